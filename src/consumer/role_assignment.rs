use super::{unexpected, AclDelta, ChangeConsumer, ConsumeOutcome};
use crate::error::Result;
use crate::event::{ChangeEntity, ChangeOp, EntityType, UpdatedFields};
use crate::generator::AclGenerator;
use crate::store::AclStore;
use crate::types::RoleAssignment;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Fields whose change invalidates every row of the assignment
const REBUILD_FIELDS: &[&str] = &[
    "roleIdentifier",
    "resourceGroupIdentifier",
    "principal",
    "principalScope",
    "disabled",
];

/// Rebuilds the rows of a single role assignment
#[derive(Clone)]
pub struct RoleAssignmentChangeConsumer {
    generator: Arc<AclGenerator>,
    store: Arc<dyn AclStore>,
}

impl RoleAssignmentChangeConsumer {
    pub fn new(generator: Arc<AclGenerator>, store: Arc<dyn AclStore>) -> Self {
        Self { generator, store }
    }

    async fn materialize(&self, role_assignment: &RoleAssignment) -> Result<usize> {
        let explicit = self.generator.generate_for_assignment(role_assignment).await?;
        let implicit = self
            .generator
            .generate_implicit(role_assignment, &BTreeSet::new(), &BTreeSet::new())
            .await?;
        Ok(explicit + implicit)
    }

    async fn refetch(&self, id: &str) -> Result<Option<RoleAssignment>> {
        self.generator.catalog().role_assignments.get_by_id(id).await
    }

    async fn on_create(&self, id: &str) -> Result<ConsumeOutcome> {
        let start = Instant::now();
        let Some(role_assignment) = self.refetch(id).await? else {
            debug!("Role assignment {} vanished before its create was processed", id);
            return Ok(ConsumeOutcome::NotApplicable);
        };

        let created = self.materialize(&role_assignment).await?;
        info!(
            "Role assignment {} created: {} ACLs created, 0 deleted in {}ms",
            id,
            created,
            start.elapsed().as_millis()
        );
        Ok(ConsumeOutcome::Applied(AclDelta::new(created, 0)))
    }

    async fn on_update(&self, id: &str, fields: &UpdatedFields) -> Result<ConsumeOutcome> {
        if !fields.touches_any(REBUILD_FIELDS) {
            debug!("Update of role assignment {} touches no ACL-relevant field", id);
            return Ok(ConsumeOutcome::NotApplicable);
        }

        let start = Instant::now();
        let deleted = self.store.delete_by_assignment(id).await?;
        let created = match self.refetch(id).await? {
            Some(role_assignment) => self.materialize(&role_assignment).await?,
            None => 0,
        };

        info!(
            "Role assignment {} updated: {} ACLs created, {} deleted in {}ms",
            id,
            created,
            deleted,
            start.elapsed().as_millis()
        );
        Ok(ConsumeOutcome::Applied(AclDelta::new(created, deleted)))
    }

    async fn on_delete(&self, id: &str, entity: Option<&RoleAssignment>) -> Result<ConsumeOutcome> {
        let start = Instant::now();
        let mut deleted = self.store.delete_by_assignment(id).await?;
        if deleted == 0 {
            if let Some(role_assignment) = entity {
                deleted = self
                    .store
                    .delete_by_scope_and_identifier(&role_assignment.scope, &role_assignment.identifier)
                    .await?;
            }
        }

        info!(
            "Role assignment {} deleted: 0 ACLs created, {} deleted in {}ms",
            id,
            deleted,
            start.elapsed().as_millis()
        );
        Ok(ConsumeOutcome::Applied(AclDelta::new(0, deleted)))
    }
}

#[async_trait]
impl ChangeConsumer for RoleAssignmentChangeConsumer {
    fn entity_type(&self) -> EntityType {
        EntityType::RoleAssignment
    }

    async fn consume_event(
        &self,
        op: &ChangeOp,
        id: &str,
        entity: Option<ChangeEntity>,
    ) -> Result<ConsumeOutcome> {
        let role_assignment = match entity {
            Some(ChangeEntity::RoleAssignment(role_assignment)) => Some(role_assignment),
            Some(other) => return Err(unexpected(EntityType::RoleAssignment, &other)),
            None => None,
        };

        match op {
            ChangeOp::Create => self.on_create(id).await,
            ChangeOp::Update(fields) => self.on_update(id, fields).await,
            ChangeOp::Delete => self.on_delete(id, role_assignment.as_ref()).await,
        }
    }
}
