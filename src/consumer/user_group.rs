use super::{
    clear_if_oversized, known_selectors, unexpected, AclDelta, AssignmentTask, BoundedTaskExecutor, ChangeConsumer, ConsumeOutcome,
    TaskExecutor,
};
use crate::config::Config;
use crate::error::Result;
use crate::event::{ChangeEntity, ChangeOp, EntityType};
use crate::generator::AclGenerator;
use crate::store::AclStore;
use crate::types::{Principal, RoleAssignment, UserGroup};

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const USERS_FIELD: &str = "users";

/// Propagates membership changes to every assignment granting to the group
#[derive(Clone)]
pub struct UserGroupChangeConsumer {
    generator: Arc<AclGenerator>,
    store: Arc<dyn AclStore>,
    executor: Arc<dyn TaskExecutor>,
    delete_chunk_size: usize,
}

impl UserGroupChangeConsumer {
    pub fn new(generator: Arc<AclGenerator>, store: Arc<dyn AclStore>, config: &Config) -> Self {
        Self {
            generator,
            store,
            executor: Arc::new(BoundedTaskExecutor::new(
                config.fanout.effective_worker_threads(),
            )),
            delete_chunk_size: config.user_group.principal_delete_chunk_size.max(1),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = executor;
        self
    }

    async fn apply(&self, user_group: UserGroup) -> Result<ConsumeOutcome> {
        let start = Instant::now();
        let assignments = self
            .generator
            .catalog()
            .role_assignments
            .find_by_user_group(&user_group.identifier, &user_group.scope)
            .await?;
        let assignment_count = assignments.len();

        let members = Arc::new(user_group.member_principals());
        let tasks: Vec<(String, AssignmentTask)> = assignments
            .into_iter()
            .map(|role_assignment| {
                let consumer = self.clone();
                let members = members.clone();
                let id = role_assignment.id.clone();
                let task: AssignmentTask = Box::pin(async move {
                    consumer.apply_to_assignment(&members, &role_assignment).await
                });
                (id, task)
            })
            .collect();

        let delta = self.executor.invoke_all(tasks).await?;
        info!(
            "User group {} at {} changed across {} assignments: {} ACLs created, {} deleted in {}ms",
            user_group.identifier,
            user_group.scope,
            assignment_count,
            delta.created,
            delta.deleted,
            start.elapsed().as_millis()
        );
        Ok(ConsumeOutcome::Applied(delta))
    }

    async fn apply_to_assignment(
        &self,
        members: &BTreeSet<Principal>,
        role_assignment: &RoleAssignment,
    ) -> Result<AclDelta> {
        let current = self.store.distinct_principals(&role_assignment.id).await?;
        let removed: Vec<Principal> = current.difference(members).cloned().collect();
        let added: BTreeSet<Principal> = members.difference(&current).cloned().collect();

        let mut delta = AclDelta::default();
        for chunk in removed.chunks(self.delete_chunk_size) {
            let chunk: BTreeSet<Principal> = chunk.iter().cloned().collect();
            delta.deleted += self
                .store
                .delete_by_assignment_and_principals(&role_assignment.id, &chunk)
                .await?;
        }

        if !added.is_empty() {
            if let Some(role) = self.generator.resolve_role(role_assignment).await? {
                let store = self.store.as_ref();
                let selectors = known_selectors(store, &self.generator, role_assignment).await?;
                if let Some(cleared) = clear_if_oversized(
                    store,
                    &self.generator,
                    role_assignment,
                    members.len(),
                    role.permissions.len(),
                    selectors.len(),
                )
                .await?
                {
                    return Ok(delta + cleared);
                }
            }
            delta.created += self
                .generator
                .generate_for_assignment_with_principals(role_assignment, &added)
                .await?;
            delta.created += self
                .generator
                .generate_implicit(role_assignment, &added, &BTreeSet::new())
                .await?;
        }

        debug!(
            "Assignment {}: {} members added, {} removed",
            role_assignment.id,
            added.len(),
            removed.len()
        );
        Ok(delta)
    }
}

#[async_trait]
impl ChangeConsumer for UserGroupChangeConsumer {
    fn entity_type(&self) -> EntityType {
        EntityType::UserGroup
    }

    async fn consume_event(
        &self,
        op: &ChangeOp,
        id: &str,
        entity: Option<ChangeEntity>,
    ) -> Result<ConsumeOutcome> {
        let user_group = match entity {
            Some(ChangeEntity::UserGroup(user_group)) => user_group,
            Some(other) => return Err(unexpected(EntityType::UserGroup, &other)),
            None => {
                warn!("{} of user group {} carried no payload", op.name(), id);
                return Ok(ConsumeOutcome::NotApplicable);
            }
        };

        match op {
            ChangeOp::Update(fields) if !fields.touches_any(&[USERS_FIELD]) => {
                debug!(
                    "Update of user group {} leaves membership unchanged",
                    user_group.identifier
                );
                Ok(ConsumeOutcome::NotApplicable)
            }
            ChangeOp::Create | ChangeOp::Update(_) => self.apply(user_group).await,
            ChangeOp::Delete => {
                let emptied = UserGroup {
                    users: BTreeSet::new(),
                    ..user_group
                };
                self.apply(emptied).await
            }
        }
    }
}
