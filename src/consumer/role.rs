use super::{
    clear_if_oversized, known_principals, known_selectors, unexpected, AclDelta, AssignmentTask, BoundedTaskExecutor,
    ChangeConsumer, ConsumeOutcome, TaskExecutor,
};
use crate::config::Config;
use crate::error::Result;
use crate::event::{ChangeEntity, ChangeOp, EntityType};
use crate::generator::AclGenerator;
use crate::store::AclStore;
use crate::types::{Permission, Role, RoleAssignment};

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const PERMISSIONS_FIELD: &str = "permissions";

/// Propagates role permission changes to every assignment naming the role
#[derive(Clone)]
pub struct RoleChangeConsumer {
    generator: Arc<AclGenerator>,
    store: Arc<dyn AclStore>,
    executor: Arc<dyn TaskExecutor>,
}

impl RoleChangeConsumer {
    pub fn new(generator: Arc<AclGenerator>, store: Arc<dyn AclStore>, config: &Config) -> Self {
        Self {
            generator,
            store,
            executor: Arc::new(BoundedTaskExecutor::new(
                config.fanout.effective_worker_threads(),
            )),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = executor;
        self
    }

    async fn apply(&self, role: Role, deleted: bool) -> Result<ConsumeOutcome> {
        let start = Instant::now();
        let assignments = self
            .generator
            .catalog()
            .role_assignments
            .find_by_role(&role.identifier, role.scope.as_deref())
            .await?;
        let assignment_count = assignments.len();

        let role = Arc::new(role);
        let tasks: Vec<(String, AssignmentTask)> = assignments
            .into_iter()
            .map(|role_assignment| {
                let consumer = self.clone();
                let role = role.clone();
                let id = role_assignment.id.clone();
                let task: AssignmentTask = Box::pin(async move {
                    consumer
                        .apply_to_assignment(&role, &role_assignment, deleted)
                        .await
                });
                (id, task)
            })
            .collect();

        let delta = self.executor.invoke_all(tasks).await?;
        info!(
            "Role {} changed across {} assignments: {} ACLs created, {} deleted in {}ms",
            role.identifier,
            assignment_count,
            delta.created,
            delta.deleted,
            start.elapsed().as_millis()
        );
        Ok(ConsumeOutcome::Applied(delta))
    }

    async fn apply_to_assignment(
        &self,
        role: &Role,
        role_assignment: &RoleAssignment,
        deleted: bool,
    ) -> Result<AclDelta> {
        let target = match self.generator.resolve_role(role_assignment).await? {
            // A closer role with the same identifier shadows this one
            Some(resolved) if !deleted && resolved.scope != role.scope => {
                debug!(
                    "Assignment {} binds role {} from scope {:?}, skipping",
                    role_assignment.id, role.identifier, resolved.scope
                );
                return Ok(AclDelta::default());
            }
            // Once the role is gone its rows follow whichever role still resolves
            Some(resolved) if deleted => resolved.permissions,
            _ => role.permissions.clone(),
        };

        let current = self.store.distinct_permissions(&role_assignment.id).await?;
        let removed: BTreeSet<Permission> = current.difference(&target).cloned().collect();
        let added: BTreeSet<Permission> = target.difference(&current).cloned().collect();

        let mut delta = AclDelta::default();
        if !removed.is_empty() {
            delta.deleted += self
                .store
                .delete_by_assignment_and_permissions(&role_assignment.id, &removed)
                .await?;
        }
        if !added.is_empty() {
            let store = self.store.as_ref();
            let principals = known_principals(store, &self.generator, role_assignment).await?;
            let selectors = known_selectors(store, &self.generator, role_assignment).await?;
            if let Some(cleared) = clear_if_oversized(
                store,
                &self.generator,
                role_assignment,
                principals.len(),
                target.len(),
                selectors.len(),
            )
            .await?
            {
                return Ok(delta + cleared);
            }
            delta.created += self
                .generator
                .generate(role_assignment, &principals, &added, &selectors)
                .await?;
            delta.created += self
                .generator
                .generate_implicit(role_assignment, &BTreeSet::new(), &added)
                .await?;
        }

        debug!(
            "Assignment {}: {} permissions added, {} removed",
            role_assignment.id,
            added.len(),
            removed.len()
        );
        Ok(delta)
    }
}

#[async_trait]
impl ChangeConsumer for RoleChangeConsumer {
    fn entity_type(&self) -> EntityType {
        EntityType::Role
    }

    async fn consume_event(
        &self,
        op: &ChangeOp,
        id: &str,
        entity: Option<ChangeEntity>,
    ) -> Result<ConsumeOutcome> {
        let role = match entity {
            Some(ChangeEntity::Role(role)) => role,
            Some(other) => return Err(unexpected(EntityType::Role, &other)),
            None => {
                warn!("{} of role {} carried no payload", op.name(), id);
                return Ok(ConsumeOutcome::NotApplicable);
            }
        };

        match op {
            ChangeOp::Update(fields) if !fields.touches_any(&[PERMISSIONS_FIELD]) => {
                debug!("Update of role {} leaves permissions unchanged", role.identifier);
                Ok(ConsumeOutcome::NotApplicable)
            }
            ChangeOp::Create | ChangeOp::Update(_) => self.apply(role, false).await,
            ChangeOp::Delete => {
                let emptied = Role {
                    permissions: BTreeSet::new(),
                    ..role
                };
                self.apply(emptied, true).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RoleAssignmentRepository;
    use crate::consumer::test_support::*;
    use crate::event::UpdatedFields;
    use crate::types::Principal;

    fn setup(h: &Harness) {
        h.catalog.upsert_role(role("viewer", "acct1", &["view", "edit"]));
        h.catalog
            .upsert_resource_group(resource_group("pipelines", "acct1/org1", &["pipeline:*"]));
        h.catalog
            .upsert_resource_group(resource_group("pipelines", "acct1", &["pipeline:*"]));
        h.catalog.upsert_role_assignment(assignment(
            "ra-1",
            "acct1/org1",
            Principal::user("u1"),
            "viewer",
            "pipelines",
        ));
        h.catalog.upsert_role_assignment(assignment(
            "ra-2",
            "acct1",
            Principal::user("u2"),
            "viewer",
            "pipelines",
        ));
    }

    async fn materialize(h: &Harness) {
        for id in ["ra-1", "ra-2"] {
            let ra = h.catalog.get_by_id(id).await.unwrap().unwrap();
            h.generator.generate_for_assignment(&ra).await.unwrap();
        }
    }

    fn update(fields: &[&str]) -> ChangeOp {
        ChangeOp::Update(UpdatedFields::Known(
            fields.iter().map(|f| f.to_string()).collect(),
        ))
    }

    #[tokio::test]
    async fn test_permission_delta_applied_per_assignment() {
        let h = Harness::new();
        setup(&h);
        materialize(&h).await;

        let updated = role("viewer", "acct1", &["edit", "delete"]);
        h.catalog.upsert_role(updated.clone());
        let consumer = RoleChangeConsumer::new(h.generator.clone(), h.store.clone(), &h.config);

        let outcome = consumer
            .consume_event(&update(&["permissions"]), "role-1", Some(ChangeEntity::Role(updated)))
            .await
            .unwrap();
        assert_eq!(outcome, ConsumeOutcome::Applied(AclDelta::new(2, 2)));

        for id in ["ra-1", "ra-2"] {
            let permissions = h.store.distinct_permissions(id).await.unwrap();
            assert_eq!(permissions, perms(&["delete", "edit"]));
        }
    }

    #[tokio::test]
    async fn test_unrelated_update_is_not_applicable() {
        let h = Harness::new();
        setup(&h);
        materialize(&h).await;
        let consumer = RoleChangeConsumer::new(h.generator.clone(), h.store.clone(), &h.config);

        let outcome = consumer
            .consume_event(
                &update(&["description"]),
                "role-1",
                Some(ChangeEntity::Role(role("viewer", "acct1", &[]))),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ConsumeOutcome::NotApplicable);
        assert_eq!(h.store.len(), 4);
    }

    #[tokio::test]
    async fn test_shadowed_role_is_left_alone() {
        let h = Harness::new();
        setup(&h);
        h.catalog.upsert_role(role("viewer", "acct1/org1", &["view"]));
        materialize(&h).await;
        assert_eq!(h.store.count_for_assignment("ra-1"), 1);

        let updated = role("viewer", "acct1", &["admin"]);
        h.catalog.upsert_role(updated.clone());
        let consumer = RoleChangeConsumer::new(h.generator.clone(), h.store.clone(), &h.config);
        consumer
            .consume_event(&update(&["permissions"]), "role-1", Some(ChangeEntity::Role(updated)))
            .await
            .unwrap();

        assert_eq!(h.store.distinct_permissions("ra-1").await.unwrap(), perms(&["view"]));
        assert_eq!(h.store.distinct_permissions("ra-2").await.unwrap(), perms(&["admin"]));
    }

    #[tokio::test]
    async fn test_deleted_role_yields_to_the_role_that_still_resolves() {
        let h = Harness::new();
        setup(&h);
        h.catalog.upsert_role(role("viewer", "acct1/org1", &["view"]));
        materialize(&h).await;
        assert_eq!(h.store.distinct_permissions("ra-1").await.unwrap(), perms(&["view"]));

        let managed = Role {
            identifier: "viewer".to_string(),
            scope: None,
            permissions: perms(&["view", "audit"]),
        };
        h.catalog.upsert_role(managed);
        let deleted = role("viewer", "acct1", &["view", "edit"]);
        h.catalog.remove_role("viewer", Some("acct1"));
        let consumer = RoleChangeConsumer::new(h.generator.clone(), h.store.clone(), &h.config);

        let outcome = consumer
            .consume_event(&ChangeOp::Delete, "role-1", Some(ChangeEntity::Role(deleted)))
            .await
            .unwrap();

        // ra-1 keeps its closer role, ra-2 falls back to the managed one
        assert_eq!(outcome, ConsumeOutcome::Applied(AclDelta::new(1, 1)));
        assert_eq!(h.store.distinct_permissions("ra-1").await.unwrap(), perms(&["view"]));
        assert_eq!(
            h.store.distinct_permissions("ra-2").await.unwrap(),
            perms(&["audit", "view"])
        );
    }

    #[tokio::test]
    async fn test_role_growing_past_cap_clears_assignments() {
        let mut config = Config::default();
        config.generator.max_acls_per_assignment = 2;
        let h = Harness::with_config(config);
        setup(&h);
        materialize(&h).await;
        assert_eq!(h.store.len(), 4);
        let consumer = RoleChangeConsumer::new(h.generator.clone(), h.store.clone(), &h.config);

        let grown = role("viewer", "acct1", &["view", "edit", "delete"]);
        h.catalog.upsert_role(grown.clone());
        let outcome = consumer
            .consume_event(&update(&["permissions"]), "role-1", Some(ChangeEntity::Role(grown)))
            .await
            .unwrap();
        assert_eq!(outcome, ConsumeOutcome::Applied(AclDelta::new(0, 4)));
        assert!(h.store.is_empty());

        let shrunk = role("viewer", "acct1", &["view"]);
        h.catalog.upsert_role(shrunk.clone());
        let outcome = consumer
            .consume_event(&update(&["permissions"]), "role-1", Some(ChangeEntity::Role(shrunk)))
            .await
            .unwrap();
        assert_eq!(outcome, ConsumeOutcome::Applied(AclDelta::new(2, 0)));
    }

    #[tokio::test]
    async fn test_delete_removes_every_permission() {
        let h = Harness::new();
        setup(&h);
        materialize(&h).await;
        let deleted = role("viewer", "acct1", &["view", "edit"]);
        h.catalog.remove_role("viewer", Some("acct1"));
        let consumer = RoleChangeConsumer::new(h.generator.clone(), h.store.clone(), &h.config);

        let outcome = consumer
            .consume_event(&ChangeOp::Delete, "role-1", Some(ChangeEntity::Role(deleted)))
            .await
            .unwrap();
        assert_eq!(outcome, ConsumeOutcome::Applied(AclDelta::new(0, 4)));
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_task_failure_fails_the_event() {
        let h = Harness::new();
        setup(&h);
        materialize(&h).await;
        h.store.fail_next_writes(1);

        let updated = role("viewer", "acct1", &["view"]);
        let consumer = RoleChangeConsumer::new(h.generator.clone(), h.store.clone(), &h.config);
        let result = consumer
            .consume_event(&update(&["permissions"]), "role-1", Some(ChangeEntity::Role(updated)))
            .await;
        assert!(result.is_err());
    }
}
