use super::{
    clear_if_oversized, known_principals, unexpected, AclDelta, AssignmentTask, BoundedTaskExecutor, ChangeConsumer,
    ConsumeOutcome, TaskExecutor,
};
use crate::config::Config;
use crate::error::Result;
use crate::event::{ChangeEntity, ChangeOp, EntityType, UpdatedFields};
use crate::generator::AclGenerator;
use crate::store::AclStore;
use crate::types::{Permission, ResourceGroup, ResourceSelector, RoleAssignment};

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const SELECTOR_FIELDS: &[&str] = &["resourceSelectors", "resourceSelectorsV2"];
const SCOPE_SELECTOR_FIELD: &str = "scopeSelectors";

/// Propagates selector changes to every assignment bound to the group
#[derive(Clone)]
pub struct ResourceGroupChangeConsumer {
    generator: Arc<AclGenerator>,
    store: Arc<dyn AclStore>,
    executor: Arc<dyn TaskExecutor>,
}

/// Which parts of a group an event may have changed
#[derive(Debug, Clone, Copy)]
struct Changes {
    selectors: bool,
    /// `Some(true)` when scope selectors are known to have changed,
    /// `None` when the event does not say
    scope_selectors: Option<bool>,
}

impl Changes {
    fn from_fields(fields: &UpdatedFields) -> Self {
        match fields {
            UpdatedFields::Unknown => Self {
                selectors: true,
                scope_selectors: None,
            },
            UpdatedFields::Known(_) => Self {
                selectors: fields.touches_any(SELECTOR_FIELDS),
                scope_selectors: Some(fields.touches_any(&[SCOPE_SELECTOR_FIELD])),
            },
        }
    }

    fn everything() -> Self {
        Self {
            selectors: true,
            scope_selectors: Some(true),
        }
    }

    fn is_empty(&self) -> bool {
        !self.selectors && self.scope_selectors == Some(false)
    }
}

impl ResourceGroupChangeConsumer {
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

    async fn apply(
        &self,
        resource_group: ResourceGroup,
        changes: Changes,
        deleted: bool,
    ) -> Result<ConsumeOutcome> {
        let start = Instant::now();
        let assignments = self
            .generator
            .catalog()
            .role_assignments
            .find_by_resource_group(&resource_group.identifier, resource_group.scope.as_deref())
            .await?;
        let assignment_count = assignments.len();

        let resource_group = Arc::new(resource_group);
        let tasks: Vec<(String, AssignmentTask)> = assignments
            .into_iter()
            .map(|role_assignment| {
                let consumer = self.clone();
                let resource_group = resource_group.clone();
                let id = role_assignment.id.clone();
                let task: AssignmentTask = Box::pin(async move {
                    consumer
                        .apply_to_assignment(&resource_group, &role_assignment, changes, deleted)
                        .await
                });
                (id, task)
            })
            .collect();

        let delta = self.executor.invoke_all(tasks).await?;
        info!(
            "Resource group {} changed across {} assignments: {} ACLs created, {} deleted in {}ms",
            resource_group.identifier,
            assignment_count,
            delta.created,
            delta.deleted,
            start.elapsed().as_millis()
        );
        Ok(ConsumeOutcome::Applied(delta))
    }

    async fn apply_to_assignment(
        &self,
        resource_group: &ResourceGroup,
        role_assignment: &RoleAssignment,
        changes: Changes,
        deleted: bool,
    ) -> Result<AclDelta> {
        let resolved;
        let resource_group = if deleted {
            // Once the group is gone the assignment follows whichever group still resolves
            resolved = self.generator.resolve_resource_group(role_assignment).await?;
            resolved.as_ref().unwrap_or(resource_group)
        } else {
            resource_group
        };

        let mut delta = AclDelta::default();
        let role = self.generator.resolve_role(role_assignment).await?;

        if changes.selectors {
            let permissions = role.as_ref().map(|role| &role.permissions);
            delta += self
                .apply_selector_delta(resource_group, role_assignment, permissions)
                .await?;
        }

        let rebuild_implicit = match changes.scope_selectors {
            Some(changed) => changed,
            None => {
                let expected: BTreeSet<ResourceSelector> = match &role {
                    Some(role) => self
                        .generator
                        .implicit_grants_for(resource_group, &role.permissions)?
                        .into_keys()
                        .collect(),
                    None => BTreeSet::new(),
                };
                let current = self
                    .store
                    .distinct_implicit_selectors(&role_assignment.id)
                    .await?;
                expected != current
            }
        };

        if rebuild_implicit {
            delta.deleted += self
                .store
                .delete_implicit_for_assignment(&role_assignment.id)
                .await?;
            delta.created += self
                .generator
                .generate_implicit(role_assignment, &BTreeSet::new(), &BTreeSet::new())
                .await?;
        }

        Ok(delta)
    }

    async fn apply_selector_delta(
        &self,
        resource_group: &ResourceGroup,
        role_assignment: &RoleAssignment,
        permissions: Option<&BTreeSet<Permission>>,
    ) -> Result<AclDelta> {
        let target = resource_group.effective_selectors(&role_assignment.scope);
        let current = self.store.distinct_selectors(&role_assignment.id).await?;
        let removed: BTreeSet<ResourceSelector> = current.difference(&target).cloned().collect();
        let added: BTreeSet<ResourceSelector> = target.difference(&current).cloned().collect();

        let mut delta = AclDelta::default();
        if !removed.is_empty() {
            delta.deleted += self
                .store
                .delete_by_assignment_and_selectors(&role_assignment.id, &removed)
                .await?;
        }
        if let Some(permissions) = permissions.filter(|_| !added.is_empty()) {
            let store = self.store.as_ref();
            let principals = known_principals(store, &self.generator, role_assignment).await?;
            if let Some(cleared) = clear_if_oversized(
                store,
                &self.generator,
                role_assignment,
                principals.len(),
                permissions.len(),
                target.len(),
            )
            .await?
            {
                return Ok(delta + cleared);
            }
            delta.created += self
                .generator
                .generate(role_assignment, &principals, permissions, &added)
                .await?;
        }

        debug!(
            "Assignment {}: {} selectors added, {} removed",
            role_assignment.id,
            added.len(),
            removed.len()
        );
        Ok(delta)
    }
}

#[async_trait]
impl ChangeConsumer for ResourceGroupChangeConsumer {
    fn entity_type(&self) -> EntityType {
        EntityType::ResourceGroup
    }

    async fn consume_event(
        &self,
        op: &ChangeOp,
        id: &str,
        entity: Option<ChangeEntity>,
    ) -> Result<ConsumeOutcome> {
        let resource_group = match entity {
            Some(ChangeEntity::ResourceGroup(resource_group)) => resource_group,
            Some(other) => return Err(unexpected(EntityType::ResourceGroup, &other)),
            None => {
                warn!("{} of resource group {} carried no payload", op.name(), id);
                return Ok(ConsumeOutcome::NotApplicable);
            }
        };

        match op {
            ChangeOp::Create => {
                let changes = Changes::from_fields(&UpdatedFields::Unknown);
                self.apply(resource_group, changes, false).await
            }
            ChangeOp::Update(fields) => {
                let changes = Changes::from_fields(fields);
                if changes.is_empty() {
                    debug!(
                        "Update of resource group {} leaves selectors unchanged",
                        resource_group.identifier
                    );
                    return Ok(ConsumeOutcome::NotApplicable);
                }
                self.apply(resource_group, changes, false).await
            }
            ChangeOp::Delete => {
                let emptied = ResourceGroup {
                    resource_selectors: BTreeSet::new(),
                    resource_selectors_v2: BTreeSet::new(),
                    scope_selectors: BTreeSet::new(),
                    ..resource_group
                };
                self.apply(emptied, Changes::everything(), true).await
            }
        }
    }
}
