//! Change Consumers
//!
//! One consumer per primitive. The role assignment consumer rebuilds the
//! rows of a single assignment; the role, resource group and user group
//! consumers compute a delta against the already-materialized rows of every
//! assignment that references the changed entity and fan that work out over
//! a bounded executor.

pub mod fanout;
pub mod resource_group;
pub mod role;
pub mod role_assignment;
pub mod user_group;

pub use fanout::{AssignmentTask, BoundedTaskExecutor, TaskExecutor};
pub use resource_group::ResourceGroupChangeConsumer;
pub use role::RoleChangeConsumer;
pub use role_assignment::RoleAssignmentChangeConsumer;
pub use user_group::UserGroupChangeConsumer;

use crate::error::{Result, RustAclError};
use crate::event::{ChangeEntity, ChangeOp, EntityType};
use crate::store::AclStore;
use crate::types::{Principal, ResourceSelector, RoleAssignment};
use crate::generator::AclGenerator;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::ops::{Add, AddAssign};
use tracing::warn;

/// Rows created and deleted by one application
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AclDelta {
    pub created: usize,
    pub deleted: usize,
}

impl AclDelta {
    pub fn new(created: usize, deleted: usize) -> Self {
        Self { created, deleted }
    }
}

impl Add for AclDelta {
    type Output = AclDelta;

    fn add(self, other: AclDelta) -> AclDelta {
        AclDelta {
            created: self.created + other.created,
            deleted: self.deleted + other.deleted,
        }
    }
}

impl AddAssign for AclDelta {
    fn add_assign(&mut self, other: AclDelta) {
        *self = *self + other;
    }
}

/// Result of handing one event to a consumer. Failures travel as `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Applied(AclDelta),
    /// The event carried no change relevant to materialized rows
    NotApplicable,
}

impl ConsumeOutcome {
    pub fn delta(&self) -> AclDelta {
        match self {
            ConsumeOutcome::Applied(delta) => *delta,
            ConsumeOutcome::NotApplicable => AclDelta::default(),
        }
    }
}

#[async_trait]
pub trait ChangeConsumer: Send + Sync {
    fn entity_type(&self) -> EntityType;

    async fn consume_event(
        &self,
        op: &ChangeOp,
        id: &str,
        entity: Option<ChangeEntity>,
    ) -> Result<ConsumeOutcome>;
}

fn unexpected(expected: EntityType, entity: &ChangeEntity) -> RustAclError {
    RustAclError::UnexpectedEntity {
        expected: expected.as_str(),
        found: entity.entity_type().as_str(),
    }
}

/// Principals already materialized for the assignment, resolved afresh
/// when it owns no rows yet.
async fn known_principals(
    store: &dyn AclStore,
    generator: &AclGenerator,
    role_assignment: &RoleAssignment,
) -> Result<BTreeSet<Principal>> {
    let principals = store.distinct_principals(&role_assignment.id).await?;
    if !principals.is_empty() {
        return Ok(principals);
    }
    generator.resolve_principals(role_assignment).await
}

/// Explicit selectors already materialized for the assignment, resolved
/// afresh when it owns no explicit rows yet.
async fn known_selectors(
    store: &dyn AclStore,
    generator: &AclGenerator,
    role_assignment: &RoleAssignment,
) -> Result<BTreeSet<ResourceSelector>> {
    let selectors = store.distinct_selectors(&role_assignment.id).await?;
    if !selectors.is_empty() {
        return Ok(selectors);
    }
    Ok(generator
        .resolve_resource_group(role_assignment)
        .await?
        .map(|group| group.effective_selectors(&role_assignment.scope))
        .unwrap_or_default())
}

/// Removes every row of an assignment whose full product has grown past
/// the cap, leaving it as a fresh create would. `None` when the product fits.
async fn clear_if_oversized(
    store: &dyn AclStore,
    generator: &AclGenerator,
    role_assignment: &RoleAssignment,
    principals: usize,
    permissions: usize,
    selectors: usize,
) -> Result<Option<AclDelta>> {
    let Some(total) = generator.oversized_product(principals, permissions, selectors) else {
        return Ok(None);
    };
    let deleted = store.delete_by_assignment(&role_assignment.id).await?;
    warn!(
        "Role assignment {} at {} grew to {} ACLs, over the limit of {}: removed its {} ACLs",
        role_assignment.id,
        role_assignment.scope,
        total,
        generator.max_acls_per_assignment(),
        deleted
    );
    Ok(Some(AclDelta::new(0, deleted)))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_arithmetic() {
        let mut total = AclDelta::default();
        total += AclDelta::new(2, 1);
        total += AclDelta::new(3, 0);
        assert_eq!(total, AclDelta::new(5, 1));
    }

    #[test]
    fn test_not_applicable_has_empty_delta() {
        assert_eq!(ConsumeOutcome::NotApplicable.delta(), AclDelta::default());
        assert_eq!(
            ConsumeOutcome::Applied(AclDelta::new(1, 2)).delta(),
            AclDelta::new(1, 2)
        );
    }
}
