//! Read-side collaborators
//!
//! Lookups of the authorization primitives the materializer derives rows
//! from. All of them may race with concurrent deletes, so every lookup
//! returns an `Option` and callers treat `None` as "nothing to do".

pub mod memory;
pub mod permissions;
pub mod scope;

pub use memory::{InMemoryCatalog, StaticAccountGate};
pub use permissions::{PermissionMetadata, StaticPermissionMetadata};
pub use scope::{HierarchicalScopeService, ScopeService};

use crate::error::Result;
use crate::types::{ResourceGroup, Role, RoleAssignment, UserGroup};

use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait RoleLookup: Send + Sync {
    async fn get_role(&self, identifier: &str, scope: Option<&str>) -> Result<Option<Role>>;
}

#[async_trait]
pub trait ResourceGroupLookup: Send + Sync {
    async fn get_resource_group(
        &self,
        identifier: &str,
        scope: Option<&str>,
    ) -> Result<Option<ResourceGroup>>;
}

#[async_trait]
pub trait UserGroupLookup: Send + Sync {
    async fn get_user_group(&self, identifier: &str, scope: &str) -> Result<Option<UserGroup>>;
}

/// Query side of the role assignment collection
#[async_trait]
pub trait RoleAssignmentRepository: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Option<RoleAssignment>>;

    /// Assignments naming the role; a scoped role is visible at its scope
    /// and every descendant, a managed role everywhere.
    async fn find_by_role(&self, role_identifier: &str, role_scope: Option<&str>)
        -> Result<Vec<RoleAssignment>>;

    /// Assignments naming the resource group at exactly its scope, or
    /// everywhere for a managed group.
    async fn find_by_resource_group(
        &self,
        resource_group_identifier: &str,
        resource_group_scope: Option<&str>,
    ) -> Result<Vec<RoleAssignment>>;

    /// USER_GROUP assignments naming the group at its scope or below
    async fn find_by_user_group(
        &self,
        user_group_identifier: &str,
        user_group_scope: &str,
    ) -> Result<Vec<RoleAssignment>>;
}

/// Account suspension status, owned elsewhere
#[async_trait]
pub trait AccountGate: Send + Sync {
    async fn is_account_blocked(&self, account_identifier: &str) -> Result<bool>;
}

/// Bundle of read-side collaborators shared by the generator and consumers
#[derive(Clone)]
pub struct Catalog {
    pub roles: Arc<dyn RoleLookup>,
    pub resource_groups: Arc<dyn ResourceGroupLookup>,
    pub user_groups: Arc<dyn UserGroupLookup>,
    pub role_assignments: Arc<dyn RoleAssignmentRepository>,
    pub scopes: Arc<dyn ScopeService>,
    pub permissions: Arc<dyn PermissionMetadata>,
}

impl Catalog {
    /// Catalog served entirely from one in-memory catalog, with the default
    /// scope parser and permission naming convention.
    pub fn in_memory(catalog: Arc<InMemoryCatalog>) -> Self {
        Self {
            roles: catalog.clone(),
            resource_groups: catalog.clone(),
            user_groups: catalog.clone(),
            role_assignments: catalog,
            scopes: Arc::new(HierarchicalScopeService::new()),
            permissions: Arc::new(StaticPermissionMetadata::from_naming_convention()),
        }
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionMetadata>) -> Self {
        self.permissions = permissions;
        self
    }
}
