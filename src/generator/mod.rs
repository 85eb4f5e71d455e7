//! ACL Generation
//!
//! Derives materialized rows for one role assignment: the explicit
//! principal x permission x selector product plus the implicit grants that
//! come from the resource group's scope selectors.

pub mod implicit;

pub use implicit::{implicit_grants, ImplicitPermissionTable};

use crate::catalog::Catalog;
use crate::config::{Config, GeneratorConfig};
use crate::error::Result;
use crate::store::AclStore;
use crate::types::{
    Acl, Permission, Principal, PrincipalKind, ResourceGroup, ResourceSelector, Role,
    RoleAssignment,
};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct AclGenerator {
    store: Arc<dyn AclStore>,
    catalog: Catalog,
    config: GeneratorConfig,
    implicit_table: ImplicitPermissionTable,
}

impl AclGenerator {
    pub fn new(store: Arc<dyn AclStore>, catalog: Catalog, config: &Config) -> Self {
        let mut generator_config = config.generator.clone();
        generator_config.write_batch_size = generator_config.write_batch_size.max(1);
        Self {
            store,
            catalog,
            config: generator_config,
            implicit_table: ImplicitPermissionTable::from_config(&config.implicit),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Size of a principal x permission x selector product when it exceeds
    /// the cap. The cap itself is still allowed.
    pub fn oversized_product(
        &self,
        principals: usize,
        permissions: usize,
        selectors: usize,
    ) -> Option<u64> {
        let total = (principals as u64)
            .saturating_mul(permissions as u64)
            .saturating_mul(selectors as u64);
        (total > self.config.max_acls_per_assignment).then_some(total)
    }

    pub fn max_acls_per_assignment(&self) -> u64 {
        self.config.max_acls_per_assignment
    }

    /// Role bound by the assignment, searched from the assignment's scope
    /// upwards and finally among managed roles.
    pub async fn resolve_role(&self, role_assignment: &RoleAssignment) -> Result<Option<Role>> {
        let scope = self.catalog.scopes.build_scope(&role_assignment.scope)?;
        let chain = std::iter::once(&scope).chain(scope.ancestors());
        for candidate in chain {
            if let Some(role) = self
                .catalog
                .roles
                .get_role(&role_assignment.role_identifier, Some(candidate.identifier()))
                .await?
            {
                return Ok(Some(role));
            }
        }
        self.catalog
            .roles
            .get_role(&role_assignment.role_identifier, None)
            .await
    }

    pub async fn resolve_resource_group(
        &self,
        role_assignment: &RoleAssignment,
    ) -> Result<Option<ResourceGroup>> {
        self.catalog
            .resource_groups
            .get_resource_group(
                &role_assignment.resource_group_identifier,
                Some(&role_assignment.scope),
            )
            .await
    }

    /// Principals the assignment grants to; user groups are expanded into
    /// their member users.
    pub async fn resolve_principals(
        &self,
        role_assignment: &RoleAssignment,
    ) -> Result<BTreeSet<Principal>> {
        let principal = &role_assignment.principal;
        match principal.kind {
            PrincipalKind::UserGroup => {
                let group_scope = role_assignment
                    .principal_scope
                    .as_deref()
                    .unwrap_or(&role_assignment.scope);
                let group = self
                    .catalog
                    .user_groups
                    .get_user_group(&principal.identifier, group_scope)
                    .await?;
                Ok(group.map(|g| g.member_principals()).unwrap_or_default())
            }
            PrincipalKind::User | PrincipalKind::ServiceAccount => {
                Ok([principal.clone()].into())
            }
        }
    }

    /// Explicit rows for the assignment with every input resolved
    pub async fn generate_for_assignment(&self, role_assignment: &RoleAssignment) -> Result<usize> {
        let principals = self.resolve_principals(role_assignment).await?;
        self.generate_for_assignment_with_principals(role_assignment, &principals)
            .await
    }

    /// Explicit rows for the assignment restricted to `principals`
    pub async fn generate_for_assignment_with_principals(
        &self,
        role_assignment: &RoleAssignment,
        principals: &BTreeSet<Principal>,
    ) -> Result<usize> {
        let Some(role) = self.resolve_role(role_assignment).await? else {
            debug!(
                "Role {} of assignment {} no longer exists",
                role_assignment.role_identifier, role_assignment.id
            );
            return Ok(0);
        };
        let Some(resource_group) = self.resolve_resource_group(role_assignment).await? else {
            debug!(
                "Resource group {} of assignment {} no longer exists",
                role_assignment.resource_group_identifier, role_assignment.id
            );
            return Ok(0);
        };

        let selectors = resource_group.effective_selectors(&role_assignment.scope);
        self.generate(role_assignment, principals, &role.permissions, &selectors)
            .await
    }

    /// Write the full principal x permission x selector product, or nothing
    /// at all when it exceeds the configured cap.
    pub async fn generate(
        &self,
        role_assignment: &RoleAssignment,
        principals: &BTreeSet<Principal>,
        permissions: &BTreeSet<Permission>,
        selectors: &BTreeSet<ResourceSelector>,
    ) -> Result<usize> {
        let start = Instant::now();
        if principals.is_empty() || permissions.is_empty() || selectors.is_empty() {
            return Ok(0);
        }

        if let Some(total) =
            self.oversized_product(principals.len(), permissions.len(), selectors.len())
        {
            warn!(
                "Skipping role assignment {} at {}: {} principals x {} permissions x {} selectors = {} ACLs exceeds limit of {}",
                role_assignment.id,
                role_assignment.scope,
                principals.len(),
                permissions.len(),
                selectors.len(),
                total,
                self.config.max_acls_per_assignment
            );
            return Ok(0);
        }

        let batch_size = self.config.write_batch_size;
        let total = principals.len() * permissions.len() * selectors.len();
        let mut batch = Vec::with_capacity(std::cmp::min(total, batch_size));
        let mut created = 0;

        for principal in principals {
            for permission in permissions {
                for selector in selectors {
                    let applicable = !self.config.redundant_acl_elimination
                        || self
                            .catalog
                            .permissions
                            .is_applicable(permission, &selector.resource_type);
                    batch.push(Acl {
                        permission: permission.clone(),
                        principal: principal.clone(),
                        resource_selector: selector.clone(),
                        role_assignment_id: role_assignment.id.clone(),
                        role_assignment_scope: role_assignment.scope.clone(),
                        role_assignment_identifier: role_assignment.identifier.clone(),
                        implicit: false,
                        enabled: !role_assignment.disabled && applicable,
                    });

                    if batch.len() >= batch_size {
                        created += self
                            .store
                            .insert_ignoring_duplicates(std::mem::take(&mut batch))
                            .await?;
                    }
                }
            }
        }

        if !batch.is_empty() {
            created += self.store.insert_ignoring_duplicates(batch).await?;
        }

        info!(
            "Created {} explicit ACLs for role assignment {} in {}ms",
            created,
            role_assignment.id,
            start.elapsed().as_millis()
        );
        Ok(created)
    }

    /// Implicit rows for the assignment. Non-empty `added_principals` or
    /// `added_permissions` restrict the output to rows touching them. An
    /// assignment whose explicit product exceeds the cap gets none.
    pub async fn generate_implicit(
        &self,
        role_assignment: &RoleAssignment,
        added_principals: &BTreeSet<Principal>,
        added_permissions: &BTreeSet<Permission>,
    ) -> Result<usize> {
        let start = Instant::now();
        let Some(role) = self.resolve_role(role_assignment).await? else {
            return Ok(0);
        };
        let Some(resource_group) = self.resolve_resource_group(role_assignment).await? else {
            return Ok(0);
        };
        if resource_group.scope_selectors.is_empty() {
            return Ok(0);
        }

        let mut principals = self.resolve_principals(role_assignment).await?;
        let selectors = resource_group.effective_selectors(&role_assignment.scope);
        if let Some(total) =
            self.oversized_product(principals.len(), role.permissions.len(), selectors.len())
        {
            debug!(
                "No implicit ACLs for role assignment {}: {} ACLs exceeds limit of {}",
                role_assignment.id, total, self.config.max_acls_per_assignment
            );
            return Ok(0);
        }
        if !added_principals.is_empty() {
            principals.retain(|principal| added_principals.contains(principal));
        }
        let mut permissions = role.permissions;
        if !added_permissions.is_empty() {
            permissions.retain(|permission| added_permissions.contains(permission));
        }
        if principals.is_empty() || permissions.is_empty() {
            return Ok(0);
        }

        let grants = self.implicit_grants_for(&resource_group, &permissions)?;
        let rows = self.implicit_rows(role_assignment, &principals, &grants);

        let mut created = 0;
        for chunk in rows.chunks(self.config.write_batch_size) {
            created += self.store.insert_ignoring_duplicates(chunk.to_vec()).await?;
        }

        info!(
            "Created {} implicit ACLs for role assignment {} in {}ms",
            created,
            role_assignment.id,
            start.elapsed().as_millis()
        );
        Ok(created)
    }

    /// Implicit selector -> permission grants for the group, bounded by
    /// `granted`.
    pub fn implicit_grants_for(
        &self,
        resource_group: &ResourceGroup,
        granted: &BTreeSet<Permission>,
    ) -> Result<BTreeMap<ResourceSelector, BTreeSet<Permission>>> {
        implicit_grants(
            resource_group,
            granted,
            &self.implicit_table,
            self.catalog.scopes.as_ref(),
        )
    }

    fn implicit_rows(
        &self,
        role_assignment: &RoleAssignment,
        principals: &BTreeSet<Principal>,
        grants: &BTreeMap<ResourceSelector, BTreeSet<Permission>>,
    ) -> Vec<Acl> {
        let mut rows = Vec::new();
        for principal in principals {
            for (selector, permissions) in grants {
                for permission in permissions {
                    rows.push(Acl {
                        permission: permission.clone(),
                        principal: principal.clone(),
                        resource_selector: selector.clone(),
                        role_assignment_id: role_assignment.id.clone(),
                        role_assignment_scope: role_assignment.scope.clone(),
                        role_assignment_identifier: role_assignment.identifier.clone(),
                        implicit: true,
                        enabled: !role_assignment.disabled,
                    });
                }
            }
        }
        rows
    }
}
