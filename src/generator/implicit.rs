//! Scope-hierarchy ("implicit") grants.

use crate::catalog::ScopeService;
use crate::config::ImplicitPermissionConfig;
use crate::error::Result;
use crate::types::{Permission, ResourceGroup, ResourceSelector, ScopeLevel};

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Static (scope level, include child scopes) -> permission table
#[derive(Debug, Clone, Default)]
pub struct ImplicitPermissionTable {
    entries: HashMap<(ScopeLevel, bool), BTreeSet<Permission>>,
}

impl ImplicitPermissionTable {
    pub fn from_config(config: &ImplicitPermissionConfig) -> Self {
        let mut entries: HashMap<(ScopeLevel, bool), BTreeSet<Permission>> = HashMap::new();
        for rule in &config.rules {
            entries
                .entry((rule.scope_level, rule.include_child_scopes))
                .or_default()
                .extend(rule.permissions.iter().cloned());
        }
        Self { entries }
    }

    /// Table permissions for the slot, intersected with `granted`
    pub fn grantable(
        &self,
        level: ScopeLevel,
        include_child_scopes: bool,
        granted: &BTreeSet<Permission>,
    ) -> BTreeSet<Permission> {
        self.entries
            .get(&(level, include_child_scopes))
            .map(|allowed| allowed.intersection(granted).cloned().collect())
            .unwrap_or_default()
    }
}

/// Walk every scope selector of the group: a descendant grant at the
/// selector's own scope when it includes child scopes, and a scope-only
/// grant at each ancestor above it.
pub fn implicit_grants(
    resource_group: &ResourceGroup,
    granted: &BTreeSet<Permission>,
    table: &ImplicitPermissionTable,
    scopes: &dyn ScopeService,
) -> Result<BTreeMap<ResourceSelector, BTreeSet<Permission>>> {
    let mut grants: BTreeMap<ResourceSelector, BTreeSet<Permission>> = BTreeMap::new();

    for scope_selector in &resource_group.scope_selectors {
        let scope = scopes.build_scope(&scope_selector.scope_identifier)?;

        if scope_selector.include_child_scopes {
            let permissions = table.grantable(scope.level(), true, granted);
            if !permissions.is_empty() {
                grants
                    .entry(ResourceSelector::scope_and_descendants(&scope))
                    .or_default()
                    .extend(permissions);
            }
        }

        for ancestor in scope.ancestors() {
            let permissions = table.grantable(ancestor.level(), false, granted);
            if !permissions.is_empty() {
                grants
                    .entry(ResourceSelector::scope_only(ancestor))
                    .or_default()
                    .extend(permissions);
            }
        }
    }

    Ok(grants)
}
