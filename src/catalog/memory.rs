use super::{
    AccountGate, ResourceGroupLookup, RoleAssignmentRepository, RoleLookup, UserGroupLookup,
};
use crate::error::Result;
use crate::event::{ChangeEntity, ChangeOp};
use crate::types::{scope_is_within, PrincipalKind, ResourceGroup, Role, RoleAssignment, UserGroup};

use async_trait::async_trait;
use dashmap::DashSet;
use parking_lot::RwLock;
use std::collections::HashMap;

type ScopedKey = (Option<String>, String);

/// In-memory primitives catalog used by tests and the replay tool
#[derive(Default)]
pub struct InMemoryCatalog {
    roles: RwLock<HashMap<ScopedKey, Role>>,
    resource_groups: RwLock<HashMap<ScopedKey, ResourceGroup>>,
    user_groups: RwLock<HashMap<(String, String), UserGroup>>,
    role_assignments: RwLock<HashMap<String, RoleAssignment>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_role(&self, role: Role) {
        self.roles
            .write()
            .insert((role.scope.clone(), role.identifier.clone()), role);
    }

    pub fn remove_role(&self, identifier: &str, scope: Option<&str>) -> Option<Role> {
        self.roles
            .write()
            .remove(&(scope.map(str::to_string), identifier.to_string()))
    }

    pub fn upsert_resource_group(&self, resource_group: ResourceGroup) {
        self.resource_groups.write().insert(
            (resource_group.scope.clone(), resource_group.identifier.clone()),
            resource_group,
        );
    }

    pub fn remove_resource_group(&self, identifier: &str, scope: Option<&str>) -> Option<ResourceGroup> {
        self.resource_groups
            .write()
            .remove(&(scope.map(str::to_string), identifier.to_string()))
    }

    pub fn upsert_user_group(&self, user_group: UserGroup) {
        self.user_groups.write().insert(
            (user_group.scope.clone(), user_group.identifier.clone()),
            user_group,
        );
    }

    pub fn remove_user_group(&self, identifier: &str, scope: &str) -> Option<UserGroup> {
        self.user_groups
            .write()
            .remove(&(scope.to_string(), identifier.to_string()))
    }

    pub fn upsert_role_assignment(&self, role_assignment: RoleAssignment) {
        self.role_assignments
            .write()
            .insert(role_assignment.id.clone(), role_assignment);
    }

    pub fn remove_role_assignment(&self, id: &str) -> Option<RoleAssignment> {
        self.role_assignments.write().remove(id)
    }

    /// Mirror a captured change into the catalog, the way the source
    /// collection looked once the change was written.
    pub fn apply_change(&self, op: &ChangeOp, id: &str, entity: Option<&ChangeEntity>) {
        match (op, entity) {
            (ChangeOp::Delete, Some(ChangeEntity::Role(role))) => {
                self.remove_role(&role.identifier, role.scope.as_deref());
            }
            (ChangeOp::Delete, Some(ChangeEntity::ResourceGroup(group))) => {
                self.remove_resource_group(&group.identifier, group.scope.as_deref());
            }
            (ChangeOp::Delete, Some(ChangeEntity::UserGroup(group))) => {
                self.remove_user_group(&group.identifier, &group.scope);
            }
            (ChangeOp::Delete, _) => {
                self.remove_role_assignment(id);
            }
            (_, Some(ChangeEntity::Role(role))) => self.upsert_role(role.clone()),
            (_, Some(ChangeEntity::ResourceGroup(group))) => self.upsert_resource_group(group.clone()),
            (_, Some(ChangeEntity::UserGroup(group))) => self.upsert_user_group(group.clone()),
            (_, Some(ChangeEntity::RoleAssignment(assignment))) => {
                let mut assignment = assignment.clone();
                if assignment.id.is_empty() {
                    assignment.id = id.to_string();
                }
                self.upsert_role_assignment(assignment);
            }
            (_, None) => {}
        }
    }

    fn scoped_or_managed<T: Clone>(
        entries: &HashMap<ScopedKey, T>,
        identifier: &str,
        scope: Option<&str>,
    ) -> Option<T> {
        if let Some(scope) = scope {
            if let Some(entry) = entries.get(&(Some(scope.to_string()), identifier.to_string())) {
                return Some(entry.clone());
            }
        }
        entries.get(&(None, identifier.to_string())).cloned()
    }

    fn select_assignments(&self, predicate: impl Fn(&RoleAssignment) -> bool) -> Vec<RoleAssignment> {
        let mut matches: Vec<RoleAssignment> = self
            .role_assignments
            .read()
            .values()
            .filter(|assignment| predicate(assignment))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        matches
    }
}

#[async_trait]
impl RoleLookup for InMemoryCatalog {
    async fn get_role(&self, identifier: &str, scope: Option<&str>) -> Result<Option<Role>> {
        Ok(Self::scoped_or_managed(&self.roles.read(), identifier, scope))
    }
}

#[async_trait]
impl ResourceGroupLookup for InMemoryCatalog {
    async fn get_resource_group(
        &self,
        identifier: &str,
        scope: Option<&str>,
    ) -> Result<Option<ResourceGroup>> {
        Ok(Self::scoped_or_managed(&self.resource_groups.read(), identifier, scope))
    }
}

#[async_trait]
impl UserGroupLookup for InMemoryCatalog {
    async fn get_user_group(&self, identifier: &str, scope: &str) -> Result<Option<UserGroup>> {
        Ok(self
            .user_groups
            .read()
            .get(&(scope.to_string(), identifier.to_string()))
            .cloned())
    }
}

#[async_trait]
impl RoleAssignmentRepository for InMemoryCatalog {
    async fn get_by_id(&self, id: &str) -> Result<Option<RoleAssignment>> {
        Ok(self.role_assignments.read().get(id).cloned())
    }

    async fn find_by_role(
        &self,
        role_identifier: &str,
        role_scope: Option<&str>,
    ) -> Result<Vec<RoleAssignment>> {
        Ok(self.select_assignments(|assignment| {
            assignment.role_identifier == role_identifier
                && role_scope.map_or(true, |scope| scope_is_within(&assignment.scope, scope))
        }))
    }

    async fn find_by_resource_group(
        &self,
        resource_group_identifier: &str,
        resource_group_scope: Option<&str>,
    ) -> Result<Vec<RoleAssignment>> {
        Ok(self.select_assignments(|assignment| {
            assignment.resource_group_identifier == resource_group_identifier
                && resource_group_scope.map_or(true, |scope| assignment.scope == scope)
        }))
    }

    async fn find_by_user_group(
        &self,
        user_group_identifier: &str,
        user_group_scope: &str,
    ) -> Result<Vec<RoleAssignment>> {
        Ok(self.select_assignments(|assignment| {
            let principal_scope = assignment
                .principal_scope
                .as_deref()
                .unwrap_or(&assignment.scope);
            assignment.principal.kind == PrincipalKind::UserGroup
                && assignment.principal.identifier == user_group_identifier
                && principal_scope == user_group_scope
                && scope_is_within(&assignment.scope, user_group_scope)
        }))
    }
}

/// Fixed set of blocked accounts
#[derive(Default)]
pub struct StaticAccountGate {
    blocked: DashSet<String>,
}

impl StaticAccountGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&self, account_identifier: impl Into<String>) {
        self.blocked.insert(account_identifier.into());
    }

    pub fn unblock(&self, account_identifier: &str) {
        self.blocked.remove(account_identifier);
    }
}

#[async_trait]
impl AccountGate for StaticAccountGate {
    async fn is_account_blocked(&self, account_identifier: &str) -> Result<bool> {
        Ok(self.blocked.contains(account_identifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Permission, Principal};

    fn assignment(id: &str, scope: &str, principal: Principal, role: &str) -> RoleAssignment {
        RoleAssignment {
            id: id.to_string(),
            identifier: id.to_string(),
            scope: scope.to_string(),
            principal,
            principal_scope: None,
            role_identifier: role.to_string(),
            resource_group_identifier: "rg".to_string(),
            disabled: false,
        }
    }

    #[tokio::test]
    async fn test_role_lookup_falls_back_to_managed() {
        let catalog = InMemoryCatalog::new();
        catalog.upsert_role(Role {
            identifier: "viewer".to_string(),
            scope: None,
            permissions: [Permission::from("view")].into(),
        });

        let role = catalog.get_role("viewer", Some("acct1")).await.unwrap();
        assert!(role.is_some());

        catalog.upsert_role(Role {
            identifier: "viewer".to_string(),
            scope: Some("acct1".to_string()),
            permissions: [Permission::from("edit")].into(),
        });
        let scoped = catalog.get_role("viewer", Some("acct1")).await.unwrap().unwrap();
        assert!(scoped.permissions.contains(&Permission::from("edit")));
    }

    #[tokio::test]
    async fn test_find_by_role_respects_scope_tree() {
        let catalog = InMemoryCatalog::new();
        catalog.upsert_role_assignment(assignment("a", "acct1", Principal::user("u1"), "r"));
        catalog.upsert_role_assignment(assignment("b", "acct1/org1", Principal::user("u1"), "r"));
        catalog.upsert_role_assignment(assignment("c", "acct2", Principal::user("u1"), "r"));
        catalog.upsert_role_assignment(assignment("d", "acct1", Principal::user("u1"), "other"));

        let ids: Vec<String> = catalog
            .find_by_role("r", Some("acct1"))
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert_eq!(catalog.find_by_role("r", None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_find_by_user_group_only_matches_group_principals() {
        let catalog = InMemoryCatalog::new();
        catalog.upsert_role_assignment(assignment("a", "acct1", Principal::user_group("devs"), "r"));
        catalog.upsert_role_assignment(assignment("b", "acct1", Principal::user("devs"), "r"));
        let mut inherited = assignment("c", "acct1/org1", Principal::user_group("devs"), "r");
        inherited.principal_scope = Some("acct1".to_string());
        catalog.upsert_role_assignment(inherited);

        let ids: Vec<String> = catalog
            .find_by_user_group("devs", "acct1")
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_apply_change_mirrors_source() {
        let catalog = InMemoryCatalog::new();
        let mut created = assignment("", "acct1", Principal::user("u1"), "r");
        created.identifier = "ra1".to_string();
        catalog.apply_change(
            &ChangeOp::Create,
            "ra-9",
            Some(&ChangeEntity::RoleAssignment(created)),
        );
        let stored = catalog.get_by_id("ra-9").await.unwrap().unwrap();
        assert_eq!(stored.identifier, "ra1");

        catalog.apply_change(&ChangeOp::Delete, "ra-9", None);
        assert!(catalog.get_by_id("ra-9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_account_gate() {
        let gate = StaticAccountGate::new();
        gate.block("acct1");
        assert!(gate.is_account_blocked("acct1").await.unwrap());
        gate.unblock("acct1");
        assert!(!gate.is_account_blocked("acct1").await.unwrap());
    }
}
