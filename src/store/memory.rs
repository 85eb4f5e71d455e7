use super::AclStore;
use crate::error::{Result, RustAclError};
use crate::types::{Acl, AclKey, Permission, Principal, ResourceSelector};

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

/// In-memory ACL store partitioned by owning role assignment id
pub struct InMemoryAclStore {
    partitions: DashMap<String, HashMap<AclKey, Acl>>,
    pending_write_failures: AtomicUsize,
}

impl Default for InMemoryAclStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAclStore {
    pub fn new() -> Self {
        Self {
            partitions: DashMap::new(),
            pending_write_failures: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` mutating calls fail with a store error
    pub fn fail_next_writes(&self, count: usize) {
        self.pending_write_failures.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.partitions.iter().map(|partition| partition.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_for_assignment(&self, role_assignment_id: &str) -> usize {
        self.partitions
            .get(role_assignment_id)
            .map(|partition| partition.len())
            .unwrap_or(0)
    }

    pub fn assignment_ids(&self) -> BTreeSet<String> {
        self.partitions
            .iter()
            .filter(|partition| !partition.is_empty())
            .map(|partition| partition.key().clone())
            .collect()
    }

    fn check_injected_failure(&self) -> Result<()> {
        let injected = self
            .pending_write_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if injected {
            return Err(RustAclError::Store("injected write failure".to_string()));
        }
        Ok(())
    }

    fn retain_in(&self, role_assignment_id: &str, mut keep: impl FnMut(&Acl) -> bool) -> usize {
        let Some(mut partition) = self.partitions.get_mut(role_assignment_id) else {
            return 0;
        };
        let before = partition.len();
        partition.retain(|_, acl| keep(acl));
        before - partition.len()
    }

    fn collect_distinct<T: Ord>(
        &self,
        role_assignment_id: &str,
        mut project: impl FnMut(&Acl) -> Option<T>,
    ) -> BTreeSet<T> {
        self.partitions
            .get(role_assignment_id)
            .map(|partition| partition.values().filter_map(&mut project).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AclStore for InMemoryAclStore {
    async fn insert_ignoring_duplicates(&self, acls: Vec<Acl>) -> Result<usize> {
        self.check_injected_failure()?;

        let mut inserted = 0;
        for acl in acls {
            let mut partition = self
                .partitions
                .entry(acl.role_assignment_id.clone())
                .or_default();
            let key = acl.key();
            if !partition.contains_key(&key) {
                partition.insert(key, acl);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn delete_by_assignment(&self, role_assignment_id: &str) -> Result<usize> {
        self.check_injected_failure()?;
        Ok(self
            .partitions
            .remove(role_assignment_id)
            .map(|(_, partition)| partition.len())
            .unwrap_or(0))
    }

    async fn delete_by_assignment_and_permissions(
        &self,
        role_assignment_id: &str,
        permissions: &BTreeSet<Permission>,
    ) -> Result<usize> {
        self.check_injected_failure()?;
        Ok(self.retain_in(role_assignment_id, |acl| !permissions.contains(&acl.permission)))
    }

    async fn delete_by_assignment_and_principals(
        &self,
        role_assignment_id: &str,
        principals: &BTreeSet<Principal>,
    ) -> Result<usize> {
        self.check_injected_failure()?;
        Ok(self.retain_in(role_assignment_id, |acl| !principals.contains(&acl.principal)))
    }

    async fn delete_by_assignment_and_selectors(
        &self,
        role_assignment_id: &str,
        selectors: &BTreeSet<ResourceSelector>,
    ) -> Result<usize> {
        self.check_injected_failure()?;
        Ok(self.retain_in(role_assignment_id, |acl| {
            acl.implicit || !selectors.contains(&acl.resource_selector)
        }))
    }

    async fn delete_implicit_for_assignment(&self, role_assignment_id: &str) -> Result<usize> {
        self.check_injected_failure()?;
        Ok(self.retain_in(role_assignment_id, |acl| !acl.implicit))
    }

    async fn delete_by_scope_and_identifier(&self, scope: &str, identifier: &str) -> Result<usize> {
        self.check_injected_failure()?;

        let owners: Vec<String> = self
            .partitions
            .iter()
            .filter(|partition| {
                partition.values().any(|acl| {
                    acl.role_assignment_scope == scope && acl.role_assignment_identifier == identifier
                })
            })
            .map(|partition| partition.key().clone())
            .collect();

        let mut deleted = 0;
        for owner in owners {
            deleted += self.retain_in(&owner, |acl| {
                !(acl.role_assignment_scope == scope && acl.role_assignment_identifier == identifier)
            });
        }
        Ok(deleted)
    }

    async fn distinct_permissions(&self, role_assignment_id: &str) -> Result<BTreeSet<Permission>> {
        Ok(self.collect_distinct(role_assignment_id, |acl| Some(acl.permission.clone())))
    }

    async fn distinct_principals(&self, role_assignment_id: &str) -> Result<BTreeSet<Principal>> {
        Ok(self.collect_distinct(role_assignment_id, |acl| Some(acl.principal.clone())))
    }

    async fn distinct_selectors(&self, role_assignment_id: &str) -> Result<BTreeSet<ResourceSelector>> {
        Ok(self.collect_distinct(role_assignment_id, |acl| {
            (!acl.implicit).then(|| acl.resource_selector.clone())
        }))
    }

    async fn distinct_implicit_selectors(
        &self,
        role_assignment_id: &str,
    ) -> Result<BTreeSet<ResourceSelector>> {
        Ok(self.collect_distinct(role_assignment_id, |acl| {
            acl.implicit.then(|| acl.resource_selector.clone())
        }))
    }

    async fn rows_for_assignment(&self, role_assignment_id: &str) -> Result<Vec<Acl>> {
        let mut rows: Vec<Acl> = self
            .partitions
            .get(role_assignment_id)
            .map(|partition| partition.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|acl| acl.key());
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acl(principal: &str, permission: &str, selector: &str, implicit: bool) -> Acl {
        Acl {
            permission: Permission::from(permission),
            principal: Principal::user(principal),
            resource_selector: ResourceSelector::parse(selector).unwrap(),
            role_assignment_id: "ra-1".to_string(),
            role_assignment_scope: "acct1".to_string(),
            role_assignment_identifier: "ra1".to_string(),
            implicit,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_insert_ignores_duplicates() {
        let store = InMemoryAclStore::new();
        let rows = vec![
            acl("u1", "view", "pipeline:*", false),
            acl("u1", "view", "pipeline:*", false),
            acl("u1", "edit", "pipeline:*", false),
        ];

        assert_eq!(store.insert_ignoring_duplicates(rows.clone()).await.unwrap(), 2);
        assert_eq!(store.insert_ignoring_duplicates(rows).await.unwrap(), 0);
        assert_eq!(store.count_for_assignment("ra-1"), 2);
    }

    #[tokio::test]
    async fn test_selective_deletes() {
        let store = InMemoryAclStore::new();
        store
            .insert_ignoring_duplicates(vec![
                acl("u1", "view", "pipeline:*", false),
                acl("u2", "view", "pipeline:*", false),
                acl("u1", "edit", "secret:*", false),
                acl("u1", "view", "ACCOUNT:/acct1", true),
            ])
            .await
            .unwrap();

        let removed = store
            .delete_by_assignment_and_selectors("ra-1", &[ResourceSelector::parse("ACCOUNT:/acct1").unwrap()].into())
            .await
            .unwrap();
        assert_eq!(removed, 0, "implicit rows are not selector-deletable");

        let removed = store
            .delete_by_assignment_and_principals("ra-1", &[Principal::user("u2")].into())
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let removed = store
            .delete_by_assignment_and_permissions("ra-1", &[Permission::from("edit")].into())
            .await
            .unwrap();
        assert_eq!(removed, 1);

        assert_eq!(store.delete_implicit_for_assignment("ra-1").await.unwrap(), 1);
        assert_eq!(store.count_for_assignment("ra-1"), 1);
    }

    #[tokio::test]
    async fn test_distinct_queries_split_explicit_and_implicit() {
        let store = InMemoryAclStore::new();
        store
            .insert_ignoring_duplicates(vec![
                acl("u1", "view", "pipeline:*", false),
                acl("u1", "core_account_view", "ACCOUNT:/acct1", true),
            ])
            .await
            .unwrap();

        let selectors = store.distinct_selectors("ra-1").await.unwrap();
        assert_eq!(selectors.len(), 1);
        assert_eq!(selectors.iter().next().unwrap().to_string(), "pipeline:*");

        let implicit = store.distinct_implicit_selectors("ra-1").await.unwrap();
        assert_eq!(implicit.iter().next().unwrap().to_string(), "ACCOUNT:/acct1");

        assert_eq!(store.distinct_permissions("ra-1").await.unwrap().len(), 2);
        assert_eq!(store.distinct_principals("ra-1").await.unwrap().len(), 1);
        assert!(store.distinct_permissions("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_scope_and_identifier() {
        let store = InMemoryAclStore::new();
        store
            .insert_ignoring_duplicates(vec![acl("u1", "view", "pipeline:*", false)])
            .await
            .unwrap();

        assert_eq!(store.delete_by_scope_and_identifier("acct1", "other").await.unwrap(), 0);
        assert_eq!(store.delete_by_scope_and_identifier("acct1", "ra1").await.unwrap(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = InMemoryAclStore::new();
        store.fail_next_writes(1);

        assert!(store.delete_by_assignment("ra-1").await.is_err());
        assert_eq!(store.delete_by_assignment("ra-1").await.unwrap(), 0);
    }
}
