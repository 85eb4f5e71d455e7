//! Materialized ACL Store
//!
//! The store is the only shared mutable state of the pipeline. Every
//! mutation is scoped to one owning role assignment and is idempotent, so
//! concurrent fan-out tasks and retried events never conflict.

pub mod memory;

pub use memory::InMemoryAclStore;

use crate::error::Result;
use crate::types::{Acl, Permission, Principal, ResourceSelector};

use async_trait::async_trait;
use std::collections::BTreeSet;

#[async_trait]
pub trait AclStore: Send + Sync {
    /// Insert rows, skipping any whose key already exists. Returns the number
    /// of rows actually inserted.
    async fn insert_ignoring_duplicates(&self, acls: Vec<Acl>) -> Result<usize>;

    /// Delete every row owned by the assignment
    async fn delete_by_assignment(&self, role_assignment_id: &str) -> Result<usize>;

    async fn delete_by_assignment_and_permissions(
        &self,
        role_assignment_id: &str,
        permissions: &BTreeSet<Permission>,
    ) -> Result<usize>;

    async fn delete_by_assignment_and_principals(
        &self,
        role_assignment_id: &str,
        principals: &BTreeSet<Principal>,
    ) -> Result<usize>;

    /// Delete explicit rows carrying one of `selectors`
    async fn delete_by_assignment_and_selectors(
        &self,
        role_assignment_id: &str,
        selectors: &BTreeSet<ResourceSelector>,
    ) -> Result<usize>;

    async fn delete_implicit_for_assignment(&self, role_assignment_id: &str) -> Result<usize>;

    /// Delete rows owned by the assignment known as `identifier` at `scope`
    async fn delete_by_scope_and_identifier(&self, scope: &str, identifier: &str) -> Result<usize>;

    async fn distinct_permissions(&self, role_assignment_id: &str) -> Result<BTreeSet<Permission>>;

    async fn distinct_principals(&self, role_assignment_id: &str) -> Result<BTreeSet<Principal>>;

    /// Selectors of explicit rows only
    async fn distinct_selectors(&self, role_assignment_id: &str) -> Result<BTreeSet<ResourceSelector>>;

    async fn distinct_implicit_selectors(
        &self,
        role_assignment_id: &str,
    ) -> Result<BTreeSet<ResourceSelector>>;

    async fn rows_for_assignment(&self, role_assignment_id: &str) -> Result<Vec<Acl>>;
}
