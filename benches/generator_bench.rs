//! Generator throughput benchmarks
//!
//! Measures the explicit principal x permission x selector product written
//! through the in-memory store, and the per-assignment delta applied when a
//! shared user group changes membership.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

use rustacl::catalog::{Catalog, InMemoryCatalog};
use rustacl::consumer::{ChangeConsumer, UserGroupChangeConsumer};
use rustacl::event::{ChangeEntity, ChangeOp, UpdatedFields};
use rustacl::generator::AclGenerator;
use rustacl::store::InMemoryAclStore;
use rustacl::types::{
    Permission, Principal, PrincipalKind, ResourceGroup, ResourceSelector, Role, RoleAssignment,
    UserGroup,
};
use rustacl::Config;

fn assignment(id: usize, principal: Principal) -> RoleAssignment {
    RoleAssignment {
        id: format!("ra-{}", id),
        identifier: format!("ra{}", id),
        scope: "acct1".to_string(),
        principal,
        principal_scope: None,
        role_identifier: "editor".to_string(),
        resource_group_identifier: "rg".to_string(),
        disabled: false,
    }
}

fn seed_catalog(catalog: &InMemoryCatalog, permissions: usize, selectors: usize) {
    catalog.upsert_role(Role {
        identifier: "editor".to_string(),
        scope: Some("acct1".to_string()),
        permissions: (0..permissions)
            .map(|i| Permission::new(format!("core_pipeline_action{}", i)))
            .collect(),
    });
    catalog.upsert_resource_group(ResourceGroup {
        identifier: "rg".to_string(),
        scope: Some("acct1".to_string()),
        resource_selectors: (0..selectors)
            .map(|i| ResourceSelector::new("PIPELINE", format!("/acct1/PIPELINE/p{}", i)))
            .collect(),
        resource_selectors_v2: BTreeSet::new(),
        scope_selectors: BTreeSet::new(),
    });
}

fn users(range: std::ops::Range<usize>) -> BTreeSet<String> {
    range.map(|i| format!("user{}", i)).collect()
}

/// Explicit rows for one assignment as the product grows
fn generate_benchmarks(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("generate");
    group.measurement_time(Duration::from_secs(10));

    for principals in [10usize, 100, 1_000] {
        let permissions = 10;
        let selectors = 10;
        group.throughput(Throughput::Elements((principals * permissions * selectors) as u64));
        group.bench_with_input(
            BenchmarkId::new("principals", principals),
            &principals,
            |b, &principals| {
                let principal_set: BTreeSet<Principal> =
                    users(0..principals).into_iter().map(Principal::user).collect();
                let permission_set: BTreeSet<Permission> = (0..permissions)
                    .map(|i| Permission::new(format!("core_pipeline_action{}", i)))
                    .collect();
                let selector_set: BTreeSet<ResourceSelector> = (0..selectors)
                    .map(|i| ResourceSelector::new("PIPELINE", format!("/acct1/PIPELINE/p{}", i)))
                    .collect();

                b.iter(|| {
                    let store = Arc::new(InMemoryAclStore::new());
                    let generator = AclGenerator::new(
                        store,
                        Catalog::in_memory(Arc::new(InMemoryCatalog::new())),
                        &Config::default(),
                    );
                    let created = rt.block_on(generator.generate(
                        &assignment(0, Principal::user("unused")),
                        &principal_set,
                        &permission_set,
                        &selector_set,
                    ));
                    black_box(created.unwrap())
                });
            },
        );
    }

    group.finish();
}

/// Membership swap fanned out across many assignments of one group
fn user_group_fanout_benchmarks(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("user_group_fanout");
    group.measurement_time(Duration::from_secs(10));

    for assignments in [1usize, 16, 64] {
        group.bench_with_input(
            BenchmarkId::new("assignments", assignments),
            &assignments,
            |b, &assignments| {
                let config = Config::default();
                let store = Arc::new(InMemoryAclStore::new());
                let catalog = Arc::new(InMemoryCatalog::new());
                seed_catalog(&catalog, 5, 5);
                catalog.upsert_user_group(UserGroup {
                    identifier: "devs".to_string(),
                    scope: "acct1".to_string(),
                    users: users(0..100),
                });
                let generator = Arc::new(AclGenerator::new(
                    store.clone(),
                    Catalog::in_memory(catalog.clone()),
                    &config,
                ));
                for i in 0..assignments {
                    let ra = assignment(i, Principal::new(PrincipalKind::UserGroup, "devs"));
                    catalog.upsert_role_assignment(ra.clone());
                    rt.block_on(generator.generate_for_assignment(&ra)).unwrap();
                }
                let consumer = UserGroupChangeConsumer::new(generator, store, &config);
                let op = ChangeOp::Update(UpdatedFields::Known(["users".to_string()].into()));

                // Alternate between two memberships differing in ten users
                let memberships = [users(0..100), users(10..110)];
                let mut turn = 0;
                b.iter(|| {
                    turn = (turn + 1) % 2;
                    let updated = UserGroup {
                        identifier: "devs".to_string(),
                        scope: "acct1".to_string(),
                        users: memberships[turn].clone(),
                    };
                    catalog.upsert_user_group(updated.clone());
                    let outcome = rt.block_on(consumer.consume_event(
                        &op,
                        "ug-devs",
                        Some(ChangeEntity::UserGroup(updated)),
                    ));
                    black_box(outcome.unwrap())
                });
            },
        );
    }

    group.finish();
}

criterion_group! {
    name = generator_benchmarks;
    config = Criterion::default()
        .significance_level(0.05)
        .sample_size(20);
    targets = generate_benchmarks, user_group_fanout_benchmarks
}

criterion_main!(generator_benchmarks);
