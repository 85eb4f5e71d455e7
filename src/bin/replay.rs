use anyhow::{Context, Result};
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use rustacl::catalog::{Catalog, InMemoryCatalog, StaticAccountGate};
use rustacl::dispatcher::{
    ChangeDispatcher, ConsumerRegistry, InMemoryOffsetCommitter, LoggingDeadLetterSink,
    TopicRouter,
};
use rustacl::event::ChangeEvent;
use rustacl::generator::AclGenerator;
use rustacl::metrics::SyncMetrics;
use rustacl::store::InMemoryAclStore;
use rustacl::types::{ResourceGroup, Role, RoleAssignment, UserGroup};
use rustacl::Config;

#[derive(Parser)]
#[command(name = "rustacl-replay")]
#[command(about = "Replay a recorded change stream into an in-memory ACL store")]
#[command(version)]
struct Cli {
    /// TOML configuration; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON catalog snapshot taken before the first event
    #[arg(long)]
    fixtures: Option<PathBuf>,

    /// Recorded events, one JSON object per line
    #[arg(long)]
    events: PathBuf,

    /// Events handed to the dispatcher per batch
    #[arg(long, default_value = "100")]
    batch_size: usize,

    /// Print the metrics registry in text exposition format when done
    #[arg(long)]
    dump_metrics: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Fixtures {
    roles: Vec<Role>,
    resource_groups: Vec<ResourceGroup>,
    user_groups: Vec<UserGroup>,
    role_assignments: Vec<RoleAssignment>,
    blocked_accounts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RecordedEvent {
    topic: String,
    #[serde(default)]
    partition: u32,
    offset: u64,
    key: serde_json::Value,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    headers: HashMap<String, String>,
}

impl RecordedEvent {
    fn into_change_event(self) -> Result<ChangeEvent> {
        let key = match self.key {
            serde_json::Value::String(raw) => raw.into_bytes(),
            other => serde_json::to_vec(&other)?,
        };
        let value = match self.value {
            None | Some(serde_json::Value::Null) => None,
            Some(payload) => Some(serde_json::to_vec(&payload)?),
        };
        Ok(ChangeEvent {
            key: Some(key),
            value,
            source_topic: self.topic,
            partition: self.partition,
            offset: self.offset,
            timestamp: chrono::Utc::now(),
            headers: self.headers,
        })
    }
}

fn load_fixtures(path: &PathBuf, catalog: &InMemoryCatalog, gate: &StaticAccountGate) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading fixtures {}", path.display()))?;
    let fixtures: Fixtures = serde_json::from_str(&content)
        .with_context(|| format!("parsing fixtures {}", path.display()))?;

    info!(
        "Seeding {} roles, {} resource groups, {} user groups, {} role assignments",
        fixtures.roles.len(),
        fixtures.resource_groups.len(),
        fixtures.user_groups.len(),
        fixtures.role_assignments.len()
    );
    fixtures.roles.into_iter().for_each(|r| catalog.upsert_role(r));
    fixtures
        .resource_groups
        .into_iter()
        .for_each(|g| catalog.upsert_resource_group(g));
    fixtures.user_groups.into_iter().for_each(|g| catalog.upsert_user_group(g));
    fixtures
        .role_assignments
        .into_iter()
        .for_each(|a| catalog.upsert_role_assignment(a));
    fixtures.blocked_accounts.into_iter().for_each(|a| gate.block(a));
    Ok(())
}

fn load_events(path: &PathBuf) -> Result<Vec<ChangeEvent>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading events {}", path.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| {
            let recorded: RecordedEvent = serde_json::from_str(line)
                .with_context(|| format!("{}:{} is not a recorded event", path.display(), number + 1))?;
            recorded.into_change_event()
        })
        .collect()
}

/// The captured collection already holds the change when its event arrives
fn mirror_into_catalog(catalog: &InMemoryCatalog, router: &TopicRouter, event: &ChangeEvent) {
    let mirrored = (|| -> rustacl::Result<()> {
        let entity_type = router.route(event.collection())?;
        let id = event.decode_id()?;
        let op = event.decode_op()?;
        let entity = match event.value.as_deref() {
            Some(payload) if !payload.is_empty() => Some(entity_type.decode(payload)?),
            _ => None,
        };
        catalog.apply_change(&op, &id, entity.as_ref());
        Ok(())
    })();
    if let Err(e) = mirrored {
        warn!("Not mirroring {} into the catalog: {}", event, e);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let path = path.to_string_lossy();
            Config::from_file(&path).with_context(|| format!("loading config {}", path))?
        }
        None => Config::default(),
    };
    config.validate()?;

    let store = Arc::new(InMemoryAclStore::new());
    let catalog = Arc::new(InMemoryCatalog::new());
    let gate = Arc::new(StaticAccountGate::new());
    if let Some(path) = &cli.fixtures {
        load_fixtures(path, &catalog, &gate)?;
    }

    let generator = Arc::new(AclGenerator::new(
        store.clone(),
        Catalog::in_memory(catalog.clone()),
        &config,
    ));
    let registry = ConsumerRegistry::standard(generator, store.clone(), &config)?;
    let committer = Arc::new(InMemoryOffsetCommitter::new());
    let metrics = SyncMetrics::new()?;
    let dispatcher = ChangeDispatcher::new(
        &config,
        registry,
        gate,
        Arc::new(LoggingDeadLetterSink),
        committer.clone(),
        metrics.clone(),
    );
    let router = TopicRouter::from_config(&config.routing);

    let events = load_events(&cli.events)?;
    info!("Replaying {} events in batches of {}", events.len(), cli.batch_size);

    for (index, batch) in events.chunks(cli.batch_size.max(1)).enumerate() {
        for event in batch {
            mirror_into_catalog(&catalog, &router, event);
        }
        let report = dispatcher.handle_batch(batch.to_vec()).await?;
        println!(
            "batch {}: {} events, {} applied, {} not applicable, {} suppressed, {} dead-lettered, +{} / -{} ACLs",
            index,
            report.dispositions.len(),
            report.applied(),
            report.not_applicable(),
            report.suppressed(),
            report.dead_lettered(),
            report.delta.created,
            report.delta.deleted
        );
        for ((topic, partition), offset) in &report.committed {
            println!("  committed {}:{} @ {}", topic, partition, offset);
        }
    }

    println!("{} ACLs materialized", store.len());
    for id in store.assignment_ids() {
        println!("  {}: {}", id, store.count_for_assignment(&id));
    }

    if cli.dump_metrics {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metrics.registry.gather(), &mut buffer)?;
        print!("{}", String::from_utf8(buffer)?);
    }

    Ok(())
}
