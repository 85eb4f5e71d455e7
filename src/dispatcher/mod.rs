//! CDC Dispatcher
//!
//! Takes batches of change events, routes every event to the consumer of its
//! entity type and commits the batch once each event reached a terminal
//! state: applied, not applicable, suppressed, or dead-lettered. Events of a
//! batch are handled one after another so changes to the same entity keep
//! their relative order.

pub mod dead_letter;
pub mod offsets;
pub mod registry;
pub mod retry;
pub mod routing;

pub use dead_letter::{DeadLetter, DeadLetterSink, InMemoryDeadLetterSink, LoggingDeadLetterSink};
pub use offsets::{InMemoryOffsetCommitter, OffsetCommitter};
pub use registry::{ConsumerRegistry, ConsumerRegistryBuilder};
pub use retry::RetryPolicy;
pub use routing::TopicRouter;

use crate::catalog::AccountGate;
use crate::config::Config;
use crate::consumer::{AclDelta, ConsumeOutcome};
use crate::error::{Result, RustAclError};
use crate::event::{ChangeEntity, ChangeEvent, ChangeOp, EntityType};
use crate::metrics::SyncMetrics;

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Terminal state of one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDisposition {
    Applied(AclDelta),
    NotApplicable,
    /// Owning account is blocked; nothing was dispatched
    Suppressed,
    /// A duplicate-key failure: the write had already landed
    AlreadyApplied,
    DeadLettered { attempts: u32, error: String },
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub dispositions: Vec<EventDisposition>,
    pub delta: AclDelta,
    /// Highest offset committed per (topic, partition)
    pub committed: BTreeMap<(String, u32), u64>,
}

impl BatchReport {
    pub fn applied(&self) -> usize {
        self.count(|d| matches!(d, EventDisposition::Applied(_) | EventDisposition::AlreadyApplied))
    }

    pub fn not_applicable(&self) -> usize {
        self.count(|d| matches!(d, EventDisposition::NotApplicable))
    }

    pub fn suppressed(&self) -> usize {
        self.count(|d| matches!(d, EventDisposition::Suppressed))
    }

    pub fn dead_lettered(&self) -> usize {
        self.count(|d| matches!(d, EventDisposition::DeadLettered { .. }))
    }

    fn count(&self, predicate: impl Fn(&EventDisposition) -> bool) -> usize {
        self.dispositions.iter().filter(|d| predicate(d)).count()
    }
}

/// Event decoded into what a consumer needs
struct DecodedEvent {
    entity_type: EntityType,
    id: String,
    op: ChangeOp,
    entity: Option<ChangeEntity>,
}

pub struct ChangeDispatcher {
    registry: ConsumerRegistry,
    router: TopicRouter,
    retry: RetryPolicy,
    account_gate: Arc<dyn AccountGate>,
    dead_letters: Arc<dyn DeadLetterSink>,
    committer: Arc<dyn OffsetCommitter>,
    metrics: Arc<SyncMetrics>,
}

impl ChangeDispatcher {
    pub fn new(
        config: &Config,
        registry: ConsumerRegistry,
        account_gate: Arc<dyn AccountGate>,
        dead_letters: Arc<dyn DeadLetterSink>,
        committer: Arc<dyn OffsetCommitter>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            registry,
            router: TopicRouter::from_config(&config.routing),
            retry: RetryPolicy::from_config(&config.dispatcher.retry),
            account_gate,
            dead_letters,
            committer,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    /// Handle every event of the batch, then commit. A commit failure is
    /// returned so the batch is redelivered; handling is idempotent.
    pub async fn handle_batch(&self, events: Vec<ChangeEvent>) -> Result<BatchReport> {
        let start = Instant::now();
        let mut report = BatchReport::default();

        for event in &events {
            let disposition = self.handle_event(event).await;
            if let EventDisposition::Applied(delta) = &disposition {
                report.delta += *delta;
            }
            report.dispositions.push(disposition);

            let position = report
                .committed
                .entry((event.source_topic.clone(), event.partition))
                .or_insert(event.offset);
            *position = (*position).max(event.offset);
        }

        for ((topic, partition), offset) in &report.committed {
            self.committer.commit_offset(topic, *partition, *offset).await?;
        }

        info!(
            "Batch of {} events handled in {}ms: {} applied, {} not applicable, {} suppressed, {} dead-lettered ({} ACLs created, {} deleted)",
            events.len(),
            start.elapsed().as_millis(),
            report.applied(),
            report.not_applicable(),
            report.suppressed(),
            report.dead_lettered(),
            report.delta.created,
            report.delta.deleted
        );
        Ok(report)
    }

    /// Drive one event to a terminal state. Never fails: failures end in
    /// the dead-letter sink.
    pub async fn handle_event(&self, event: &ChangeEvent) -> EventDisposition {
        let timer = self.metrics.event_latency.start_timer();

        let disposition = match self.decode(event) {
            Ok(decoded) => self.dispatch_with_retry(event, &decoded).await,
            // Undecodable events fail the same way on every attempt
            Err(e) => self.dead_letter(event, e, 1).await,
        };

        match &disposition {
            EventDisposition::Applied(delta) => {
                self.metrics.acl_rows_created.inc_by(delta.created as u64);
                self.metrics.acl_rows_deleted.inc_by(delta.deleted as u64);
            }
            EventDisposition::NotApplicable => self.metrics.events_not_applicable.inc(),
            EventDisposition::Suppressed => self.metrics.events_suppressed.inc(),
            EventDisposition::AlreadyApplied => {}
            EventDisposition::DeadLettered { .. } => self.metrics.events_dead_lettered.inc(),
        }
        self.metrics.events_processed.inc();
        timer.observe_duration();

        disposition
    }

    fn decode(&self, event: &ChangeEvent) -> Result<DecodedEvent> {
        let entity_type = self.router.route(event.collection())?;
        let id = event.decode_id()?;
        let op = event.decode_op()?;
        let entity = match event.value.as_deref() {
            Some(payload) if !payload.is_empty() => Some(entity_type.decode(payload)?),
            _ => None,
        };
        Ok(DecodedEvent {
            entity_type,
            id,
            op,
            entity,
        })
    }

    async fn dispatch_with_retry(
        &self,
        event: &ChangeEvent,
        decoded: &DecodedEvent,
    ) -> EventDisposition {
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 1;
        loop {
            match self.dispatch(decoded).await {
                Ok(disposition) => return disposition,
                Err(e) if e.is_duplicate_key() => {
                    debug!("{} hit a duplicate key, treating as applied: {}", event, e);
                    return EventDisposition::AlreadyApplied;
                }
                Err(e) if attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt - 1);
                    warn!(
                        "{} {} of {} {} failed (attempt {}), retrying in {}ms: {}",
                        event,
                        decoded.op.name(),
                        decoded.entity_type,
                        decoded.id,
                        attempt,
                        delay.as_millis(),
                        e
                    );
                    self.metrics.events_retried.inc();
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return self.dead_letter(event, e, attempt).await,
            }
        }
    }

    async fn dispatch(&self, decoded: &DecodedEvent) -> Result<EventDisposition> {
        if let Some(account) = decoded.entity.as_ref().and_then(|e| e.account_identifier()) {
            if self.account_gate.is_account_blocked(account).await? {
                debug!(
                    "Suppressing {} of {} {}: account {} is blocked",
                    decoded.op.name(),
                    decoded.entity_type,
                    decoded.id,
                    account
                );
                return Ok(EventDisposition::Suppressed);
            }
        }

        let consumer = self.registry.consumer(decoded.entity_type)?;
        let outcome = consumer
            .consume_event(&decoded.op, &decoded.id, decoded.entity.clone())
            .await?;
        Ok(match outcome {
            ConsumeOutcome::Applied(delta) => EventDisposition::Applied(delta),
            ConsumeOutcome::NotApplicable => EventDisposition::NotApplicable,
        })
    }

    async fn dead_letter(
        &self,
        event: &ChangeEvent,
        error: RustAclError,
        attempts: u32,
    ) -> EventDisposition {
        error!("Giving up on {} after {} attempts: {}", event, attempts, error);
        if let Err(e) = self.dead_letters.dead_letter(event, &error, attempts).await {
            error!("Dead-letter sink rejected {}: {}", event, e);
        }
        EventDisposition::DeadLettered {
            attempts,
            error: error.to_string(),
        }
    }
}
