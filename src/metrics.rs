use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

use crate::error::Result;

pub struct SyncMetrics {
    pub events_processed: IntCounter,
    pub events_suppressed: IntCounter,
    pub events_not_applicable: IntCounter,
    pub events_retried: IntCounter,
    pub events_dead_lettered: IntCounter,
    pub acl_rows_created: IntCounter,
    pub acl_rows_deleted: IntCounter,
    pub event_latency: Histogram,
    pub registry: Registry,
}

impl SyncMetrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let events_processed = IntCounter::new(
            "acl_events_processed_total",
            "Change events that reached terminal handling",
        )?;
        let events_suppressed = IntCounter::new(
            "acl_events_suppressed_total",
            "Change events skipped because their account is blocked",
        )?;
        let events_not_applicable = IntCounter::new(
            "acl_events_not_applicable_total",
            "Change events that carried no materialization-relevant change",
        )?;
        let events_retried = IntCounter::new(
            "acl_events_retried_total",
            "Retried event handling attempts",
        )?;
        let events_dead_lettered = IntCounter::new(
            "acl_events_dead_lettered_total",
            "Change events handed to the dead-letter sink",
        )?;
        let acl_rows_created = IntCounter::new(
            "acl_rows_created_total",
            "Materialized ACL rows inserted",
        )?;
        let acl_rows_deleted = IntCounter::new(
            "acl_rows_deleted_total",
            "Materialized ACL rows removed",
        )?;
        let event_latency = Histogram::with_opts(HistogramOpts::new(
            "acl_event_handling_seconds",
            "Wall time to reach terminal handling for one change event",
        ))?;

        registry.register(Box::new(events_processed.clone()))?;
        registry.register(Box::new(events_suppressed.clone()))?;
        registry.register(Box::new(events_not_applicable.clone()))?;
        registry.register(Box::new(events_retried.clone()))?;
        registry.register(Box::new(events_dead_lettered.clone()))?;
        registry.register(Box::new(acl_rows_created.clone()))?;
        registry.register(Box::new(acl_rows_deleted.clone()))?;
        registry.register(Box::new(event_latency.clone()))?;

        Ok(Arc::new(Self {
            events_processed,
            events_suppressed,
            events_not_applicable,
            events_retried,
            events_dead_lettered,
            acl_rows_created,
            acl_rows_deleted,
            event_latency,
            registry,
        }))
    }
}
