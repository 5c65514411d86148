//! Best-effort audit trail.

use std::sync::Arc;

use fogplane_telemetry::{events, MetricsRegistry};

use crate::db::{AuditEvent, NewAuditEvent, Store};
use crate::error::ControlResult;

#[derive(Clone)]
struct Sink {
    store: Arc<dyn Store>,
    metrics: Arc<MetricsRegistry>,
}

/// Writes audit events in their own transaction, after the operation they
/// describe has committed. Write failures are logged and counted, never
/// returned.
#[derive(Clone)]
pub struct EventLog {
    sink: Option<Sink>,
}

impl EventLog {
    pub fn new(store: Arc<dyn Store>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            sink: Some(Sink { store, metrics }),
        }
    }

    /// An event log that drops everything.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub async fn record(&self, batch: Vec<NewAuditEvent>) {
        let Some(sink) = &self.sink else {
            return;
        };
        if batch.is_empty() {
            return;
        }
        if let Err(e) = write(&sink.store, &batch).await {
            tracing::warn!(
                event = events::AUDIT_WRITE_FAILED,
                count = batch.len(),
                error = %e,
                "could not write audit events"
            );
            sink.metrics.record_audit_write_failure();
        }
    }

    /// Most recent events first.
    pub async fn recent(&self, limit: i64) -> ControlResult<Vec<AuditEvent>> {
        let Some(sink) = &self.sink else {
            return Ok(vec![]);
        };
        let mut tx = sink.store.begin().await?;
        Ok(tx.list_events(limit).await?)
    }
}

async fn write(store: &Arc<dyn Store>, batch: &[NewAuditEvent]) -> ControlResult<()> {
    let mut tx = store.begin().await?;
    for event in batch {
        tx.insert_event(event).await?;
    }
    tx.commit().await?;
    Ok(())
}
