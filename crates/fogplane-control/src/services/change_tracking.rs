//! Per-agent change tracking.
//!
//! Agents poll their change record and re-fetch whatever advanced since the
//! last poll. Writers describe *what happened* with a [`ChangeEvent`]; the
//! tracker expands it into the flags an agent actually watches.

use std::sync::Arc;

use fogplane_telemetry::{events, MetricsRegistry};
use uuid::Uuid;

use crate::db::{ChangeFlag, ChangeRecord, Store, StoreTx};
use crate::error::{ControlError, ControlResult};

/// Kind of change applied to an agent's desired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeEvent {
    /// A microservice's definition changed.
    MicroserviceCommon,
    /// The set of microservices on the agent changed.
    MicroserviceList,
    /// Only microservice configuration changed.
    MicroserviceConfig,
    /// Anything about the agent's microservices may have changed.
    MicroserviceFull,
    /// Routes to or from the agent's microservices changed.
    MicroserviceRouting,
    EdgeResources,
    Tunnel,
    Registries,
}

impl ChangeEvent {
    /// Flags advanced by this event.
    pub fn flags(self) -> &'static [ChangeFlag] {
        match self {
            Self::MicroserviceCommon => &[ChangeFlag::MicroserviceConfig, ChangeFlag::MicroserviceList],
            Self::MicroserviceList => &[ChangeFlag::MicroserviceList],
            Self::MicroserviceConfig => &[ChangeFlag::MicroserviceConfig],
            Self::MicroserviceFull => &[
                ChangeFlag::MicroserviceConfig,
                ChangeFlag::MicroserviceList,
                ChangeFlag::Routing,
                ChangeFlag::Registries,
            ],
            Self::MicroserviceRouting => &[ChangeFlag::Routing],
            Self::EdgeResources => &[ChangeFlag::EdgeResources],
            Self::Tunnel => &[ChangeFlag::Tunnel],
            Self::Registries => &[ChangeFlag::Registries],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MicroserviceCommon => "microservice_common",
            Self::MicroserviceList => "microservice_list",
            Self::MicroserviceConfig => "microservice_config",
            Self::MicroserviceFull => "microservice_full",
            Self::MicroserviceRouting => "microservice_routing",
            Self::EdgeResources => "edge_resources",
            Self::Tunnel => "tunnel",
            Self::Registries => "registries",
        }
    }
}

/// Advances and reads per-agent change records.
#[derive(Clone)]
pub struct ChangeTracker {
    store: Arc<dyn Store>,
    metrics: Arc<MetricsRegistry>,
}

impl ChangeTracker {
    pub fn new(store: Arc<dyn Store>, metrics: Arc<MetricsRegistry>) -> Self {
        Self { store, metrics }
    }

    /// Advance `fog`'s record for `event` inside `tx`. No-op for an unplaced
    /// microservice (`fog == None`).
    pub async fn update(
        &self,
        tx: &mut dyn StoreTx,
        fog: Option<Uuid>,
        event: ChangeEvent,
    ) -> ControlResult<()> {
        let Some(fog) = fog else {
            return Ok(());
        };
        for flag in event.flags() {
            tx.bump_change(fog, *flag).await?;
        }
        tracing::debug!(
            event = events::CHANGE_TRACKED,
            fog_uuid = %fog,
            change = event.as_str(),
            "change tracked"
        );
        self.metrics.record_change_event(event.as_str());
        Ok(())
    }

    /// Current change record of an agent.
    pub async fn record(&self, fog: Uuid) -> ControlResult<ChangeRecord> {
        let mut tx = self.store.begin().await?;
        ensure_fog(&mut *tx, fog).await?;
        let entries = tx.list_changes(fog).await?;
        Ok(ChangeRecord {
            fog_uuid: fog,
            entries,
        })
    }

    /// Mark every pending flag of an agent as fetched.
    pub async fn acknowledge(&self, fog: Uuid) -> ControlResult<u64> {
        let mut tx = self.store.begin().await?;
        ensure_fog(&mut *tx, fog).await?;
        let cleared = tx.clear_changes(fog).await?;
        tx.commit().await?;
        Ok(cleared)
    }
}

async fn ensure_fog(tx: &mut dyn StoreTx, fog: Uuid) -> ControlResult<()> {
    match tx.find_fog(fog).await? {
        Some(_) => Ok(()),
        None => Err(ControlError::not_found(format!("agent {fog} not found"))),
    }
}
