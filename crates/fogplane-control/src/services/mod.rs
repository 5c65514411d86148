//! Orchestration services.
//!
//! Every public operation opens one store transaction, does all of its writes
//! there and commits once. Work that must not share the primary atomicity
//! boundary (tag fan-out and audit records) is collected in a [`Deferred`] and
//! run after the commit.

mod agents;
mod applications;
mod catalog;
mod change_tracking;
mod events;
mod extra_hosts;
mod microservices;
mod ports;
mod routing;
mod tags;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use fogplane_telemetry::MetricsRegistry;
use serde::Deserialize;
use uuid::Uuid;

use crate::config::ControlConfig;
use crate::db::{Application, Microservice, NewAuditEvent, Store, StoreTx};
use crate::error::{ControlError, ControlResult};

pub use agents::AgentService;
pub use applications::{ApplicationManifest, ApplicationService, ApplicationView, ManifestRoute};
pub use catalog::CatalogService;
pub use change_tracking::{ChangeEvent, ChangeTracker};
pub use events::EventLog;
pub use extra_hosts::{AddressScope, ExtraHostRequest, ExtraHostResolver, HostTemplate, Resolution};
pub use microservices::{
    CreatedMicroservice, MicroserviceQuery, MicroserviceRequest, MicroserviceService,
    MicroserviceView, Placement, StatusReport,
};
pub use ports::{PortMappingService, PortMappingView, PortRequest, Protocol, PublicLink};
pub use routing::{RouteRequest, RouteUpdate, RoutingService};
pub use tags::{FanOutFailure, FanOutReport, TagFanOut};

/// Who issued an operation.
///
/// CLI callers act with controller privileges. API callers never see system
/// applications or system microservices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    Cli,
    Api,
}

impl Caller {
    pub fn is_privileged(self) -> bool {
        matches!(self, Caller::Cli)
    }
}

/// An application referenced by name or numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ApplicationRef {
    Id(i64),
    Name(String),
}

impl ApplicationRef {
    fn as_name(&self) -> String {
        match self {
            Self::Id(id) => id.to_string(),
            Self::Name(name) => name.clone(),
        }
    }

    fn as_id(&self) -> Option<i64> {
        match self {
            Self::Id(id) => Some(*id),
            Self::Name(name) => name.parse().ok(),
        }
    }
}

impl From<&str> for ApplicationRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

/// Resolve an application by name first, then by id.
pub(crate) async fn find_application(
    tx: &mut dyn StoreTx,
    reference: &ApplicationRef,
    caller: Caller,
) -> ControlResult<Application> {
    let mut found = tx.find_application_by_name(&reference.as_name()).await?;
    if found.is_none() {
        if let Some(id) = reference.as_id() {
            found = tx.find_application(id).await?;
        }
    }
    match found {
        Some(app) if caller.is_privileged() || !app.is_system => Ok(app),
        _ => Err(ControlError::not_found(format!(
            "application {} not found",
            reference.as_name()
        ))),
    }
}

/// A live microservice the caller may see. Deleted microservices, and system
/// microservices for unprivileged callers, are reported as not found.
pub(crate) async fn visible_microservice(
    tx: &mut dyn StoreTx,
    uuid: Uuid,
    caller: Caller,
) -> ControlResult<Microservice> {
    let not_found = || ControlError::not_found(format!("microservice {uuid} not found"));
    let microservice = tx.find_microservice(uuid).await?.ok_or_else(not_found)?;
    if microservice.delete {
        return Err(not_found());
    }
    if !caller.is_privileged() && is_system_microservice(tx, &microservice).await? {
        return Err(not_found());
    }
    Ok(microservice)
}

/// A microservice is system when its application is, or when it was built
/// from a `SYSTEM` catalog item.
pub(crate) async fn is_system_microservice(
    tx: &mut dyn StoreTx,
    microservice: &Microservice,
) -> ControlResult<bool> {
    if let Some(app) = tx.find_application(microservice.application_id).await? {
        if app.is_system {
            return Ok(true);
        }
    }
    Ok(match microservice.catalog_item_id {
        Some(id) => tx
            .find_catalog_item(id)
            .await?
            .is_some_and(|item| item.is_system()),
        None => false,
    })
}

/// Work that runs after the primary transaction commits.
#[derive(Debug, Default)]
pub(crate) struct Deferred {
    fan_out: Vec<(Uuid, Vec<i64>)>,
    audit: Vec<NewAuditEvent>,
}

impl Deferred {
    /// Advance the publishers of `tags`, newly subscribed by `subscriber`.
    pub(crate) fn fan_out(&mut self, subscriber: Uuid, tags: Vec<i64>) {
        if !tags.is_empty() {
            self.fan_out.push((subscriber, tags));
        }
    }

    pub(crate) fn audit(
        &mut self,
        action: &str,
        resource_kind: &str,
        resource_id: impl ToString,
        detail: serde_json::Value,
    ) {
        self.audit.push(NewAuditEvent {
            action: action.to_string(),
            resource_kind: resource_kind.to_string(),
            resource_id: resource_id.to_string(),
            detail,
        });
    }
}

/// Shared handles every service is built from.
#[derive(Clone)]
pub struct Services {
    store: Arc<dyn Store>,
    config: Arc<ControlConfig>,
    metrics: Arc<MetricsRegistry>,
    events: EventLog,
}

impl Services {
    pub fn new(store: Arc<dyn Store>, config: ControlConfig, metrics: Arc<MetricsRegistry>) -> Self {
        let events = EventLog::new(Arc::clone(&store), Arc::clone(&metrics));
        Self {
            store,
            config: Arc::new(config),
            metrics,
            events,
        }
    }

    /// Replace the audit log (e.g. with [`EventLog::disabled`]).
    pub fn with_event_log(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn tracker(&self) -> ChangeTracker {
        ChangeTracker::new(Arc::clone(&self.store), Arc::clone(&self.metrics))
    }

    pub fn ports(&self) -> PortMappingService {
        PortMappingService::new(Arc::clone(&self.config))
    }

    pub fn extra_hosts(&self) -> ExtraHostResolver {
        ExtraHostResolver::new(self.tracker(), Arc::clone(&self.metrics))
    }

    pub fn tags(&self) -> TagFanOut {
        TagFanOut::new(
            Arc::clone(&self.store),
            self.tracker(),
            Arc::clone(&self.metrics),
        )
    }

    pub fn routing(&self) -> RoutingService {
        RoutingService::new(self.clone())
    }

    pub fn microservices(&self) -> MicroserviceService {
        MicroserviceService::new(self.clone())
    }

    pub fn applications(&self) -> ApplicationService {
        ApplicationService::new(self.clone())
    }

    pub fn agents(&self) -> AgentService {
        AgentService::new(self.clone())
    }

    pub fn catalog(&self) -> CatalogService {
        CatalogService::new(self.clone())
    }

    /// Run post-commit work. Never fails.
    pub(crate) async fn finish(&self, deferred: Deferred) {
        let tags = self.tags();
        for (subscriber, tag_ids) in deferred.fan_out {
            tags.propagate(subscriber, &tag_ids).await;
        }
        self.events.record(deferred.audit).await;
    }

    /// Count an operation outcome.
    pub(crate) fn observe<T>(&self, operation: &str, result: &ControlResult<T>) {
        self.metrics.record_operation(operation, result.is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn application_ref_resolves_name_before_id() {
        let services = services();
        let first = create_app(&services, "app1").await;
        // An application literally named after the first one's id
        let named = create_app(&services, &first.id.to_string()).await;

        let mut tx = services.store().begin().await.unwrap();
        let by_id = find_application(&mut *tx, &ApplicationRef::Id(first.id), Caller::Cli)
            .await
            .unwrap();
        assert_eq!(by_id.id, named.id);

        let by_name = find_application(&mut *tx, &"app1".into(), Caller::Cli)
            .await
            .unwrap();
        assert_eq!(by_name.id, first.id);
    }

    #[tokio::test]
    async fn system_applications_are_hidden_from_api_callers() {
        let services = services();
        let system = services
            .applications()
            .create(
                ApplicationManifest::named("system-app").system(),
                Caller::Cli,
            )
            .await
            .unwrap();

        let mut tx = services.store().begin().await.unwrap();
        let err = find_application(&mut *tx, &"system-app".into(), Caller::Api)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::NotFound(_)));
        assert!(find_application(&mut *tx, &ApplicationRef::Id(system.application.id), Caller::Cli)
            .await
            .is_ok());
    }

    #[test]
    fn application_ref_deserializes_ids_and_names() {
        let id: ApplicationRef = serde_json::from_str("7").unwrap();
        let name: ApplicationRef = serde_json::from_str("\"app1\"").unwrap();
        assert_eq!(id, ApplicationRef::Id(7));
        assert_eq!(name, ApplicationRef::Name("app1".into()));
    }
}
