//! Application aggregator.
//!
//! An application manifest names the microservices and routes that make up
//! an application. Creating or updating from a manifest is all-or-nothing.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::db::{Application, ApplicationPatch, MicroserviceFilter, NewApplication, Route, StoreTx};
use crate::error::{ControlError, ControlResult};

use super::change_tracking::ChangeEvent;
use super::microservices::{MicroserviceQuery, MicroserviceRequest, MicroserviceView, Placement};
use super::routing::{RouteRequest, RouteUpdate};
use super::{find_application, ApplicationRef, Caller, Deferred, Services};

/// A route between two microservices of the manifest, by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRoute {
    pub name: String,
    pub from: String,
    pub to: String,
}

/// A fully expanded application definition.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationManifest {
    pub name: String,
    pub description: Option<String>,
    pub is_activated: Option<bool>,
    #[serde(default)]
    pub is_system: bool,
    #[serde(default)]
    pub microservices: Vec<MicroserviceRequest>,
    #[serde(default)]
    pub routes: Vec<ManifestRoute>,
}

impl ApplicationManifest {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Mark the application as controller-managed.
    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }

    pub fn with_microservice(mut self, request: MicroserviceRequest) -> Self {
        self.microservices.push(request);
        self
    }

    pub fn with_route(mut self, name: &str, from: &str, to: &str) -> Self {
        self.routes.push(ManifestRoute {
            name: name.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
        self
    }
}

/// An application with its microservices and routes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationView {
    #[serde(flatten)]
    pub application: Application,
    pub microservices: Vec<MicroserviceView>,
    pub routes: Vec<Route>,
}

#[derive(Clone)]
pub struct ApplicationService {
    ctx: Services,
}

impl ApplicationService {
    pub fn new(ctx: Services) -> Self {
        Self { ctx }
    }

    /// Create an application with every microservice and route of the
    /// manifest, or nothing at all.
    pub async fn create(
        &self,
        manifest: ApplicationManifest,
        caller: Caller,
    ) -> ControlResult<ApplicationView> {
        let result = async {
            let name = manifest.name.trim();
            if name.is_empty() {
                return Err(ControlError::validation("application name is required"));
            }
            let mut tx = self.ctx.store().begin().await?;
            let mut deferred = Deferred::default();
            if tx.find_application_by_name(name).await?.is_some() {
                return Err(ControlError::duplicate(format!(
                    "application {name} already exists"
                )));
            }
            let app = tx
                .insert_application(&NewApplication {
                    name: name.to_string(),
                    description: manifest.description.clone(),
                    is_activated: manifest.is_activated.unwrap_or(true),
                    is_system: manifest.is_system && caller.is_privileged(),
                })
                .await?;

            let microservices = self.ctx.microservices();
            for request in &manifest.microservices {
                let request = owned_by(request, &app);
                microservices
                    .create_in(&mut *tx, &request, caller, &mut deferred)
                    .await?;
            }
            let routing = self.ctx.routing();
            for route in &manifest.routes {
                let request = RouteRequest::by_name(&route.name, &app.name, &route.from, &route.to);
                routing
                    .create_in(&mut *tx, &request, caller, &mut deferred)
                    .await?;
            }
            tx.commit().await?;

            tracing::info!(
                application = %app.name,
                microservices = manifest.microservices.len(),
                routes = manifest.routes.len(),
                "application created"
            );
            deferred.audit(
                "created",
                "application",
                app.id,
                json!({"name": app.name, "system": app.is_system}),
            );
            self.ctx.finish(deferred).await;
            self.get(&app.name, Caller::Cli).await
        }
        .await;
        self.ctx.observe("create_application", &result);
        result
    }

    /// Reconcile an application with a manifest: missing microservices and
    /// routes are created, present ones updated, the rest deleted. Agents
    /// touched by several microservices are advanced once per change kind.
    pub async fn update(
        &self,
        name: &str,
        manifest: ApplicationManifest,
        caller: Caller,
    ) -> ControlResult<ApplicationView> {
        let result = async {
            let mut tx = self.ctx.store().begin().await?;
            let mut deferred = Deferred::default();
            let app = find_application(&mut *tx, &name.into(), caller).await?;

            let patch = ApplicationPatch {
                description: manifest.description.clone(),
                is_activated: manifest.is_activated,
            };
            let app = tx
                .update_application(app.id, &patch)
                .await?
                .ok_or_else(|| ControlError::not_found(format!("application {name} not found")))?;

            let mut placements = Vec::new();
            self.reconcile_microservices(&mut *tx, &app, &manifest, caller, &mut placements, &mut deferred)
                .await?;
            self.reconcile_routes(&mut *tx, &app, &manifest, caller, &mut deferred)
                .await?;
            self.track_batch(&mut *tx, &placements).await?;
            tx.commit().await?;

            deferred.audit("updated", "application", app.id, json!({"name": app.name}));
            self.ctx.finish(deferred).await;
            self.get(&app.name, Caller::Cli).await
        }
        .await;
        self.ctx.observe("update_application", &result);
        result
    }

    async fn reconcile_microservices(
        &self,
        tx: &mut dyn StoreTx,
        app: &Application,
        manifest: &ApplicationManifest,
        caller: Caller,
        placements: &mut Vec<Placement>,
        deferred: &mut Deferred,
    ) -> ControlResult<()> {
        let filter = MicroserviceFilter {
            application_id: Some(app.id),
            ..Default::default()
        };
        let existing: HashMap<String, Uuid> = tx
            .list_microservices(&filter)
            .await?
            .into_iter()
            .map(|m| (m.name, m.uuid))
            .collect();
        let wanted: BTreeSet<&str> = manifest
            .microservices
            .iter()
            .filter_map(|m| m.name.as_deref())
            .collect();

        let microservices = self.ctx.microservices();
        for (name, uuid) in &existing {
            if !wanted.contains(name.as_str()) {
                microservices.delete_in(tx, *uuid, caller, deferred).await?;
            }
        }
        for request in &manifest.microservices {
            let request = owned_by(request, app);
            let existing_uuid = request.name.as_deref().and_then(|n| existing.get(n));
            match existing_uuid {
                Some(uuid) => {
                    let placement = microservices
                        .update_in(tx, *uuid, &request, caller, false, deferred)
                        .await?;
                    placements.push(placement);
                }
                None => {
                    microservices
                        .create_in(tx, &request, caller, deferred)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn reconcile_routes(
        &self,
        tx: &mut dyn StoreTx,
        app: &Application,
        manifest: &ApplicationManifest,
        caller: Caller,
        deferred: &mut Deferred,
    ) -> ControlResult<()> {
        let routing = self.ctx.routing();
        let existing: BTreeSet<String> = tx
            .list_routes(Some(app.id))
            .await?
            .into_iter()
            .map(|r| r.name)
            .collect();
        let wanted: BTreeSet<&str> = manifest.routes.iter().map(|r| r.name.as_str()).collect();

        for name in &existing {
            if !wanted.contains(name.as_str()) {
                routing
                    .delete_in(tx, &app.name, name, caller, deferred)
                    .await?;
            }
        }
        for route in &manifest.routes {
            if existing.contains(&route.name) {
                let update = RouteUpdate {
                    name: None,
                    from: Some(route.from.clone()),
                    to: Some(route.to.clone()),
                };
                routing
                    .update_in(tx, &app.name, &route.name, &update, caller, deferred)
                    .await?;
            } else {
                let request = RouteRequest::by_name(&route.name, &app.name, &route.from, &route.to);
                routing.create_in(tx, &request, caller, deferred).await?;
            }
        }
        Ok(())
    }

    async fn track_batch(&self, tx: &mut dyn StoreTx, placements: &[Placement]) -> ControlResult<()> {
        let mut batch = BTreeSet::new();
        for placement in placements {
            if placement.moved() {
                if let Some(old) = placement.microservice_iofog_uuid {
                    batch.insert((old, ChangeEvent::MicroserviceList));
                }
                if let Some(new) = placement.updated_microservice_iofog_uuid {
                    batch.insert((new, ChangeEvent::MicroserviceFull));
                }
            } else if let Some(fog) = placement.updated_microservice_iofog_uuid {
                batch.insert((fog, ChangeEvent::MicroserviceCommon));
            }
        }
        let tracker = self.ctx.tracker();
        for (fog, event) in batch {
            tracker.update(tx, Some(fog), event).await?;
        }
        Ok(())
    }

    /// Update description or activation. Toggling activation refreshes the
    /// microservice list of every agent running the application.
    pub async fn patch(
        &self,
        name: &str,
        patch: ApplicationPatch,
        caller: Caller,
    ) -> ControlResult<Application> {
        let result = async {
            let mut tx = self.ctx.store().begin().await?;
            let app = find_application(&mut *tx, &name.into(), caller).await?;
            let updated = tx
                .update_application(app.id, &patch)
                .await?
                .ok_or_else(|| ControlError::not_found(format!("application {name} not found")))?;
            if updated.is_activated != app.is_activated {
                let tracker = self.ctx.tracker();
                for fog in agents_of(&mut *tx, app.id).await? {
                    tracker
                        .update(&mut *tx, Some(fog), ChangeEvent::MicroserviceList)
                        .await?;
                }
            }
            tx.commit().await?;

            let mut deferred = Deferred::default();
            deferred.audit(
                "patched",
                "application",
                updated.id,
                json!({"activated": updated.is_activated}),
            );
            self.ctx.finish(deferred).await;
            Ok(updated)
        }
        .await;
        self.ctx.observe("patch_application", &result);
        result
    }

    pub async fn delete(&self, name: &str, caller: Caller) -> ControlResult<()> {
        let result = async {
            let mut tx = self.ctx.store().begin().await?;
            let mut deferred = Deferred::default();
            let app = find_application(&mut *tx, &name.into(), caller).await?;

            let filter = MicroserviceFilter {
                application_id: Some(app.id),
                ..Default::default()
            };
            let microservices = self.ctx.microservices();
            for m in tx.list_microservices(&filter).await? {
                microservices
                    .delete_in(&mut *tx, m.uuid, Caller::Cli, &mut deferred)
                    .await?;
            }
            tx.delete_application(app.id).await?;
            tx.commit().await?;

            deferred.audit("deleted", "application", app.id, json!({"name": app.name}));
            self.ctx.finish(deferred).await;
            Ok(())
        }
        .await;
        self.ctx.observe("delete_application", &result);
        result
    }

    pub async fn list(&self, caller: Caller) -> ControlResult<Vec<Application>> {
        let mut tx = self.ctx.store().begin().await?;
        Ok(tx
            .list_applications()
            .await?
            .into_iter()
            .filter(|a| caller.is_privileged() || !a.is_system)
            .collect())
    }

    pub async fn get(&self, name: &str, caller: Caller) -> ControlResult<ApplicationView> {
        let (application, routes) = {
            let mut tx = self.ctx.store().begin().await?;
            let app = find_application(&mut *tx, &name.into(), caller).await?;
            let routes = tx.list_routes(Some(app.id)).await?;
            (app, routes)
        };
        let query = MicroserviceQuery {
            application: Some(application.name.clone()),
            agent: None,
        };
        let microservices = self.ctx.microservices().list(&query, caller).await?;
        Ok(ApplicationView {
            application,
            microservices,
            routes,
        })
    }
}

/// The request with its application pinned to `app`.
fn owned_by(request: &MicroserviceRequest, app: &Application) -> MicroserviceRequest {
    MicroserviceRequest {
        application: Some(ApplicationRef::Name(app.name.clone())),
        ..request.clone()
    }
}

async fn agents_of(tx: &mut dyn StoreTx, application_id: i64) -> ControlResult<BTreeSet<Uuid>> {
    let filter = MicroserviceFilter {
        application_id: Some(application_id),
        ..Default::default()
    };
    Ok(tx
        .list_microservices(&filter)
        .await?
        .into_iter()
        .filter_map(|m| m.iofog_uuid)
        .collect())
}
