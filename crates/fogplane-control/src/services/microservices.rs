//! Microservice orchestration.
//!
//! Creating, updating and deleting a microservice touches its port mappings,
//! extra-host bindings, tag memberships, routes and the change records of
//! every agent that must converge. All of it happens in one store
//! transaction; tag fan-out and audit records run after the commit.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use fogplane_telemetry::events;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::db::{
    CatalogItem, EnvVar, ExtraHost, Fog, Microservice, MicroserviceFilter, MicroserviceImage,
    MicroservicePatch, MicroserviceState, MicroserviceStatus, NewMicroservice, PortMapping,
    PublicMode, StoreTx, VolumeMapping, VolumeType,
};
use crate::error::{ControlError, ControlResult};

use super::change_tracking::ChangeEvent;
use super::extra_hosts::ExtraHostRequest;
use super::ports::{public_link, PortMappingView, PortRequest, PublicLink};
use super::{
    find_application, is_system_microservice, visible_microservice, ApplicationRef, Caller,
    Deferred, Services,
};

static VOLUME_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").expect("volume name pattern is valid")
});

/// Microservice fields as sent by a caller. On update only present fields
/// are applied.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroserviceRequest {
    pub name: Option<String>,
    /// Owning application; ignored on update.
    pub application: Option<ApplicationRef>,
    pub iofog_uuid: Option<Uuid>,
    pub agent_name: Option<String>,
    pub catalog_item_id: Option<i64>,
    pub registry_id: Option<i64>,
    pub config: Option<String>,
    pub images: Option<Vec<MicroserviceImage>>,
    pub env: Option<Vec<EnvVar>>,
    pub cmd: Option<Vec<String>>,
    pub cdi_devices: Option<Vec<String>>,
    pub volume_mappings: Option<Vec<VolumeMapping>>,
    pub root_host_access: Option<bool>,
    pub run_as_user: Option<String>,
    pub platform: Option<String>,
    pub runtime: Option<String>,
    pub log_size: Option<i64>,
    pub ports: Option<Vec<PortRequest>>,
    pub extra_hosts: Option<Vec<ExtraHostRequest>>,
    pub pub_tags: Option<Vec<String>>,
    pub sub_tags: Option<Vec<String>>,
    pub rebuild: Option<bool>,
}

/// Result of a successful create.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedMicroservice {
    pub uuid: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub public_ports: Vec<PublicLink>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub proxies: Vec<PublicLink>,
}

/// Agent placement before and after an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub microservice_iofog_uuid: Option<Uuid>,
    pub updated_microservice_iofog_uuid: Option<Uuid>,
}

impl Placement {
    pub fn moved(&self) -> bool {
        self.microservice_iofog_uuid != self.updated_microservice_iofog_uuid
    }
}

/// A microservice with everything derived from its child rows.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroserviceView {
    #[serde(flatten)]
    pub microservice: Microservice,
    pub status: Option<MicroserviceStatus>,
    pub ports: Vec<PortMappingView>,
    pub extra_hosts: Vec<ExtraHost>,
    /// Explicit route destinations and tag receivers.
    pub routes: Vec<Uuid>,
    pub pub_tags: Vec<String>,
    pub sub_tags: Vec<String>,
}

/// Listing filter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MicroserviceQuery {
    pub application: Option<String>,
    pub agent: Option<Uuid>,
}

/// A runtime status reported by an agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: MicroserviceState,
    #[serde(default)]
    pub operating_duration: i64,
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub memory_usage: i64,
    pub container_id: Option<String>,
    #[serde(default)]
    pub percentage: f64,
    pub error_message: Option<String>,
}

impl StatusReport {
    pub fn new(status: MicroserviceState) -> Self {
        Self {
            status,
            operating_duration: 0,
            start_time: 0,
            cpu_usage: 0.0,
            memory_usage: 0,
            container_id: None,
            percentage: 0.0,
            error_message: None,
        }
    }

    fn into_status(self, microservice: Uuid) -> MicroserviceStatus {
        MicroserviceStatus {
            operating_duration: self.operating_duration,
            start_time: self.start_time,
            cpu_usage: self.cpu_usage,
            memory_usage: self.memory_usage,
            container_id: self.container_id,
            percentage: self.percentage,
            error_message: self.error_message,
            ..MicroserviceStatus::with_state(microservice, self.status)
        }
    }
}

/// Orchestrates microservice lifecycles.
#[derive(Clone)]
pub struct MicroserviceService {
    ctx: Services,
}

impl MicroserviceService {
    pub fn new(ctx: Services) -> Self {
        Self { ctx }
    }

    pub async fn create(
        &self,
        request: MicroserviceRequest,
        caller: Caller,
    ) -> ControlResult<CreatedMicroservice> {
        let result = async {
            let mut tx = self.ctx.store().begin().await?;
            let mut deferred = Deferred::default();
            let created = self
                .create_in(&mut *tx, &request, caller, &mut deferred)
                .await?;
            tx.commit().await?;
            self.ctx.finish(deferred).await;
            Ok(created)
        }
        .await;
        self.ctx.observe("create_microservice", &result);
        result
    }

    pub(crate) async fn create_in(
        &self,
        tx: &mut dyn StoreTx,
        request: &MicroserviceRequest,
        caller: Caller,
        deferred: &mut Deferred,
    ) -> ControlResult<CreatedMicroservice> {
        let name = required_name(request.name.as_deref())?;
        let application = request
            .application
            .as_ref()
            .ok_or_else(|| ControlError::validation("application is required"))?;
        let app = find_application(tx, application, caller).await?;
        let fog = resolve_fog(tx, request.iofog_uuid, request.agent_name.as_deref()).await?;

        let item = self
            .resolve_catalog_item(tx, request.catalog_item_id, caller)
            .await?;
        let images = resolve_images(item.as_ref(), request.images.as_deref(), fog.as_ref())?;
        let registry_id = self
            .resolve_registry(tx, request.registry_id, item.as_ref())
            .await?;

        let volumes = request.volume_mappings.clone().unwrap_or_default();
        validate_volumes(&volumes)?;
        let ports = request.ports.clone().unwrap_or_default();
        let port_service = self.ctx.ports();
        port_service.validate_request(&ports)?;

        let resolver = self.ctx.extra_hosts();
        let hosts = resolver
            .resolve_all(
                tx,
                request.extra_hosts.as_deref().unwrap_or_default(),
                caller,
            )
            .await?;

        if tx.find_microservice_by_name(app.id, name).await?.is_some() {
            return Err(ControlError::duplicate(format!(
                "microservice {name} already exists in application {}",
                app.name
            )));
        }

        let microservice = tx
            .insert_microservice(&NewMicroservice {
                uuid: Uuid::new_v4(),
                name: name.to_string(),
                application_id: app.id,
                iofog_uuid: fog.as_ref().map(|f| f.uuid),
                catalog_item_id: item.as_ref().map(|i| i.id),
                registry_id,
                config: request.config.clone().unwrap_or_else(|| "{}".to_string()),
                images,
                env: request.env.clone().unwrap_or_default(),
                cmd: request.cmd.clone().unwrap_or_default(),
                cdi_devices: request.cdi_devices.clone().unwrap_or_default(),
                volume_mappings: volumes,
                root_host_access: request.root_host_access.unwrap_or(false),
                run_as_user: request.run_as_user.clone(),
                platform: request.platform.clone(),
                runtime: request.runtime.clone(),
                log_size: request.log_size.unwrap_or(0),
            })
            .await?;
        let uuid = microservice.uuid;

        resolver.store(tx, uuid, &hosts).await?;
        let mappings = port_service.reserve(tx, uuid, fog.as_ref(), &ports).await?;
        tx.upsert_status(&MicroserviceStatus::queued(uuid)).await?;

        let tags = self.ctx.tags();
        if let Some(values) = &request.pub_tags {
            tags.set_pub_tags(tx, uuid, values).await?;
        }
        if let Some(values) = &request.sub_tags {
            let subscribed = tags.set_sub_tags(tx, uuid, values).await?;
            deferred.fan_out(uuid, subscribed);
        }

        self.ctx
            .tracker()
            .update(tx, microservice.iofog_uuid, ChangeEvent::MicroserviceCommon)
            .await?;

        tracing::info!(
            event = events::MICROSERVICE_CREATED,
            microservice_uuid = %uuid,
            application = %app.name,
            name = %microservice.name,
            "microservice created"
        );
        deferred.audit(
            "created",
            "microservice",
            uuid,
            json!({"name": microservice.name, "application": app.name}),
        );

        let host = fog.as_ref().map(|f| f.host.as_str());
        Ok(CreatedMicroservice {
            uuid,
            name: microservice.name,
            public_ports: links(&mappings, PublicMode::Public, host),
            proxies: links(&mappings, PublicMode::Proxy, host),
        })
    }

    /// Update a microservice and advance the agents involved.
    pub async fn update(
        &self,
        uuid: Uuid,
        request: MicroserviceRequest,
        caller: Caller,
    ) -> ControlResult<Placement> {
        self.update_tracked(uuid, request, caller, true, "update_microservice")
            .await
    }

    /// Update a microservice without advancing its own agents. The returned
    /// placement lets the caller batch change tracking.
    pub async fn update_silently(
        &self,
        uuid: Uuid,
        request: MicroserviceRequest,
        caller: Caller,
    ) -> ControlResult<Placement> {
        self.update_tracked(uuid, request, caller, false, "update_microservice_silently")
            .await
    }

    async fn update_tracked(
        &self,
        uuid: Uuid,
        request: MicroserviceRequest,
        caller: Caller,
        track: bool,
        operation: &str,
    ) -> ControlResult<Placement> {
        let result = async {
            let mut tx = self.ctx.store().begin().await?;
            let mut deferred = Deferred::default();
            let placement = self
                .update_in(&mut *tx, uuid, &request, caller, track, &mut deferred)
                .await?;
            tx.commit().await?;
            self.ctx.finish(deferred).await;
            Ok(placement)
        }
        .await;
        self.ctx.observe(operation, &result);
        result
    }

    pub(crate) async fn update_in(
        &self,
        tx: &mut dyn StoreTx,
        uuid: Uuid,
        request: &MicroserviceRequest,
        caller: Caller,
        track: bool,
        deferred: &mut Deferred,
    ) -> ControlResult<Placement> {
        let current = visible_microservice(tx, uuid, caller).await?;
        let mut patch = MicroservicePatch::default();
        let mut rebuild = false;

        if let Some(name) = request.name.as_deref() {
            let name = required_name(Some(name))?;
            if name != current.name {
                if tx
                    .find_microservice_by_name(current.application_id, name)
                    .await?
                    .is_some()
                {
                    return Err(ControlError::duplicate(format!(
                        "microservice {name} already exists"
                    )));
                }
                patch.name = Some(name.to_string());
            }
        }

        let requested_fog =
            resolve_fog(tx, request.iofog_uuid, request.agent_name.as_deref()).await?;
        let moved_to = requested_fog.filter(|f| Some(f.uuid) != current.iofog_uuid);
        let placed_on = match &moved_to {
            Some(fog) => Some(fog.clone()),
            None => match current.iofog_uuid {
                Some(fog) => tx.find_fog(fog).await?,
                None => None,
            },
        };

        let port_service = self.ctx.ports();
        if let Some(ports) = &request.ports {
            port_service.validate_request(ports)?;
            port_service.release(tx, uuid).await?;
            port_service
                .reserve(tx, uuid, placed_on.as_ref(), ports)
                .await?;
            rebuild = true;
        } else if let Some(dest) = &moved_to {
            port_service.ensure_available_on(tx, uuid, dest.uuid).await?;
        }

        if request.images.is_some() || request.catalog_item_id.is_some() || moved_to.is_some() {
            let item = self
                .resolve_catalog_item(
                    tx,
                    request.catalog_item_id.or(current.catalog_item_id),
                    caller,
                )
                .await?;
            let supplied = match (&request.images, &item) {
                (Some(images), _) => Some(images.as_slice()),
                (None, None) => Some(current.images.as_slice()),
                (None, Some(_)) => None,
            };
            let images = resolve_images(item.as_ref(), supplied, placed_on.as_ref())?;
            if container_images(&images) != container_images(&current.images) {
                rebuild = true;
            }
            patch.images = Some(images);
            patch.catalog_item_id = request.catalog_item_id;
        }

        if let Some(registry) = request.registry_id {
            if tx.find_registry(registry).await?.is_none() {
                return Err(ControlError::not_found(format!(
                    "registry {registry} not found"
                )));
            }
            patch.registry_id = Some(registry);
        }

        if let Some(volumes) = &request.volume_mappings {
            validate_volumes(volumes)?;
            patch.volume_mappings = Some(volumes.clone());
        }
        patch.root_host_access = request.root_host_access;
        patch.env = request.env.clone();
        patch.cmd = request.cmd.clone();
        patch.cdi_devices = request.cdi_devices.clone();
        patch.run_as_user = request.run_as_user.clone();
        patch.platform = request.platform.clone();
        patch.runtime = request.runtime.clone();
        patch.config = request.config.clone();
        patch.log_size = request.log_size;
        // Presence alone forces a rebuild for these.
        if request.root_host_access.is_some()
            || request.env.is_some()
            || request.cmd.is_some()
            || request.cdi_devices.is_some()
            || request.run_as_user.is_some()
            || request.platform.is_some()
            || request.runtime.is_some()
            || request.volume_mappings.is_some()
        {
            rebuild = true;
        }

        if let Some(hosts) = &request.extra_hosts {
            let resolver = self.ctx.extra_hosts();
            let resolved = resolver.resolve_all(tx, hosts, caller).await?;
            if resolver.replace(tx, uuid, &resolved).await? {
                rebuild = true;
            }
        }

        if rebuild {
            patch.rebuild = Some(true);
        } else if let Some(requested) = request.rebuild {
            patch.rebuild = Some(requested);
        }

        if let Some(dest) = &moved_to {
            patch.iofog_uuid = Some(dest.uuid);
            tx.upsert_status(&MicroserviceStatus::queued(uuid)).await?;
            if request.ports.is_none() {
                port_service
                    .move_public_ports_to_new_fog(tx, uuid, dest.uuid)
                    .await?;
            }
        }

        let updated = tx
            .update_microservice(uuid, &patch)
            .await?
            .ok_or_else(|| ControlError::not_found(format!("microservice {uuid} not found")))?;

        let tracker = self.ctx.tracker();
        let tags = self.ctx.tags();
        if let Some(values) = &request.pub_tags {
            tags.set_pub_tags(tx, uuid, values).await?;
            tracker
                .update(tx, updated.iofog_uuid, ChangeEvent::MicroserviceRouting)
                .await?;
        }
        if let Some(values) = &request.sub_tags {
            let subscribed = tags.set_sub_tags(tx, uuid, values).await?;
            deferred.fan_out(uuid, subscribed);
        }

        if let Some(name) = &patch.name {
            self.ctx
                .extra_hosts()
                .rename_target(tx, uuid, &current.name, name)
                .await?;
        } else if moved_to.is_some() || request.ports.is_some() {
            self.ctx
                .extra_hosts()
                .refresh_targeting_microservice(tx, uuid)
                .await?;
        }
        if moved_to.is_some() {
            for peer in route_peers(tx, uuid).await? {
                tracker
                    .update(tx, peer, ChangeEvent::MicroserviceRouting)
                    .await?;
            }
            tracing::info!(
                event = events::MICROSERVICE_MOVED,
                microservice_uuid = %uuid,
                from = ?current.iofog_uuid,
                to = ?updated.iofog_uuid,
                "microservice moved"
            );
        }

        let placement = Placement {
            microservice_iofog_uuid: current.iofog_uuid,
            updated_microservice_iofog_uuid: updated.iofog_uuid,
        };
        if track {
            self.track_placement(tx, placement).await?;
        }

        tracing::info!(
            event = events::MICROSERVICE_UPDATED,
            microservice_uuid = %uuid,
            rebuild = updated.rebuild,
            "microservice updated"
        );
        deferred.audit(
            "updated",
            "microservice",
            uuid,
            json!({"name": updated.name, "moved": placement.moved()}),
        );
        Ok(placement)
    }

    /// Advance the agents of an updated microservice: a move refreshes the
    /// old agent's list and everything on the new one.
    pub(crate) async fn track_placement(
        &self,
        tx: &mut dyn StoreTx,
        placement: Placement,
    ) -> ControlResult<()> {
        let tracker = self.ctx.tracker();
        if placement.moved() {
            tracker
                .update(
                    tx,
                    placement.microservice_iofog_uuid,
                    ChangeEvent::MicroserviceList,
                )
                .await?;
            tracker
                .update(
                    tx,
                    placement.updated_microservice_iofog_uuid,
                    ChangeEvent::MicroserviceFull,
                )
                .await
        } else {
            tracker
                .update(
                    tx,
                    placement.updated_microservice_iofog_uuid,
                    ChangeEvent::MicroserviceCommon,
                )
                .await
        }
    }

    pub async fn delete(&self, uuid: Uuid, caller: Caller) -> ControlResult<()> {
        let result = async {
            let mut tx = self.ctx.store().begin().await?;
            let mut deferred = Deferred::default();
            self.delete_in(&mut *tx, uuid, caller, &mut deferred)
                .await?;
            tx.commit().await?;
            self.ctx.finish(deferred).await;
            Ok(())
        }
        .await;
        self.ctx.observe("delete_microservice", &result);
        result
    }

    /// Tear down routes, ports and bindings. A placed microservice is only
    /// marked for deletion until its agent stops it.
    pub(crate) async fn delete_in(
        &self,
        tx: &mut dyn StoreTx,
        uuid: Uuid,
        caller: Caller,
        deferred: &mut Deferred,
    ) -> ControlResult<()> {
        let microservice = visible_microservice(tx, uuid, caller).await?;
        let tracker = self.ctx.tracker();

        self.ctx.routing().delete_touching(tx, uuid).await?;
        self.ctx.ports().release(tx, uuid).await?;
        tx.delete_extra_hosts(uuid).await?;

        let subscribed: Vec<i64> = tx
            .list_sub_tags(uuid)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        if !subscribed.is_empty() {
            for publisher in tx.list_publishers(&subscribed).await? {
                if publisher == uuid {
                    continue;
                }
                let fog = tx.find_microservice(publisher).await?.and_then(|m| m.iofog_uuid);
                tracker
                    .update(tx, fog, ChangeEvent::MicroserviceRouting)
                    .await?;
            }
        }

        match microservice.iofog_uuid {
            Some(fog) => {
                let patch = MicroservicePatch {
                    delete: Some(true),
                    ..Default::default()
                };
                tx.update_microservice(uuid, &patch).await?;
                tx.upsert_status(&MicroserviceStatus::with_state(
                    uuid,
                    MicroserviceState::MarkedForDeletion,
                ))
                .await?;
                tracker
                    .update(tx, Some(fog), ChangeEvent::MicroserviceList)
                    .await?;
            }
            None => {
                tx.delete_microservice(uuid).await?;
            }
        }

        self.ctx
            .extra_hosts()
            .refresh_targeting_microservice(tx, uuid)
            .await?;

        tracing::info!(
            event = events::MICROSERVICE_DELETED,
            microservice_uuid = %uuid,
            soft = microservice.iofog_uuid.is_some(),
            "microservice deleted"
        );
        deferred.audit(
            "deleted",
            "microservice",
            uuid,
            json!({"name": microservice.name}),
        );
        Ok(())
    }

    /// Hard-delete the microservices of `fog` that are marked for deletion
    /// and no longer running.
    pub async fn delete_not_running(&self, fog: Uuid) -> ControlResult<Vec<Uuid>> {
        let result = async {
            let mut tx = self.ctx.store().begin().await?;
            let filter = MicroserviceFilter {
                iofog_uuid: Some(fog),
                include_deleted: true,
                ..Default::default()
            };
            let mut removed = Vec::new();
            for m in tx.list_microservices(&filter).await? {
                if !m.delete {
                    continue;
                }
                let deletable = tx
                    .find_status(m.uuid)
                    .await?
                    .is_none_or(|s| MicroserviceState::DELETABLE.contains(&s.status));
                if deletable {
                    tx.delete_microservice(m.uuid).await?;
                    removed.push(m.uuid);
                }
            }
            if !removed.is_empty() {
                self.ctx
                    .tracker()
                    .update(&mut *tx, Some(fog), ChangeEvent::MicroserviceList)
                    .await?;
            }
            tx.commit().await?;
            Ok(removed)
        }
        .await;
        self.ctx.observe("sweep_microservices", &result);
        result
    }

    /// Store an agent's status report, then sweep the agent.
    pub async fn report_status(&self, uuid: Uuid, report: StatusReport) -> ControlResult<()> {
        let mut tx = self.ctx.store().begin().await?;
        let microservice = tx
            .find_microservice(uuid)
            .await?
            .ok_or_else(|| ControlError::not_found(format!("microservice {uuid} not found")))?;
        tx.upsert_status(&report.into_status(uuid)).await?;
        tx.commit().await?;

        if let Some(fog) = microservice.iofog_uuid {
            self.delete_not_running(fog).await?;
        }
        Ok(())
    }

    pub async fn get(&self, uuid: Uuid, caller: Caller) -> ControlResult<MicroserviceView> {
        let mut tx = self.ctx.store().begin().await?;
        if !caller.is_privileged() {
            // Tell "never existed" apart from "exists but not visible".
            let Some(existing) = tx.find_microservice(uuid).await? else {
                return Err(ControlError::not_found(format!(
                    "microservice {uuid} not found"
                )));
            };
            if existing.delete || is_system_microservice(&mut *tx, &existing).await? {
                return Err(ControlError::not_found(format!(
                    "microservice {uuid} is not available"
                )));
            }
        }
        let microservice = visible_microservice(&mut *tx, uuid, caller).await?;
        self.view(&mut *tx, microservice).await
    }

    pub async fn list(
        &self,
        query: &MicroserviceQuery,
        caller: Caller,
    ) -> ControlResult<Vec<MicroserviceView>> {
        let mut tx = self.ctx.store().begin().await?;
        let application_id = match &query.application {
            Some(name) => Some(
                find_application(&mut *tx, &name.as_str().into(), caller)
                    .await?
                    .id,
            ),
            None => None,
        };
        let filter = MicroserviceFilter {
            application_id,
            iofog_uuid: query.agent,
            include_deleted: false,
        };
        let mut views = Vec::new();
        for m in tx.list_microservices(&filter).await? {
            if !caller.is_privileged() && is_system_microservice(&mut *tx, &m).await? {
                continue;
            }
            views.push(self.view(&mut *tx, m).await?);
        }
        Ok(views)
    }

    /// Live microservices receiving what `uuid` publishes.
    pub async fn receivers(&self, uuid: Uuid, caller: Caller) -> ControlResult<Vec<Uuid>> {
        let mut tx = self.ctx.store().begin().await?;
        visible_microservice(&mut *tx, uuid, caller).await?;
        self.ctx.tags().receivers(&mut *tx, uuid).await
    }

    async fn view(
        &self,
        tx: &mut dyn StoreTx,
        microservice: Microservice,
    ) -> ControlResult<MicroserviceView> {
        let uuid = microservice.uuid;
        let mut routes: Vec<Uuid> = tx
            .list_routes_touching(uuid)
            .await?
            .into_iter()
            .filter(|r| r.source_microservice_uuid == uuid)
            .map(|r| r.dest_microservice_uuid)
            .collect();
        for receiver in self.ctx.tags().receivers(tx, uuid).await? {
            if !routes.contains(&receiver) {
                routes.push(receiver);
            }
        }

        Ok(MicroserviceView {
            status: tx.find_status(uuid).await?,
            ports: self.ctx.ports().list_views(tx, uuid).await?,
            extra_hosts: tx.list_extra_hosts(uuid).await?,
            routes,
            pub_tags: tx
                .list_pub_tags(uuid)
                .await?
                .into_iter()
                .map(|t| t.value)
                .collect(),
            sub_tags: tx
                .list_sub_tags(uuid)
                .await?
                .into_iter()
                .map(|t| t.value)
                .collect(),
            microservice,
        })
    }

    async fn resolve_catalog_item(
        &self,
        tx: &mut dyn StoreTx,
        id: Option<i64>,
        caller: Caller,
    ) -> ControlResult<Option<CatalogItem>> {
        let Some(id) = id else {
            return Ok(None);
        };
        match tx.find_catalog_item(id).await? {
            Some(item) if caller.is_privileged() || !item.is_system() => Ok(Some(item)),
            _ => Err(ControlError::not_found(format!(
                "catalog item {id} not found"
            ))),
        }
    }

    async fn resolve_registry(
        &self,
        tx: &mut dyn StoreTx,
        requested: Option<i64>,
        item: Option<&CatalogItem>,
    ) -> ControlResult<i64> {
        let id = requested
            .or(item.map(|i| i.registry_id))
            .unwrap_or(self.ctx.config().default_registry_id);
        match tx.find_registry(id).await? {
            Some(registry) => Ok(registry.id),
            None => Err(ControlError::not_found(format!("registry {id} not found"))),
        }
    }
}

fn required_name(name: Option<&str>) -> ControlResult<&str> {
    match name.map(str::trim) {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(ControlError::validation("microservice name is required")),
    }
}

async fn resolve_fog(
    tx: &mut dyn StoreTx,
    uuid: Option<Uuid>,
    agent_name: Option<&str>,
) -> ControlResult<Option<Fog>> {
    if let Some(uuid) = uuid {
        return match tx.find_fog(uuid).await? {
            Some(fog) => Ok(Some(fog)),
            None => Err(ControlError::not_found(format!("agent {uuid} not found"))),
        };
    }
    if let Some(name) = agent_name {
        return match tx.find_fog_by_name(name).await? {
            Some(fog) => Ok(Some(fog)),
            None => Err(ControlError::not_found(format!("agent {name} not found"))),
        };
    }
    Ok(None)
}

/// Images for a microservice. A catalog item's images win; supplied images
/// must agree with them per agent type.
fn resolve_images(
    item: Option<&CatalogItem>,
    supplied: Option<&[MicroserviceImage]>,
    fog: Option<&Fog>,
) -> ControlResult<Vec<MicroserviceImage>> {
    let images = match item {
        Some(item) => {
            for image in supplied.unwrap_or_default() {
                let conflicting = item.images.iter().any(|i| {
                    i.fog_type_id == image.fog_type_id && i.container_image != image.container_image
                });
                if conflicting {
                    return Err(ControlError::validation(format!(
                        "image {} does not match catalog item {}",
                        image.container_image, item.name
                    )));
                }
            }
            item.images.clone()
        }
        None => supplied.map(<[_]>::to_vec).unwrap_or_default(),
    };
    if images.is_empty() {
        return Err(ControlError::validation(
            "microservice requires images or a catalog item",
        ));
    }
    if let Some(fog) = fog {
        if !images.iter().any(|i| i.fog_type_id == fog.fog_type_id) {
            return Err(ControlError::validation(format!(
                "no image for agent type {} of agent {}",
                fog.fog_type_id, fog.name
            )));
        }
    }
    Ok(images)
}

fn validate_volumes(volumes: &[VolumeMapping]) -> ControlResult<()> {
    for volume in volumes {
        if volume.volume_type == VolumeType::Volume
            && !VOLUME_NAME.is_match(&volume.host_destination)
        {
            return Err(ControlError::invalid_argument(format!(
                "invalid volume name {}",
                volume.host_destination
            )));
        }
    }
    Ok(())
}

fn container_images(images: &[MicroserviceImage]) -> Vec<&str> {
    images.iter().map(|i| i.container_image.as_str()).collect()
}

fn links(mappings: &[PortMapping], mode: PublicMode, host: Option<&str>) -> Vec<PublicLink> {
    mappings
        .iter()
        .filter(|m| m.public_mode == mode)
        .filter_map(|m| {
            Some(PublicLink {
                internal: m.port_internal,
                external: m.port_external,
                link: public_link(m, host)?,
            })
        })
        .collect()
}

/// Agents of the other endpoint of every route touching `microservice`.
async fn route_peers(tx: &mut dyn StoreTx, microservice: Uuid) -> ControlResult<Vec<Option<Uuid>>> {
    let mut peers = BTreeSet::new();
    for route in tx.list_routes_touching(microservice).await? {
        let peer = if route.source_microservice_uuid == microservice {
            route.dest_microservice_uuid
        } else {
            route.source_microservice_uuid
        };
        if let Some(m) = tx.find_microservice(peer).await? {
            peers.insert(m.iofog_uuid);
        }
    }
    Ok(peers.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ChangeFlag, NewCatalogItem};
    use crate::services::testing::*;
    use crate::services::{ApplicationManifest, RouteRequest};

    #[tokio::test]
    async fn create_queues_and_advances_agent() {
        let services = services();
        let fog = create_agent(&services, "agent1", "10.0.0.1").await;
        create_app(&services, "app1").await;

        let created = create_ms(&services, "app1", "m1", Some(fog.uuid)).await;
        let view = services
            .microservices()
            .get(created.uuid, Caller::Cli)
            .await
            .unwrap();
        assert_eq!(view.microservice.name, "m1");
        assert_eq!(view.status.unwrap().status, MicroserviceState::Queued);

        let record = changes(&services, fog.uuid).await;
        assert_eq!(record.revision(ChangeFlag::MicroserviceList), 1);
        assert!(record.is_pending(ChangeFlag::MicroserviceConfig));
    }

    #[tokio::test]
    async fn names_are_unique_per_application() {
        let services = services();
        create_app(&services, "app1").await;
        create_app(&services, "app2").await;
        create_ms(&services, "app1", "m1", None).await;

        let err = services
            .microservices()
            .create(ms_request("app1", "m1", None), Caller::Cli)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::DuplicateProperty(_)));

        create_ms(&services, "app2", "m1", None).await;
    }

    #[tokio::test]
    async fn failed_port_reservation_leaves_no_trace() {
        let services = services();
        let fog = create_agent(&services, "agent1", "10.0.0.1").await;
        create_app(&services, "app1").await;
        let mut first = ms_request("app1", "first", Some(fog.uuid));
        first.ports = Some(vec![PortRequest::new(80, 8080)]);
        services
            .microservices()
            .create(first, Caller::Cli)
            .await
            .unwrap();

        let mut second = ms_request("app1", "second", Some(fog.uuid));
        second.ports = Some(vec![PortRequest::new(80, 8080)]);
        second.pub_tags = Some(vec!["orphan".into()]);
        assert!(services
            .microservices()
            .create(second, Caller::Cli)
            .await
            .is_err());

        let listed = services
            .microservices()
            .list(&MicroserviceQuery::default(), Caller::Cli)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        // the retry succeeds: nothing was left holding the name
        let mut retry = ms_request("app1", "second", Some(fog.uuid));
        retry.ports = Some(vec![PortRequest::new(80, 8081)]);
        services
            .microservices()
            .create(retry, Caller::Cli)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn volume_names_are_checked_for_named_volumes_only() {
        let services = services();
        create_app(&services, "app1").await;
        let mapping = |volume_type| VolumeMapping {
            host_destination: "my volume!".into(),
            container_destination: "/data".into(),
            access_mode: "rw".into(),
            volume_type,
        };

        let mut named = ms_request("app1", "named", None);
        named.volume_mappings = Some(vec![mapping(VolumeType::Volume)]);
        let err = services
            .microservices()
            .create(named, Caller::Cli)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::InvalidArgument(_)));

        let mut bind = ms_request("app1", "bind", None);
        bind.volume_mappings = Some(vec![mapping(VolumeType::Bind)]);
        services
            .microservices()
            .create(bind, Caller::Cli)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn images_must_cover_the_agent_type() {
        let services = services();
        let fog = services
            .agents()
            .register(crate::db::NewFog {
                name: "arm-agent".into(),
                host: "10.0.0.3".into(),
                fog_type_id: 2,
            })
            .await
            .unwrap();
        create_app(&services, "app1").await;

        let err = services
            .microservices()
            .create(ms_request("app1", "m1", Some(fog.uuid)), Caller::Cli)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));

        let mut no_images = ms_request("app1", "m2", None);
        no_images.images = None;
        assert!(matches!(
            services
                .microservices()
                .create(no_images, Caller::Cli)
                .await,
            Err(ControlError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn catalog_images_must_agree_with_supplied_ones() {
        let services = services();
        create_app(&services, "app1").await;
        let item = services
            .catalog()
            .add_catalog_item(NewCatalogItem {
                name: "web".into(),
                category: "USER".into(),
                registry_id: None,
                images: images(),
            })
            .await
            .unwrap();

        let mut mismatch = ms_request("app1", "m1", None);
        mismatch.catalog_item_id = Some(item.id);
        mismatch.images = Some(vec![MicroserviceImage {
            fog_type_id: 1,
            container_image: "httpd:2".into(),
        }]);
        assert!(services
            .microservices()
            .create(mismatch, Caller::Cli)
            .await
            .is_err());

        let mut from_catalog = ms_request("app1", "m2", None);
        from_catalog.catalog_item_id = Some(item.id);
        from_catalog.images = None;
        let created = services
            .microservices()
            .create(from_catalog, Caller::Cli)
            .await
            .unwrap();
        let view = services
            .microservices()
            .get(created.uuid, Caller::Cli)
            .await
            .unwrap();
        assert_eq!(view.microservice.images, images());
    }

    #[tokio::test]
    async fn metadata_update_keeps_rebuild_while_env_sets_it() {
        let services = services();
        let fog = create_agent(&services, "agent1", "10.0.0.1").await;
        create_app(&services, "app1").await;
        let created = create_ms(&services, "app1", "m1", Some(fog.uuid)).await;
        let ms = services.microservices();

        ms.update(
            created.uuid,
            MicroserviceRequest {
                rebuild: Some(false),
                ..Default::default()
            },
            Caller::Cli,
        )
        .await
        .unwrap();
        ms.update(
            created.uuid,
            MicroserviceRequest {
                config: Some("{\"level\":2}".into()),
                ..Default::default()
            },
            Caller::Cli,
        )
        .await
        .unwrap();
        let view = ms.get(created.uuid, Caller::Cli).await.unwrap();
        assert!(!view.microservice.rebuild);
        assert_eq!(view.microservice.config, "{\"level\":2}");

        ms.update(
            created.uuid,
            MicroserviceRequest {
                env: Some(vec![EnvVar {
                    key: "MODE".into(),
                    value: "edge".into(),
                }]),
                ..Default::default()
            },
            Caller::Cli,
        )
        .await
        .unwrap();
        assert!(ms.get(created.uuid, Caller::Cli).await.unwrap().microservice.rebuild);
    }

    #[tokio::test]
    async fn image_change_is_order_sensitive() {
        let services = services();
        create_app(&services, "app1").await;
        let two = vec![
            MicroserviceImage {
                fog_type_id: 1,
                container_image: "a:1".into(),
            },
            MicroserviceImage {
                fog_type_id: 2,
                container_image: "b:1".into(),
            },
        ];
        let mut request = ms_request("app1", "m1", None);
        request.images = Some(two.clone());
        let created = services
            .microservices()
            .create(request, Caller::Cli)
            .await
            .unwrap();
        let ms = services.microservices();
        ms.update(
            created.uuid,
            MicroserviceRequest {
                rebuild: Some(false),
                ..Default::default()
            },
            Caller::Cli,
        )
        .await
        .unwrap();

        ms.update(
            created.uuid,
            MicroserviceRequest {
                images: Some(two.clone()),
                ..Default::default()
            },
            Caller::Cli,
        )
        .await
        .unwrap();
        assert!(!ms.get(created.uuid, Caller::Cli).await.unwrap().microservice.rebuild);

        let reversed: Vec<_> = two.into_iter().rev().collect();
        ms.update(
            created.uuid,
            MicroserviceRequest {
                images: Some(reversed),
                ..Default::default()
            },
            Caller::Cli,
        )
        .await
        .unwrap();
        assert!(ms.get(created.uuid, Caller::Cli).await.unwrap().microservice.rebuild);
    }

    #[tokio::test]
    async fn move_requeues_and_advances_both_agents() {
        let services = services();
        let f = create_agent(&services, "agent-f", "10.0.0.1").await;
        let g = create_agent(&services, "agent-g", "10.0.0.2").await;
        create_app(&services, "app1").await;
        let mut request = ms_request("app1", "m1", Some(f.uuid));
        request.ports = Some(vec![PortRequest::new(80, 8080).public()]);
        let created = services
            .microservices()
            .create(request, Caller::Cli)
            .await
            .unwrap();
        let f_before = changes(&services, f.uuid).await;

        let placement = services
            .microservices()
            .update(
                created.uuid,
                MicroserviceRequest {
                    iofog_uuid: Some(g.uuid),
                    ..Default::default()
                },
                Caller::Cli,
            )
            .await
            .unwrap();
        assert!(placement.moved());

        let view = services
            .microservices()
            .get(created.uuid, Caller::Cli)
            .await
            .unwrap();
        assert_eq!(view.microservice.iofog_uuid, Some(g.uuid));
        assert_eq!(view.status.unwrap().status, MicroserviceState::Queued);
        assert_eq!(
            view.ports[0].public_link.as_deref(),
            Some("http://10.0.0.2:6000")
        );

        let f_after = changes(&services, f.uuid).await;
        assert!(
            f_after.revision(ChangeFlag::MicroserviceList)
                > f_before.revision(ChangeFlag::MicroserviceList)
        );
        assert_eq!(changes(&services, g.uuid).await.revision(ChangeFlag::Routing), 1);
    }

    #[tokio::test]
    async fn move_is_rejected_when_ports_clash_on_destination() {
        let services = services();
        let f = create_agent(&services, "agent-f", "10.0.0.1").await;
        let g = create_agent(&services, "agent-g", "10.0.0.2").await;
        create_app(&services, "app1").await;
        for (name, fog) in [("m1", f.uuid), ("m2", g.uuid)] {
            let mut request = ms_request("app1", name, Some(fog));
            request.ports = Some(vec![PortRequest::new(80, 8080)]);
            services
                .microservices()
                .create(request, Caller::Cli)
                .await
                .unwrap();
        }
        let m1 = services
            .microservices()
            .list(
                &MicroserviceQuery {
                    agent: Some(f.uuid),
                    ..Default::default()
                },
                Caller::Cli,
            )
            .await
            .unwrap()
            .remove(0);

        let err = services
            .microservices()
            .update(
                m1.microservice.uuid,
                MicroserviceRequest {
                    iofog_uuid: Some(g.uuid),
                    ..Default::default()
                },
                Caller::Cli,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
        let view = services
            .microservices()
            .get(m1.microservice.uuid, Caller::Cli)
            .await
            .unwrap();
        assert_eq!(view.microservice.iofog_uuid, Some(f.uuid));
    }

    #[tokio::test]
    async fn silent_update_leaves_own_agent_untouched() {
        let services = services();
        let fog = create_agent(&services, "agent1", "10.0.0.1").await;
        create_app(&services, "app1").await;
        let created = create_ms(&services, "app1", "m1", Some(fog.uuid)).await;
        let before = changes(&services, fog.uuid).await;

        let placement = services
            .microservices()
            .update_silently(
                created.uuid,
                MicroserviceRequest {
                    cmd: Some(vec!["serve".into()]),
                    ..Default::default()
                },
                Caller::Cli,
            )
            .await
            .unwrap();
        assert!(!placement.moved());
        assert_eq!(placement.updated_microservice_iofog_uuid, Some(fog.uuid));

        let after = changes(&services, fog.uuid).await;
        assert_eq!(
            after.revision(ChangeFlag::MicroserviceConfig),
            before.revision(ChangeFlag::MicroserviceConfig)
        );
    }

    #[tokio::test]
    async fn deleting_a_placed_microservice_marks_it_until_swept() {
        let services = services();
        let fog = create_agent(&services, "agent1", "10.0.0.1").await;
        create_app(&services, "app1").await;
        let a = create_ms(&services, "app1", "a", Some(fog.uuid)).await;
        create_ms(&services, "app1", "b", Some(fog.uuid)).await;
        services
            .routing()
            .create(RouteRequest::by_name("a-to-b", "app1", "a", "b"), Caller::Cli)
            .await
            .unwrap();

        let ms = services.microservices();
        ms.delete(a.uuid, Caller::Cli).await.unwrap();
        assert!(matches!(
            ms.get(a.uuid, Caller::Cli).await,
            Err(ControlError::NotFound(_))
        ));
        assert!(services
            .routing()
            .list(Some("app1"), Caller::Cli)
            .await
            .unwrap()
            .is_empty());
        // the name is free again while the old row awaits the sweep
        create_ms(&services, "app1", "a", Some(fog.uuid)).await;

        ms.report_status(a.uuid, StatusReport::new(MicroserviceState::Running))
            .await
            .unwrap();
        assert!(ms.delete_not_running(fog.uuid).await.unwrap().is_empty());

        ms.report_status(a.uuid, StatusReport::new(MicroserviceState::Stopping))
            .await
            .unwrap();
        let mut tx = services.store().begin().await.unwrap();
        assert!(tx.find_microservice(a.uuid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deleting_an_unplaced_microservice_is_immediate() {
        let services = services();
        create_app(&services, "app1").await;
        let created = create_ms(&services, "app1", "m1", None).await;
        services
            .microservices()
            .delete(created.uuid, Caller::Cli)
            .await
            .unwrap();
        let mut tx = services.store().begin().await.unwrap();
        assert!(tx.find_microservice(created.uuid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn system_microservices_are_hidden_from_api_callers() {
        let services = services();
        services
            .applications()
            .create(ApplicationManifest::named("system-app").system(), Caller::Cli)
            .await
            .unwrap();
        let created = create_ms(&services, "system-app", "router", None).await;
        let ms = services.microservices();

        match ms.get(created.uuid, Caller::Api).await {
            Err(ControlError::NotFound(msg)) => assert!(msg.contains("not available")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            ms.delete(created.uuid, Caller::Api).await,
            Err(ControlError::NotFound(_))
        ));
        assert!(ms
            .list(&MicroserviceQuery::default(), Caller::Api)
            .await
            .unwrap()
            .is_empty());
        ms.delete(created.uuid, Caller::Cli).await.unwrap();
    }

    #[tokio::test]
    async fn views_list_route_destinations() {
        let services = services();
        let fog = create_agent(&services, "agent1", "10.0.0.1").await;
        create_app(&services, "app1").await;
        let a = create_ms(&services, "app1", "a", Some(fog.uuid)).await;
        let b = create_ms(&services, "app1", "b", Some(fog.uuid)).await;
        services
            .routing()
            .create(RouteRequest::by_uuid("a-to-b", a.uuid, b.uuid), Caller::Cli)
            .await
            .unwrap();

        let ms = services.microservices();
        assert_eq!(ms.get(a.uuid, Caller::Cli).await.unwrap().routes, vec![b.uuid]);
        assert!(ms.get(b.uuid, Caller::Cli).await.unwrap().routes.is_empty());
    }
}
