//! In-process store backend.
//!
//! All tables live behind one async mutex. A transaction owns the lock for its
//! whole lifetime and writes to a working copy; commit swaps the copy in, drop
//! discards it. Transactions are therefore fully serialized.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::models::*;
use super::store::*;

/// Registry seeded into every fresh store.
pub const DEFAULT_REGISTRY_URL: &str = "registry.hub.docker.com";

/// Audit events kept in memory; older ones are dropped first.
pub const RETAINED_EVENTS: usize = 1000;

#[derive(Debug, Clone, Default)]
struct Tables {
    next_id: i64,
    applications: BTreeMap<i64, Application>,
    fogs: BTreeMap<Uuid, Fog>,
    registries: BTreeMap<i64, Registry>,
    catalog: BTreeMap<i64, CatalogItem>,
    microservices: BTreeMap<Uuid, Microservice>,
    statuses: HashMap<Uuid, MicroserviceStatus>,
    ports: BTreeMap<i64, PortMapping>,
    extra_hosts: BTreeMap<i64, ExtraHost>,
    routes: BTreeMap<i64, Route>,
    tags: BTreeMap<i64, Tag>,
    pub_tags: BTreeSet<(Uuid, i64)>,
    sub_tags: BTreeSet<(Uuid, i64)>,
    changes: BTreeMap<(Uuid, ChangeFlag), ChangeEntry>,
    events: VecDeque<AuditEvent>,
}

impl Tables {
    fn seeded() -> Self {
        let mut tables = Self::default();
        let id = tables.next_id();
        tables.registries.insert(
            id,
            Registry {
                id,
                url: DEFAULT_REGISTRY_URL.to_string(),
                is_public: true,
                created_at: Utc::now(),
            },
        );
        tables
    }

    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn microservice_name_taken(&self, application_id: i64, name: &str, except: Option<Uuid>) -> bool {
        self.microservices.values().any(|m| {
            m.application_id == application_id
                && m.name == name
                && !m.delete
                && Some(m.uuid) != except
        })
    }

    fn route_conflicts(&self, candidate: &Route) -> Option<&'static str> {
        for r in self.routes.values().filter(|r| r.id != candidate.id) {
            if r.source_microservice_uuid == candidate.source_microservice_uuid
                && r.dest_microservice_uuid == candidate.dest_microservice_uuid
            {
                return Some("routes_source_dest_key");
            }
            if r.application_id == candidate.application_id && r.name == candidate.name {
                return Some("routes_application_name_key");
            }
        }
        None
    }

    fn remove_microservice(&mut self, uuid: Uuid) -> bool {
        if self.microservices.remove(&uuid).is_none() {
            return false;
        }
        self.statuses.remove(&uuid);
        self.ports.retain(|_, p| p.microservice_uuid != uuid);
        self.extra_hosts.retain(|_, h| h.microservice_uuid != uuid);
        for host in self.extra_hosts.values_mut() {
            if host.target_microservice_uuid == Some(uuid) {
                host.target_microservice_uuid = None;
            }
        }
        self.routes.retain(|_, r| {
            r.source_microservice_uuid != uuid && r.dest_microservice_uuid != uuid
        });
        self.pub_tags.retain(|(m, _)| *m != uuid);
        self.sub_tags.retain(|(m, _)| *m != uuid);
        true
    }

    fn live_on_fog(&self, fog: Uuid) -> BTreeSet<Uuid> {
        self.microservices
            .values()
            .filter(|m| !m.delete && m.iofog_uuid == Some(fog))
            .map(|m| m.uuid)
            .collect()
    }
}

fn unique(constraint: &str) -> StoreError {
    StoreError::UniqueViolation(constraint.to_string())
}

/// Store backend keeping every table in process memory.
#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    /// Create an empty store holding only the default registry.
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::seeded())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// An open in-memory transaction.
pub struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}

#[async_trait]
impl ApplicationStore for MemoryTx {
    async fn insert_application(&mut self, app: &NewApplication) -> StoreResult<Application> {
        let t = &mut self.working;
        if t.applications.values().any(|a| a.name == app.name) {
            return Err(unique("applications_name_key"));
        }
        let now = Utc::now();
        let id = t.next_id();
        let row = Application {
            id,
            name: app.name.clone(),
            description: app.description.clone(),
            is_activated: app.is_activated,
            is_system: app.is_system,
            created_at: now,
            updated_at: now,
        };
        t.applications.insert(id, row.clone());
        Ok(row)
    }

    async fn find_application(&mut self, id: i64) -> StoreResult<Option<Application>> {
        Ok(self.working.applications.get(&id).cloned())
    }

    async fn find_application_by_name(
        &mut self,
        name: &str,
    ) -> StoreResult<Option<Application>> {
        Ok(self
            .working
            .applications
            .values()
            .find(|a| a.name == name)
            .cloned())
    }

    async fn list_applications(&mut self) -> StoreResult<Vec<Application>> {
        let mut apps: Vec<_> = self.working.applications.values().cloned().collect();
        apps.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(apps)
    }

    async fn update_application(
        &mut self,
        id: i64,
        patch: &ApplicationPatch,
    ) -> StoreResult<Option<Application>> {
        let Some(app) = self.working.applications.get_mut(&id) else {
            return Ok(None);
        };
        if let Some(description) = &patch.description {
            app.description = Some(description.clone());
        }
        if let Some(activated) = patch.is_activated {
            app.is_activated = activated;
        }
        app.updated_at = Utc::now();
        Ok(Some(app.clone()))
    }

    async fn delete_application(&mut self, id: i64) -> StoreResult<bool> {
        let t = &mut self.working;
        if t.applications.remove(&id).is_none() {
            return Ok(false);
        }
        let owned: Vec<Uuid> = t
            .microservices
            .values()
            .filter(|m| m.application_id == id)
            .map(|m| m.uuid)
            .collect();
        for uuid in owned {
            t.remove_microservice(uuid);
        }
        t.routes.retain(|_, r| r.application_id != id);
        Ok(true)
    }
}

#[async_trait]
impl FogStore for MemoryTx {
    async fn insert_fog(&mut self, fog: &NewFog) -> StoreResult<Fog> {
        let t = &mut self.working;
        if t.fogs.values().any(|f| f.name == fog.name) {
            return Err(unique("fogs_name_key"));
        }
        let now = Utc::now();
        let row = Fog {
            uuid: Uuid::new_v4(),
            name: fog.name.clone(),
            host: fog.host.clone(),
            fog_type_id: fog.fog_type_id,
            created_at: now,
            updated_at: now,
        };
        t.fogs.insert(row.uuid, row.clone());
        Ok(row)
    }

    async fn find_fog(&mut self, uuid: Uuid) -> StoreResult<Option<Fog>> {
        Ok(self.working.fogs.get(&uuid).cloned())
    }

    async fn find_fog_by_name(&mut self, name: &str) -> StoreResult<Option<Fog>> {
        Ok(self.working.fogs.values().find(|f| f.name == name).cloned())
    }

    async fn list_fogs(&mut self) -> StoreResult<Vec<Fog>> {
        let mut fogs: Vec<_> = self.working.fogs.values().cloned().collect();
        fogs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(fogs)
    }

    async fn update_fog_host(&mut self, uuid: Uuid, host: &str) -> StoreResult<Option<Fog>> {
        let Some(fog) = self.working.fogs.get_mut(&uuid) else {
            return Ok(None);
        };
        fog.host = host.to_string();
        fog.updated_at = Utc::now();
        Ok(Some(fog.clone()))
    }
}

#[async_trait]
impl CatalogStore for MemoryTx {
    async fn insert_registry(&mut self, registry: &NewRegistry) -> StoreResult<Registry> {
        let t = &mut self.working;
        if t.registries.values().any(|r| r.url == registry.url) {
            return Err(unique("registries_url_key"));
        }
        let id = t.next_id();
        let row = Registry {
            id,
            url: registry.url.clone(),
            is_public: registry.is_public,
            created_at: Utc::now(),
        };
        t.registries.insert(id, row.clone());
        Ok(row)
    }

    async fn find_registry(&mut self, id: i64) -> StoreResult<Option<Registry>> {
        Ok(self.working.registries.get(&id).cloned())
    }

    async fn insert_catalog_item(
        &mut self,
        item: &NewCatalogItem,
        registry_id: i64,
    ) -> StoreResult<CatalogItem> {
        let t = &mut self.working;
        if t.catalog.values().any(|c| c.name == item.name) {
            return Err(unique("catalog_items_name_key"));
        }
        let id = t.next_id();
        let row = CatalogItem {
            id,
            name: item.name.clone(),
            category: item.category.clone(),
            registry_id,
            images: item.images.clone(),
            created_at: Utc::now(),
        };
        t.catalog.insert(id, row.clone());
        Ok(row)
    }

    async fn find_catalog_item(&mut self, id: i64) -> StoreResult<Option<CatalogItem>> {
        Ok(self.working.catalog.get(&id).cloned())
    }
}

#[async_trait]
impl MicroserviceStore for MemoryTx {
    async fn insert_microservice(&mut self, m: &NewMicroservice) -> StoreResult<Microservice> {
        let t = &mut self.working;
        if t.microservice_name_taken(m.application_id, &m.name, None) {
            return Err(unique("microservices_application_name_key"));
        }
        let now = Utc::now();
        let row = Microservice {
            uuid: m.uuid,
            name: m.name.clone(),
            application_id: m.application_id,
            iofog_uuid: m.iofog_uuid,
            catalog_item_id: m.catalog_item_id,
            registry_id: m.registry_id,
            config: m.config.clone(),
            images: m.images.clone(),
            env: m.env.clone(),
            cmd: m.cmd.clone(),
            cdi_devices: m.cdi_devices.clone(),
            volume_mappings: m.volume_mappings.clone(),
            root_host_access: m.root_host_access,
            run_as_user: m.run_as_user.clone(),
            platform: m.platform.clone(),
            runtime: m.runtime.clone(),
            log_size: m.log_size,
            rebuild: false,
            delete: false,
            created_at: now,
            updated_at: now,
        };
        t.microservices.insert(row.uuid, row.clone());
        Ok(row)
    }

    async fn find_microservice(&mut self, uuid: Uuid) -> StoreResult<Option<Microservice>> {
        Ok(self.working.microservices.get(&uuid).cloned())
    }

    async fn find_microservice_by_name(
        &mut self,
        application_id: i64,
        name: &str,
    ) -> StoreResult<Option<Microservice>> {
        Ok(self
            .working
            .microservices
            .values()
            .find(|m| m.application_id == application_id && m.name == name && !m.delete)
            .cloned())
    }

    async fn list_microservices(
        &mut self,
        filter: &MicroserviceFilter,
    ) -> StoreResult<Vec<Microservice>> {
        let mut rows: Vec<_> = self
            .working
            .microservices
            .values()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.application_id, &a.name, a.uuid).cmp(&(b.application_id, &b.name, b.uuid))
        });
        Ok(rows)
    }

    async fn update_microservice(
        &mut self,
        uuid: Uuid,
        patch: &MicroservicePatch,
    ) -> StoreResult<Option<Microservice>> {
        let t = &mut self.working;
        let Some(current) = t.microservices.get(&uuid) else {
            return Ok(None);
        };
        if let Some(name) = &patch.name {
            if !current.delete && t.microservice_name_taken(current.application_id, name, Some(uuid))
            {
                return Err(unique("microservices_application_name_key"));
            }
        }
        let Some(row) = t.microservices.get_mut(&uuid) else {
            return Ok(None);
        };
        patch.apply_to(row);
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn delete_microservice(&mut self, uuid: Uuid) -> StoreResult<bool> {
        Ok(self.working.remove_microservice(uuid))
    }

    async fn upsert_status(&mut self, status: &MicroserviceStatus) -> StoreResult<()> {
        self.working
            .statuses
            .insert(status.microservice_uuid, status.clone());
        Ok(())
    }

    async fn find_status(&mut self, uuid: Uuid) -> StoreResult<Option<MicroserviceStatus>> {
        Ok(self.working.statuses.get(&uuid).cloned())
    }
}

#[async_trait]
impl PortMappingStore for MemoryTx {
    async fn insert_port_mapping(&mut self, port: &NewPortMapping) -> StoreResult<PortMapping> {
        let t = &mut self.working;
        let id = t.next_id();
        let row = PortMapping {
            id,
            microservice_uuid: port.microservice_uuid,
            port_internal: port.port_internal,
            port_external: port.port_external,
            is_udp: port.is_udp,
            public_mode: port.public_mode,
            public_port: port.public_port,
            public_fog_uuid: port.public_fog_uuid,
            proxy_host: port.proxy_host.clone(),
            created_at: Utc::now(),
        };
        t.ports.insert(id, row.clone());
        Ok(row)
    }

    async fn list_port_mappings(&mut self, microservice: Uuid) -> StoreResult<Vec<PortMapping>> {
        Ok(self
            .working
            .ports
            .values()
            .filter(|p| p.microservice_uuid == microservice)
            .cloned()
            .collect())
    }

    async fn list_port_mappings_on_fog(&mut self, fog: Uuid) -> StoreResult<Vec<PortMapping>> {
        let live = self.working.live_on_fog(fog);
        Ok(self
            .working
            .ports
            .values()
            .filter(|p| live.contains(&p.microservice_uuid))
            .cloned()
            .collect())
    }

    async fn list_exposed_port_mappings(&mut self) -> StoreResult<Vec<PortMapping>> {
        Ok(self
            .working
            .ports
            .values()
            .filter(|p| p.public_mode != PublicMode::None)
            .cloned()
            .collect())
    }

    async fn set_public_fog(&mut self, id: i64, fog: Uuid) -> StoreResult<()> {
        if let Some(port) = self.working.ports.get_mut(&id) {
            port.public_fog_uuid = Some(fog);
        }
        Ok(())
    }

    async fn delete_port_mappings(&mut self, microservice: Uuid) -> StoreResult<u64> {
        let before = self.working.ports.len();
        self.working
            .ports
            .retain(|_, p| p.microservice_uuid != microservice);
        Ok((before - self.working.ports.len()) as u64)
    }
}

#[async_trait]
impl ExtraHostStore for MemoryTx {
    async fn insert_extra_host(&mut self, host: &NewExtraHost) -> StoreResult<ExtraHost> {
        let t = &mut self.working;
        let id = t.next_id();
        let row = ExtraHost {
            id,
            microservice_uuid: host.microservice_uuid,
            name: host.name.clone(),
            template: host.template.clone(),
            template_type: host.template_type,
            value: host.value.clone(),
            target_fog_uuid: host.target_fog_uuid,
            target_microservice_uuid: host.target_microservice_uuid,
            public_port: host.public_port,
        };
        t.extra_hosts.insert(id, row.clone());
        Ok(row)
    }

    async fn list_extra_hosts(&mut self, microservice: Uuid) -> StoreResult<Vec<ExtraHost>> {
        Ok(self
            .working
            .extra_hosts
            .values()
            .filter(|h| h.microservice_uuid == microservice)
            .cloned()
            .collect())
    }

    async fn list_extra_hosts_targeting_microservice(
        &mut self,
        target: Uuid,
    ) -> StoreResult<Vec<ExtraHost>> {
        Ok(self
            .working
            .extra_hosts
            .values()
            .filter(|h| h.target_microservice_uuid == Some(target))
            .cloned()
            .collect())
    }

    async fn list_extra_hosts_targeting_fog(&mut self, fog: Uuid) -> StoreResult<Vec<ExtraHost>> {
        Ok(self
            .working
            .extra_hosts
            .values()
            .filter(|h| h.target_fog_uuid == Some(fog))
            .cloned()
            .collect())
    }

    async fn update_extra_host(&mut self, id: i64, update: &ExtraHostUpdate) -> StoreResult<()> {
        if let Some(host) = self.working.extra_hosts.get_mut(&id) {
            host.value = update.value.clone();
            host.target_fog_uuid = update.target_fog_uuid;
            host.target_microservice_uuid = update.target_microservice_uuid;
            host.public_port = update.public_port;
        }
        Ok(())
    }

    async fn set_extra_host_template(&mut self, id: i64, template: &str) -> StoreResult<()> {
        if let Some(host) = self.working.extra_hosts.get_mut(&id) {
            host.template = template.to_string();
        }
        Ok(())
    }

    async fn delete_extra_hosts(&mut self, microservice: Uuid) -> StoreResult<u64> {
        let before = self.working.extra_hosts.len();
        self.working
            .extra_hosts
            .retain(|_, h| h.microservice_uuid != microservice);
        Ok((before - self.working.extra_hosts.len()) as u64)
    }
}

#[async_trait]
impl RouteStore for MemoryTx {
    async fn insert_route(&mut self, route: &NewRoute) -> StoreResult<Route> {
        let t = &mut self.working;
        let now = Utc::now();
        let mut row = Route {
            id: 0,
            name: route.name.clone(),
            application_id: route.application_id,
            source_microservice_uuid: route.source_microservice_uuid,
            dest_microservice_uuid: route.dest_microservice_uuid,
            created_at: now,
            updated_at: now,
        };
        if let Some(constraint) = t.route_conflicts(&row) {
            return Err(unique(constraint));
        }
        row.id = t.next_id();
        t.routes.insert(row.id, row.clone());
        Ok(row)
    }

    async fn find_route_by_name(
        &mut self,
        application_id: i64,
        name: &str,
    ) -> StoreResult<Option<Route>> {
        Ok(self
            .working
            .routes
            .values()
            .find(|r| r.application_id == application_id && r.name == name)
            .cloned())
    }

    async fn find_route_between(
        &mut self,
        source: Uuid,
        dest: Uuid,
    ) -> StoreResult<Option<Route>> {
        Ok(self
            .working
            .routes
            .values()
            .find(|r| r.source_microservice_uuid == source && r.dest_microservice_uuid == dest)
            .cloned())
    }

    async fn list_routes(&mut self, application_id: Option<i64>) -> StoreResult<Vec<Route>> {
        Ok(self
            .working
            .routes
            .values()
            .filter(|r| application_id.is_none_or(|id| r.application_id == id))
            .cloned()
            .collect())
    }

    async fn list_routes_touching(&mut self, microservice: Uuid) -> StoreResult<Vec<Route>> {
        Ok(self
            .working
            .routes
            .values()
            .filter(|r| {
                r.source_microservice_uuid == microservice
                    || r.dest_microservice_uuid == microservice
            })
            .cloned()
            .collect())
    }

    async fn update_route(&mut self, id: i64, patch: &RoutePatch) -> StoreResult<Option<Route>> {
        let t = &mut self.working;
        let Some(current) = t.routes.get(&id) else {
            return Ok(None);
        };
        let mut next = current.clone();
        if let Some(name) = &patch.name {
            next.name = name.clone();
        }
        if let Some(source) = patch.source_microservice_uuid {
            next.source_microservice_uuid = source;
        }
        if let Some(dest) = patch.dest_microservice_uuid {
            next.dest_microservice_uuid = dest;
        }
        if let Some(constraint) = t.route_conflicts(&next) {
            return Err(unique(constraint));
        }
        next.updated_at = Utc::now();
        t.routes.insert(id, next.clone());
        Ok(Some(next))
    }

    async fn delete_route(&mut self, id: i64) -> StoreResult<bool> {
        Ok(self.working.routes.remove(&id).is_some())
    }
}

#[async_trait]
impl TagStore for MemoryTx {
    async fn upsert_tag(&mut self, value: &str) -> StoreResult<Tag> {
        let t = &mut self.working;
        if let Some(tag) = t.tags.values().find(|tag| tag.value == value) {
            return Ok(tag.clone());
        }
        let id = t.next_id();
        let tag = Tag {
            id,
            value: value.to_string(),
        };
        t.tags.insert(id, tag.clone());
        Ok(tag)
    }

    async fn set_pub_tags(&mut self, microservice: Uuid, tags: &[i64]) -> StoreResult<()> {
        let set = &mut self.working.pub_tags;
        set.retain(|(m, _)| *m != microservice);
        set.extend(tags.iter().map(|id| (microservice, *id)));
        Ok(())
    }

    async fn set_sub_tags(&mut self, microservice: Uuid, tags: &[i64]) -> StoreResult<()> {
        let set = &mut self.working.sub_tags;
        set.retain(|(m, _)| *m != microservice);
        set.extend(tags.iter().map(|id| (microservice, *id)));
        Ok(())
    }

    async fn list_pub_tags(&mut self, microservice: Uuid) -> StoreResult<Vec<Tag>> {
        let t = &self.working;
        Ok(t.pub_tags
            .iter()
            .filter(|(m, _)| *m == microservice)
            .filter_map(|(_, id)| t.tags.get(id).cloned())
            .collect())
    }

    async fn list_sub_tags(&mut self, microservice: Uuid) -> StoreResult<Vec<Tag>> {
        let t = &self.working;
        Ok(t.sub_tags
            .iter()
            .filter(|(m, _)| *m == microservice)
            .filter_map(|(_, id)| t.tags.get(id).cloned())
            .collect())
    }

    async fn list_publishers(&mut self, tags: &[i64]) -> StoreResult<Vec<Uuid>> {
        let found: BTreeSet<Uuid> = self
            .working
            .pub_tags
            .iter()
            .filter(|(_, id)| tags.contains(id))
            .map(|(m, _)| *m)
            .collect();
        Ok(found.into_iter().collect())
    }

    async fn list_subscribers(&mut self, tags: &[i64]) -> StoreResult<Vec<Uuid>> {
        let found: BTreeSet<Uuid> = self
            .working
            .sub_tags
            .iter()
            .filter(|(_, id)| tags.contains(id))
            .map(|(m, _)| *m)
            .collect();
        Ok(found.into_iter().collect())
    }
}

#[async_trait]
impl ChangeStore for MemoryTx {
    async fn bump_change(&mut self, fog: Uuid, flag: ChangeFlag) -> StoreResult<ChangeEntry> {
        let entry = self
            .working
            .changes
            .entry((fog, flag))
            .or_insert_with(|| ChangeEntry {
                fog_uuid: fog,
                flag,
                revision: 0,
                pending: false,
                updated_at: Utc::now(),
            });
        entry.revision += 1;
        entry.pending = true;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn list_changes(&mut self, fog: Uuid) -> StoreResult<Vec<ChangeEntry>> {
        Ok(self
            .working
            .changes
            .range((fog, ChangeFlag::MicroserviceConfig)..=(fog, ChangeFlag::Tunnel))
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn clear_changes(&mut self, fog: Uuid) -> StoreResult<u64> {
        let mut cleared = 0;
        for entry in self.working.changes.values_mut() {
            if entry.fog_uuid == fog && entry.pending {
                entry.pending = false;
                cleared += 1;
            }
        }
        Ok(cleared)
    }
}

#[async_trait]
impl EventStore for MemoryTx {
    async fn insert_event(&mut self, event: &NewAuditEvent) -> StoreResult<AuditEvent> {
        let t = &mut self.working;
        let id = t.next_id();
        let row = AuditEvent {
            id,
            action: event.action.clone(),
            resource_kind: event.resource_kind.clone(),
            resource_id: event.resource_id.clone(),
            detail: event.detail.clone(),
            occurred_at: Utc::now(),
        };
        if t.events.len() == RETAINED_EVENTS {
            t.events.pop_front();
        }
        t.events.push_back(row.clone());
        Ok(row)
    }

    async fn list_events(&mut self, limit: i64) -> StoreResult<Vec<AuditEvent>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .working
            .events
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}
