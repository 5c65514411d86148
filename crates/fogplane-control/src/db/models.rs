//! Entity models for the control plane.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

/// A stored enum column held a value this build does not know.
#[derive(Debug, Clone, Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            /// Canonical string form, as stored and serialized.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// ============================================================================
// Applications
// ============================================================================

/// An application record - groups microservices and the routes between them.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub is_activated: bool,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating an application.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewApplication {
    pub name: String,
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub is_activated: bool,
    #[serde(default)]
    pub is_system: bool,
}

/// Input for updating an application. Only present fields are written.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationPatch {
    pub description: Option<String>,
    pub is_activated: Option<bool>,
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Agents, registries, catalog
// ============================================================================

/// A registered fog agent (placement target).
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Fog {
    pub uuid: Uuid,
    pub name: String,
    pub host: String,
    pub fog_type_id: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for registering an agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFog {
    pub name: String,
    pub host: String,
    #[serde(default = "default_fog_type")]
    pub fog_type_id: i32,
}

fn default_fog_type() -> i32 {
    1
}

/// A container image registry.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    pub id: i64,
    pub url: String,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for adding a registry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRegistry {
    pub url: String,
    #[serde(default = "default_true")]
    pub is_public: bool,
}

/// Catalog category reserved for controller-managed microservices.
pub const SYSTEM_CATEGORY: &str = "SYSTEM";

/// A catalog item: a named, reusable image set.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    pub id: i64,
    pub name: String,
    pub category: String,
    pub registry_id: i64,
    pub images: Vec<MicroserviceImage>,
    pub created_at: DateTime<Utc>,
}

impl CatalogItem {
    pub fn is_system(&self) -> bool {
        self.category == SYSTEM_CATEGORY
    }
}

/// Input for adding a catalog item.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCatalogItem {
    pub name: String,
    #[serde(default = "default_category")]
    pub category: String,
    pub registry_id: Option<i64>,
    pub images: Vec<MicroserviceImage>,
}

fn default_category() -> String {
    "USER".to_string()
}

// ============================================================================
// Microservices
// ============================================================================

/// A container image for one agent architecture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroserviceImage {
    pub fog_type_id: i32,
    pub container_image: String,
}

/// An environment variable passed to the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

/// How a volume mapping's host side is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    /// A named volume managed by the agent's container runtime.
    Volume,
    /// A bind mount of an arbitrary host path.
    #[default]
    Bind,
}

/// A volume mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMapping {
    pub host_destination: String,
    pub container_destination: String,
    #[serde(default = "default_access_mode")]
    pub access_mode: String,
    #[serde(rename = "type", default)]
    pub volume_type: VolumeType,
}

fn default_access_mode() -> String {
    "rw".to_string()
}

/// A microservice record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Microservice {
    pub uuid: Uuid,
    pub name: String,
    pub application_id: i64,
    pub iofog_uuid: Option<Uuid>,
    pub catalog_item_id: Option<i64>,
    pub registry_id: i64,
    pub config: String,
    pub images: Vec<MicroserviceImage>,
    pub env: Vec<EnvVar>,
    pub cmd: Vec<String>,
    pub cdi_devices: Vec<String>,
    pub volume_mappings: Vec<VolumeMapping>,
    pub root_host_access: bool,
    pub run_as_user: Option<String>,
    pub platform: Option<String>,
    pub runtime: Option<String>,
    pub log_size: i64,
    pub rebuild: bool,
    pub delete: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A fully resolved microservice ready for insertion.
#[derive(Debug, Clone)]
pub struct NewMicroservice {
    pub uuid: Uuid,
    pub name: String,
    pub application_id: i64,
    pub iofog_uuid: Option<Uuid>,
    pub catalog_item_id: Option<i64>,
    pub registry_id: i64,
    pub config: String,
    pub images: Vec<MicroserviceImage>,
    pub env: Vec<EnvVar>,
    pub cmd: Vec<String>,
    pub cdi_devices: Vec<String>,
    pub volume_mappings: Vec<VolumeMapping>,
    pub root_host_access: bool,
    pub run_as_user: Option<String>,
    pub platform: Option<String>,
    pub runtime: Option<String>,
    pub log_size: i64,
}

/// Partial update of a microservice row. Only `Some` fields are written.
#[derive(Debug, Clone, Default)]
pub struct MicroservicePatch {
    pub name: Option<String>,
    pub config: Option<String>,
    pub iofog_uuid: Option<Uuid>,
    pub catalog_item_id: Option<i64>,
    pub registry_id: Option<i64>,
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
    pub rebuild: Option<bool>,
    pub delete: Option<bool>,
}

impl MicroservicePatch {
    /// Apply the patch to an in-memory record.
    pub fn apply_to(&self, m: &mut Microservice) {
        if let Some(name) = &self.name {
            m.name = name.clone();
        }
        if let Some(config) = &self.config {
            m.config = config.clone();
        }
        if let Some(fog) = self.iofog_uuid {
            m.iofog_uuid = Some(fog);
        }
        if let Some(item) = self.catalog_item_id {
            m.catalog_item_id = Some(item);
        }
        if let Some(registry) = self.registry_id {
            m.registry_id = registry;
        }
        if let Some(images) = &self.images {
            m.images = images.clone();
        }
        if let Some(env) = &self.env {
            m.env = env.clone();
        }
        if let Some(cmd) = &self.cmd {
            m.cmd = cmd.clone();
        }
        if let Some(devices) = &self.cdi_devices {
            m.cdi_devices = devices.clone();
        }
        if let Some(volumes) = &self.volume_mappings {
            m.volume_mappings = volumes.clone();
        }
        if let Some(root) = self.root_host_access {
            m.root_host_access = root;
        }
        if let Some(user) = &self.run_as_user {
            m.run_as_user = Some(user.clone());
        }
        if let Some(platform) = &self.platform {
            m.platform = Some(platform.clone());
        }
        if let Some(runtime) = &self.runtime {
            m.runtime = Some(runtime.clone());
        }
        if let Some(log_size) = self.log_size {
            m.log_size = log_size;
        }
        if let Some(rebuild) = self.rebuild {
            m.rebuild = rebuild;
        }
        if let Some(delete) = self.delete {
            m.delete = delete;
        }
    }
}

/// Scope for microservice listings.
#[derive(Debug, Clone, Default)]
pub struct MicroserviceFilter {
    pub application_id: Option<i64>,
    pub iofog_uuid: Option<Uuid>,
    pub include_deleted: bool,
}

impl MicroserviceFilter {
    pub fn matches(&self, m: &Microservice) -> bool {
        self.application_id.is_none_or(|id| m.application_id == id)
            && self.iofog_uuid.is_none_or(|fog| m.iofog_uuid == Some(fog))
            && (self.include_deleted || !m.delete)
    }
}

/// Runtime state of a microservice as last reported by its agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MicroserviceState {
    Queued,
    Pulling,
    Starting,
    Running,
    Stopping,
    Stopped,
    Deleting,
    MarkedForDeletion,
    Failed,
    Unknown,
}

string_enum!(MicroserviceState, "microservice state", {
    Queued => "QUEUED",
    Pulling => "PULLING",
    Starting => "STARTING",
    Running => "RUNNING",
    Stopping => "STOPPING",
    Stopped => "STOPPED",
    Deleting => "DELETING",
    MarkedForDeletion => "MARKED_FOR_DELETION",
    Failed => "FAILED",
    Unknown => "UNKNOWN",
});

impl MicroserviceState {
    /// States in which a microservice flagged for deletion may be removed.
    pub const DELETABLE: [MicroserviceState; 4] = [
        MicroserviceState::Unknown,
        MicroserviceState::Stopping,
        MicroserviceState::Deleting,
        MicroserviceState::MarkedForDeletion,
    ];
}

/// Status record for a microservice.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroserviceStatus {
    pub microservice_uuid: Uuid,
    pub status: MicroserviceState,
    pub operating_duration: i64,
    pub start_time: i64,
    pub cpu_usage: f64,
    pub memory_usage: i64,
    pub container_id: Option<String>,
    pub percentage: f64,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl MicroserviceStatus {
    /// A fresh `QUEUED` status with zeroed runtime counters.
    pub fn queued(microservice_uuid: Uuid) -> Self {
        Self::with_state(microservice_uuid, MicroserviceState::Queued)
    }

    pub fn with_state(microservice_uuid: Uuid, status: MicroserviceState) -> Self {
        Self {
            microservice_uuid,
            status,
            operating_duration: 0,
            start_time: 0,
            cpu_usage: 0.0,
            memory_usage: 0,
            container_id: None,
            percentage: 0.0,
            error_message: None,
            updated_at: Utc::now(),
        }
    }
}

// ============================================================================
// Port mappings
// ============================================================================

/// How a port mapping is exposed beyond its agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicMode {
    #[default]
    None,
    Public,
    Proxy,
}

string_enum!(PublicMode, "public mode", {
    None => "none",
    Public => "public",
    Proxy => "proxy",
});

/// A reserved port binding on an agent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub id: i64,
    pub microservice_uuid: Uuid,
    pub port_internal: i32,
    pub port_external: i32,
    pub is_udp: bool,
    pub public_mode: PublicMode,
    pub public_port: Option<i32>,
    pub public_fog_uuid: Option<Uuid>,
    pub proxy_host: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Input for reserving a port binding.
#[derive(Debug, Clone)]
pub struct NewPortMapping {
    pub microservice_uuid: Uuid,
    pub port_internal: i32,
    pub port_external: i32,
    pub is_udp: bool,
    pub public_mode: PublicMode,
    pub public_port: Option<i32>,
    pub public_fog_uuid: Option<Uuid>,
    pub proxy_host: Option<String>,
}

// ============================================================================
// Extra hosts
// ============================================================================

/// Shape of an extra-host address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateType {
    Literal,
    Apps,
    Agents,
}

string_enum!(TemplateType, "template type", {
    Literal => "Literal",
    Apps => "Apps",
    Agents => "Agents",
});

/// An `/etc/hosts` entry injected into a microservice's container.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraHost {
    pub id: i64,
    pub microservice_uuid: Uuid,
    pub name: String,
    pub template: String,
    pub template_type: TemplateType,
    pub value: String,
    pub target_fog_uuid: Option<Uuid>,
    pub target_microservice_uuid: Option<Uuid>,
    pub public_port: Option<i32>,
}

/// Input for storing a resolved extra host.
#[derive(Debug, Clone)]
pub struct NewExtraHost {
    pub microservice_uuid: Uuid,
    pub name: String,
    pub template: String,
    pub template_type: TemplateType,
    pub value: String,
    pub target_fog_uuid: Option<Uuid>,
    pub target_microservice_uuid: Option<Uuid>,
    pub public_port: Option<i32>,
}

/// Re-resolved values for an existing extra host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraHostUpdate {
    pub value: String,
    pub target_fog_uuid: Option<Uuid>,
    pub target_microservice_uuid: Option<Uuid>,
    pub public_port: Option<i32>,
}

// ============================================================================
// Routes and tags
// ============================================================================

/// An explicit route between two microservices of one application.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub id: i64,
    pub name: String,
    pub application_id: i64,
    pub source_microservice_uuid: Uuid,
    pub dest_microservice_uuid: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a route.
#[derive(Debug, Clone)]
pub struct NewRoute {
    pub name: String,
    pub application_id: i64,
    pub source_microservice_uuid: Uuid,
    pub dest_microservice_uuid: Uuid,
}

/// Partial update of a route. Only `Some` fields are written.
#[derive(Debug, Clone, Default)]
pub struct RoutePatch {
    pub name: Option<String>,
    pub source_microservice_uuid: Option<Uuid>,
    pub dest_microservice_uuid: Option<Uuid>,
}

/// A pub/sub tag, unique by value.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Tag {
    pub id: i64,
    pub value: String,
}

// ============================================================================
// Change tracking
// ============================================================================

/// A per-agent indicator an agent polls to decide what to re-fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeFlag {
    MicroserviceConfig,
    MicroserviceList,
    Routing,
    Registries,
    EdgeResources,
    Tunnel,
}

string_enum!(ChangeFlag, "change flag", {
    MicroserviceConfig => "microservice_config",
    MicroserviceList => "microservice_list",
    Routing => "routing",
    Registries => "registries",
    EdgeResources => "edge_resources",
    Tunnel => "tunnel",
});

/// State of one change flag for one agent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    pub fog_uuid: Uuid,
    pub flag: ChangeFlag,
    pub revision: i64,
    pub pending: bool,
    pub updated_at: DateTime<Utc>,
}

/// Every change flag recorded for one agent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub fog_uuid: Uuid,
    pub entries: Vec<ChangeEntry>,
}

impl ChangeRecord {
    /// Revision of a flag; zero when the flag was never advanced.
    pub fn revision(&self, flag: ChangeFlag) -> i64 {
        self.entries
            .iter()
            .find(|e| e.flag == flag)
            .map(|e| e.revision)
            .unwrap_or(0)
    }

    pub fn is_pending(&self, flag: ChangeFlag) -> bool {
        self.entries.iter().any(|e| e.flag == flag && e.pending)
    }
}

// ============================================================================
// Audit events
// ============================================================================

/// An audit trail entry.
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: i64,
    pub action: String,
    pub resource_kind: String,
    pub resource_id: String,
    pub detail: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

/// Input for appending an audit event.
#[derive(Debug, Clone)]
pub struct NewAuditEvent {
    pub action: String,
    pub resource_kind: String,
    pub resource_id: String,
    pub detail: serde_json::Value,
}
