//! Persistence seams.
//!
//! Every orchestration operation runs inside one [`StoreTx`]. A transaction
//! that is dropped without [`StoreTx::commit`] rolls back, so an operation
//! that fails part way leaves nothing behind.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use super::models::*;

/// Store-level errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(sqlx::Error),

    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                let constraint = db_err.constraint().unwrap_or("unique").to_string();
                return Self::UniqueViolation(constraint);
            }
        }
        Self::Database(err)
    }
}

impl From<UnknownVariant> for StoreError {
    fn from(err: UnknownVariant) -> Self {
        Self::Corrupt(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A backend that can open transactions.
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a new transaction.
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>>;

    /// Check that the backend is reachable.
    async fn ping(&self) -> StoreResult<()>;
}

/// One open transaction over every entity table.
#[async_trait]
pub trait StoreTx:
    ApplicationStore
    + FogStore
    + CatalogStore
    + MicroserviceStore
    + PortMappingStore
    + ExtraHostStore
    + RouteStore
    + TagStore
    + ChangeStore
    + EventStore
    + Send
{
    /// Make every write of this transaction visible.
    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

#[async_trait]
pub trait ApplicationStore: Send {
    async fn insert_application(&mut self, app: &NewApplication) -> StoreResult<Application>;
    async fn find_application(&mut self, id: i64) -> StoreResult<Option<Application>>;
    async fn find_application_by_name(&mut self, name: &str)
        -> StoreResult<Option<Application>>;
    async fn list_applications(&mut self) -> StoreResult<Vec<Application>>;
    async fn update_application(
        &mut self,
        id: i64,
        patch: &ApplicationPatch,
    ) -> StoreResult<Option<Application>>;
    /// Delete an application with its microservices, routes and their rows.
    async fn delete_application(&mut self, id: i64) -> StoreResult<bool>;
}

#[async_trait]
pub trait FogStore: Send {
    async fn insert_fog(&mut self, fog: &NewFog) -> StoreResult<Fog>;
    async fn find_fog(&mut self, uuid: Uuid) -> StoreResult<Option<Fog>>;
    async fn find_fog_by_name(&mut self, name: &str) -> StoreResult<Option<Fog>>;
    async fn list_fogs(&mut self) -> StoreResult<Vec<Fog>>;
    async fn update_fog_host(&mut self, uuid: Uuid, host: &str) -> StoreResult<Option<Fog>>;
}

#[async_trait]
pub trait CatalogStore: Send {
    async fn insert_registry(&mut self, registry: &NewRegistry) -> StoreResult<Registry>;
    async fn find_registry(&mut self, id: i64) -> StoreResult<Option<Registry>>;
    async fn insert_catalog_item(
        &mut self,
        item: &NewCatalogItem,
        registry_id: i64,
    ) -> StoreResult<CatalogItem>;
    async fn find_catalog_item(&mut self, id: i64) -> StoreResult<Option<CatalogItem>>;
}

#[async_trait]
pub trait MicroserviceStore: Send {
    async fn insert_microservice(&mut self, m: &NewMicroservice) -> StoreResult<Microservice>;
    async fn find_microservice(&mut self, uuid: Uuid) -> StoreResult<Option<Microservice>>;
    async fn find_microservice_by_name(
        &mut self,
        application_id: i64,
        name: &str,
    ) -> StoreResult<Option<Microservice>>;
    async fn list_microservices(
        &mut self,
        filter: &MicroserviceFilter,
    ) -> StoreResult<Vec<Microservice>>;
    async fn update_microservice(
        &mut self,
        uuid: Uuid,
        patch: &MicroservicePatch,
    ) -> StoreResult<Option<Microservice>>;
    /// Hard-delete a microservice and every row that hangs off it.
    async fn delete_microservice(&mut self, uuid: Uuid) -> StoreResult<bool>;

    async fn upsert_status(&mut self, status: &MicroserviceStatus) -> StoreResult<()>;
    async fn find_status(&mut self, uuid: Uuid) -> StoreResult<Option<MicroserviceStatus>>;
}

#[async_trait]
pub trait PortMappingStore: Send {
    async fn insert_port_mapping(&mut self, port: &NewPortMapping) -> StoreResult<PortMapping>;
    async fn list_port_mappings(&mut self, microservice: Uuid) -> StoreResult<Vec<PortMapping>>;
    /// Every port mapping of non-deleted microservices placed on `fog`.
    async fn list_port_mappings_on_fog(&mut self, fog: Uuid) -> StoreResult<Vec<PortMapping>>;
    /// Every public or proxy mapping, across agents.
    async fn list_exposed_port_mappings(&mut self) -> StoreResult<Vec<PortMapping>>;
    async fn set_public_fog(&mut self, id: i64, fog: Uuid) -> StoreResult<()>;
    async fn delete_port_mappings(&mut self, microservice: Uuid) -> StoreResult<u64>;
}

#[async_trait]
pub trait ExtraHostStore: Send {
    async fn insert_extra_host(&mut self, host: &NewExtraHost) -> StoreResult<ExtraHost>;
    async fn list_extra_hosts(&mut self, microservice: Uuid) -> StoreResult<Vec<ExtraHost>>;
    async fn list_extra_hosts_targeting_microservice(
        &mut self,
        target: Uuid,
    ) -> StoreResult<Vec<ExtraHost>>;
    async fn list_extra_hosts_targeting_fog(&mut self, fog: Uuid) -> StoreResult<Vec<ExtraHost>>;
    async fn update_extra_host(&mut self, id: i64, update: &ExtraHostUpdate) -> StoreResult<()>;
    async fn set_extra_host_template(&mut self, id: i64, template: &str) -> StoreResult<()>;
    async fn delete_extra_hosts(&mut self, microservice: Uuid) -> StoreResult<u64>;
}

#[async_trait]
pub trait RouteStore: Send {
    async fn insert_route(&mut self, route: &NewRoute) -> StoreResult<Route>;
    async fn find_route_by_name(
        &mut self,
        application_id: i64,
        name: &str,
    ) -> StoreResult<Option<Route>>;
    async fn find_route_between(&mut self, source: Uuid, dest: Uuid)
        -> StoreResult<Option<Route>>;
    async fn list_routes(&mut self, application_id: Option<i64>) -> StoreResult<Vec<Route>>;
    /// Routes with `microservice` at either end.
    async fn list_routes_touching(&mut self, microservice: Uuid) -> StoreResult<Vec<Route>>;
    async fn update_route(&mut self, id: i64, patch: &RoutePatch) -> StoreResult<Option<Route>>;
    async fn delete_route(&mut self, id: i64) -> StoreResult<bool>;
}

#[async_trait]
pub trait TagStore: Send {
    /// Return the tag with `value`, creating it first if absent.
    async fn upsert_tag(&mut self, value: &str) -> StoreResult<Tag>;
    async fn set_pub_tags(&mut self, microservice: Uuid, tags: &[i64]) -> StoreResult<()>;
    async fn set_sub_tags(&mut self, microservice: Uuid, tags: &[i64]) -> StoreResult<()>;
    async fn list_pub_tags(&mut self, microservice: Uuid) -> StoreResult<Vec<Tag>>;
    async fn list_sub_tags(&mut self, microservice: Uuid) -> StoreResult<Vec<Tag>>;
    /// Microservices publishing any of `tags`.
    async fn list_publishers(&mut self, tags: &[i64]) -> StoreResult<Vec<Uuid>>;
    /// Microservices subscribing to any of `tags`.
    async fn list_subscribers(&mut self, tags: &[i64]) -> StoreResult<Vec<Uuid>>;
}

#[async_trait]
pub trait ChangeStore: Send {
    /// Advance the revision of `flag` for `fog` and mark it pending.
    async fn bump_change(&mut self, fog: Uuid, flag: ChangeFlag) -> StoreResult<ChangeEntry>;
    async fn list_changes(&mut self, fog: Uuid) -> StoreResult<Vec<ChangeEntry>>;
    /// Clear the pending mark on every flag of `fog`. Revisions are kept.
    async fn clear_changes(&mut self, fog: Uuid) -> StoreResult<u64>;
}

#[async_trait]
pub trait EventStore: Send {
    async fn insert_event(&mut self, event: &NewAuditEvent) -> StoreResult<AuditEvent>;
    async fn list_events(&mut self, limit: i64) -> StoreResult<Vec<AuditEvent>>;
}
