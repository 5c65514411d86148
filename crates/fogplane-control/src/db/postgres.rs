//! PostgreSQL store backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::Postgres;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, QueryBuilder, Transaction};
use uuid::Uuid;

use super::models::*;
use super::store::*;

/// Store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// An open database transaction. Rolled back on drop unless committed.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }
}

// ============================================================================
// Row types for columns that need conversion
// ============================================================================

#[derive(FromRow)]
struct CatalogItemRow {
    id: i64,
    name: String,
    category: String,
    registry_id: i64,
    images: Json<Vec<MicroserviceImage>>,
    created_at: DateTime<Utc>,
}

impl From<CatalogItemRow> for CatalogItem {
    fn from(row: CatalogItemRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            category: row.category,
            registry_id: row.registry_id,
            images: row.images.0,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct MicroserviceRow {
    uuid: Uuid,
    name: String,
    application_id: i64,
    iofog_uuid: Option<Uuid>,
    catalog_item_id: Option<i64>,
    registry_id: i64,
    config: String,
    images: Json<Vec<MicroserviceImage>>,
    env: Json<Vec<EnvVar>>,
    cmd: Json<Vec<String>>,
    cdi_devices: Json<Vec<String>>,
    volume_mappings: Json<Vec<VolumeMapping>>,
    root_host_access: bool,
    run_as_user: Option<String>,
    platform: Option<String>,
    runtime: Option<String>,
    log_size: i64,
    rebuild: bool,
    is_deleted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<MicroserviceRow> for Microservice {
    fn from(row: MicroserviceRow) -> Self {
        Self {
            uuid: row.uuid,
            name: row.name,
            application_id: row.application_id,
            iofog_uuid: row.iofog_uuid,
            catalog_item_id: row.catalog_item_id,
            registry_id: row.registry_id,
            config: row.config,
            images: row.images.0,
            env: row.env.0,
            cmd: row.cmd.0,
            cdi_devices: row.cdi_devices.0,
            volume_mappings: row.volume_mappings.0,
            root_host_access: row.root_host_access,
            run_as_user: row.run_as_user,
            platform: row.platform,
            runtime: row.runtime,
            log_size: row.log_size,
            rebuild: row.rebuild,
            delete: row.is_deleted,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct StatusRow {
    microservice_uuid: Uuid,
    status: String,
    operating_duration: i64,
    start_time: i64,
    cpu_usage: f64,
    memory_usage: i64,
    container_id: Option<String>,
    percentage: f64,
    error_message: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StatusRow> for MicroserviceStatus {
    type Error = UnknownVariant;

    fn try_from(row: StatusRow) -> Result<Self, Self::Error> {
        Ok(Self {
            microservice_uuid: row.microservice_uuid,
            status: row.status.parse()?,
            operating_duration: row.operating_duration,
            start_time: row.start_time,
            cpu_usage: row.cpu_usage,
            memory_usage: row.memory_usage,
            container_id: row.container_id,
            percentage: row.percentage,
            error_message: row.error_message,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct PortMappingRow {
    id: i64,
    microservice_uuid: Uuid,
    port_internal: i32,
    port_external: i32,
    is_udp: bool,
    public_mode: String,
    public_port: Option<i32>,
    public_fog_uuid: Option<Uuid>,
    proxy_host: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<PortMappingRow> for PortMapping {
    type Error = UnknownVariant;

    fn try_from(row: PortMappingRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            microservice_uuid: row.microservice_uuid,
            port_internal: row.port_internal,
            port_external: row.port_external,
            is_udp: row.is_udp,
            public_mode: row.public_mode.parse()?,
            public_port: row.public_port,
            public_fog_uuid: row.public_fog_uuid,
            proxy_host: row.proxy_host,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct ExtraHostRow {
    id: i64,
    microservice_uuid: Uuid,
    name: String,
    template: String,
    template_type: String,
    value: String,
    target_fog_uuid: Option<Uuid>,
    target_microservice_uuid: Option<Uuid>,
    public_port: Option<i32>,
}

impl TryFrom<ExtraHostRow> for ExtraHost {
    type Error = UnknownVariant;

    fn try_from(row: ExtraHostRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            microservice_uuid: row.microservice_uuid,
            name: row.name,
            template: row.template,
            template_type: row.template_type.parse()?,
            value: row.value,
            target_fog_uuid: row.target_fog_uuid,
            target_microservice_uuid: row.target_microservice_uuid,
            public_port: row.public_port,
        })
    }
}

#[derive(FromRow)]
struct ChangeRow {
    fog_uuid: Uuid,
    flag: String,
    revision: i64,
    pending: bool,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ChangeRow> for ChangeEntry {
    type Error = UnknownVariant;

    fn try_from(row: ChangeRow) -> Result<Self, Self::Error> {
        Ok(Self {
            fog_uuid: row.fog_uuid,
            flag: row.flag.parse()?,
            revision: row.revision,
            pending: row.pending,
            updated_at: row.updated_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = UnknownVariant>,
{
    rows.into_iter()
        .map(|row| T::try_from(row).map_err(StoreError::from))
        .collect()
}

// ============================================================================
// Repositories
// ============================================================================

#[async_trait]
impl ApplicationStore for PgTx {
    async fn insert_application(&mut self, app: &NewApplication) -> StoreResult<Application> {
        let row = sqlx::query_as::<_, Application>(
            r#"
            INSERT INTO applications (name, description, is_activated, is_system)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(&app.name)
        .bind(&app.description)
        .bind(app.is_activated)
        .bind(app.is_system)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn find_application(&mut self, id: i64) -> StoreResult<Option<Application>> {
        let row = sqlx::query_as::<_, Application>("SELECT * FROM applications WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn find_application_by_name(
        &mut self,
        name: &str,
    ) -> StoreResult<Option<Application>> {
        let row = sqlx::query_as::<_, Application>("SELECT * FROM applications WHERE name = $1")
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn list_applications(&mut self) -> StoreResult<Vec<Application>> {
        let rows = sqlx::query_as::<_, Application>("SELECT * FROM applications ORDER BY name")
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows)
    }

    async fn update_application(
        &mut self,
        id: i64,
        patch: &ApplicationPatch,
    ) -> StoreResult<Option<Application>> {
        // Build dynamic update query
        let mut set_clauses = vec!["updated_at = NOW()".to_string()];
        let mut param_idx = 2; // $1 is the id

        if patch.description.is_some() {
            set_clauses.push(format!("description = ${}", param_idx));
            param_idx += 1;
        }
        if patch.is_activated.is_some() {
            set_clauses.push(format!("is_activated = ${}", param_idx));
        }

        let query = format!(
            "UPDATE applications SET {} WHERE id = $1 RETURNING *",
            set_clauses.join(", ")
        );

        let mut q = sqlx::query_as::<_, Application>(&query).bind(id);
        if let Some(description) = &patch.description {
            q = q.bind(description);
        }
        if let Some(activated) = patch.is_activated {
            q = q.bind(activated);
        }

        Ok(q.fetch_optional(&mut *self.tx).await?)
    }

    async fn delete_application(&mut self, id: i64) -> StoreResult<bool> {
        // Microservices, routes and their rows cascade
        let result = sqlx::query("DELETE FROM applications WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl FogStore for PgTx {
    async fn insert_fog(&mut self, fog: &NewFog) -> StoreResult<Fog> {
        let row = sqlx::query_as::<_, Fog>(
            r#"
            INSERT INTO fogs (uuid, name, host, fog_type_id)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&fog.name)
        .bind(&fog.host)
        .bind(fog.fog_type_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn find_fog(&mut self, uuid: Uuid) -> StoreResult<Option<Fog>> {
        let row = sqlx::query_as::<_, Fog>("SELECT * FROM fogs WHERE uuid = $1")
            .bind(uuid)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn find_fog_by_name(&mut self, name: &str) -> StoreResult<Option<Fog>> {
        let row = sqlx::query_as::<_, Fog>("SELECT * FROM fogs WHERE name = $1")
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn list_fogs(&mut self) -> StoreResult<Vec<Fog>> {
        let rows = sqlx::query_as::<_, Fog>("SELECT * FROM fogs ORDER BY name")
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows)
    }

    async fn update_fog_host(&mut self, uuid: Uuid, host: &str) -> StoreResult<Option<Fog>> {
        let row = sqlx::query_as::<_, Fog>(
            "UPDATE fogs SET host = $2, updated_at = NOW() WHERE uuid = $1 RETURNING *",
        )
        .bind(uuid)
        .bind(host)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl CatalogStore for PgTx {
    async fn insert_registry(&mut self, registry: &NewRegistry) -> StoreResult<Registry> {
        let row = sqlx::query_as::<_, Registry>(
            "INSERT INTO registries (url, is_public) VALUES ($1, $2) RETURNING *",
        )
        .bind(&registry.url)
        .bind(registry.is_public)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn find_registry(&mut self, id: i64) -> StoreResult<Option<Registry>> {
        let row = sqlx::query_as::<_, Registry>("SELECT * FROM registries WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn insert_catalog_item(
        &mut self,
        item: &NewCatalogItem,
        registry_id: i64,
    ) -> StoreResult<CatalogItem> {
        let row = sqlx::query_as::<_, CatalogItemRow>(
            r#"
            INSERT INTO catalog_items (name, category, registry_id, images)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(&item.name)
        .bind(&item.category)
        .bind(registry_id)
        .bind(Json(&item.images))
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.into())
    }

    async fn find_catalog_item(&mut self, id: i64) -> StoreResult<Option<CatalogItem>> {
        let row = sqlx::query_as::<_, CatalogItemRow>("SELECT * FROM catalog_items WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(Into::into))
    }
}

#[async_trait]
impl MicroserviceStore for PgTx {
    async fn insert_microservice(&mut self, m: &NewMicroservice) -> StoreResult<Microservice> {
        let row = sqlx::query_as::<_, MicroserviceRow>(
            r#"
            INSERT INTO microservices (
                uuid, name, application_id, iofog_uuid, catalog_item_id, registry_id,
                config, images, env, cmd, cdi_devices, volume_mappings,
                root_host_access, run_as_user, platform, runtime, log_size
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING *
            "#,
        )
        .bind(m.uuid)
        .bind(&m.name)
        .bind(m.application_id)
        .bind(m.iofog_uuid)
        .bind(m.catalog_item_id)
        .bind(m.registry_id)
        .bind(&m.config)
        .bind(Json(&m.images))
        .bind(Json(&m.env))
        .bind(Json(&m.cmd))
        .bind(Json(&m.cdi_devices))
        .bind(Json(&m.volume_mappings))
        .bind(m.root_host_access)
        .bind(&m.run_as_user)
        .bind(&m.platform)
        .bind(&m.runtime)
        .bind(m.log_size)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.into())
    }

    async fn find_microservice(&mut self, uuid: Uuid) -> StoreResult<Option<Microservice>> {
        let row = sqlx::query_as::<_, MicroserviceRow>("SELECT * FROM microservices WHERE uuid = $1")
            .bind(uuid)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn find_microservice_by_name(
        &mut self,
        application_id: i64,
        name: &str,
    ) -> StoreResult<Option<Microservice>> {
        let row = sqlx::query_as::<_, MicroserviceRow>(
            r#"
            SELECT * FROM microservices
            WHERE application_id = $1 AND name = $2 AND NOT is_deleted
            "#,
        )
        .bind(application_id)
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list_microservices(
        &mut self,
        filter: &MicroserviceFilter,
    ) -> StoreResult<Vec<Microservice>> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM microservices WHERE TRUE");
        if let Some(application_id) = filter.application_id {
            qb.push(" AND application_id = ").push_bind(application_id);
        }
        if let Some(fog) = filter.iofog_uuid {
            qb.push(" AND iofog_uuid = ").push_bind(fog);
        }
        if !filter.include_deleted {
            qb.push(" AND NOT is_deleted");
        }
        qb.push(" ORDER BY application_id, name, uuid");

        let rows = qb
            .build_query_as::<MicroserviceRow>()
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update_microservice(
        &mut self,
        uuid: Uuid,
        patch: &MicroservicePatch,
    ) -> StoreResult<Option<Microservice>> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE microservices SET updated_at = NOW()");
        if let Some(name) = &patch.name {
            qb.push(", name = ").push_bind(name.clone());
        }
        if let Some(config) = &patch.config {
            qb.push(", config = ").push_bind(config.clone());
        }
        if let Some(fog) = patch.iofog_uuid {
            qb.push(", iofog_uuid = ").push_bind(fog);
        }
        if let Some(item) = patch.catalog_item_id {
            qb.push(", catalog_item_id = ").push_bind(item);
        }
        if let Some(registry) = patch.registry_id {
            qb.push(", registry_id = ").push_bind(registry);
        }
        if let Some(images) = &patch.images {
            qb.push(", images = ").push_bind(Json(images.clone()));
        }
        if let Some(env) = &patch.env {
            qb.push(", env = ").push_bind(Json(env.clone()));
        }
        if let Some(cmd) = &patch.cmd {
            qb.push(", cmd = ").push_bind(Json(cmd.clone()));
        }
        if let Some(devices) = &patch.cdi_devices {
            qb.push(", cdi_devices = ").push_bind(Json(devices.clone()));
        }
        if let Some(volumes) = &patch.volume_mappings {
            qb.push(", volume_mappings = ").push_bind(Json(volumes.clone()));
        }
        if let Some(root) = patch.root_host_access {
            qb.push(", root_host_access = ").push_bind(root);
        }
        if let Some(user) = &patch.run_as_user {
            qb.push(", run_as_user = ").push_bind(user.clone());
        }
        if let Some(platform) = &patch.platform {
            qb.push(", platform = ").push_bind(platform.clone());
        }
        if let Some(runtime) = &patch.runtime {
            qb.push(", runtime = ").push_bind(runtime.clone());
        }
        if let Some(log_size) = patch.log_size {
            qb.push(", log_size = ").push_bind(log_size);
        }
        if let Some(rebuild) = patch.rebuild {
            qb.push(", rebuild = ").push_bind(rebuild);
        }
        if let Some(delete) = patch.delete {
            qb.push(", is_deleted = ").push_bind(delete);
        }
        qb.push(" WHERE uuid = ").push_bind(uuid);
        qb.push(" RETURNING *");

        let row = qb
            .build_query_as::<MicroserviceRow>()
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn delete_microservice(&mut self, uuid: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM microservices WHERE uuid = $1")
            .bind(uuid)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_status(&mut self, status: &MicroserviceStatus) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO microservice_statuses (
                microservice_uuid, status, operating_duration, start_time, cpu_usage,
                memory_usage, container_id, percentage, error_message, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (microservice_uuid) DO UPDATE SET
                status = EXCLUDED.status,
                operating_duration = EXCLUDED.operating_duration,
                start_time = EXCLUDED.start_time,
                cpu_usage = EXCLUDED.cpu_usage,
                memory_usage = EXCLUDED.memory_usage,
                container_id = EXCLUDED.container_id,
                percentage = EXCLUDED.percentage,
                error_message = EXCLUDED.error_message,
                updated_at = NOW()
            "#,
        )
        .bind(status.microservice_uuid)
        .bind(status.status.as_str())
        .bind(status.operating_duration)
        .bind(status.start_time)
        .bind(status.cpu_usage)
        .bind(status.memory_usage)
        .bind(&status.container_id)
        .bind(status.percentage)
        .bind(&status.error_message)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn find_status(&mut self, uuid: Uuid) -> StoreResult<Option<MicroserviceStatus>> {
        let row = sqlx::query_as::<_, StatusRow>(
            "SELECT * FROM microservice_statuses WHERE microservice_uuid = $1",
        )
        .bind(uuid)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(MicroserviceStatus::try_from).transpose()?)
    }
}

#[async_trait]
impl PortMappingStore for PgTx {
    async fn insert_port_mapping(&mut self, port: &NewPortMapping) -> StoreResult<PortMapping> {
        let row = sqlx::query_as::<_, PortMappingRow>(
            r#"
            INSERT INTO port_mappings (
                microservice_uuid, port_internal, port_external, is_udp,
                public_mode, public_port, public_fog_uuid, proxy_host
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(port.microservice_uuid)
        .bind(port.port_internal)
        .bind(port.port_external)
        .bind(port.is_udp)
        .bind(port.public_mode.as_str())
        .bind(port.public_port)
        .bind(port.public_fog_uuid)
        .bind(&port.proxy_host)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.try_into()?)
    }

    async fn list_port_mappings(&mut self, microservice: Uuid) -> StoreResult<Vec<PortMapping>> {
        let rows = sqlx::query_as::<_, PortMappingRow>(
            "SELECT * FROM port_mappings WHERE microservice_uuid = $1 ORDER BY id",
        )
        .bind(microservice)
        .fetch_all(&mut *self.tx)
        .await?;
        convert_all(rows)
    }

    async fn list_port_mappings_on_fog(&mut self, fog: Uuid) -> StoreResult<Vec<PortMapping>> {
        let rows = sqlx::query_as::<_, PortMappingRow>(
            r#"
            SELECT p.* FROM port_mappings p
            JOIN microservices m ON m.uuid = p.microservice_uuid
            WHERE m.iofog_uuid = $1 AND NOT m.is_deleted
            ORDER BY p.id
            "#,
        )
        .bind(fog)
        .fetch_all(&mut *self.tx)
        .await?;
        convert_all(rows)
    }

    async fn list_exposed_port_mappings(&mut self) -> StoreResult<Vec<PortMapping>> {
        let rows = sqlx::query_as::<_, PortMappingRow>(
            "SELECT * FROM port_mappings WHERE public_mode <> 'none' ORDER BY id",
        )
        .fetch_all(&mut *self.tx)
        .await?;
        convert_all(rows)
    }

    async fn set_public_fog(&mut self, id: i64, fog: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE port_mappings SET public_fog_uuid = $2 WHERE id = $1")
            .bind(id)
            .bind(fog)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn delete_port_mappings(&mut self, microservice: Uuid) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM port_mappings WHERE microservice_uuid = $1")
            .bind(microservice)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ExtraHostStore for PgTx {
    async fn insert_extra_host(&mut self, host: &NewExtraHost) -> StoreResult<ExtraHost> {
        let row = sqlx::query_as::<_, ExtraHostRow>(
            r#"
            INSERT INTO extra_hosts (
                microservice_uuid, name, template, template_type, value,
                target_fog_uuid, target_microservice_uuid, public_port
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(host.microservice_uuid)
        .bind(&host.name)
        .bind(&host.template)
        .bind(host.template_type.as_str())
        .bind(&host.value)
        .bind(host.target_fog_uuid)
        .bind(host.target_microservice_uuid)
        .bind(host.public_port)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.try_into()?)
    }

    async fn list_extra_hosts(&mut self, microservice: Uuid) -> StoreResult<Vec<ExtraHost>> {
        let rows = sqlx::query_as::<_, ExtraHostRow>(
            "SELECT * FROM extra_hosts WHERE microservice_uuid = $1 ORDER BY id",
        )
        .bind(microservice)
        .fetch_all(&mut *self.tx)
        .await?;
        convert_all(rows)
    }

    async fn list_extra_hosts_targeting_microservice(
        &mut self,
        target: Uuid,
    ) -> StoreResult<Vec<ExtraHost>> {
        let rows = sqlx::query_as::<_, ExtraHostRow>(
            "SELECT * FROM extra_hosts WHERE target_microservice_uuid = $1 ORDER BY id",
        )
        .bind(target)
        .fetch_all(&mut *self.tx)
        .await?;
        convert_all(rows)
    }

    async fn list_extra_hosts_targeting_fog(&mut self, fog: Uuid) -> StoreResult<Vec<ExtraHost>> {
        let rows = sqlx::query_as::<_, ExtraHostRow>(
            "SELECT * FROM extra_hosts WHERE target_fog_uuid = $1 ORDER BY id",
        )
        .bind(fog)
        .fetch_all(&mut *self.tx)
        .await?;
        convert_all(rows)
    }

    async fn update_extra_host(&mut self, id: i64, update: &ExtraHostUpdate) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE extra_hosts
            SET value = $2, target_fog_uuid = $3, target_microservice_uuid = $4, public_port = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&update.value)
        .bind(update.target_fog_uuid)
        .bind(update.target_microservice_uuid)
        .bind(update.public_port)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn set_extra_host_template(&mut self, id: i64, template: &str) -> StoreResult<()> {
        sqlx::query("UPDATE extra_hosts SET template = $2 WHERE id = $1")
            .bind(id)
            .bind(template)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn delete_extra_hosts(&mut self, microservice: Uuid) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM extra_hosts WHERE microservice_uuid = $1")
            .bind(microservice)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RouteStore for PgTx {
    async fn insert_route(&mut self, route: &NewRoute) -> StoreResult<Route> {
        let row = sqlx::query_as::<_, Route>(
            r#"
            INSERT INTO routes (name, application_id, source_microservice_uuid, dest_microservice_uuid)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(&route.name)
        .bind(route.application_id)
        .bind(route.source_microservice_uuid)
        .bind(route.dest_microservice_uuid)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn find_route_by_name(
        &mut self,
        application_id: i64,
        name: &str,
    ) -> StoreResult<Option<Route>> {
        let row = sqlx::query_as::<_, Route>(
            "SELECT * FROM routes WHERE application_id = $1 AND name = $2",
        )
        .bind(application_id)
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn find_route_between(
        &mut self,
        source: Uuid,
        dest: Uuid,
    ) -> StoreResult<Option<Route>> {
        let row = sqlx::query_as::<_, Route>(
            "SELECT * FROM routes WHERE source_microservice_uuid = $1 AND dest_microservice_uuid = $2",
        )
        .bind(source)
        .bind(dest)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn list_routes(&mut self, application_id: Option<i64>) -> StoreResult<Vec<Route>> {
        let rows = match application_id {
            Some(id) => {
                sqlx::query_as::<_, Route>(
                    "SELECT * FROM routes WHERE application_id = $1 ORDER BY id",
                )
                .bind(id)
                .fetch_all(&mut *self.tx)
                .await?
            }
            None => {
                sqlx::query_as::<_, Route>("SELECT * FROM routes ORDER BY id")
                    .fetch_all(&mut *self.tx)
                    .await?
            }
        };
        Ok(rows)
    }

    async fn list_routes_touching(&mut self, microservice: Uuid) -> StoreResult<Vec<Route>> {
        let rows = sqlx::query_as::<_, Route>(
            r#"
            SELECT * FROM routes
            WHERE source_microservice_uuid = $1 OR dest_microservice_uuid = $1
            ORDER BY id
            "#,
        )
        .bind(microservice)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn update_route(&mut self, id: i64, patch: &RoutePatch) -> StoreResult<Option<Route>> {
        let mut set_clauses = vec!["updated_at = NOW()".to_string()];
        let mut param_idx = 2; // $1 is the id

        if patch.name.is_some() {
            set_clauses.push(format!("name = ${}", param_idx));
            param_idx += 1;
        }
        if patch.source_microservice_uuid.is_some() {
            set_clauses.push(format!("source_microservice_uuid = ${}", param_idx));
            param_idx += 1;
        }
        if patch.dest_microservice_uuid.is_some() {
            set_clauses.push(format!("dest_microservice_uuid = ${}", param_idx));
        }

        let query = format!(
            "UPDATE routes SET {} WHERE id = $1 RETURNING *",
            set_clauses.join(", ")
        );

        let mut q = sqlx::query_as::<_, Route>(&query).bind(id);
        if let Some(name) = &patch.name {
            q = q.bind(name);
        }
        if let Some(source) = patch.source_microservice_uuid {
            q = q.bind(source);
        }
        if let Some(dest) = patch.dest_microservice_uuid {
            q = q.bind(dest);
        }

        Ok(q.fetch_optional(&mut *self.tx).await?)
    }

    async fn delete_route(&mut self, id: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM routes WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TagStore for PgTx {
    async fn upsert_tag(&mut self, value: &str) -> StoreResult<Tag> {
        sqlx::query("INSERT INTO tags (value) VALUES ($1) ON CONFLICT (value) DO NOTHING")
            .bind(value)
            .execute(&mut *self.tx)
            .await?;
        let tag = sqlx::query_as::<_, Tag>("SELECT * FROM tags WHERE value = $1")
            .bind(value)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(tag)
    }

    async fn set_pub_tags(&mut self, microservice: Uuid, tags: &[i64]) -> StoreResult<()> {
        sqlx::query("DELETE FROM microservice_pub_tags WHERE microservice_uuid = $1")
            .bind(microservice)
            .execute(&mut *self.tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO microservice_pub_tags (microservice_uuid, tag_id)
            SELECT $1, UNNEST($2::BIGINT[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(microservice)
        .bind(tags)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn set_sub_tags(&mut self, microservice: Uuid, tags: &[i64]) -> StoreResult<()> {
        sqlx::query("DELETE FROM microservice_sub_tags WHERE microservice_uuid = $1")
            .bind(microservice)
            .execute(&mut *self.tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO microservice_sub_tags (microservice_uuid, tag_id)
            SELECT $1, UNNEST($2::BIGINT[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(microservice)
        .bind(tags)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn list_pub_tags(&mut self, microservice: Uuid) -> StoreResult<Vec<Tag>> {
        let rows = sqlx::query_as::<_, Tag>(
            r#"
            SELECT t.* FROM tags t
            JOIN microservice_pub_tags p ON p.tag_id = t.id
            WHERE p.microservice_uuid = $1
            ORDER BY t.id
            "#,
        )
        .bind(microservice)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn list_sub_tags(&mut self, microservice: Uuid) -> StoreResult<Vec<Tag>> {
        let rows = sqlx::query_as::<_, Tag>(
            r#"
            SELECT t.* FROM tags t
            JOIN microservice_sub_tags s ON s.tag_id = t.id
            WHERE s.microservice_uuid = $1
            ORDER BY t.id
            "#,
        )
        .bind(microservice)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn list_publishers(&mut self, tags: &[i64]) -> StoreResult<Vec<Uuid>> {
        let rows = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT DISTINCT microservice_uuid FROM microservice_pub_tags
            WHERE tag_id = ANY($1)
            ORDER BY microservice_uuid
            "#,
        )
        .bind(tags)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn list_subscribers(&mut self, tags: &[i64]) -> StoreResult<Vec<Uuid>> {
        let rows = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT DISTINCT microservice_uuid FROM microservice_sub_tags
            WHERE tag_id = ANY($1)
            ORDER BY microservice_uuid
            "#,
        )
        .bind(tags)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl ChangeStore for PgTx {
    async fn bump_change(&mut self, fog: Uuid, flag: ChangeFlag) -> StoreResult<ChangeEntry> {
        let row = sqlx::query_as::<_, ChangeRow>(
            r#"
            INSERT INTO change_tracking (fog_uuid, flag, revision, pending, updated_at)
            VALUES ($1, $2, 1, TRUE, NOW())
            ON CONFLICT (fog_uuid, flag) DO UPDATE SET
                revision = change_tracking.revision + 1,
                pending = TRUE,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(fog)
        .bind(flag.as_str())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.try_into()?)
    }

    async fn list_changes(&mut self, fog: Uuid) -> StoreResult<Vec<ChangeEntry>> {
        let rows = sqlx::query_as::<_, ChangeRow>(
            "SELECT * FROM change_tracking WHERE fog_uuid = $1 ORDER BY flag",
        )
        .bind(fog)
        .fetch_all(&mut *self.tx)
        .await?;
        convert_all(rows)
    }

    async fn clear_changes(&mut self, fog: Uuid) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE change_tracking SET pending = FALSE WHERE fog_uuid = $1 AND pending",
        )
        .bind(fog)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl EventStore for PgTx {
    async fn insert_event(&mut self, event: &NewAuditEvent) -> StoreResult<AuditEvent> {
        let row = sqlx::query_as::<_, AuditEvent>(
            r#"
            INSERT INTO audit_events (action, resource_kind, resource_id, detail)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(&event.action)
        .bind(&event.resource_kind)
        .bind(&event.resource_id)
        .bind(&event.detail)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn list_events(&mut self, limit: i64) -> StoreResult<Vec<AuditEvent>> {
        let rows = sqlx::query_as::<_, AuditEvent>(
            "SELECT * FROM audit_events ORDER BY id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_pool, run_migrations};

    /// Connect to the test database, or `None` to skip.
    async fn test_store() -> Option<PgStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let pool = create_pool(&url).await.ok()?;
        run_migrations(&pool).await.ok()?;
        Some(PgStore::new(pool))
    }

    #[tokio::test]
    async fn change_counter_upsert_advances_revision() {
        let Some(store) = test_store().await else {
            return;
        };
        let mut tx = store.begin().await.unwrap();
        let fog = tx
            .insert_fog(&NewFog {
                name: format!("pg-test-{}", Uuid::new_v4()),
                host: "10.0.0.1".into(),
                fog_type_id: 1,
            })
            .await
            .unwrap();

        tx.bump_change(fog.uuid, ChangeFlag::MicroserviceList)
            .await
            .unwrap();
        let entry = tx
            .bump_change(fog.uuid, ChangeFlag::MicroserviceList)
            .await
            .unwrap();
        assert_eq!(entry.revision, 2);
        assert!(entry.pending);
        // dropped without commit: rolled back
    }

    #[tokio::test]
    async fn tag_upsert_returns_existing_row() {
        let Some(store) = test_store().await else {
            return;
        };
        let mut tx = store.begin().await.unwrap();
        let value = format!("tag-{}", Uuid::new_v4());
        let first = tx.upsert_tag(&value).await.unwrap();
        let second = tx.upsert_tag(&value).await.unwrap();
        assert_eq!(first.id, second.id);
    }
}
