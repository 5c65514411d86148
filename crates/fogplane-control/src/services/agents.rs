//! Agent (fog node) registry.

use serde_json::json;
use uuid::Uuid;

use crate::db::{ChangeRecord, Fog, NewFog};
use crate::error::{ControlError, ControlResult};

use super::{Deferred, Services};

#[derive(Clone)]
pub struct AgentService {
    ctx: Services,
}

impl AgentService {
    pub fn new(ctx: Services) -> Self {
        Self { ctx }
    }

    pub async fn register(&self, fog: NewFog) -> ControlResult<Fog> {
        let result = async {
            if fog.name.trim().is_empty() {
                return Err(ControlError::validation("agent name is required"));
            }
            if fog.host.trim().is_empty() {
                return Err(ControlError::validation("agent host is required"));
            }
            let mut tx = self.ctx.store().begin().await?;
            if tx.find_fog_by_name(&fog.name).await?.is_some() {
                return Err(ControlError::duplicate(format!(
                    "agent {} already exists",
                    fog.name
                )));
            }
            let created = tx.insert_fog(&fog).await?;
            tx.commit().await?;

            let mut deferred = Deferred::default();
            deferred.audit(
                "registered",
                "agent",
                created.uuid,
                json!({"name": created.name, "host": created.host}),
            );
            self.ctx.finish(deferred).await;
            Ok(created)
        }
        .await;
        self.ctx.observe("register_agent", &result);
        result
    }

    pub async fn list(&self) -> ControlResult<Vec<Fog>> {
        let mut tx = self.ctx.store().begin().await?;
        Ok(tx.list_fogs().await?)
    }

    pub async fn get(&self, uuid: Uuid) -> ControlResult<Fog> {
        let mut tx = self.ctx.store().begin().await?;
        tx.find_fog(uuid)
            .await?
            .ok_or_else(|| ControlError::not_found(format!("agent {uuid} not found")))
    }

    /// Change an agent's host and re-resolve every binding that points at it.
    pub async fn update_host(&self, uuid: Uuid, host: &str) -> ControlResult<Fog> {
        let result = async {
            if host.trim().is_empty() {
                return Err(ControlError::validation("agent host is required"));
            }
            let mut tx = self.ctx.store().begin().await?;
            let updated = tx
                .update_fog_host(uuid, host)
                .await?
                .ok_or_else(|| ControlError::not_found(format!("agent {uuid} not found")))?;
            let owners = self
                .ctx
                .extra_hosts()
                .refresh_targeting_fog(&mut *tx, uuid)
                .await?;
            tx.commit().await?;

            tracing::debug!(
                fog_uuid = %uuid,
                host = %updated.host,
                rebuilt = owners.len(),
                "agent host updated"
            );
            let mut deferred = Deferred::default();
            deferred.audit("updated", "agent", uuid, json!({"host": updated.host}));
            self.ctx.finish(deferred).await;
            Ok(updated)
        }
        .await;
        self.ctx.observe("update_agent_host", &result);
        result
    }

    /// The agent's change record, as read by its poll.
    pub async fn changes(&self, uuid: Uuid) -> ControlResult<ChangeRecord> {
        self.ctx.tracker().record(uuid).await
    }

    /// Mark every pending change of the agent as fetched.
    pub async fn acknowledge(&self, uuid: Uuid) -> ControlResult<u64> {
        self.ctx.tracker().acknowledge(uuid).await
    }
}
