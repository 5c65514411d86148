//! Agents API handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{ChangeRecord, Fog, NewFog};
use crate::error::ProblemDetails;

use super::router::AppState;

#[derive(Debug, Deserialize)]
pub struct UpdateAgent {
    pub host: String,
}

#[derive(Debug, Serialize)]
pub struct AcknowledgeResponse {
    pub cleared: u64,
}

/// POST /agents - Register an agent
pub async fn register_agent(
    State(state): State<AppState>,
    Json(input): Json<NewFog>,
) -> Result<(StatusCode, Json<Fog>), ProblemDetails> {
    let fog = state.services.agents().register(input).await?;
    Ok((StatusCode::CREATED, Json(fog)))
}

/// GET /agents - List agents
pub async fn list_agents(
    State(state): State<AppState>,
) -> Result<Json<Vec<Fog>>, ProblemDetails> {
    let fogs = state.services.agents().list().await?;
    Ok(Json(fogs))
}

/// GET /agents/:uuid - Get an agent
pub async fn get_agent(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<Json<Fog>, ProblemDetails> {
    let fog = state.services.agents().get(uuid).await?;
    Ok(Json(fog))
}

/// PATCH /agents/:uuid - Change an agent's host
pub async fn update_agent(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
    Json(input): Json<UpdateAgent>,
) -> Result<Json<Fog>, ProblemDetails> {
    let fog = state.services.agents().update_host(uuid, &input.host).await?;
    Ok(Json(fog))
}

/// GET /agents/:uuid/changes - The agent's change record
pub async fn get_changes(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<Json<ChangeRecord>, ProblemDetails> {
    let record = state.services.agents().changes(uuid).await?;
    Ok(Json(record))
}

/// DELETE /agents/:uuid/changes - Acknowledge every pending change
pub async fn acknowledge_changes(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<Json<AcknowledgeResponse>, ProblemDetails> {
    let cleared = state.services.agents().acknowledge(uuid).await?;
    Ok(Json(AcknowledgeResponse { cleared }))
}
