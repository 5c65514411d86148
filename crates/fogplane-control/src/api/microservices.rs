//! Microservices API handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use crate::error::ProblemDetails;
use crate::services::{
    Caller, CreatedMicroservice, MicroserviceQuery, MicroserviceRequest, MicroserviceView,
    StatusReport,
};

use super::router::AppState;

/// POST /microservices - Create a microservice
pub async fn create_microservice(
    State(state): State<AppState>,
    Json(request): Json<MicroserviceRequest>,
) -> Result<(StatusCode, Json<CreatedMicroservice>), ProblemDetails> {
    let created = state
        .services
        .microservices()
        .create(request, Caller::Api)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /microservices - List microservices, optionally by application or agent
pub async fn list_microservices(
    State(state): State<AppState>,
    Query(query): Query<MicroserviceQuery>,
) -> Result<Json<Vec<MicroserviceView>>, ProblemDetails> {
    let views = state
        .services
        .microservices()
        .list(&query, Caller::Api)
        .await?;
    Ok(Json(views))
}

/// GET /microservices/:uuid - Get a microservice
pub async fn get_microservice(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<Json<MicroserviceView>, ProblemDetails> {
    let view = state.services.microservices().get(uuid, Caller::Api).await?;
    Ok(Json(view))
}

/// PATCH /microservices/:uuid - Update a microservice
pub async fn update_microservice(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
    Json(request): Json<MicroserviceRequest>,
) -> Result<Json<MicroserviceView>, ProblemDetails> {
    let microservices = state.services.microservices();
    microservices.update(uuid, request, Caller::Api).await?;
    let view = microservices.get(uuid, Caller::Api).await?;
    Ok(Json(view))
}

/// DELETE /microservices/:uuid - Delete a microservice
pub async fn delete_microservice(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<StatusCode, ProblemDetails> {
    state
        .services
        .microservices()
        .delete(uuid, Caller::Api)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /microservices/:uuid/receivers - Microservices receiving its published tags
pub async fn list_receivers(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<Json<Vec<Uuid>>, ProblemDetails> {
    let receivers = state
        .services
        .microservices()
        .receivers(uuid, Caller::Api)
        .await?;
    Ok(Json(receivers))
}

/// PUT /microservices/:uuid/status - Ingest an agent status report
pub async fn report_status(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
    Json(report): Json<StatusReport>,
) -> Result<StatusCode, ProblemDetails> {
    state
        .services
        .microservices()
        .report_status(uuid, report)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
