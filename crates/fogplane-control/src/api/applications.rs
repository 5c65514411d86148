//! Applications API handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::db::{Application, ApplicationPatch};
use crate::error::ProblemDetails;
use crate::services::{ApplicationManifest, ApplicationView, Caller};

use super::router::AppState;

/// POST /applications - Create an application from a manifest
pub async fn create_application(
    State(state): State<AppState>,
    Json(manifest): Json<ApplicationManifest>,
) -> Result<(StatusCode, Json<ApplicationView>), ProblemDetails> {
    let view = state
        .services
        .applications()
        .create(manifest, Caller::Api)
        .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// GET /applications - List applications
pub async fn list_applications(
    State(state): State<AppState>,
) -> Result<Json<Vec<Application>>, ProblemDetails> {
    let applications = state.services.applications().list(Caller::Api).await?;
    Ok(Json(applications))
}

/// GET /applications/:name - Get an application with its microservices and routes
pub async fn get_application(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ApplicationView>, ProblemDetails> {
    let view = state.services.applications().get(&name, Caller::Api).await?;
    Ok(Json(view))
}

/// PUT /applications/:name - Reconcile an application with a manifest
pub async fn update_application(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(manifest): Json<ApplicationManifest>,
) -> Result<Json<ApplicationView>, ProblemDetails> {
    let view = state
        .services
        .applications()
        .update(&name, manifest, Caller::Api)
        .await?;
    Ok(Json(view))
}

/// PATCH /applications/:name - Update description or activation
pub async fn patch_application(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(patch): Json<ApplicationPatch>,
) -> Result<Json<Application>, ProblemDetails> {
    let application = state
        .services
        .applications()
        .patch(&name, patch, Caller::Api)
        .await?;
    Ok(Json(application))
}

/// DELETE /applications/:name - Delete an application and everything in it
pub async fn delete_application(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ProblemDetails> {
    state
        .services
        .applications()
        .delete(&name, Caller::Api)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
