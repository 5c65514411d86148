//! Routes API handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::db::Route;
use crate::error::ProblemDetails;
use crate::services::{Caller, RouteRequest, RouteUpdate};

use super::router::AppState;

#[derive(Debug, Deserialize)]
pub struct RouteQuery {
    pub application: Option<String>,
}

/// POST /routes - Create a route
pub async fn create_route(
    State(state): State<AppState>,
    Json(request): Json<RouteRequest>,
) -> Result<(StatusCode, Json<Route>), ProblemDetails> {
    let route = state.services.routing().create(request, Caller::Api).await?;
    Ok((StatusCode::CREATED, Json(route)))
}

/// GET /routes - List routes, optionally of one application
pub async fn list_routes(
    State(state): State<AppState>,
    Query(query): Query<RouteQuery>,
) -> Result<Json<Vec<Route>>, ProblemDetails> {
    let routes = state
        .services
        .routing()
        .list(query.application.as_deref(), Caller::Api)
        .await?;
    Ok(Json(routes))
}

/// GET /routes/:application/:name - Get a route
pub async fn get_route(
    State(state): State<AppState>,
    Path((application, name)): Path<(String, String)>,
) -> Result<Json<Route>, ProblemDetails> {
    let route = state
        .services
        .routing()
        .get(&application, &name, Caller::Api)
        .await?;
    Ok(Json(route))
}

/// PATCH /routes/:application/:name - Rename or re-point a route
pub async fn update_route(
    State(state): State<AppState>,
    Path((application, name)): Path<(String, String)>,
    Json(update): Json<RouteUpdate>,
) -> Result<Json<Route>, ProblemDetails> {
    let route = state
        .services
        .routing()
        .update(&application, &name, update, Caller::Api)
        .await?;
    Ok(Json(route))
}

/// DELETE /routes/:application/:name - Delete a route
pub async fn delete_route(
    State(state): State<AppState>,
    Path((application, name)): Path<(String, String)>,
) -> Result<StatusCode, ProblemDetails> {
    state
        .services
        .routing()
        .delete(&application, &name, Caller::Api)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
