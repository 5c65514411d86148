//! Catalog and registry API handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::db::{CatalogItem, NewCatalogItem, NewRegistry, Registry};
use crate::error::ProblemDetails;
use crate::services::Caller;

use super::router::AppState;

/// POST /catalog - Add a catalog item
pub async fn add_catalog_item(
    State(state): State<AppState>,
    Json(input): Json<NewCatalogItem>,
) -> Result<(StatusCode, Json<CatalogItem>), ProblemDetails> {
    let item = state.services.catalog().add_catalog_item(input).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

/// GET /catalog/:id - Get a catalog item
pub async fn get_catalog_item(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<CatalogItem>, ProblemDetails> {
    let item = state
        .services
        .catalog()
        .get_catalog_item(id, Caller::Api)
        .await?;
    Ok(Json(item))
}

/// POST /registries - Add a registry
pub async fn add_registry(
    State(state): State<AppState>,
    Json(input): Json<NewRegistry>,
) -> Result<(StatusCode, Json<Registry>), ProblemDetails> {
    let registry = state.services.catalog().add_registry(input).await?;
    Ok((StatusCode::CREATED, Json(registry)))
}
