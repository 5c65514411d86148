//! Audit events API handler.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;

use crate::db::AuditEvent;
use crate::error::ProblemDetails;

use super::router::AppState;

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<i64>,
}

/// GET /events - Most recent audit events first
pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<AuditEvent>>, ProblemDetails> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(ProblemDetails::bad_request(format!(
            "limit must be between 1 and {MAX_LIMIT}"
        )));
    }
    let events = state.services.events().recent(limit).await?;
    Ok(Json(events))
}
