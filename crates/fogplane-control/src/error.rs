//! Domain errors and their RFC 9457 Problem Details rendering.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::db::StoreError;

/// Errors returned by orchestration operations.
///
/// Any of these aborts the enclosing transaction.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Input is well-formed but inconsistent with current state.
    #[error("{0}")]
    Validation(String),

    /// A referenced entity does not exist (or is hidden from the caller).
    #[error("{0}")]
    NotFound(String),

    /// A uniqueness rule was violated.
    #[error("{0}")]
    DuplicateProperty(String),

    /// A single field holds a value outside its allowed shape.
    #[error("{0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Store(StoreError),
}

impl ControlError {
    pub fn validation(detail: impl Into<String>) -> Self {
        Self::Validation(detail.into())
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::NotFound(detail.into())
    }

    pub fn duplicate(detail: impl Into<String>) -> Self {
        Self::DuplicateProperty(detail.into())
    }

    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Self::InvalidArgument(detail.into())
    }
}

impl From<StoreError> for ControlError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UniqueViolation(constraint) => {
                Self::DuplicateProperty(format!("duplicate value violates {constraint}"))
            }
            other => Self::Store(other),
        }
    }
}

pub type ControlResult<T> = Result<T, ControlError>;

/// RFC 9457 Problem Details response.
#[derive(Debug, Clone, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub error_type: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl ProblemDetails {
    fn new(kind: &str, title: &str, status: u16, detail: Option<String>) -> Self {
        Self {
            error_type: format!("urn:fogplane:error:{kind}"),
            title: title.into(),
            status,
            detail,
            instance: None,
        }
    }

    /// Create a 404 Not Found error.
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new("not-found", "Not Found", 404, Some(detail.into()))
    }

    /// Create a 400 Bad Request error for state validation failures.
    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new("validation", "Validation Failed", 400, Some(detail.into()))
    }

    /// Create a 400 Bad Request error for a malformed argument.
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new("bad-request", "Bad Request", 400, Some(detail.into()))
    }

    /// Create a 409 Conflict error.
    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new("conflict", "Conflict", 409, Some(detail.into()))
    }

    /// Create a 500 Internal Server Error.
    pub fn internal_error() -> Self {
        Self::new("internal-error", "Internal Server Error", 500, None)
    }

    /// Create a 503 Service Unavailable error.
    pub fn service_unavailable(detail: impl Into<String>) -> Self {
        Self::new(
            "service-unavailable",
            "Service Unavailable",
            503,
            Some(detail.into()),
        )
    }
}

impl IntoResponse for ProblemDetails {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = Json(&self).into_response();
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

/// Convert domain errors to ProblemDetails.
impl From<ControlError> for ProblemDetails {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::Validation(detail) => Self::validation(detail),
            ControlError::InvalidArgument(detail) => Self::bad_request(detail),
            ControlError::NotFound(detail) => Self::not_found(detail),
            ControlError::DuplicateProperty(detail) => Self::conflict(detail),
            ControlError::Store(e) => {
                tracing::error!(error = %e, "store error");
                Self::internal_error()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_becomes_duplicate_property() {
        let err: ControlError = StoreError::UniqueViolation("routes_source_dest_key".into()).into();
        assert!(matches!(err, ControlError::DuplicateProperty(_)));
        assert_eq!(ProblemDetails::from(err).status, 409);
    }

    #[test]
    fn store_failures_hide_detail() {
        let err = ControlError::Store(StoreError::Corrupt("bad flag".into()));
        let problem = ProblemDetails::from(err);
        assert_eq!(problem.status, 500);
        assert!(problem.detail.is_none());
    }

    #[test]
    fn problem_response_uses_problem_json() {
        let response = ProblemDetails::validation("port 80 is taken").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }
}
