//! HTTP-facing error taxonomy (§7.1). Maps 1:1 onto the status codes in
//! §6.1/§6.2; `message` is always safe to echo, never a wrapped error's
//! `Display`.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use shepherd_k8s::TaskStoreError;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Gone(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("{0}")]
    UnsupportedMediaType(String),
    #[error("{0}")]
    BadGateway(String),
    #[error("{0}")]
    ServiceUnavailable(String),
    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    fn status_and_message(&self) -> (StatusCode, &str) {
        match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m.as_str()),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m.as_str()),
            Self::Conflict(m) => (StatusCode::CONFLICT, m.as_str()),
            Self::Gone(m) => (StatusCode::GONE, m.as_str()),
            Self::PayloadTooLarge(m) => (StatusCode::PAYLOAD_TOO_LARGE, m.as_str()),
            Self::UnsupportedMediaType(m) => (StatusCode::UNSUPPORTED_MEDIA_TYPE, m.as_str()),
            Self::BadGateway(m) => (StatusCode::BAD_GATEWAY, m.as_str()),
            Self::ServiceUnavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m.as_str()),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(detail) = &self {
            error!(detail, "internal error");
        }
        let (status, message) = self.status_and_message();
        (status, Json(ErrorBody { error: message.to_string() })).into_response()
    }
}

/// Rejects a request whose `Content-Type` isn't exactly `application/json`
/// with 415, per §4.3's JSON-only mutating-endpoint rule.
pub fn require_json_content_type(headers: &HeaderMap) -> Result<(), ApiError> {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type.split(';').next().unwrap_or_default().trim() != "application/json" {
        return Err(ApiError::UnsupportedMediaType(
            "Content-Type must be application/json".to_string(),
        ));
    }
    Ok(())
}

impl From<TaskStoreError> for ApiError {
    fn from(err: TaskStoreError) -> Self {
        match err {
            TaskStoreError::NotFound(name) => Self::NotFound(format!("task {name} not found")),
            TaskStoreError::AlreadyExists { name } => {
                Self::Conflict(format!("task {name} already exists"))
            }
            TaskStoreError::Conflict { .. } => {
                Self::Internal(err.to_string())
            }
            TaskStoreError::Backend(_) => Self::Internal(err.to_string()),
        }
    }
}
