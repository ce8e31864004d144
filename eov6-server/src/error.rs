use axum::http::StatusCode;
use eov6_core::models::SessionRejection;
use eov6_core::{BlobError, StoreError};
use serde::Serialize;
use thiserror::Error;

/// Handler-boundary error. Each variant maps to one status and one stable
/// machine code; internal detail is logged, never returned.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(&'static str),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("{0}")]
    Session(SessionRejection),

    #[error("preview limit reached ({count}/{limit})")]
    PreviewLimit { count: i32, limit: i32 },

    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Standard HTTP error body: `{"error": "<code>"}`
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Session(SessionRejection::NotFound) => StatusCode::NOT_FOUND,
            ApiError::Session(SessionRejection::Expired) => StatusCode::GONE,
            ApiError::Session(SessionRejection::Closed)
            | ApiError::Session(SessionRejection::AlreadyJoined) => StatusCode::CONFLICT,
            ApiError::PreviewLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(code) => code,
            ApiError::Unauthorized => "unauthorized",
            ApiError::Forbidden => "forbidden",
            ApiError::Session(r) => r.code(),
            ApiError::PreviewLimit { .. } => "preview_limit_reached",
            ApiError::Upstream(_) => "upstream_unavailable",
            ApiError::Internal(_) => "internal_error",
        }
    }

    /// Status and JSON body, logging server-side failures.
    pub fn into_parts(self) -> (StatusCode, serde_json::Value) {
        let status = self.status();
        match &self {
            ApiError::Upstream(detail) => tracing::warn!(error = %detail, "Upstream call failed"),
            ApiError::Internal(detail) => tracing::error!(error = %detail, "Request failed"),
            _ => {}
        }

        let mut body = serde_json::json!({ "error": self.code() });
        if let ApiError::PreviewLimit { count, limit } = self {
            body["usage"] = serde_json::json!({
                "previewCount": count,
                "limit": limit,
                "remaining": 0,
            });
        }
        (status, body)
    }
}

impl From<SessionRejection> for ApiError {
    fn from(r: SessionRejection) -> Self {
        ApiError::Session(r)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Rejected(r) => ApiError::Session(r),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<BlobError> for ApiError {
    fn from(e: BlobError) -> Self {
        match e {
            BlobError::InvalidKey(_) => ApiError::BadRequest("invalid_upload_name"),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
