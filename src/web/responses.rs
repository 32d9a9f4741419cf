//! Error-to-response mapping for the web layer.
//!
//! Invalid requests map to 4xx without noise in the logs; failures inside
//! the core map to 5xx and are logged where they happen. Path translation
//! misses are the one 4xx logged at warn, since they point at a
//! misconfigured mapping table rather than a misbehaving client.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::warn;

use crate::errors::{ProxyError, StreamError};

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        let status = match &self {
            StreamError::SceneNotFound { .. } => StatusCode::NOT_FOUND,
            StreamError::QualityNotAllowed { .. } => StatusCode::BAD_REQUEST,
            StreamError::InvalidSegment { .. } => StatusCode::BAD_REQUEST,
            StreamError::MetadataUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            StreamError::PathNotMapped { path } => {
                warn!("no path mapping for upstream path: {path}");
                StatusCode::NOT_FOUND
            }
            StreamError::StartupFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            StreamError::RunnerFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            StreamError::WaitTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
            StreamError::SessionGone => StatusCode::SERVICE_UNAVAILABLE,
            StreamError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            StreamError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StreamError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyError::VariantNotFound { .. } => StatusCode::NOT_FOUND,
            ProxyError::SegmentNotFound { .. } => StatusCode::NOT_FOUND,
            ProxyError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Manifest { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Request(_) => StatusCode::BAD_GATEWAY,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
