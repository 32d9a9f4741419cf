//! Health check endpoint.

use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::web::AppState;

/// `GET /health`: liveness plus transcoder availability as probed at
/// startup.
pub async fn health_check(State(state): State<AppState>) -> Response {
    let sessions = state.manager.list().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "startedAt": state.started_at.to_rfc3339(),
        "metadataConfigured": state.metadata.is_some(),
        "activeSessions": sessions.len(),
        "ffmpeg": {
            "command": state.ffmpeg.command,
            "available": state.ffmpeg.available,
            "version": state.ffmpeg.version,
        },
        "ffprobe": {
            "command": state.ffprobe.command,
            "available": state.ffprobe.available,
            "version": state.ffprobe.version,
        },
    }))
    .into_response()
}
