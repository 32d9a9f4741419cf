//! Admin surface for session inspection.
//!
//! Session keys use the `<scene_id>@<quality>` form, e.g.
//! `GET /session/42@720p/status`.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::models::SessionKey;
use crate::web::AppState;

/// `GET /sessions`
pub async fn list(State(state): State<AppState>) -> Response {
    Json(state.manager.list().await).into_response()
}

/// `GET /session/{key}/status`
pub async fn status(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    let Some(key) = SessionKey::parse(&key) else {
        return bad_key(&key);
    };
    match state.manager.status(&key).await {
        Some(status) => Json(status).into_response(),
        None => not_found(&key),
    }
}

/// `GET /session/{key}/segments`
pub async fn segments(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    let Some(key) = SessionKey::parse(&key) else {
        return bad_key(&key);
    };
    match state.manager.segments(&key).await {
        Some(segments) => Json(segments).into_response(),
        None => not_found(&key),
    }
}

fn bad_key(raw: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": format!("invalid session key '{raw}'") })),
    )
        .into_response()
}

fn not_found(key: &SessionKey) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("no session for key {key}") })),
    )
        .into_response()
}
