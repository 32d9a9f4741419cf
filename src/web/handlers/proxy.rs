//! Variant passthrough surface.
//!
//! Serves rewritten upstream manifests and forwards segment bytes without
//! re-encoding. Range requests are passed through when the client sends
//! them.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::errors::StreamError;
use crate::playlist::parse_segment_file_name;
use crate::web::AppState;
use crate::web::handlers::{MPEGTS_CONTENT_TYPE, MPEGURL_CONTENT_TYPE};

/// `GET /proxy/{scene_id}/{variant}/index.m3u8`
pub async fn playlist(
    State(state): State<AppState>,
    Path((scene_id, variant)): Path<(String, String)>,
) -> Response {
    let scene = match super::stream::resolve_scene(&state, &scene_id).await {
        Ok(scene) => scene,
        Err(e) => return e.into_response(),
    };

    match state
        .variant_proxy
        .playlist(&scene, &scene_id, &variant)
        .await
    {
        Ok(playlist) => {
            ([(header::CONTENT_TYPE, MPEGURL_CONTENT_TYPE)], playlist).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// `GET /proxy/{scene_id}/{variant}/segment_{n}.ts`
pub async fn segment(
    State(state): State<AppState>,
    Path((scene_id, variant, segment_name)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Response {
    let Some(n) = parse_segment_file_name(&segment_name) else {
        return StreamError::InvalidSegment { name: segment_name }.into_response();
    };

    let scene = match super::stream::resolve_scene(&state, &scene_id).await {
        Ok(scene) => scene,
        Err(e) => return e.into_response(),
    };

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());

    match state
        .variant_proxy
        .segment(&scene, &scene_id, &variant, n, range)
        .await
    {
        Ok(proxied) => {
            let status = if proxied.partial {
                StatusCode::PARTIAL_CONTENT
            } else {
                StatusCode::OK
            };
            let mut response = Response::builder().status(status).header(
                header::CONTENT_TYPE,
                proxied
                    .content_type
                    .unwrap_or_else(|| MPEGTS_CONTENT_TYPE.to_string()),
            );
            if let Some(len) = proxied.content_length {
                response = response.header(header::CONTENT_LENGTH, len);
            }
            response
                .body(Body::from_stream(proxied.body))
                .unwrap_or_else(|e| {
                    StreamError::internal(e.to_string()).into_response()
                })
        }
        Err(e) => e.into_response(),
    }
}
