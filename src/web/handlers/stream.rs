//! Streaming surface: master playlist, media playlist, and segments.
//!
//! The master playlist request is what creates (or reuses) a session; the
//! segment handler only looks sessions up, so an isolated segment request
//! after teardown answers 404 and the player falls back to re-requesting
//! the playlist.

use std::path::PathBuf;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::errors::StreamError;
use crate::models::{QualityLevel, SceneSource, SessionKey};
use crate::playlist;
use crate::streaming::WaitOutcome;
use crate::streaming::manager::SessionEntry;
use crate::web::AppState;
use crate::web::handlers::{MPEGTS_CONTENT_TYPE, MPEGURL_CONTENT_TYPE};

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub quality: Option<String>,
    pub start: Option<f64>,
}

/// `GET /stream/{scene_id}/master.m3u8?quality=Q[&start=T]`
pub async fn master_playlist(
    State(state): State<AppState>,
    Path(scene_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, StreamError> {
    let scene = resolve_scene(&state, &scene_id).await?;
    let facts = scene_facts(&state, &scene).await?;
    let quality = parse_quality(&query, facts.height)?;
    let start_sec = query.start.unwrap_or(0.0);

    // A matching pre-generated variant bypasses the transcoding path.
    if use_variant(&scene, quality) {
        let master = variant_master(&scene_id, quality, &scene);
        return Ok(playlist_response(master));
    }

    let entry = ensure_session(&state, &scene_id, quality, start_sec, &facts).await?;
    entry.session.touch();

    let master = playlist::master_playlist(quality, facts.width, facts.height, start_sec);
    Ok(playlist_response(master))
}

/// `GET /stream/{scene_id}/index.m3u8?quality=Q[&start=T]`
pub async fn media_playlist(
    State(state): State<AppState>,
    Path(scene_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, StreamError> {
    let scene = resolve_scene(&state, &scene_id).await?;
    let facts = scene_facts(&state, &scene).await?;
    let quality = parse_quality(&query, facts.height)?;

    if use_variant(&scene, quality) {
        return match state
            .variant_proxy
            .playlist(&scene, &scene_id, quality.as_str())
            .await
        {
            Ok(playlist) => Ok(playlist_response(playlist)),
            Err(e) => Ok(e.into_response()),
        };
    }

    let entry = ensure_session(
        &state,
        &scene_id,
        quality,
        query.start.unwrap_or(0.0),
        &facts,
    )
    .await?;
    entry.session.touch();
    Ok(playlist_response(entry.session.media_playlist.clone()))
}

/// `GET /stream/{scene_id}/segment_{n}.ts?quality=Q`
pub async fn segment(
    State(state): State<AppState>,
    Path((scene_id, segment_name)): Path<(String, String)>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, StreamError> {
    let n = playlist::parse_segment_file_name(&segment_name).ok_or_else(|| {
        StreamError::InvalidSegment {
            name: segment_name.clone(),
        }
    })?;
    let quality = parse_quality_lookup(&query)?;
    let key = SessionKey::new(scene_id, quality);

    let entry = state
        .manager
        .lookup(&key)
        .await
        .ok_or_else(|| StreamError::SessionNotFound {
            key: key.to_string(),
        })?;

    entry.session.touch();
    entry.session.index.note_requested(n);

    let timeout = state.manager.streaming_config().segment_wait_timeout();
    match entry.session.index.wait_for(n, timeout).await {
        WaitOutcome::Completed => serve_segment_file(&entry, n).await,
        WaitOutcome::Failed(reason) => Err(StreamError::runner_failed(reason)),
        WaitOutcome::Timeout => Err(StreamError::WaitTimeout { segment: n }),
        WaitOutcome::SessionGone => Err(StreamError::SessionGone),
    }
}

/// Stream a finalized segment file; response body I/O happens outside any
/// session lock.
async fn serve_segment_file(entry: &SessionEntry, n: u64) -> Result<Response, StreamError> {
    let path = entry.session.segment_path(n);
    // The index says completed, so a missing file means the session was
    // torn down between the wait and the open.
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| StreamError::SessionGone)?;
    let len = file.metadata().await.map(|m| m.len()).ok();

    let mut response = Response::builder()
        .header(header::CONTENT_TYPE, MPEGTS_CONTENT_TYPE);
    if let Some(len) = len {
        response = response.header(header::CONTENT_LENGTH, len);
    }
    response
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| StreamError::internal(e.to_string()))
}

pub(super) async fn resolve_scene(
    state: &AppState,
    scene_id: &str,
) -> Result<SceneSource, StreamError> {
    let metadata = state
        .metadata
        .as_ref()
        .ok_or_else(|| StreamError::MetadataUnavailable {
            message: "metadata service not configured".to_string(),
        })?;
    Ok(metadata.resolve_scene(scene_id).await?)
}

/// Duration and dimensions for a scene, falling back to a local probe when
/// the metadata service left gaps.
pub(super) struct SceneFacts {
    pub duration_secs: f64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub input_path: PathBuf,
}

pub(super) async fn scene_facts(
    state: &AppState,
    scene: &SceneSource,
) -> Result<SceneFacts, StreamError> {
    let input_path = state.path_mapper.translate(&scene.path)?;
    let mut facts = SceneFacts {
        duration_secs: scene.duration_secs,
        width: scene.source_width,
        height: scene.source_height,
        input_path,
    };

    if (facts.duration_secs <= 0.0 || facts.height.is_none())
        && let Some(prober) = &state.prober
        && let Ok(probed) = prober.probe(&facts.input_path).await
    {
        if facts.duration_secs <= 0.0 {
            facts.duration_secs = probed.duration_secs.unwrap_or(0.0);
        }
        if facts.height.is_none() {
            facts.width = probed.width;
            facts.height = probed.height;
        }
    }

    Ok(facts)
}

fn parse_quality(query: &StreamQuery, source_height: Option<u32>) -> Result<QualityLevel, StreamError> {
    let quality = parse_quality_lookup(query)?;
    if !quality.eligible_for(source_height) {
        return Err(StreamError::quality_not_allowed(
            quality.as_str(),
            "preset exceeds source resolution",
        ));
    }
    Ok(quality)
}

fn parse_quality_lookup(query: &StreamQuery) -> Result<QualityLevel, StreamError> {
    let raw = query.quality.as_deref().unwrap_or("direct");
    raw.parse()
        .map_err(|_| StreamError::quality_not_allowed(raw, "unknown quality level"))
}

fn use_variant(scene: &SceneSource, quality: QualityLevel) -> bool {
    scene.is_streamable && scene.variant(quality.as_str()).is_some()
}

/// Master playlist pointing at the proxy surface instead of a session.
fn variant_master(scene_id: &str, quality: QualityLevel, scene: &SceneSource) -> String {
    use std::fmt::Write as FmtWrite;
    let mut m3u8 = String::with_capacity(192);
    writeln!(m3u8, "#EXTM3U").unwrap();
    writeln!(m3u8, "#EXT-X-VERSION:3").unwrap();
    let mut attrs = String::from("BANDWIDTH=20000000");
    if let Some(preset) = quality.preset() {
        attrs = format!(
            "BANDWIDTH={},RESOLUTION={}x{}",
            u64::from(preset.video_bitrate_kbps + preset.audio_bitrate_kbps) * 1000,
            preset.width,
            preset.height
        );
    } else if let (Some(w), Some(h)) = (scene.source_width, scene.source_height) {
        attrs.push_str(&format!(",RESOLUTION={w}x{h}"));
    }
    writeln!(m3u8, "#EXT-X-STREAM-INF:{attrs}").unwrap();
    writeln!(
        m3u8,
        "/proxy/{}/{}/index.m3u8",
        urlencoding::encode(scene_id),
        quality
    )
    .unwrap();
    m3u8
}

async fn ensure_session(
    state: &AppState,
    scene_id: &str,
    quality: QualityLevel,
    start_sec: f64,
    facts: &SceneFacts,
) -> Result<SessionEntry, StreamError> {
    let key = SessionKey::new(scene_id, quality);
    state
        .manager
        .get_or_create(
            key,
            start_sec,
            facts.input_path.clone(),
            facts.duration_secs,
        )
        .await
}

fn playlist_response(playlist: String) -> Response {
    ([(header::CONTENT_TYPE, MPEGURL_CONTENT_TYPE)], playlist).into_response()
}
