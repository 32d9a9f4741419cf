//! Streaming surface tests driven through the router, with a stub metadata
//! source and the scripted fake transcoder behind it.

mod common;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use scene_proxy::metadata::MetadataSource;
use scene_proxy::web::build_router;

use common::{
    StubMetadata, dummy_input, scene, test_config, test_state, test_streaming_config,
    write_fake_transcoder,
};

async fn get(app: &Router, uri: &str) -> (StatusCode, Vec<u8>, Option<String>) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec();
    (status, body, content_type)
}

struct Fixture {
    app: Router,
    _root: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let ffmpeg = write_fake_transcoder(root.path(), "fake-ffmpeg", 4, None);
    let input = dummy_input(root.path());

    let metadata: Arc<dyn MetadataSource> =
        Arc::new(StubMetadata::new().with_scene("scene-720", scene(&input, 8.0, 720)));

    let config = test_config(root.path(), test_streaming_config(&ffmpeg));
    let state = test_state(config, Some(metadata));
    Fixture {
        app: build_router(state),
        _root: root,
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let f = fixture();
    let (status, body, _) = get(&f.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["metadataConfigured"], true);
}

#[tokio::test]
async fn unknown_scene_is_404() {
    let f = fixture();
    let (status, _, _) = get(&f.app, "/stream/nope/master.m3u8?quality=480p").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_quality_is_400() {
    let f = fixture();
    let (status, _, _) = get(&f.app, "/stream/scene-720/master.m3u8?quality=4k").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn upscaling_quality_is_400() {
    let f = fixture();
    let (status, _, _) = get(&f.app, "/stream/scene-720/master.m3u8?quality=2160p").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn missing_metadata_service_is_503() {
    let root = tempfile::tempdir().unwrap();
    let ffmpeg = write_fake_transcoder(root.path(), "fake-ffmpeg", 4, None);
    let config = test_config(root.path(), test_streaming_config(&ffmpeg));
    let app = build_router(test_state(config, None));
    let (status, _, _) = get(&app, "/stream/x/master.m3u8?quality=480p").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn master_playlist_points_at_media_playlist() {
    let f = fixture();
    let (status, body, content_type) =
        get(&f.app, "/stream/scene-720/master.m3u8?quality=480p").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        content_type.as_deref(),
        Some("application/vnd.apple.mpegurl")
    );
    let text = String::from_utf8(body).unwrap();
    assert!(text.starts_with("#EXTM3U"));
    assert!(text.contains("RESOLUTION=854x480"));
    assert!(text.contains("index.m3u8?quality=480p"));
}

#[tokio::test]
async fn media_playlist_is_stable_and_complete() {
    let f = fixture();
    let (status, first, _) = get(&f.app, "/stream/scene-720/index.m3u8?quality=480p").await;
    assert_eq!(status, StatusCode::OK);
    let (_, second, _) = get(&f.app, "/stream/scene-720/index.m3u8?quality=480p").await;
    assert_eq!(first, second, "playlist bytes must be identical");

    let text = String::from_utf8(first).unwrap();
    let extinf = text.lines().filter(|l| l.starts_with("#EXTINF:")).count();
    assert_eq!(extinf, 4);
    assert!(text.contains("#EXT-X-PLAYLIST-TYPE:VOD"));
    assert!(text.contains("#EXT-X-ENDLIST"));
    assert!(text.contains("segment_000.ts?quality=480p"));
}

#[tokio::test]
async fn segments_stream_after_the_playlist_request() {
    let f = fixture();
    let (status, _, _) = get(&f.app, "/stream/scene-720/master.m3u8?quality=480p").await;
    assert_eq!(status, StatusCode::OK);

    for n in 0..4 {
        let uri = format!("/stream/scene-720/segment_{n:03}.ts?quality=480p");
        let (status, body, content_type) = get(&f.app, &uri).await;
        assert_eq!(status, StatusCode::OK, "segment {n}");
        assert_eq!(content_type.as_deref(), Some("video/mp2t"));
        assert!(!body.is_empty());
    }
}

#[tokio::test]
async fn segment_without_a_session_is_404() {
    let f = fixture();
    let (status, _, _) = get(&f.app, "/stream/scene-720/segment_000.ts?quality=720p").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_segment_name_is_400() {
    let f = fixture();
    let (status, _, _) = get(&f.app, "/stream/scene-720/foo.ts?quality=480p").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_status_reflects_progress() {
    let f = fixture();
    let (status, _, _) = get(&f.app, "/stream/scene-720/master.m3u8?quality=480p").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = get(&f.app, "/stream/scene-720/segment_003.ts?quality=480p").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body, _) = get(&f.app, "/session/scene-720@480p/status").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["state"], "active");
    assert_eq!(json["completed"], 4);
    assert_eq!(json["producedEnd"], 4);

    let (status, body, _) = get(&f.app, "/session/scene-720@480p/segments").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let entries = json.as_array().unwrap();
    assert_eq!(entries.len(), 4);
    assert!(entries.iter().all(|e| e["state"] == "completed"));

    let (status, body, _) = get(&f.app, "/sessions").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn admin_status_for_unknown_key_is_404() {
    let f = fixture();
    let (status, _, _) = get(&f.app, "/session/ghost@480p/status").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = get(&f.app, "/session/not-a-key/status").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
