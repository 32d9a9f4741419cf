//! End-to-end session lifecycle tests against a scripted fake transcoder:
//! cold start, reuse, far seeks, idle teardown, concurrent creation, and
//! crash handling.

mod common;

use std::time::Duration;

use scene_proxy::models::{QualityLevel, SessionKey, SessionState};
use scene_proxy::streaming::{SessionManager, WaitOutcome};

use common::{dummy_input, test_streaming_config, write_broken_transcoder, write_fake_transcoder};

fn key(scene: &str) -> SessionKey {
    SessionKey::new(scene, QualityLevel::Q480)
}

fn run_dir_count(session_dir: &std::path::Path) -> usize {
    std::fs::read_dir(session_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("run_"))
        .count()
}

#[tokio::test]
async fn cold_start_serves_every_segment_of_a_small_file() {
    let root = tempfile::tempdir().unwrap();
    let ffmpeg = write_fake_transcoder(root.path(), "fake-ffmpeg", 4, None);
    let manager =
        SessionManager::with_settings(test_streaming_config(&ffmpeg), root.path().join("hls"));
    let input = dummy_input(root.path());

    let entry = manager
        .get_or_create(key("scene-a"), 0.0, input, 8.0)
        .await
        .expect("session should start");

    assert_eq!(entry.session.state(), SessionState::Active);
    assert_eq!(entry.session.total_segments, 4);

    for n in 0..4 {
        entry.session.index.note_requested(n);
        assert_eq!(
            entry.session.index.wait_for(n, Duration::from_secs(5)).await,
            WaitOutcome::Completed,
            "segment {n} should complete"
        );
        let path = entry.session.segment_path(n);
        let len = std::fs::metadata(&path).expect("segment file exists").len();
        assert!(len > 0, "segment {n} should be non-empty");
    }

    assert_eq!(entry.session.produced_end(), 4);
    manager.destroy_all().await;
}

#[tokio::test]
async fn repeat_requests_reuse_the_session_without_a_new_runner() {
    let root = tempfile::tempdir().unwrap();
    let ffmpeg = write_fake_transcoder(root.path(), "fake-ffmpeg", 4, None);
    let manager =
        SessionManager::with_settings(test_streaming_config(&ffmpeg), root.path().join("hls"));
    let input = dummy_input(root.path());

    let first = manager
        .get_or_create(key("scene-a"), 0.0, input.clone(), 8.0)
        .await
        .unwrap();
    first
        .session
        .index
        .wait_for(2, Duration::from_secs(5))
        .await;

    // A seek back into already-produced territory rides the same runner.
    let again = manager
        .get_or_create(key("scene-a"), 4.0, input, 8.0)
        .await
        .unwrap();

    assert_eq!(first.session.id, again.session.id);
    assert_eq!(run_dir_count(&first.session.dir), 1);
    manager.destroy_all().await;
}

#[tokio::test]
async fn far_seek_restarts_once_and_keeps_earlier_segments() {
    let root = tempfile::tempdir().unwrap();
    let ffmpeg = write_fake_transcoder(root.path(), "fake-ffmpeg", 4, None);
    let manager =
        SessionManager::with_settings(test_streaming_config(&ffmpeg), root.path().join("hls"));
    let input = dummy_input(root.path());

    let entry = manager
        .get_or_create(key("scene-long"), 0.0, input.clone(), 600.0)
        .await
        .unwrap();
    entry.session.index.note_requested(0);
    assert_eq!(
        entry.session.index.wait_for(0, Duration::from_secs(5)).await,
        WaitOutcome::Completed
    );

    // Seek to 400s: segment 200, far outside the producible window.
    let seeked = manager
        .get_or_create(key("scene-long"), 400.0, input, 600.0)
        .await
        .expect("seek restart should succeed");

    assert_eq!(seeked.session.id, entry.session.id);
    assert_eq!(seeked.session.state(), SessionState::Active);
    assert_eq!(seeked.session.start_seg(), 200);
    assert_eq!(run_dir_count(&entry.session.dir), 2);

    seeked.session.index.note_requested(200);
    assert_eq!(
        seeked
            .session
            .index
            .wait_for(200, Duration::from_secs(5))
            .await,
        WaitOutcome::Completed
    );
    assert!(seeked.session.segment_path(200).exists());
    // Segments from the first run stay on disk with their timeline names.
    assert!(entry.session.segment_path(0).exists());

    manager.destroy_all().await;
}

#[tokio::test]
async fn idle_sessions_are_swept_away() {
    let root = tempfile::tempdir().unwrap();
    let ffmpeg = write_fake_transcoder(root.path(), "fake-ffmpeg", 4, None);
    let manager =
        SessionManager::with_settings(test_streaming_config(&ffmpeg), root.path().join("hls"));
    let input = dummy_input(root.path());

    let entry = manager
        .get_or_create(key("scene-a"), 0.0, input, 8.0)
        .await
        .unwrap();
    let session_dir = entry.session.dir.clone();
    assert!(session_dir.exists());
    drop(entry);

    // Idle timeout is 1s in the test config.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    manager.sweep().await;

    assert!(manager.lookup(&key("scene-a")).await.is_none());
    assert!(!session_dir.exists(), "session dir should be removed");
}

#[tokio::test]
async fn concurrent_requests_start_exactly_one_runner() {
    let root = tempfile::tempdir().unwrap();
    let ffmpeg = write_fake_transcoder(root.path(), "fake-ffmpeg", 4, None);
    let manager =
        SessionManager::with_settings(test_streaming_config(&ffmpeg), root.path().join("hls"));
    let input = dummy_input(root.path());

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let manager = manager.clone();
            let input = input.clone();
            tokio::spawn(async move {
                manager
                    .get_or_create(key("scene-burst"), 0.0, input, 8.0)
                    .await
            })
        })
        .collect();

    let mut ids = Vec::new();
    let mut playlists = Vec::new();
    for task in tasks {
        let entry = task.await.unwrap().expect("all concurrent requests succeed");
        ids.push(entry.session.id.clone());
        playlists.push(entry.session.media_playlist.clone());
    }

    ids.dedup();
    assert_eq!(ids.len(), 1, "all requests should share one session");
    assert!(playlists.windows(2).all(|w| w[0] == w[1]));

    let entry = manager.lookup(&key("scene-burst")).await.unwrap();
    assert_eq!(run_dir_count(&entry.session.dir), 1);
    manager.destroy_all().await;
}

#[tokio::test]
async fn runner_crash_fails_waiters_and_frees_the_key() {
    let root = tempfile::tempdir().unwrap();
    // Emits segment 0, then exits with a non-zero code.
    let ffmpeg = write_fake_transcoder(root.path(), "fake-ffmpeg", 4, Some(0));
    let manager =
        SessionManager::with_settings(test_streaming_config(&ffmpeg), root.path().join("hls"));
    let input = dummy_input(root.path());

    let entry = manager
        .get_or_create(key("scene-crash"), 0.0, input.clone(), 8.0)
        .await
        .expect("startup succeeds on the strength of segment 0");

    entry.session.index.note_requested(0);
    assert_eq!(
        entry.session.index.wait_for(0, Duration::from_secs(5)).await,
        WaitOutcome::Completed
    );

    entry.session.index.note_requested(1);
    match entry.session.index.wait_for(1, Duration::from_secs(4)).await {
        WaitOutcome::Failed(reason) => {
            assert!(reason.contains("exited"), "unexpected reason: {reason}")
        }
        WaitOutcome::SessionGone => {}
        other => panic!("expected terminal failure for segment 1, got {other:?}"),
    }

    manager.sweep().await;
    assert!(manager.lookup(&key("scene-crash")).await.is_none());

    // The next request starts a fresh session.
    let fresh = manager
        .get_or_create(key("scene-crash"), 0.0, input, 8.0)
        .await
        .expect("recreation after crash");
    assert_ne!(fresh.session.id, entry.session.id);
    manager.destroy_all().await;
}

#[tokio::test]
async fn startup_failure_leaves_no_registry_entry() {
    let root = tempfile::tempdir().unwrap();
    let ffmpeg = write_broken_transcoder(root.path(), "broken-ffmpeg");
    let manager =
        SessionManager::with_settings(test_streaming_config(&ffmpeg), root.path().join("hls"));
    let input = dummy_input(root.path());

    let err = manager
        .get_or_create(key("scene-a"), 0.0, input.clone(), 8.0)
        .await
        .expect_err("broken transcoder cannot start a session");
    assert!(err.to_string().contains("startup") || err.to_string().contains("exited"));
    assert!(manager.lookup(&key("scene-a")).await.is_none());

    // The failure is not sticky.
    assert!(
        manager
            .get_or_create(key("scene-a"), 0.0, input, 8.0)
            .await
            .is_err()
    );
    assert!(manager.lookup(&key("scene-a")).await.is_none());
}

#[tokio::test]
async fn stop_is_idempotent_and_teardown_cancels_waiters() {
    let root = tempfile::tempdir().unwrap();
    let ffmpeg = write_fake_transcoder(root.path(), "fake-ffmpeg", 4, None);
    let manager =
        SessionManager::with_settings(test_streaming_config(&ffmpeg), root.path().join("hls"));
    let input = dummy_input(root.path());

    let entry = manager
        .get_or_create(key("scene-long"), 0.0, input, 600.0)
        .await
        .unwrap();

    // Segment 50 is far beyond what the fake transcoder emits.
    let index = entry.session.index.clone();
    let waiter =
        tokio::spawn(async move { index.wait_for(50, Duration::from_secs(10)).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    manager.destroy(&key("scene-long")).await;
    assert_eq!(waiter.await.unwrap(), WaitOutcome::SessionGone);
    assert_eq!(entry.session.state(), SessionState::Stopped);

    // A second stop finds the same terminal state.
    entry.supervisor.stop().await;
    assert_eq!(entry.session.state(), SessionState::Stopped);
}

#[tokio::test]
async fn session_cap_evicts_least_recently_used() {
    let root = tempfile::tempdir().unwrap();
    let ffmpeg = write_fake_transcoder(root.path(), "fake-ffmpeg", 4, None);
    let mut streaming = test_streaming_config(&ffmpeg);
    streaming.max_concurrent_sessions = Some(2);
    let manager = SessionManager::with_settings(streaming, root.path().join("hls"));
    let input = dummy_input(root.path());

    let a = manager
        .get_or_create(key("scene-a"), 0.0, input.clone(), 8.0)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _b = manager
        .get_or_create(key("scene-b"), 0.0, input.clone(), 8.0)
        .await
        .unwrap();
    // scene-a is now least recently used; creating a third evicts it.
    let _c = manager
        .get_or_create(key("scene-c"), 0.0, input, 8.0)
        .await
        .unwrap();

    assert!(manager.lookup(&key("scene-a")).await.is_none());
    assert!(manager.lookup(&key("scene-b")).await.is_some());
    assert!(manager.lookup(&key("scene-c")).await.is_some());
    assert_eq!(a.session.state(), SessionState::Stopped);
    manager.destroy_all().await;
}
