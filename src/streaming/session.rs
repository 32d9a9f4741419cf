//! One transcoding session: identity, timeline bookkeeping, and state.

use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{QualityLevel, SessionKey, SessionState};
use crate::playlist;
use crate::streaming::index::SegmentIndex;
use std::sync::Arc;

#[derive(Debug)]
pub struct StreamSession {
    pub id: String,
    pub key: SessionKey,
    pub input_path: PathBuf,
    pub duration_secs: f64,
    pub segment_secs: u64,
    pub total_segments: u64,
    /// Exclusively owned output directory; removed on destroy.
    pub dir: PathBuf,
    pub index: Arc<SegmentIndex>,
    /// Built once at creation; identical bytes for every request.
    pub media_playlist: String,
    state: Mutex<SessionState>,
    /// Timeline segment the current run starts at.
    start_seg: AtomicU64,
    last_activity: Mutex<Instant>,
}

impl StreamSession {
    pub fn new(
        key: SessionKey,
        input_path: PathBuf,
        duration_secs: f64,
        segment_secs: u64,
        sessions_root: &std::path::Path,
        start_seg: u64,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let total_segments = playlist::segment_count(duration_secs, segment_secs);
        let media_playlist = playlist::media_playlist(duration_secs, segment_secs, key.quality);
        Self {
            dir: sessions_root.join(&id),
            id,
            key,
            input_path,
            duration_secs,
            segment_secs,
            total_segments,
            index: Arc::new(SegmentIndex::new(total_segments)),
            media_playlist,
            state: Mutex::new(SessionState::Starting),
            start_seg: AtomicU64::new(start_seg),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn quality(&self) -> QualityLevel {
        self.key.quality
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// Transition to `next`, logging (and refusing) invalid transitions.
    pub fn set_state(&self, next: SessionState) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == next {
            return true;
        }
        if !state.can_transition(next) {
            warn!(
                session_id = %self.id,
                from = %*state,
                to = %next,
                "refusing invalid session state transition"
            );
            debug_assert!(false, "invalid transition {} -> {}", *state, next);
            return false;
        }
        debug!(session_id = %self.id, from = %*state, to = %next, "session state");
        *state = next;
        true
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn last_activity_age(&self) -> std::time::Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    pub fn start_seg(&self) -> u64 {
        self.start_seg.load(Ordering::SeqCst)
    }

    pub fn set_start_seg(&self, seg: u64) {
        self.start_seg.store(seg, Ordering::SeqCst);
    }

    /// Start offset of the current run in seconds (segment aligned).
    pub fn start_sec(&self) -> f64 {
        (self.start_seg() * self.segment_secs) as f64
    }

    /// Exclusive end of the contiguous completed range of the current run.
    pub fn produced_end(&self) -> u64 {
        self.index.contiguous_end(self.start_seg())
    }

    pub fn segment_path(&self, n: u64) -> PathBuf {
        self.dir.join(playlist::segment_file_name(n))
    }

    /// Reuse rule: a seek to `target_seg` is served by the current run when
    /// the segment already exists, or lies within the run's producible
    /// window plus a small look-ahead grace.
    pub fn can_serve_without_restart(&self, target_seg: u64, grace_segments: u64) -> bool {
        use crate::models::SegmentState;
        if self.index.state_of(target_seg) == SegmentState::Completed {
            return true;
        }
        if !self.state().is_live() {
            return false;
        }
        target_seg >= self.start_seg()
            && target_seg <= self.produced_end().saturating_add(grace_segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QualityLevel;

    fn session(start_seg: u64) -> StreamSession {
        StreamSession::new(
            SessionKey::new("scene-1", QualityLevel::Q480),
            PathBuf::from("/media/in.mp4"),
            600.0,
            2,
            std::path::Path::new("/tmp/hls"),
            start_seg,
        )
    }

    #[test]
    fn derives_timeline_counts() {
        let s = session(0);
        assert_eq!(s.total_segments, 300);
        assert_eq!(s.start_sec(), 0.0);
        let s = session(100);
        assert_eq!(s.start_sec(), 200.0);
        assert!(s.dir.starts_with("/tmp/hls"));
    }

    #[test]
    fn invalid_transitions_are_refused() {
        let s = session(0);
        assert_eq!(s.state(), SessionState::Starting);
        assert!(s.set_state(SessionState::Active));
        assert!(s.set_state(SessionState::Stopping));
        assert!(s.set_state(SessionState::Stopped));
        // Stopped is terminal.
        assert!(!std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            s.set_state(SessionState::Active)
        }))
        .unwrap_or(false));
    }

    #[test]
    fn reuse_window_tracks_produced_range() {
        let s = session(0);
        s.set_state(SessionState::Active);
        for n in 0..5 {
            s.index.mark_completed(n);
        }
        // Completed segments always reuse, including backward seeks.
        assert!(s.can_serve_without_restart(2, 5));
        // Within produced end + grace.
        assert!(s.can_serve_without_restart(9, 5));
        // Beyond the grace window.
        assert!(!s.can_serve_without_restart(11, 5));
        // Before the run start and not completed.
        let s2 = session(100);
        s2.set_state(SessionState::Active);
        assert!(!s2.can_serve_without_restart(50, 5));
    }
}
