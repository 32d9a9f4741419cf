//! Per-session segment state index.
//!
//! A concurrent map from timeline-absolute segment number to state, plus a
//! broadcast channel that wakes segment waiters. Waiters subscribe before
//! re-checking state, so a state change between check and wait cannot be
//! lost. Every transition into a terminal state broadcasts exactly once.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::models::{SegmentEntry, SegmentState};

/// Outcome of waiting for a segment to reach a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Completed,
    Failed(String),
    Timeout,
    /// The owning session was torn down while the request was waiting.
    SessionGone,
}

#[derive(Debug, Clone)]
enum IndexEvent {
    Terminal(u64),
    Closed,
}

#[derive(Debug, Clone)]
pub struct SegmentRecord {
    pub state: SegmentState,
    pub started_at: Option<Instant>,
    pub completed_at: Option<Instant>,
    pub retries: u32,
    pub last_error: Option<String>,
    /// Set when the first waiter arrives; drives the stall policy.
    pub requested_at: Option<Instant>,
}

impl Default for SegmentRecord {
    fn default() -> Self {
        Self {
            state: SegmentState::Waiting,
            started_at: None,
            completed_at: None,
            retries: 0,
            last_error: None,
            requested_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IndexSnapshot {
    pub completed: u64,
    pub transcoding: u64,
    pub failed: u64,
    pub waiting: u64,
}

#[derive(Debug)]
struct IndexInner {
    segments: HashMap<u64, SegmentRecord>,
    closed: bool,
}

#[derive(Debug)]
pub struct SegmentIndex {
    inner: Mutex<IndexInner>,
    events: broadcast::Sender<IndexEvent>,
    total_segments: u64,
}

impl SegmentIndex {
    pub fn new(total_segments: u64) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(IndexInner {
                segments: HashMap::new(),
                closed: false,
            }),
            events,
            total_segments,
        }
    }

    pub fn total_segments(&self) -> u64 {
        self.total_segments
    }

    pub fn get(&self, n: u64) -> Option<SegmentRecord> {
        self.inner.lock().unwrap().segments.get(&n).cloned()
    }

    pub fn state_of(&self, n: u64) -> SegmentState {
        self.inner
            .lock()
            .unwrap()
            .segments
            .get(&n)
            .map(|r| r.state)
            .unwrap_or(SegmentState::Waiting)
    }

    /// Record that a waiter asked for this segment. First request wins; the
    /// stall sweep measures from that point.
    pub fn note_requested(&self, n: u64) {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.segments.entry(n).or_default();
        if !record.state.is_terminal() && record.requested_at.is_none() {
            record.requested_at = Some(Instant::now());
        }
    }

    /// Mark a segment as being produced. Completed/failed segments are left
    /// untouched.
    pub fn mark_transcoding(&self, n: u64) {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.segments.entry(n).or_default();
        if record.state == SegmentState::Waiting {
            record.state = SegmentState::Transcoding;
            record.started_at = Some(Instant::now());
        }
    }

    /// Mark a segment completed and wake its waiters. Idempotent.
    pub fn mark_completed(&self, n: u64) {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.segments.entry(n).or_default();
        if record.state == SegmentState::Completed {
            return;
        }
        record.state = SegmentState::Completed;
        record.completed_at = Some(Instant::now());
        record.last_error = None;
        drop(inner);
        let _ = self.events.send(IndexEvent::Terminal(n));
    }

    /// Mark a segment failed and wake its waiters. A completed segment stays
    /// completed.
    pub fn mark_failed(&self, n: u64, error: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.segments.entry(n).or_default();
        if record.state.is_terminal() {
            return;
        }
        record.state = SegmentState::Failed;
        record.last_error = Some(error.into());
        drop(inner);
        let _ = self.events.send(IndexEvent::Terminal(n));
    }

    /// Put a segment back to `Waiting` for a retry and return the new retry
    /// count. The stall timer restarts from now.
    pub fn begin_retry(&self, n: u64) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        let record = inner.segments.entry(n).or_default();
        record.retries += 1;
        record.state = SegmentState::Waiting;
        record.started_at = None;
        record.last_error = None;
        record.requested_at = Some(Instant::now());
        record.retries
    }

    /// Reset all in-flight (non-terminal) segments to `Waiting`. Used across
    /// a runner restart; completed segments in other timeline regions keep
    /// their state.
    pub fn reset_in_flight(&self) {
        let mut inner = self.inner.lock().unwrap();
        for record in inner.segments.values_mut() {
            if record.state == SegmentState::Transcoding {
                record.state = SegmentState::Waiting;
                record.started_at = None;
            }
        }
    }

    /// Fail every requested, non-terminal segment. Used when the runner dies
    /// while the session is live, so waiters get a terminal error rather
    /// than a timeout.
    pub fn fail_pending(&self, reason: &str) {
        let mut woken = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            for (n, record) in inner.segments.iter_mut() {
                if !record.state.is_terminal() && record.requested_at.is_some() {
                    record.state = SegmentState::Failed;
                    record.last_error = Some(reason.to_string());
                    woken.push(*n);
                }
            }
        }
        for n in woken {
            let _ = self.events.send(IndexEvent::Terminal(n));
        }
    }

    /// Close the index: all current and future waiters resolve to
    /// `SessionGone`. Idempotent.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        let _ = self.events.send(IndexEvent::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Block until the segment reaches a terminal state, the deadline hits,
    /// or the session goes away. Dropping the returned future (client
    /// disconnect) simply drops this waiter.
    pub async fn wait_for(&self, n: u64, timeout: Duration) -> WaitOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = self.events.subscribe();
        loop {
            {
                let inner = self.inner.lock().unwrap();
                // A terminal segment state beats closure, so a waiter whose
                // segment failed right before teardown sees the failure.
                if let Some(record) = inner.segments.get(&n) {
                    match record.state {
                        SegmentState::Completed => return WaitOutcome::Completed,
                        SegmentState::Failed => {
                            return WaitOutcome::Failed(
                                record
                                    .last_error
                                    .clone()
                                    .unwrap_or_else(|| "segment failed".to_string()),
                            );
                        }
                        _ => {}
                    }
                }
                if inner.closed {
                    return WaitOutcome::SessionGone;
                }
            }

            match tokio::time::timeout_at(deadline, rx.recv()).await {
                // Any event triggers a state re-check; lagged receivers just
                // re-check as well.
                Ok(Ok(IndexEvent::Terminal(_))) => continue,
                Ok(Ok(IndexEvent::Closed)) => return WaitOutcome::SessionGone,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return WaitOutcome::SessionGone,
                Err(_) => return WaitOutcome::Timeout,
            }
        }
    }

    /// Counts by state; `waiting` is everything not otherwise accounted for.
    pub fn snapshot(&self) -> IndexSnapshot {
        let inner = self.inner.lock().unwrap();
        let mut snapshot = IndexSnapshot::default();
        for record in inner.segments.values() {
            match record.state {
                SegmentState::Completed => snapshot.completed += 1,
                SegmentState::Transcoding => snapshot.transcoding += 1,
                SegmentState::Failed => snapshot.failed += 1,
                SegmentState::Waiting => {}
            }
        }
        snapshot.waiting = self
            .total_segments
            .saturating_sub(snapshot.completed + snapshot.transcoding + snapshot.failed);
        snapshot
    }

    /// Exclusive end of the contiguous completed run starting at `from`.
    pub fn contiguous_end(&self, from: u64) -> u64 {
        let inner = self.inner.lock().unwrap();
        let mut n = from;
        while n < self.total_segments {
            match inner.segments.get(&n) {
                Some(record) if record.state == SegmentState::Completed => n += 1,
                _ => break,
            }
        }
        n
    }

    /// Requested segments stuck in a non-terminal state longer than
    /// `timeout`, oldest request first.
    pub fn stalled(&self, timeout: Duration) -> Vec<(u64, u32)> {
        let inner = self.inner.lock().unwrap();
        let mut stalled: Vec<(u64, u32, Instant)> = inner
            .segments
            .iter()
            .filter_map(|(n, record)| {
                if record.state.is_terminal() {
                    return None;
                }
                let requested_at = record.requested_at?;
                (requested_at.elapsed() >= timeout).then_some((*n, record.retries, requested_at))
            })
            .collect();
        stalled.sort_by_key(|(_, _, at)| *at);
        stalled.into_iter().map(|(n, r, _)| (n, r)).collect()
    }

    /// Per-segment entries for the admin endpoint, covering the whole
    /// timeline.
    pub fn entries(&self) -> Vec<SegmentEntry> {
        let inner = self.inner.lock().unwrap();
        (0..self.total_segments)
            .map(|n| match inner.segments.get(&n) {
                Some(record) => SegmentEntry {
                    n,
                    state: record.state,
                    retries: record.retries,
                    last_error: record.last_error.clone(),
                },
                None => SegmentEntry {
                    n,
                    state: SegmentState::Waiting,
                    retries: 0,
                    last_error: None,
                },
            })
            .collect()
    }
}
