//! Run-directory monitoring and timeline renaming.
//!
//! The transcoder numbers its output from zero inside its run directory. The
//! monitor detects finalized segments and moves them into the session
//! directory under their timeline-absolute names, then marks them completed
//! in the index.
//!
//! A run-local segment `k` counts as finalized when the transcoder's own
//! playlist lists it, or when `segment_{k+1}` exists (the transcoder only
//! opens the next file after closing the previous one). A bare first write
//! never finalizes. Segments are promoted strictly in order, so completions
//! within one run are monotonic.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::playlist::parse_segment_file_name;
use crate::streaming::command::RUNNER_PLAYLIST;
use crate::streaming::index::SegmentIndex;

pub struct MonitorParams {
    pub session_id: String,
    pub run_dir: PathBuf,
    pub session_dir: PathBuf,
    /// Timeline number of the run's first segment; emitted `k` maps to
    /// `start_seg + k`.
    pub start_seg: u64,
    pub total_segments: u64,
    pub index: Arc<SegmentIndex>,
    pub poll_interval: Duration,
}

/// Handle to a running monitor task.
#[derive(Debug)]
pub struct PlaylistMonitor {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl PlaylistMonitor {
    pub fn spawn(params: MonitorParams) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run_monitor(params, task_cancel).await;
        });
        Self { cancel, handle }
    }

    /// Stop the monitor after one final scan, so segments the transcoder
    /// closed during a graceful stop are still promoted.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn run_monitor(params: MonitorParams, cancel: CancellationToken) {
    let mut next_k: u64 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                scan_once(&params, &mut next_k).await;
                debug!(session_id = %params.session_id, promoted = next_k, "monitor stopped");
                return;
            }
            _ = tokio::time::sleep(params.poll_interval) => {
                scan_once(&params, &mut next_k).await;
            }
        }
    }
}

/// One pass: collect finalized run-local segments and promote them in order.
async fn scan_once(params: &MonitorParams, next_k: &mut u64) {
    let emitted = emitted_segments(&params.run_dir).await;
    let Some(&max_emitted) = emitted.iter().next_back() else {
        return;
    };

    let listed = match tokio::fs::read_to_string(params.run_dir.join(RUNNER_PLAYLIST)).await {
        Ok(text) => playlist_listed_segments(&text),
        Err(_) => BTreeSet::new(),
    };

    while *next_k <= max_emitted {
        let k = *next_k;
        let finalized = listed.contains(&k) || emitted.contains(&(k + 1));
        if !finalized || !emitted.contains(&k) {
            break;
        }
        if promote(params, k).await {
            *next_k += 1;
        } else {
            break;
        }
    }

    // The in-progress head, if any, is visibly transcoding.
    if *next_k <= max_emitted && emitted.contains(next_k) {
        let n = params.start_seg + *next_k;
        if n < params.total_segments {
            params.index.mark_transcoding(n);
        }
    }
}

/// Move run-local segment `k` to its timeline-absolute name and mark it
/// completed. Returns false if the rename failed and should be retried.
async fn promote(params: &MonitorParams, k: u64) -> bool {
    let n = params.start_seg + k;
    if n >= params.total_segments {
        // The transcoder ran past the declared timeline; drop the extra file.
        let _ = tokio::fs::remove_file(params.run_dir.join(segment_name(k))).await;
        return true;
    }

    let src = params.run_dir.join(segment_name(k));
    let dest = params.session_dir.join(segment_name(n));

    if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
        // Already produced by an earlier run; the earlier file wins.
        let _ = tokio::fs::remove_file(&src).await;
    } else if let Err(e) = tokio::fs::rename(&src, &dest).await {
        warn!(
            session_id = %params.session_id,
            segment = n,
            "failed to promote segment: {e}"
        );
        return false;
    }

    debug!(session_id = %params.session_id, run_local = k, segment = n, "segment finalized");
    params.index.mark_completed(n);
    true
}

fn segment_name(n: u64) -> String {
    format!("segment_{n:03}.ts")
}

/// Run-local segment numbers present on disk.
async fn emitted_segments(run_dir: &Path) -> BTreeSet<u64> {
    let mut found = BTreeSet::new();
    let Ok(mut entries) = tokio::fs::read_dir(run_dir).await else {
        return found;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Some(name) = entry.file_name().to_str()
            && let Some(k) = parse_segment_file_name(name)
        {
            found.insert(k);
        }
    }
    found
}

/// Run-local segment numbers the transcoder's playlist declares finalized.
fn playlist_listed_segments(text: &str) -> BTreeSet<u64> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let name = line.rsplit('/').next().unwrap_or(line);
            parse_segment_file_name(name)
        })
        .collect()
}
