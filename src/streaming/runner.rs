//! Transcoder process supervision.
//!
//! Wraps a single external transcoder invocation: spawn, drain stderr into
//! the structured log, surface progress reports, and expose a completion
//! channel that fires exactly once. Shutdown is graceful-then-forceful: a
//! `q` on the transcoder's stdin asks it to finish the current segment and
//! exit; after the grace period the process is killed.

use std::process::Stdio;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::errors::StreamError;
use crate::models::TranscodeProgress;

/// Final state of a runner process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerExit {
    pub code: Option<i32>,
    pub success: bool,
}

static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"time=(\d+):(\d{2}):(\d{2}(?:\.\d+)?).*speed=\s*(\d+(?:\.\d+)?)x")
        .expect("progress regex")
});

/// Parse an ffmpeg stderr status line into a progress report.
pub fn parse_progress_line(line: &str) -> Option<TranscodeProgress> {
    let captures = PROGRESS_RE.captures(line)?;
    let hours: f64 = captures[1].parse().ok()?;
    let minutes: f64 = captures[2].parse().ok()?;
    let seconds: f64 = captures[3].parse().ok()?;
    let speed: f64 = captures[4].parse().ok()?;
    Some(TranscodeProgress {
        timecode_secs: hours * 3600.0 + minutes * 60.0 + seconds,
        speed,
    })
}

/// Handle for one live transcoder process.
#[derive(Debug)]
pub struct TranscodeRunner {
    session_id: String,
    pid: Option<u32>,
    stdin: Mutex<Option<tokio::process::ChildStdin>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    completion: watch::Receiver<Option<RunnerExit>>,
    progress: watch::Receiver<Option<TranscodeProgress>>,
    stop_requested: AtomicBool,
}

impl TranscodeRunner {
    /// Spawn the transcoder. Fails if the executable cannot be started.
    pub fn spawn(
        command: &str,
        args: &[String],
        session_id: &str,
    ) -> Result<Self, StreamError> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            StreamError::startup_failed(format!("failed to spawn '{command}': {e}"))
        })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stderr = child.stderr.take();

        let (progress_tx, progress_rx) = watch::channel(None);
        if let Some(stderr) = stderr {
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(progress) = parse_progress_line(&line) {
                        debug!(
                            session_id = %session_id,
                            timecode = progress.timecode_secs,
                            speed = progress.speed,
                            "transcoder progress"
                        );
                        let _ = progress_tx.send(Some(progress));
                    } else if !line.trim().is_empty() {
                        debug!(session_id = %session_id, "transcoder: {}", line.trim_end());
                    }
                }
            });
        }

        let (completion_tx, completion_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        {
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    _ = &mut kill_rx => {
                        let _ = child.start_kill();
                        child.wait().await
                    }
                };
                let exit = match status {
                    Ok(status) => RunnerExit {
                        code: status.code(),
                        success: status.success(),
                    },
                    Err(e) => {
                        error!(session_id = %session_id, "failed to reap transcoder: {e}");
                        RunnerExit {
                            code: None,
                            success: false,
                        }
                    }
                };
                debug!(session_id = %session_id, code = ?exit.code, "transcoder exited");
                let _ = completion_tx.send(Some(exit));
            });
        }

        info!(session_id = %session_id, pid = ?pid, command, "spawned transcoder");

        Ok(Self {
            session_id: session_id.to_string(),
            pid,
            stdin: Mutex::new(stdin),
            kill_tx: Mutex::new(Some(kill_tx)),
            completion: completion_rx,
            progress: progress_rx,
            stop_requested: AtomicBool::new(false),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Completion channel; holds `Some(exit)` once the process has been
    /// reaped. Fires exactly once.
    pub fn completion(&self) -> watch::Receiver<Option<RunnerExit>> {
        self.completion.clone()
    }

    /// Latest progress report, if any has been parsed yet.
    pub fn progress(&self) -> Option<TranscodeProgress> {
        *self.progress.borrow()
    }

    pub fn exit(&self) -> Option<RunnerExit> {
        *self.completion.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit().is_some()
    }

    /// Whether `stop` has been requested; exits after that point are
    /// expected and not an error.
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Graceful stop: ask the transcoder to quit, wait out the grace period,
    /// then kill. Idempotent; repeated calls just await the same exit.
    pub async fn stop(&self, grace: Duration) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            // Closing stdin after the quit keystroke covers transcoders
            // that only react to EOF.
            if let Some(mut stdin) = self.stdin.lock().await.take() {
                let _ = stdin.write_all(b"q").await;
                let _ = stdin.flush().await;
            }
        }

        let mut completion = self.completion.clone();
        if completion.borrow().is_some() {
            return;
        }
        if tokio::time::timeout(grace, completion.wait_for(|v| v.is_some()))
            .await
            .is_err()
        {
            warn!(
                session_id = %self.session_id,
                "transcoder ignored graceful stop, killing"
            );
            if let Some(kill) = self.kill_tx.lock().await.take() {
                let _ = kill.send(());
            }
            let _ = tokio::time::timeout(
                Duration::from_secs(5),
                completion.wait_for(|v| v.is_some()),
            )
            .await;
        }
    }
}
