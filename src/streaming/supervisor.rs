//! Per-session lifecycle supervision.
//!
//! The supervisor owns the session's runner and monitor: it composes the
//! transcoder invocation, gates session startup on the first finalized
//! segment, restarts the runner on seeks, applies the stall policy with
//! seek-driven retries, and tears everything down exactly once. At most one
//! runner is alive per session; `lifecycle` serializes start/restart/stop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::StreamingConfig;
use crate::errors::StreamError;
use crate::models::SessionState;
use crate::streaming::command::{self, TranscodeRequest};
use crate::streaming::index::WaitOutcome;
use crate::streaming::monitor::{MonitorParams, PlaylistMonitor};
use crate::streaming::runner::{RunnerExit, TranscodeRunner};
use crate::streaming::session::StreamSession;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub ffmpeg_command: String,
    pub startup_timeout: Duration,
    pub segment_timeout: Duration,
    pub stop_grace: Duration,
    pub max_retries: u32,
    pub monitor_poll: Duration,
    pub stall_check_interval: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &StreamingConfig) -> Self {
        Self {
            ffmpeg_command: config.ffmpeg_command.clone(),
            startup_timeout: config.session_startup_timeout(),
            segment_timeout: config.segment_timeout(),
            stop_grace: config.runner_stop_grace(),
            max_retries: config.max_retries,
            monitor_poll: config.monitor_poll(),
            stall_check_interval: Duration::from_secs(5).min(config.segment_timeout() / 2),
        }
    }
}

#[derive(Debug)]
pub struct SessionSupervisor {
    pub session: Arc<StreamSession>,
    settings: SupervisorSettings,
    runner: Mutex<Option<TranscodeRunner>>,
    monitor: Mutex<Option<PlaylistMonitor>>,
    /// Serializes start/restart/stop so only one lifecycle change runs.
    lifecycle: Mutex<()>,
    run_counter: AtomicU64,
    cancel: CancellationToken,
    supervise_started: AtomicBool,
    runner_pid: std::sync::Mutex<Option<u32>>,
}

impl SessionSupervisor {
    pub fn new(session: Arc<StreamSession>, settings: SupervisorSettings) -> Arc<Self> {
        Arc::new(Self {
            session,
            settings,
            runner: Mutex::new(None),
            monitor: Mutex::new(None),
            lifecycle: Mutex::new(()),
            run_counter: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            supervise_started: AtomicBool::new(false),
            runner_pid: std::sync::Mutex::new(None),
        })
    }

    pub fn runner_pid(&self) -> Option<u32> {
        *self.runner_pid.lock().unwrap()
    }

    /// Latest progress report from the live runner, if any. Non-blocking;
    /// returns `None` while a lifecycle change holds the runner slot.
    pub fn progress(&self) -> Option<crate::models::TranscodeProgress> {
        self.runner
            .try_lock()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(|runner| runner.progress()))
    }

    /// Start the session's first run and block until segment `start_seg` is
    /// finalized or the startup deadline passes. On failure the session is
    /// marked failed and cleaned up; the caller removes it from the registry.
    pub async fn start(self: Arc<Self>) -> Result<(), StreamError> {
        let _lifecycle = self.lifecycle.lock().await;

        tokio::fs::create_dir_all(&self.session.dir).await?;
        let start_seg = self.session.start_seg();
        let completion = self.launch_run(start_seg).await?;

        match self.await_first_segment(start_seg, completion).await {
            Ok(()) => {
                self.session.set_state(SessionState::Active);
                if !self.supervise_started.swap(true, Ordering::SeqCst) {
                    tokio::spawn(self.clone().supervise());
                }
                info!(
                    session_id = %self.session.id,
                    scene_id = %self.session.key.scene_id,
                    quality = %self.session.key.quality,
                    start_seg,
                    "session active"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    session_id = %self.session.id,
                    scene_id = %self.session.key.scene_id,
                    quality = %self.session.key.quality,
                    "session startup failed: {e}"
                );
                self.halt_run().await;
                self.session.set_state(SessionState::Failed);
                self.session.index.close();
                Err(e)
            }
        }
    }

    /// Seek handling: stop the current runner, keep already-completed
    /// segments where they are on the timeline, and bring up a new runner at
    /// `target_seg`.
    pub async fn restart(&self, target_seg: u64) -> Result<(), StreamError> {
        let _lifecycle = self.lifecycle.lock().await;

        if !self.session.state().is_live() {
            return Err(StreamError::SessionGone);
        }
        self.session.set_state(SessionState::Restarting);
        info!(
            session_id = %self.session.id,
            scene_id = %self.session.key.scene_id,
            quality = %self.session.key.quality,
            target_seg,
            "restarting transcoder for seek"
        );

        self.halt_run().await;
        self.session.index.reset_in_flight();
        self.session.set_start_seg(target_seg);

        let result = async {
            let completion = self.launch_run(target_seg).await?;
            self.await_first_segment(target_seg, completion).await
        }
        .await;

        match result {
            Ok(()) => {
                self.session.set_state(SessionState::Active);
                Ok(())
            }
            Err(e) => {
                error!(session_id = %self.session.id, "restart failed: {e}");
                self.halt_run().await;
                self.session.set_state(SessionState::Failed);
                self.session.index.fail_pending(&e.to_string());
                self.session.index.close();
                Err(e)
            }
        }
    }

    /// Tear the session down. Idempotent: a second call finds the session
    /// already stopped and does nothing further.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.session.state() == SessionState::Stopped {
            return;
        }
        self.session.set_state(SessionState::Stopping);
        self.cancel.cancel();
        self.halt_run().await;
        self.session.index.close();
        self.session.set_state(SessionState::Stopped);
        info!(session_id = %self.session.id, "session stopped");
    }

    /// Spawn a runner and monitor for a run starting at `start_seg`.
    async fn launch_run(
        &self,
        start_seg: u64,
    ) -> Result<watch::Receiver<Option<RunnerExit>>, StreamError> {
        let run_n = self.run_counter.fetch_add(1, Ordering::SeqCst);
        let run_dir = self.session.dir.join(format!("run_{run_n}"));
        tokio::fs::create_dir_all(&run_dir).await?;

        let start_sec = (start_seg * self.session.segment_secs) as f64;
        let args = command::build_transcode_args(&TranscodeRequest {
            input: &self.session.input_path,
            start_sec,
            preset: self.session.quality().preset(),
            segment_secs: self.session.segment_secs,
            run_dir: &run_dir,
        });
        debug!(session_id = %self.session.id, ?args, "transcoder arguments");

        let runner =
            TranscodeRunner::spawn(&self.settings.ffmpeg_command, &args, &self.session.id)?;
        let completion = runner.completion();
        *self.runner_pid.lock().unwrap() = runner.pid();
        *self.runner.lock().await = Some(runner);

        let monitor = PlaylistMonitor::spawn(MonitorParams {
            session_id: self.session.id.clone(),
            run_dir,
            session_dir: self.session.dir.clone(),
            start_seg,
            total_segments: self.session.total_segments,
            index: self.session.index.clone(),
            poll_interval: self.settings.monitor_poll,
        });
        *self.monitor.lock().await = Some(monitor);

        Ok(completion)
    }

    /// Stop the current runner and monitor, if any.
    async fn halt_run(&self) {
        if let Some(runner) = self.runner.lock().await.take() {
            runner.stop(self.settings.stop_grace).await;
        }
        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.shutdown().await;
        }
        *self.runner_pid.lock().unwrap() = None;
    }

    /// Wait for the run's first segment. A premature failed exit of the
    /// runner short-circuits the wait; a successful early exit (short tail)
    /// keeps waiting for the monitor to promote the output.
    async fn await_first_segment(
        &self,
        seg: u64,
        mut completion: watch::Receiver<Option<RunnerExit>>,
    ) -> Result<(), StreamError> {
        let deadline = tokio::time::Instant::now() + self.settings.startup_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());

            if completion.borrow().is_some() {
                // Runner already gone (successfully); only the monitor's
                // final promotion can still complete the segment.
                let outcome = self.session.index.wait_for(seg, remaining).await;
                return self.map_startup_outcome(outcome);
            }

            tokio::select! {
                outcome = self.session.index.wait_for(seg, remaining) => {
                    return self.map_startup_outcome(outcome);
                }
                exited = wait_for_exit(&mut completion) => {
                    let exit = exited
                        .unwrap_or(RunnerExit { code: None, success: false });
                    if !exit.success {
                        // The transcoder may have emitted the segment just
                        // before dying; let the monitor promote it.
                        let grace = self.settings.monitor_poll * 4;
                        if self.session.index.wait_for(seg, grace).await == WaitOutcome::Completed {
                            return Ok(());
                        }
                        return Err(StreamError::startup_failed(format!(
                            "transcoder exited with code {:?} before producing output",
                            exit.code
                        )));
                    }
                }
            }
        }
    }

    fn map_startup_outcome(&self, outcome: WaitOutcome) -> Result<(), StreamError> {
        match outcome {
            WaitOutcome::Completed => Ok(()),
            WaitOutcome::Failed(reason) => Err(StreamError::startup_failed(reason)),
            WaitOutcome::Timeout => Err(StreamError::startup_failed(format!(
                "no output after {:?}",
                self.settings.startup_timeout
            ))),
            WaitOutcome::SessionGone => Err(StreamError::SessionGone),
        }
    }

    /// Background loop: watches for runner death and applies the stall
    /// policy while the session is active.
    async fn supervise(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.settings.stall_check_interval) => {}
            }

            self.check_runner_exit().await;
            self.check_stalled_segments().await;
        }
    }

    async fn check_runner_exit(&self) {
        let exit = {
            let mut slot = self.runner.lock().await;
            let Some(runner) = slot.as_ref() else { return };
            let Some(exit) = runner.exit() else { return };
            if runner.stop_requested() {
                // Expected during stop/restart; the lifecycle owner reaps.
                return;
            }
            *slot = None;
            *self.runner_pid.lock().unwrap() = None;
            exit
        };

        let state = self.session.state();
        if exit.success {
            // The transcoder reached the end of the asset; the session keeps
            // serving completed segments until it idles out.
            debug!(session_id = %self.session.id, "transcoder finished its run");
            return;
        }
        if matches!(state, SessionState::Starting | SessionState::Active) {
            let reason = format!("transcoder exited with code {:?}", exit.code);
            error!(
                session_id = %self.session.id,
                scene_id = %self.session.key.scene_id,
                quality = %self.session.key.quality,
                "{reason}"
            );
            self.session.set_state(SessionState::Failed);
            self.session.index.fail_pending(&reason);
            self.session.index.close();
        }
    }

    async fn check_stalled_segments(&self) {
        if self.session.state() != SessionState::Active {
            return;
        }
        let stalled = self.session.index.stalled(self.settings.segment_timeout);
        let Some(&(n, retries)) = stalled.first() else {
            return;
        };

        if retries < self.settings.max_retries {
            let attempt = self.session.index.begin_retry(n);
            warn!(
                session_id = %self.session.id,
                segment = n,
                attempt,
                "segment stalled, retrying via seek restart"
            );
            if let Err(e) = self.restart(n).await {
                warn!(session_id = %self.session.id, segment = n, "stall restart failed: {e}");
            }
        } else {
            warn!(
                session_id = %self.session.id,
                segment = n,
                retries,
                "segment exhausted retries"
            );
            self.session
                .index
                .mark_failed(n, format!("segment timed out after {retries} retries"));
        }
    }
}

/// Wait until the runner's completion channel holds a value, returning an
/// owned copy without holding a borrow of the channel across an `.await`.
async fn wait_for_exit(completion: &mut watch::Receiver<Option<RunnerExit>>) -> Option<RunnerExit> {
    loop {
        if let Some(exit) = *completion.borrow() {
            return Some(exit);
        }
        if completion.changed().await.is_err() {
            return None;
        }
    }
}
