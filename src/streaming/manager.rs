//! Process-wide session registry.
//!
//! Creates, reuses, seeks, and destroys sessions keyed by
//! `(scene_id, quality)`. Creation is serialized per key so a burst of
//! identical playlist requests starts exactly one runner. A background sweep
//! destroys idle and dead sessions and, when a session cap is configured,
//! the least-recently-used session makes room for new ones.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, StreamingConfig};
use crate::errors::StreamError;
use crate::models::{SessionKey, SessionState, SessionStatus, SessionSummary};
use crate::streaming::session::StreamSession;
use crate::streaming::supervisor::{SessionSupervisor, SupervisorSettings};

/// Look-ahead grace for session reuse: a seek landing this close past the
/// produced range rides the existing runner instead of restarting it.
const REUSE_GRACE_SECS: u64 = 10;

#[derive(Clone, Debug)]
pub struct SessionEntry {
    pub session: Arc<StreamSession>,
    pub supervisor: Arc<SessionSupervisor>,
}

pub struct SessionManager {
    registry: Mutex<HashMap<SessionKey, SessionEntry>>,
    creation_locks: Mutex<HashMap<SessionKey, Arc<Mutex<()>>>>,
    streaming: StreamingConfig,
    sessions_root: PathBuf,
    system: Mutex<System>,
}

impl SessionManager {
    pub fn new(config: &Config) -> Arc<Self> {
        Self::with_settings(config.streaming.clone(), config.sessions_dir())
    }

    pub fn with_settings(streaming: StreamingConfig, sessions_root: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
            streaming,
            sessions_root,
            system: Mutex::new(System::new()),
        })
    }

    pub fn streaming_config(&self) -> &StreamingConfig {
        &self.streaming
    }

    /// Start the idle sweep. Runs for the life of the process.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.streaming.sweep_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.sweep().await;
            }
        });
    }

    fn grace_segments(&self) -> u64 {
        REUSE_GRACE_SECS.div_ceil(self.streaming.segment_duration_secs.max(1))
    }

    fn target_segment(&self, start_sec: f64, duration_secs: f64) -> u64 {
        let total = crate::playlist::segment_count(duration_secs, self.streaming.segment_duration_secs);
        let seg = (start_sec.max(0.0) / self.streaming.segment_duration_secs as f64) as u64;
        seg.min(total.saturating_sub(1))
    }

    /// Get a live session for the key, reusing, seeking, or creating as
    /// needed. Exactly one runner is started per key for concurrent calls.
    pub async fn get_or_create(
        &self,
        key: SessionKey,
        start_sec: f64,
        input_path: PathBuf,
        duration_secs: f64,
    ) -> Result<SessionEntry, StreamError> {
        let _guard = self.acquire_key_lock(&key).await;

        let target_seg = self.target_segment(start_sec, duration_secs);

        if let Some(entry) = self.lookup(&key).await {
            match entry.session.state() {
                SessionState::Failed | SessionState::Stopped => {
                    // Dead entry; clear it and create afresh below.
                    self.destroy_locked(&key).await;
                }
                _ => {
                    if entry
                        .session
                        .can_serve_without_restart(target_seg, self.grace_segments())
                    {
                        debug!(
                            session_id = %entry.session.id,
                            target_seg,
                            "reusing session within producible window"
                        );
                        entry.session.touch();
                        return Ok(entry);
                    }
                    match entry.supervisor.restart(target_seg).await {
                        Ok(()) => {
                            entry.session.touch();
                            return Ok(entry);
                        }
                        Err(e) => {
                            warn!(key = %key, "seek restart failed, removing session: {e}");
                            self.destroy_locked(&key).await;
                            self.creation_locks.lock().await.remove(&key);
                            return Err(e);
                        }
                    }
                }
            }
        }

        self.enforce_session_limit(&key).await;

        let session = Arc::new(StreamSession::new(
            key.clone(),
            input_path,
            duration_secs,
            self.streaming.segment_duration_secs,
            &self.sessions_root,
            target_seg,
        ));
        let supervisor = SessionSupervisor::new(
            session.clone(),
            SupervisorSettings::from_config(&self.streaming),
        );
        let entry = SessionEntry {
            session: session.clone(),
            supervisor: supervisor.clone(),
        };

        info!(
            session_id = %session.id,
            scene_id = %key.scene_id,
            quality = %key.quality,
            start_seg = target_seg,
            "creating session"
        );
        self.registry.lock().await.insert(key.clone(), entry.clone());

        match supervisor.start().await {
            Ok(()) => Ok(entry),
            Err(e) => {
                // Remove the dead entry so the next request retries cleanly.
                self.registry.lock().await.remove(&key);
                let _ = tokio::fs::remove_dir_all(&session.dir).await;
                self.creation_locks.lock().await.remove(&key);
                Err(e)
            }
        }
    }

    pub async fn lookup(&self, key: &SessionKey) -> Option<SessionEntry> {
        self.registry.lock().await.get(key).cloned()
    }

    /// Destroy a session: stop the runner, remove the output directory, and
    /// drop the registry entry.
    pub async fn destroy(&self, key: &SessionKey) -> bool {
        let _guard = self.acquire_key_lock(key).await;
        let destroyed = self.destroy_locked(key).await;
        // The lock entry goes last, while we still hold its guard; late
        // waiters re-check and take a fresh lock.
        self.creation_locks.lock().await.remove(key);
        destroyed
    }

    async fn destroy_locked(&self, key: &SessionKey) -> bool {
        let entry = self.registry.lock().await.remove(key);
        let Some(entry) = entry else {
            return false;
        };
        entry.supervisor.stop().await;
        if let Err(e) = tokio::fs::remove_dir_all(&entry.session.dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(session_id = %entry.session.id, "failed to remove session dir: {e}");
            }
        }
        info!(
            session_id = %entry.session.id,
            scene_id = %key.scene_id,
            quality = %key.quality,
            "session destroyed"
        );
        true
    }

    pub async fn destroy_all(&self) {
        let keys: Vec<SessionKey> = self.registry.lock().await.keys().cloned().collect();
        for key in keys {
            self.destroy(&key).await;
        }
    }

    /// One sweep pass: drop dead sessions and anything idle past the
    /// timeout. An actively-playing client refreshes activity on every hit
    /// and never idles out.
    pub async fn sweep(&self) {
        let idle_timeout = self.streaming.idle_timeout();
        let candidates: Vec<(SessionKey, &'static str)> = {
            let registry = self.registry.lock().await;
            registry
                .iter()
                .filter_map(|(key, entry)| match entry.session.state() {
                    SessionState::Failed | SessionState::Stopped => {
                        Some((key.clone(), "dead"))
                    }
                    SessionState::Stopping => None,
                    _ if entry.session.last_activity_age() > idle_timeout => {
                        Some((key.clone(), "idle"))
                    }
                    _ => None,
                })
                .collect()
        };

        for (key, reason) in candidates {
            info!(key = %key, reason, "sweeping session");
            self.destroy(&key).await;
        }

        self.log_status_report().await;
    }

    /// When a cap is configured, destroy least-recently-used sessions until
    /// the new one fits.
    async fn enforce_session_limit(&self, new_key: &SessionKey) {
        let Some(limit) = self.streaming.max_concurrent_sessions else {
            return;
        };
        loop {
            let lru: Option<SessionKey> = {
                let registry = self.registry.lock().await;
                if registry.len() < limit.max(1) {
                    return;
                }
                registry
                    .iter()
                    .filter(|(key, entry)| {
                        // Never evict a session mid-(re)start; its creator
                        // holds the key lock and eviction would deadlock.
                        *key != new_key
                            && matches!(
                                entry.session.state(),
                                SessionState::Active
                                    | SessionState::Failed
                                    | SessionState::Stopped
                            )
                    })
                    .max_by_key(|(_, entry)| entry.session.last_activity_age())
                    .map(|(key, _)| key.clone())
            };
            match lru {
                Some(key) => {
                    info!(key = %key, "evicting least-recently-used session");
                    self.destroy(&key).await;
                }
                None => {
                    warn!("session cap reached with no evictable session; exceeding limit");
                    return;
                }
            }
        }
    }

    /// Take the per-key creation lock. Lock entries are removed together
    /// with their session, so after waiting we re-check that the instance we
    /// hold is still the key's current lock; if not, the key was destroyed
    /// meanwhile and we take the fresh lock instead.
    async fn acquire_key_lock(&self, key: &SessionKey) -> tokio::sync::OwnedMutexGuard<()> {
        loop {
            let lock = self
                .creation_locks
                .lock()
                .await
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            let guard = lock.clone().lock_owned().await;
            let still_current = self
                .creation_locks
                .lock()
                .await
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current, &lock));
            if still_current {
                return guard;
            }
        }
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let registry = self.registry.lock().await;
        let mut sessions: Vec<SessionSummary> = registry
            .iter()
            .map(|(key, entry)| SessionSummary {
                key: key.to_string(),
                session_id: entry.session.id.clone(),
                state: entry.session.state(),
                start_sec: entry.session.start_sec(),
                last_activity_age_ms: entry.session.last_activity_age().as_millis() as u64,
            })
            .collect();
        sessions.sort_by(|a, b| a.key.cmp(&b.key));
        sessions
    }

    pub async fn status(&self, key: &SessionKey) -> Option<SessionStatus> {
        let entry = self.lookup(key).await?;
        let snapshot = entry.session.index.snapshot();
        let progress = entry.supervisor.progress();
        let (cpu, memory) = self.process_usage(entry.supervisor.runner_pid()).await;
        Some(SessionStatus {
            state: entry.session.state(),
            start_sec: entry.session.start_sec(),
            produced_end: entry.session.produced_end(),
            completed: snapshot.completed,
            transcoding: snapshot.transcoding,
            failed: snapshot.failed,
            waiting: snapshot.waiting,
            last_activity_age_ms: entry.session.last_activity_age().as_millis() as u64,
            transcode_position_secs: progress.map(|p| p.timecode_secs),
            transcode_speed: progress.map(|p| p.speed),
            cpu_usage_percent: cpu,
            memory_usage_mb: memory,
        })
    }

    pub async fn segments(&self, key: &SessionKey) -> Option<Vec<crate::models::SegmentEntry>> {
        let entry = self.lookup(key).await?;
        Some(entry.session.index.entries())
    }

    /// CPU and memory of the transcoder process, when one is running.
    async fn process_usage(&self, pid: Option<u32>) -> (Option<f64>, Option<f64>) {
        let Some(pid) = pid else {
            return (None, None);
        };
        let pid = Pid::from_u32(pid);
        let mut system = self.system.lock().await;
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        match system.process(pid) {
            Some(process) => (
                Some(process.cpu_usage() as f64),
                Some(process.memory() as f64 / (1024.0 * 1024.0)),
            ),
            None => (None, None),
        }
    }

    async fn log_status_report(&self) {
        let registry = self.registry.lock().await;
        if registry.is_empty() {
            return;
        }
        for (key, entry) in registry.iter() {
            let snapshot = entry.session.index.snapshot();
            debug!(
                key = %key,
                state = %entry.session.state(),
                completed = snapshot.completed,
                transcoding = snapshot.transcoding,
                failed = snapshot.failed,
                idle_ms = entry.session.last_activity_age().as_millis() as u64,
                "session status"
            );
        }
    }
}
