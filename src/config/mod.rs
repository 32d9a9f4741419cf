use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub web: WebConfig,
    pub storage: StorageConfig,
    pub streaming: StreamingConfig,
    pub metadata: MetadataConfig,
    /// Longest-prefix translation table from upstream paths to local paths.
    /// An empty table means paths are used as reported.
    #[serde(default)]
    pub path_mappings: Vec<PathMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for runtime data; session directories live under
    /// `<config_dir>/hls/<session_id>/`.
    pub config_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Transcoder command; full path or a name resolved via $PATH.
    pub ffmpeg_command: String,
    /// Prober command; full path or a name resolved via $PATH.
    pub ffprobe_command: String,
    pub segment_duration_secs: u64,
    pub idle_timeout_secs: u64,
    pub segment_wait_timeout_secs: u64,
    /// A requested segment stuck this long without finalizing is retried or
    /// marked failed.
    pub segment_timeout_secs: u64,
    pub session_startup_timeout_secs: u64,
    pub runner_stop_grace_secs: u64,
    pub max_retries: u32,
    /// When set, creating a session over this limit evicts the
    /// least-recently-used session first.
    pub max_concurrent_sessions: Option<usize>,
    pub sweep_interval_secs: u64,
    pub monitor_poll_millis: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Base URL of the upstream metadata service. Requests against the
    /// streaming surface fail with 503 until this is configured.
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    /// How long a resolved scene stays cached.
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathMapping {
    pub from: String,
    pub to: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            web: WebConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            storage: StorageConfig {
                config_dir: PathBuf::from("/app/data"),
            },
            streaming: StreamingConfig {
                ffmpeg_command: "ffmpeg".to_string(),
                ffprobe_command: "ffprobe".to_string(),
                segment_duration_secs: 2,
                idle_timeout_secs: 90,
                segment_wait_timeout_secs: 15,
                segment_timeout_secs: 60,
                session_startup_timeout_secs: 30,
                runner_stop_grace_secs: 5,
                max_retries: 3,
                max_concurrent_sessions: None,
                sweep_interval_secs: 10,
                monitor_poll_millis: 250,
            },
            metadata: MetadataConfig {
                base_url: None,
                api_key: None,
                request_timeout_secs: 10,
                cache_ttl_secs: 300,
            },
            path_mappings: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration: TOML file (written with defaults on first run),
    /// then environment overrides.
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());

        let mut config = if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(&config_file)?;
            toml::from_str(&contents)?
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(&config_file, contents)?;
            default_config
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply the flat environment variables the deployment contract names.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("CONFIG_DIR") {
            self.storage.config_dir = PathBuf::from(dir);
        }
        env_parse("SEGMENT_DURATION_SEC", &mut self.streaming.segment_duration_secs);
        env_parse("IDLE_TIMEOUT_SEC", &mut self.streaming.idle_timeout_secs);
        env_parse(
            "SEGMENT_WAIT_TIMEOUT_SEC",
            &mut self.streaming.segment_wait_timeout_secs,
        );
        if let Ok(raw) = std::env::var("MAX_CONCURRENT_SESSIONS") {
            match raw.parse::<usize>() {
                Ok(0) => self.streaming.max_concurrent_sessions = None,
                Ok(n) => self.streaming.max_concurrent_sessions = Some(n),
                Err(_) => tracing::warn!("Ignoring unparseable MAX_CONCURRENT_SESSIONS={raw}"),
            }
        }
        if let Ok(cmd) = std::env::var("FFMPEG_COMMAND") {
            self.streaming.ffmpeg_command = cmd;
        }
        if let Ok(cmd) = std::env::var("FFPROBE_COMMAND") {
            self.streaming.ffprobe_command = cmd;
        }
        if let Ok(url) = std::env::var("METADATA_URL") {
            self.metadata.base_url = Some(url);
        }
        if let Ok(key) = std::env::var("METADATA_API_KEY") {
            self.metadata.api_key = Some(key);
        }
    }

    /// Root directory for per-session output directories.
    pub fn sessions_dir(&self) -> PathBuf {
        self.storage.config_dir.join("hls")
    }
}

impl StreamingConfig {
    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_duration_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn segment_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.segment_wait_timeout_secs)
    }

    pub fn segment_timeout(&self) -> Duration {
        Duration::from_secs(self.segment_timeout_secs)
    }

    pub fn session_startup_timeout(&self) -> Duration {
        Duration::from_secs(self.session_startup_timeout_secs)
    }

    pub fn runner_stop_grace(&self) -> Duration {
        Duration::from_secs(self.runner_stop_grace_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn monitor_poll(&self) -> Duration {
        Duration::from_millis(self.monitor_poll_millis)
    }
}

fn env_parse(name: &str, target: &mut u64) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!("Ignoring unparseable {name}={raw}"),
        }
    }
}
