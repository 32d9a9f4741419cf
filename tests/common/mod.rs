//! Shared fixtures: a scripted fake transcoder honoring the runner contract
//! (0-based segment numbering, incrementally written VOD playlist, stays
//! alive until signalled), plus a stub metadata source.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use scene_proxy::config::{Config, MetadataConfig, StorageConfig, StreamingConfig, WebConfig};
use scene_proxy::errors::MetadataError;
use scene_proxy::metadata::MetadataSource;
use scene_proxy::models::SceneSource;
use scene_proxy::pathmap::PathMapper;
use scene_proxy::proxy::VariantProxy;
use scene_proxy::streaming::{SessionManager, ToolInfo};
use scene_proxy::web::AppState;

/// Write an executable fake transcoder. It emits `segments` 4 KiB segment
/// files named `segment_%03d.ts` into the playlist's directory, appends each
/// to the playlist once written, then idles. With `fail_after = Some(k)` it
/// exits with code 1 right after emitting segment `k`.
pub fn write_fake_transcoder(dir: &Path, name: &str, segments: u32, fail_after: Option<u32>) -> PathBuf {
    let fail_after = fail_after.map(|k| k as i64).unwrap_or(-1);
    let script = format!(
        r#"#!/bin/sh
count={segments}
fail_after={fail_after}
for last in "$@"; do :; done
dir=$(dirname "$last")
pl="$last"
printf '#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:0\n' > "$pl"
i=0
while [ "$i" -lt "$count" ]; do
  head -c 4096 /dev/zero > "$dir/$(printf 'segment_%03d.ts' "$i")"
  printf '#EXTINF:2.000,\n' >> "$pl"
  printf 'segment_%03d.ts\n' "$i" >> "$pl"
  if [ "$fail_after" -ge 0 ] && [ "$i" -ge "$fail_after" ]; then
    exit 1
  fi
  i=$((i+1))
done
printf '#EXT-X-ENDLIST\n' >> "$pl"
while :; do sleep 1; done
"#
    );
    let path = dir.join(name);
    std::fs::write(&path, script).unwrap();
    make_executable(&path);
    path
}

/// A transcoder that exits immediately without producing anything.
pub fn write_broken_transcoder(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, "#!/bin/sh\nexit 2\n").unwrap();
    make_executable(&path);
    path
}

fn make_executable(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

/// Fast timeouts so lifecycle tests finish in seconds.
pub fn test_streaming_config(ffmpeg_command: &Path) -> StreamingConfig {
    StreamingConfig {
        ffmpeg_command: ffmpeg_command.to_string_lossy().into_owned(),
        ffprobe_command: "ffprobe".to_string(),
        segment_duration_secs: 2,
        idle_timeout_secs: 1,
        segment_wait_timeout_secs: 3,
        segment_timeout_secs: 1,
        session_startup_timeout_secs: 5,
        runner_stop_grace_secs: 1,
        max_retries: 3,
        max_concurrent_sessions: None,
        sweep_interval_secs: 1,
        monitor_poll_millis: 50,
    }
}

pub fn test_config(root: &Path, streaming: StreamingConfig) -> Config {
    Config {
        web: WebConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        storage: StorageConfig {
            config_dir: root.to_path_buf(),
        },
        streaming,
        metadata: MetadataConfig {
            base_url: None,
            api_key: None,
            request_timeout_secs: 5,
            cache_ttl_secs: 60,
        },
        path_mappings: Vec::new(),
    }
}

/// In-memory `MetadataSource` for router tests.
pub struct StubMetadata {
    scenes: HashMap<String, SceneSource>,
}

impl StubMetadata {
    pub fn new() -> Self {
        Self {
            scenes: HashMap::new(),
        }
    }

    pub fn with_scene(mut self, id: &str, scene: SceneSource) -> Self {
        self.scenes.insert(id.to_string(), scene);
        self
    }
}

#[async_trait]
impl MetadataSource for StubMetadata {
    async fn resolve_scene(&self, scene_id: &str) -> Result<SceneSource, MetadataError> {
        self.scenes
            .get(scene_id)
            .cloned()
            .ok_or_else(|| MetadataError::NotFound {
                scene_id: scene_id.to_string(),
            })
    }
}

pub fn scene(path: &Path, duration_secs: f64, height: u32) -> SceneSource {
    SceneSource {
        path: path.to_string_lossy().into_owned(),
        duration_secs,
        source_width: Some(height * 16 / 9),
        source_height: Some(height),
        source_codec: Some("h264".to_string()),
        variants: Vec::new(),
        is_streamable: false,
    }
}

/// Full application state over a stub metadata source and a fake transcoder.
pub fn test_state(config: Config, metadata: Option<Arc<dyn MetadataSource>>) -> AppState {
    let manager = SessionManager::new(&config);
    std::fs::create_dir_all(config.sessions_dir()).unwrap();
    AppState {
        path_mapper: Arc::new(PathMapper::new(&config.path_mappings)),
        variant_proxy: Arc::new(VariantProxy::new(reqwest::Client::new())),
        config: Arc::new(config),
        started_at: chrono::Utc::now(),
        manager,
        metadata,
        prober: None,
        ffmpeg: Arc::new(ToolInfo {
            command: "fake-transcoder".to_string(),
            available: true,
            version: Some("test".to_string()),
        }),
        ffprobe: Arc::new(ToolInfo {
            command: "ffprobe".to_string(),
            available: false,
            version: None,
        }),
    }
}

/// A dummy media file path inside the temp root; the fake transcoder never
/// reads it.
pub fn dummy_input(root: &Path) -> PathBuf {
    let path = root.join("input.mp4");
    std::fs::write(&path, b"not really media").unwrap();
    path
}
