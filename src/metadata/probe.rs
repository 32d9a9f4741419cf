//! Local file probing fallback.
//!
//! Some upstream deployments omit dimensions or duration for freshly scanned
//! scenes. When that happens the file is probed once with ffprobe and the
//! result cached, so quality eligibility and playlist generation still work.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ProbedSource {
    pub duration_secs: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub video_codec: Option<String>,
}

pub struct SourceProber {
    ffprobe_command: String,
    probe_timeout: Duration,
    cache: RwLock<HashMap<String, ProbedSource>>,
}

impl SourceProber {
    pub fn new(ffprobe_command: impl Into<String>) -> Self {
        Self {
            ffprobe_command: ffprobe_command.into(),
            probe_timeout: Duration::from_secs(10),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Probe a local file, returning cached results on repeat calls.
    pub async fn probe(&self, path: &Path) -> Result<ProbedSource> {
        let key = path.to_string_lossy().to_string();
        {
            let cache = self.cache.read().await;
            if let Some(hit) = cache.get(&key) {
                return Ok(hit.clone());
            }
        }

        debug!(path = %path.display(), "Probing source file");

        let mut cmd = Command::new(&self.ffprobe_command);
        cmd.args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ]);
        cmd.arg(path);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = tokio::time::timeout(self.probe_timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("ffprobe timeout after {:?}", self.probe_timeout))?
            .map_err(|e| anyhow!("failed to execute ffprobe: {e}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(path = %path.display(), "ffprobe failed: {}", stderr.trim());
            return Err(anyhow!("ffprobe failed: {}", stderr.trim()));
        }

        let data: serde_json::Value = serde_json::from_str(&String::from_utf8_lossy(&output.stdout))
            .map_err(|e| anyhow!("failed to parse ffprobe output: {e}"))?;

        let probed = parse_probe_output(&data);

        let mut cache = self.cache.write().await;
        cache.insert(key, probed.clone());
        Ok(probed)
    }
}

fn parse_probe_output(data: &serde_json::Value) -> ProbedSource {
    let mut probed = ProbedSource {
        duration_secs: data["format"]["duration"]
            .as_str()
            .and_then(|s| s.parse().ok()),
        width: None,
        height: None,
        video_codec: None,
    };

    if let Some(streams) = data["streams"].as_array() {
        for stream in streams {
            if stream["codec_type"].as_str() == Some("video") {
                probed.width = stream["width"].as_u64().map(|v| v as u32);
                probed.height = stream["height"].as_u64().map(|v| v as u32);
                probed.video_codec = stream["codec_name"].as_str().map(|s| s.to_string());
                break;
            }
        }
    }

    probed
}
