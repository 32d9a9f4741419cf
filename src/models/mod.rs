//! Domain model types shared across the streaming core and the web layer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Registry key for a transcoding session.
///
/// One session exists per `(scene_id, quality)` pair. The string form used by
/// the admin endpoints is `<scene_id>@<quality>`, e.g. `42@720p`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub scene_id: String,
    pub quality: QualityLevel,
}

impl SessionKey {
    pub fn new(scene_id: impl Into<String>, quality: QualityLevel) -> Self {
        Self {
            scene_id: scene_id.into(),
            quality,
        }
    }

    /// Parse the admin-endpoint form `<scene_id>@<quality>`.
    pub fn parse(s: &str) -> Option<Self> {
        let (scene_id, quality) = s.rsplit_once('@')?;
        if scene_id.is_empty() {
            return None;
        }
        Some(Self {
            scene_id: scene_id.to_string(),
            quality: quality.parse().ok()?,
        })
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.scene_id, self.quality)
    }
}

/// The fixed set of client-selectable quality levels.
///
/// `Direct` remuxes the source streams without re-encoding; the others
/// transcode to H.264/AAC at the preset resolution and bitrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Direct,
    #[serde(rename = "2160p")]
    Q2160,
    #[serde(rename = "1080p")]
    Q1080,
    #[serde(rename = "720p")]
    Q720,
    #[serde(rename = "480p")]
    Q480,
    #[serde(rename = "360p")]
    Q360,
}

impl QualityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityLevel::Direct => "direct",
            QualityLevel::Q2160 => "2160p",
            QualityLevel::Q1080 => "1080p",
            QualityLevel::Q720 => "720p",
            QualityLevel::Q480 => "480p",
            QualityLevel::Q360 => "360p",
        }
    }

    pub fn all() -> &'static [QualityLevel] {
        &[
            QualityLevel::Direct,
            QualityLevel::Q2160,
            QualityLevel::Q1080,
            QualityLevel::Q720,
            QualityLevel::Q480,
            QualityLevel::Q360,
        ]
    }

    /// Encoding preset for this level. `None` for `Direct` (stream copy).
    pub fn preset(&self) -> Option<&'static QualityPreset> {
        match self {
            QualityLevel::Direct => None,
            QualityLevel::Q2160 => Some(&QualityPreset {
                label: "2160p",
                width: 3840,
                height: 2160,
                video_bitrate_kbps: 18000,
                audio_bitrate_kbps: 192,
            }),
            QualityLevel::Q1080 => Some(&QualityPreset {
                label: "1080p",
                width: 1920,
                height: 1080,
                video_bitrate_kbps: 8000,
                audio_bitrate_kbps: 192,
            }),
            QualityLevel::Q720 => Some(&QualityPreset {
                label: "720p",
                width: 1280,
                height: 720,
                video_bitrate_kbps: 4000,
                audio_bitrate_kbps: 128,
            }),
            QualityLevel::Q480 => Some(&QualityPreset {
                label: "480p",
                width: 854,
                height: 480,
                video_bitrate_kbps: 2000,
                audio_bitrate_kbps: 128,
            }),
            QualityLevel::Q360 => Some(&QualityPreset {
                label: "360p",
                width: 640,
                height: 360,
                video_bitrate_kbps: 1000,
                audio_bitrate_kbps: 96,
            }),
        }
    }

    /// Whether this level may be requested for a source of the given height.
    ///
    /// `Direct` is always allowed; an encoding preset must not upscale.
    /// Sources with unknown height only accept `Direct`.
    pub fn eligible_for(&self, source_height: Option<u32>) -> bool {
        match self.preset() {
            None => true,
            Some(preset) => source_height.is_some_and(|h| preset.height <= h),
        }
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(QualityLevel::Direct),
            "2160p" => Ok(QualityLevel::Q2160),
            "1080p" => Ok(QualityLevel::Q1080),
            "720p" => Ok(QualityLevel::Q720),
            "480p" => Ok(QualityLevel::Q480),
            "360p" => Ok(QualityLevel::Q360),
            other => Err(format!("unknown quality level '{other}'")),
        }
    }
}

/// Encoding parameters for a non-direct quality level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QualityPreset {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
}

/// A scene as resolved by the upstream metadata service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneSource {
    /// File path as reported by the upstream service (pre path-mapping).
    pub path: String,
    pub duration_secs: f64,
    pub source_width: Option<u32>,
    pub source_height: Option<u32>,
    pub source_codec: Option<String>,
    /// Pre-generated stream variants served by the proxy path.
    #[serde(default)]
    pub variants: Vec<StreamVariant>,
    #[serde(default)]
    pub is_streamable: bool,
}

/// A pre-transcoded variant advertised by the metadata service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamVariant {
    pub label: String,
    pub manifest_url: String,
}

impl SceneSource {
    pub fn variant(&self, label: &str) -> Option<&StreamVariant> {
        self.variants.iter().find(|v| v.label == label)
    }
}

/// Lifecycle state of a transcoding session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Active,
    Restarting,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    /// Valid lifecycle transitions. Anything else is a programming error.
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Starting, Active)
                | (Starting, Failed)
                | (Starting, Stopping)
                | (Active, Restarting)
                | (Active, Stopping)
                | (Active, Failed)
                | (Restarting, Active)
                | (Restarting, Failed)
                | (Restarting, Stopping)
                | (Stopping, Stopped)
                | (Failed, Stopping)
        )
    }

    pub fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Active | SessionState::Restarting
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Restarting => "restarting",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// State of a single timeline segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentState {
    Waiting,
    Transcoding,
    Completed,
    Failed,
}

impl SegmentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SegmentState::Completed | SegmentState::Failed)
    }
}

/// A progress report parsed from a transcoder stderr line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TranscodeProgress {
    /// Position in the output timeline, seconds.
    pub timecode_secs: f64,
    /// Encode speed relative to realtime, e.g. `1.5` for "1.5x".
    pub speed: f64,
}

/// Session summary for the admin list endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub key: String,
    pub session_id: String,
    pub state: SessionState,
    pub start_sec: f64,
    pub last_activity_age_ms: u64,
}

/// Session status for `GET /session/{key}/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: SessionState,
    pub start_sec: f64,
    pub produced_end: u64,
    pub completed: u64,
    pub transcoding: u64,
    pub failed: u64,
    pub waiting: u64,
    pub last_activity_age_ms: u64,
    /// Timeline position of the live encode, when a runner is active and
    /// has reported progress.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcode_position_secs: Option<f64>,
    /// Encode speed relative to realtime.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcode_speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage_mb: Option<f64>,
}

/// Per-segment entry for `GET /session/{key}/segments`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentEntry {
    pub n: u64,
    pub state: SegmentState,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_round_trips_through_str() {
        for level in QualityLevel::all() {
            assert_eq!(level.as_str().parse::<QualityLevel>().unwrap(), *level);
        }
        assert!("4k".parse::<QualityLevel>().is_err());
    }

    #[test]
    fn eligibility_never_upscales() {
        assert!(QualityLevel::Direct.eligible_for(None));
        assert!(QualityLevel::Direct.eligible_for(Some(480)));
        assert!(QualityLevel::Q480.eligible_for(Some(1080)));
        assert!(QualityLevel::Q1080.eligible_for(Some(1080)));
        assert!(!QualityLevel::Q2160.eligible_for(Some(1080)));
        assert!(!QualityLevel::Q480.eligible_for(None));
    }

    #[test]
    fn session_key_parses_admin_form() {
        let key = SessionKey::parse("scene-7@480p").unwrap();
        assert_eq!(key.scene_id, "scene-7");
        assert_eq!(key.quality, QualityLevel::Q480);
        assert_eq!(key.to_string(), "scene-7@480p");

        // Scene ids may themselves contain '@'; the quality is the last part.
        let key = SessionKey::parse("a@b@720p").unwrap();
        assert_eq!(key.scene_id, "a@b");

        assert!(SessionKey::parse("no-quality").is_none());
        assert!(SessionKey::parse("@720p").is_none());
        assert!(SessionKey::parse("x@4k").is_none());
    }

    #[test]
    fn state_transitions_are_validated() {
        use SessionState::*;
        assert!(Starting.can_transition(Active));
        assert!(Active.can_transition(Restarting));
        assert!(Restarting.can_transition(Active));
        assert!(Stopping.can_transition(Stopped));
        assert!(!Stopped.can_transition(Active));
        assert!(!Starting.can_transition(Restarting));
    }
}
