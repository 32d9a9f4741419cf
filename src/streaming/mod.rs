//! The transcoding session core.
//!
//! One live session exists per `(scene_id, quality)`. A session owns an
//! exclusive output directory, a `SegmentIndex` tracking per-segment state,
//! and a supervisor that runs at most one transcoder process at a time. The
//! transcoder numbers its output from zero regardless of the seek offset; a
//! monitor task renames finalized files onto the timeline-absolute numbering
//! that playlists declare, and signals waiting segment requests.

use tracing::warn;

pub mod command;
pub mod index;
pub mod manager;
pub mod monitor;
pub mod runner;
pub mod session;
pub mod supervisor;

pub use index::{SegmentIndex, WaitOutcome};
pub use manager::SessionManager;
pub use session::StreamSession;

/// Availability and version of an external tool, probed once at startup.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub command: String,
    pub available: bool,
    pub version: Option<String>,
}

/// Check whether a transcoder/prober command is runnable and extract its
/// version from the first line of `<command> -version`.
pub async fn check_tool_availability(command: &str) -> ToolInfo {
    match tokio::process::Command::new(command)
        .arg("-version")
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let version = stdout
                .lines()
                .next()
                .and_then(|line| line.split_whitespace().nth(2))
                .map(|v| v.to_string());
            ToolInfo {
                command: command.to_string(),
                available: true,
                version,
            }
        }
        Ok(output) => {
            warn!("Command '{}' failed with status: {}", command, output.status);
            ToolInfo {
                command: command.to_string(),
                available: false,
                version: None,
            }
        }
        Err(e) => {
            warn!("Failed to execute command '{}': {}", command, e);
            ToolInfo {
                command: command.to_string(),
                available: false,
                version: None,
            }
        }
    }
}
