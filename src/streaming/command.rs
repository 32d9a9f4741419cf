//! Transcoder command composition.
//!
//! Builds the ffmpeg argument list for one runner invocation. The contract
//! with the rest of the core: seek before decode, fixed GOP aligned to the
//! segment duration, an MPEG-TS segmented VOD output numbered from zero in
//! the run directory, and a `stream.m3u8` the monitor reads to detect
//! finalized segments.

use std::path::Path;

use crate::models::QualityPreset;

/// File name of the transcoder-maintained playlist inside a run directory.
pub const RUNNER_PLAYLIST: &str = "stream.m3u8";

/// Segment naming pattern the transcoder writes (0-based, run-local).
pub const RUNNER_SEGMENT_PATTERN: &str = "segment_%03d.ts";

#[derive(Debug)]
pub struct TranscodeRequest<'a> {
    pub input: &'a Path,
    pub start_sec: f64,
    /// Encoding preset; `None` copies both streams (direct remux).
    pub preset: Option<&'a QualityPreset>,
    pub segment_secs: u64,
    pub run_dir: &'a Path,
}

/// Compose the full ffmpeg argument list for a runner invocation.
pub fn build_transcode_args(req: &TranscodeRequest<'_>) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-y".into()];

    // Seek before decode; -ss ahead of -i is the fast input seek.
    if req.start_sec > 0.0 {
        args.extend(["-ss".into(), format!("{:.3}", req.start_sec)]);
    }

    args.extend(["-i".into(), req.input.to_string_lossy().into_owned()]);

    // First video stream, first audio stream if present.
    args.extend(["-map".into(), "0:v:0".into()]);
    args.extend(["-map".into(), "0:a:0?".into()]);

    match req.preset {
        Some(preset) => {
            args.extend(["-c:v".into(), "libx264".into()]);
            args.extend(["-preset".into(), "veryfast".into()]);
            args.extend(["-b:v".into(), format!("{}k", preset.video_bitrate_kbps)]);
            args.extend(["-maxrate".into(), format!("{}k", preset.video_bitrate_kbps)]);
            args.extend([
                "-bufsize".into(),
                format!("{}k", preset.video_bitrate_kbps * 2),
            ]);
            // -2 keeps the width divisible by two for yuv420p.
            args.extend(["-vf".into(), format!("scale=-2:{}", preset.height)]);
            // Key frames on every segment boundary so cuts land exactly.
            args.extend([
                "-force_key_frames".into(),
                format!("expr:gte(t,n_forced*{})", req.segment_secs),
            ]);
            args.extend(["-sc_threshold".into(), "0".into()]);
            args.extend(["-c:a".into(), "aac".into()]);
            args.extend(["-b:a".into(), format!("{}k", preset.audio_bitrate_kbps)]);
            args.extend(["-ac".into(), "2".into()]);
        }
        None => {
            // Direct: remux only, no re-encode.
            args.extend(["-c:v".into(), "copy".into()]);
            args.extend(["-c:a".into(), "copy".into()]);
        }
    }

    args.extend(["-f".into(), "hls".into()]);
    args.extend(["-hls_time".into(), req.segment_secs.to_string()]);
    args.extend(["-hls_playlist_type".into(), "vod".into()]);
    args.extend(["-hls_list_size".into(), "0".into()]);
    args.extend(["-start_number".into(), "0".into()]);
    args.extend([
        "-hls_segment_filename".into(),
        req.run_dir
            .join(RUNNER_SEGMENT_PATTERN)
            .to_string_lossy()
            .into_owned(),
    ]);
    args.push(
        req.run_dir
            .join(RUNNER_PLAYLIST)
            .to_string_lossy()
            .into_owned(),
    );

    args
}
