//! HLS playlist generation for VOD master and media playlists.
//!
//! Playlists are declared for the whole asset up-front so clients can render
//! timeline controls before any segment has been produced. These functions
//! are pure; nothing here touches a session.

use std::fmt::Write as FmtWrite;

use crate::models::QualityLevel;

/// Nominal bandwidth advertised for `direct` playback, where no encoding
/// preset constrains the bitrate.
const DIRECT_BANDWIDTH_BITS: u64 = 20_000_000;

/// Generate the master playlist for one requested quality.
///
/// The server emits a single-variant master; clients switch quality by
/// re-requesting with a different `quality` parameter.
pub fn master_playlist(
    quality: QualityLevel,
    source_width: Option<u32>,
    source_height: Option<u32>,
    start_sec: f64,
) -> String {
    let mut m3u8 = String::with_capacity(256);
    writeln!(m3u8, "#EXTM3U").unwrap();
    writeln!(m3u8, "#EXT-X-VERSION:3").unwrap();

    let mut attrs = String::new();
    match quality.preset() {
        Some(preset) => {
            let bandwidth =
                u64::from(preset.video_bitrate_kbps + preset.audio_bitrate_kbps) * 1000;
            write!(attrs, "BANDWIDTH={bandwidth}").unwrap();
            write!(attrs, ",RESOLUTION={}x{}", preset.width, preset.height).unwrap();
        }
        None => {
            write!(attrs, "BANDWIDTH={DIRECT_BANDWIDTH_BITS}").unwrap();
            if let (Some(w), Some(h)) = (source_width, source_height) {
                write!(attrs, ",RESOLUTION={w}x{h}").unwrap();
            }
        }
    }
    writeln!(m3u8, "#EXT-X-STREAM-INF:{attrs}").unwrap();

    let mut uri = format!("index.m3u8?quality={quality}");
    if start_sec > 0.0 {
        write!(uri, "&start={start_sec}").unwrap();
    }
    writeln!(m3u8, "{uri}").unwrap();
    m3u8
}

/// Generate the full media playlist for an asset.
///
/// Every `#EXTINF` is `segment_secs` except the last, which covers the
/// remainder. Segment URIs carry the quality parameter so that segment
/// requests resolve back to the owning session.
pub fn media_playlist(duration_secs: f64, segment_secs: u64, quality: QualityLevel) -> String {
    let count = segment_count(duration_secs, segment_secs);
    let seg = segment_secs as f64;

    let mut m3u8 = String::with_capacity(64 + count as usize * 48);
    writeln!(m3u8, "#EXTM3U").unwrap();
    writeln!(m3u8, "#EXT-X-VERSION:3").unwrap();
    writeln!(m3u8, "#EXT-X-TARGETDURATION:{segment_secs}").unwrap();
    writeln!(m3u8, "#EXT-X-PLAYLIST-TYPE:VOD").unwrap();
    writeln!(m3u8, "#EXT-X-MEDIA-SEQUENCE:0").unwrap();

    for n in 0..count {
        let duration = if n + 1 == count {
            duration_secs - seg * (count - 1) as f64
        } else {
            seg
        };
        writeln!(m3u8, "#EXTINF:{duration:.3},").unwrap();
        writeln!(m3u8, "{}?quality={quality}", segment_file_name(n)).unwrap();
    }

    writeln!(m3u8, "#EXT-X-ENDLIST").unwrap();
    m3u8
}

/// Total number of segments covering an asset: `ceil(duration / segment)`.
pub fn segment_count(duration_secs: f64, segment_secs: u64) -> u64 {
    (duration_secs / segment_secs as f64).ceil() as u64
}

/// Timeline-absolute segment file name, `segment_000.ts` style.
pub fn segment_file_name(n: u64) -> String {
    format!("segment_{n:03}.ts")
}

/// Parse a timeline segment file name back into its number.
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    let stem = name.strip_prefix("segment_")?.strip_suffix(".ts")?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}
