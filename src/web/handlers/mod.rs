pub mod health;
pub mod proxy;
pub mod sessions;
pub mod stream;

/// Content type for HLS playlists.
pub const MPEGURL_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Content type for MPEG-TS segments.
pub const MPEGTS_CONTENT_TYPE: &str = "video/mp2t";
