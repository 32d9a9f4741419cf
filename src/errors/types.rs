use thiserror::Error;

/// Errors surfaced by the transcoding session core
#[derive(Error, Debug)]
pub enum StreamError {
    /// The metadata service does not know this scene
    #[error("Scene not found: {scene_id}")]
    SceneNotFound { scene_id: String },

    /// Quality parameter missing, unknown, or exceeding the source height
    #[error("Quality not allowed: {quality} - {reason}")]
    QualityNotAllowed { quality: String, reason: String },

    /// Segment path component did not parse as `segment_<n>.ts`
    #[error("Invalid segment name: {name}")]
    InvalidSegment { name: String },

    /// The metadata service is not reachable or not yet initialized
    #[error("Metadata unavailable: {message}")]
    MetadataUnavailable { message: String },

    /// The upstream-reported path has no local mapping
    #[error("No path mapping for: {path}")]
    PathNotMapped { path: String },

    /// The transcoder could not be started or produced no output in time
    #[error("Transcoder startup failed: {message}")]
    StartupFailed { message: String },

    /// The transcoder exited abnormally while the session was live
    #[error("Transcoder failed: {message}")]
    RunnerFailed { message: String },

    /// A segment wait hit its deadline before the segment finalized
    #[error("Timed out waiting for segment {segment}")]
    WaitTimeout { segment: u64 },

    /// The session was torn down while the request was waiting
    #[error("Session no longer exists")]
    SessionGone,

    /// No session exists for the requested key
    #[error("No session for key: {key}")]
    SessionNotFound { key: String },

    /// Filesystem errors from session directories and segment files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl StreamError {
    /// Create a quality rejection with a custom reason
    pub fn quality_not_allowed<Q: Into<String>, R: Into<String>>(quality: Q, reason: R) -> Self {
        Self::QualityNotAllowed {
            quality: quality.into(),
            reason: reason.into(),
        }
    }

    /// Create a startup failure
    pub fn startup_failed<S: Into<String>>(message: S) -> Self {
        Self::StartupFailed {
            message: message.into(),
        }
    }

    /// Create a runner failure
    pub fn runner_failed<S: Into<String>>(message: S) -> Self {
        Self::RunnerFailed {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Errors surfaced by the variant passthrough path
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The scene does not advertise the requested variant
    #[error("Variant not found: {variant} for scene {scene_id}")]
    VariantNotFound { scene_id: String, variant: String },

    /// The upstream server answered with a non-success status
    #[error("Upstream error: {status} for {url}")]
    Upstream { status: u16, url: String },

    /// The upstream manifest could not be interpreted
    #[error("Manifest error: {message}")]
    Manifest { message: String },

    /// The rewritten manifest does not contain the requested segment
    #[error("Unknown proxied segment {segment} for scene {scene_id}")]
    SegmentNotFound { scene_id: String, segment: u64 },

    /// Transport errors talking to the upstream server
    #[error("Upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl ProxyError {
    /// Create a manifest interpretation error
    pub fn manifest<S: Into<String>>(message: S) -> Self {
        Self::Manifest {
            message: message.into(),
        }
    }
}

/// Errors from the upstream metadata service
#[derive(Error, Debug)]
pub enum MetadataError {
    /// The service does not know this scene
    #[error("Scene not found: {scene_id}")]
    NotFound { scene_id: String },

    /// The service is unreachable or not yet initialized
    #[error("Metadata service unavailable: {message}")]
    Unavailable { message: String },

    /// The service answered with something we could not decode
    #[error("Metadata decode error: {message}")]
    Decode { message: String },

    /// Transport errors talking to the service
    #[error("Metadata request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl MetadataError {
    /// Create an unavailability error
    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

impl From<MetadataError> for StreamError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::NotFound { scene_id } => StreamError::SceneNotFound { scene_id },
            MetadataError::Unavailable { message } => StreamError::MetadataUnavailable { message },
            MetadataError::Decode { message } => StreamError::MetadataUnavailable { message },
            MetadataError::Request(e) => StreamError::MetadataUnavailable {
                message: e.to_string(),
            },
        }
    }
}
