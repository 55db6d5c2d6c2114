use thiserror::Error;

// Basic error handling with thiserror
#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("Content reference has neither a provider id nor an alternate id")]
    MissingIdentifiers,

    #[error("Stream URL lookup failed: {0}")]
    LookupFailed(String),

    #[error("Embed reported a runtime fault: {0}")]
    EmbedFault(String),

    #[error("Progress record rejected: {0}")]
    PersistRejected(String),

    #[error("Interceptor installation failed: {0}")]
    GuardInstall(String),

    #[error("Host page operation failed: {0}")]
    HostPage(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    ParseFailed(#[from] serde_json::Error),

    #[error("URL encoding failed: {0}")]
    UrlEncodingFailed(#[from] serde_urlencoded::ser::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid message denylist: {0}")]
    InvalidDenylist(#[from] regex::Error),
}

/// Session-level classification of a failure, surfaced through
/// [`PlaybackSessionState::last_error`](crate::PlaybackSessionState).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No identifiers were available, or the URL lookup failed. Retryable.
    Resolution,
    /// The embed signaled its own failure while playing. Retryable in place.
    EmbedRuntime,
    /// The progress record was rejected. Logged only.
    Persist,
    /// Interceptor installation failed. Playback continues with degraded isolation.
    GuardAcquisition,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Resolution => "ResolutionError",
            ErrorKind::EmbedRuntime => "EmbedRuntimeError",
            ErrorKind::Persist => "PersistError",
            ErrorKind::GuardAcquisition => "GuardAcquisitionError",
        }
    }

    /// Whether the user can recover from this kind via the retry action.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Resolution | ErrorKind::EmbedRuntime)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
