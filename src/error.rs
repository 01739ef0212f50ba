use thiserror::Error;

use crate::registry::Operation;

/// Every way a fetch against an upstream backend can fail. Fetch operations
/// absorb these into an empty result and log them with [`FetchError::kind`].
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("upstream request timed out")]
    Timeout,

    #[error("upstream returned HTTP {status}")]
    Status { status: u16 },

    #[error("upstream payload is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("payload has no result list at {expected}")]
    ShapeMismatch { expected: String },

    #[error("upstream returned an empty result list")]
    EmptyResult,

    #[error("no upstream backend available")]
    NoBackend,

    #[error("upstream session is closed")]
    SessionClosed,

    #[error("{backend} does not support {operation}")]
    Unsupported {
        backend: String,
        operation: Operation,
    },

    #[error("missing request parameter `{name}`")]
    MissingParam { name: String },

    #[error("invalid value {value:?} for request parameter `{name}`")]
    InvalidParam { name: String, value: String },

    #[error("invalid upstream url: {0}")]
    Url(#[from] url::ParseError),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Transport(err)
        }
    }
}

impl FetchError {
    /// Stable label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Transport(_) => "transport",
            FetchError::Timeout => "timeout",
            FetchError::Status { .. } => "status",
            FetchError::Decode(_) => "decode",
            FetchError::ShapeMismatch { .. } => "shape_mismatch",
            FetchError::EmptyResult => "empty",
            FetchError::NoBackend => "no_backend",
            FetchError::SessionClosed => "session_closed",
            FetchError::Unsupported { .. } => "unsupported",
            FetchError::MissingParam { .. }
            | FetchError::InvalidParam { .. }
            | FetchError::Url(_) => "request",
        }
    }

    /// True when the backend itself could not be reached or answered badly.
    pub fn is_upstream_unavailable(&self) -> bool {
        matches!(
            self,
            FetchError::Transport(_) | FetchError::Timeout | FetchError::Status { .. }
        )
    }
}
