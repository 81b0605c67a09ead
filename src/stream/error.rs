//! Error types for the streaming transport.

use thiserror::Error;

/// Fatal transport failures. Framing and payload anomalies never end up here.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The request could not be sent or the body failed mid-stream.
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// The initial response carried a non-success status.
    #[error("Stream rejected with status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Body excerpt, if any.
        body: String,
    },

    /// Request body serialization failed.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The stream URL is invalid.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The session was cancelled by the caller.
    #[error("Stream cancelled")]
    Cancelled,

    /// The read loop task ended abnormally.
    #[error("Stream task aborted: {0}")]
    Aborted(String),
}

impl StreamError {
    /// Whether the error only reflects a caller-side cancellation.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// HTTP status of a rejected stream.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::HttpRequest(err) => err.status().map(|status| status.as_u16()),
            _ => None,
        }
    }
}

/// Result alias for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;
