//! Error types for the task server client.

use thiserror::Error;

/// Errors returned by [`ApiClient`](super::ApiClient) calls.
#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// HTTP client configuration error.
    #[error("HTTP client error: {0}")]
    HttpClient(String),

    /// The server answered with a non-success status.
    #[error("Server returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Body excerpt.
        body: String,
    },

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// JSON parsing error.
    #[error("JSON parsing error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// The response lacked a field the client requires.
    #[error("Missing field in response: {0}")]
    MissingField(&'static str),

    /// Request timed out.
    #[error("Request timed out")]
    Timeout,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl ApiError {
    /// Check if this error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::HttpRequest(err) => err.is_timeout() || err.is_connect(),
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// HTTP status, when the server answered.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::HttpRequest(err) => err.status().map(|status| status.as_u16()),
            _ => None,
        }
    }
}

/// Result alias for API calls.
pub type ApiResult<T> = Result<T, ApiError>;
