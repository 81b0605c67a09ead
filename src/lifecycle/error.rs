//! Error types for the task lifecycle.

use thiserror::Error;

use crate::api::ApiError;
use crate::stream::StreamError;

/// Failures that abort a task submission.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// No conversation could be ensured.
    #[error("could not create conversation: {0}")]
    ConversationUnavailable(#[source] ApiError),

    /// No task could be ensured.
    #[error("could not create task: {0}")]
    TaskUnavailable(#[source] ApiError),

    /// A stream session is already running for this runner.
    #[error("a stream session is already active")]
    SessionActive,

    /// Another writer holds the transcript.
    #[error("transcript is held by another stream writer")]
    TranscriptBusy,

    /// A backend call failed.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The stream could not be set up.
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Result alias for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;
