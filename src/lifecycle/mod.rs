//! Conversation and task lifecycle.
//!
//! Ids and records, the client context, the ensure-exists orchestrator and the
//! runner that ties a submission to its stream.

pub mod context;
pub mod error;
pub mod ids;
pub mod orchestrator;
pub mod runner;
pub mod types;

pub use context::ClientContext;
pub use error::{LifecycleError, LifecycleResult};
pub use ids::{ConversationId, CorrelationId, TaskId};
pub use orchestrator::{DEFAULT_CONVERSATION_TITLE, LifecycleOrchestrator, TaskBackend};
pub use runner::{SubmitRequest, TaskRunner, TranscriptWriter, queue_position};
pub use types::{
    Conversation, CreateConversation, CreateTask, QueueLength, Task, TaskDetails, TaskHistory,
    TaskListQuery, TaskPartition, TaskStatus, TaskType, partition_tasks,
};
