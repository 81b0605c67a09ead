//! Task and conversation records exchanged with the task server.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::lifecycle::ids::{ConversationId, CorrelationId, TaskId};
use crate::transcript::message::{Message, MessageStatus, Role};

/// Default page size of a task listing.
pub const DEFAULT_LIST_LIMIT: u32 = 50;

/// Kind of work a task performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Generate a geometric model.
    Geometry,
    /// Run a design optimization.
    Optimize,
    /// Answer from a knowledge base.
    Retrieval,
}

impl TaskType {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Geometry => "geometry",
            Self::Optimize => "optimize",
            Self::Retrieval => "retrieval",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "geometry" => Ok(Self::Geometry),
            "optimize" => Ok(Self::Optimize),
            "retrieval" => Ok(Self::Retrieval),
            other => Err(format!("unknown task type: {other}")),
        }
    }
}

/// Server-side progress of a task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet submitted.
    #[default]
    Pending,
    /// Waiting in the backend queue.
    Queued,
    /// Running.
    #[serde(alias = "in_progress", alias = "running")]
    Processing,
    /// Finished.
    #[serde(alias = "completed", alias = "success")]
    Done,
    /// Failed.
    #[serde(alias = "error")]
    Failed,
}

impl TaskStatus {
    /// Whether the task will not progress anymore.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Infer a task's status from the last message of its transcript.
    #[must_use]
    pub fn from_message(message: &Message) -> Self {
        if message.role == Role::User {
            return Self::Pending;
        }
        match message.status {
            MessageStatus::Done => Self::Done,
            MessageStatus::Failed => Self::Failed,
            MessageStatus::Streaming | MessageStatus::InProgress => {
                let queued = message
                    .metadata
                    .get("queue_position")
                    .and_then(Value::as_u64)
                    .is_some_and(|position| position > 0);
                if queued { Self::Queued } else { Self::Processing }
            }
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A unit of work inside a conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Server id.
    pub task_id: TaskId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Kind of work.
    pub task_type: TaskType,
    /// Progress.
    #[serde(default)]
    pub status: TaskStatus,
    /// Free-form details supplied at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Creation time, when the server reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// A group of tasks and messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Server id.
    pub conversation_id: ConversationId,
    /// Title.
    #[serde(default)]
    pub title: String,
    /// Creation time, when the server reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Body of the create-conversation call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateConversation {
    /// Title hint.
    pub title: String,
    /// Client correlation id.
    pub conversation_id: CorrelationId,
}

/// Creation details of a task.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDetails {
    /// Query excerpt.
    pub query: String,
    /// Attached file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// Body of the create-task call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTask {
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Kind of work.
    pub task_type: TaskType,
    /// Creation details.
    pub details: TaskDetails,
}

/// Response of the task history endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskHistory {
    /// Messages of the task, oldest first.
    #[serde(default, rename = "message", alias = "messages")]
    pub messages: Vec<Message>,
}

/// Filter of the task list endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskListQuery {
    /// Only tasks in this status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    /// Page size.
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Page offset.
    #[serde(default)]
    pub offset: u32,
}

const fn default_limit() -> u32 {
    DEFAULT_LIST_LIMIT
}

impl Default for TaskListQuery {
    fn default() -> Self {
        Self {
            status: None,
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
        }
    }
}

impl TaskListQuery {
    /// Only tasks in `status`.
    #[must_use]
    pub const fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Snapshot of the optimization queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueLength {
    /// Tasks waiting in the queue.
    #[serde(default)]
    pub length: u64,
    /// Tasks currently running.
    #[serde(default)]
    pub running: u64,
}

/// Tasks split by completion.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskPartition {
    /// Every task whose status is not `done`.
    pub in_flight: Vec<Task>,
    /// Tasks whose status is `done`.
    pub completed: Vec<Task>,
}

/// Split a task listing into in-flight and completed tasks, keeping order.
#[must_use]
pub fn partition_tasks(tasks: Vec<Task>) -> TaskPartition {
    let (completed, in_flight) = tasks
        .into_iter()
        .partition(|task| task.status == TaskStatus::Done);
    TaskPartition {
        in_flight,
        completed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(id: &str, status: TaskStatus) -> Task {
        Task {
            task_id: TaskId::from(id),
            conversation_id: ConversationId::from("c"),
            task_type: TaskType::Optimize,
            status,
            details: None,
            created_at: None,
        }
    }

    #[test]
    fn test_status_aliases() {
        let status: TaskStatus = serde_json::from_value(json!("in_progress")).unwrap();
        assert_eq!(status, TaskStatus::Processing);
        let status: TaskStatus = serde_json::from_value(json!("completed")).unwrap();
        assert_eq!(status, TaskStatus::Done);
    }

    #[test]
    fn test_status_from_message() {
        assert_eq!(TaskStatus::from_message(&Message::user("q")), TaskStatus::Pending);
        assert_eq!(TaskStatus::from_message(&Message::agent("a")), TaskStatus::Done);

        let queued = Message::agent_placeholder(None).with_metadata("queue_position", 3);
        assert_eq!(TaskStatus::from_message(&queued), TaskStatus::Queued);
        let running = Message::agent_placeholder(None).with_metadata("queue_position", 0);
        assert_eq!(TaskStatus::from_message(&running), TaskStatus::Processing);
        let failed = Message::agent("x").with_status(MessageStatus::Failed);
        assert_eq!(TaskStatus::from_message(&failed), TaskStatus::Failed);
    }

    #[test]
    fn test_partition_tasks() {
        let partition = partition_tasks(vec![
            task("1", TaskStatus::Done),
            task("2", TaskStatus::Queued),
            task("3", TaskStatus::Failed),
            task("4", TaskStatus::Done),
        ]);
        let ids = |tasks: &[Task]| tasks.iter().map(|t| t.task_id.to_string()).collect::<Vec<_>>();
        assert_eq!(ids(&partition.in_flight), ["2", "3"]);
        assert_eq!(ids(&partition.completed), ["1", "4"]);
    }

    #[test]
    fn test_list_query_wire_shape() {
        let query = TaskListQuery::default().with_status(TaskStatus::Done);
        assert_eq!(
            serde_json::to_value(&query).unwrap(),
            json!({"status": "done", "limit": 50, "offset": 0})
        );
        assert_eq!(
            serde_json::to_value(TaskListQuery::default()).unwrap(),
            json!({"limit": 50, "offset": 0})
        );
    }

    #[test]
    fn test_history_accepts_both_field_names() {
        let history: TaskHistory =
            serde_json::from_value(json!({"messages": [{"role": "user", "content": "q"}]})).unwrap();
        assert_eq!(history.messages.len(), 1);
        let history: TaskHistory = serde_json::from_value(json!({"message": []})).unwrap();
        assert!(history.messages.is_empty());
    }
}
