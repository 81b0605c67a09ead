//! In-memory state of the reference task server.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;

use crate::api::EndpointConfig;
use crate::lifecycle::ids::{ConversationId, TaskId};
use crate::lifecycle::types::{
    Conversation, CreateConversation, CreateTask, QueueLength, Task, TaskHistory, TaskListQuery,
    TaskStatus, TaskType,
};
use crate::transcript::message::{Message, MessageStatus, Metadata};

/// Reference server settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Pause between streamed chunks.
    pub chunk_delay: Duration,
    /// Route paths; shared with the client defaults.
    pub endpoints: EndpointConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            chunk_delay: Duration::from_millis(60),
            endpoints: EndpointConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Set the pause between chunks.
    #[must_use]
    pub const fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }
}

/// A task and its messages.
#[derive(Clone, Debug)]
struct TaskRecord {
    task: Task,
    messages: Vec<Message>,
}

/// Shared application state.
#[derive(Debug, Default)]
pub struct AppState {
    config: ServerConfig,
    conversations: DashMap<ConversationId, Conversation>,
    tasks: DashMap<TaskId, TaskRecord>,
    next_id: AtomicU64,
}

impl AppState {
    /// Create the state.
    #[must_use]
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            ..Self::default()
        })
    }

    /// Settings.
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a conversation under a server id.
    pub fn create_conversation(&self, request: CreateConversation) -> Conversation {
        let conversation = Conversation {
            conversation_id: ConversationId::new(format!("conv-{}", self.next())),
            title: request.title,
            created_at: Some(Utc::now()),
        };
        tracing::info!(
            conversation_id = %conversation.conversation_id,
            correlation = %request.conversation_id,
            "conversation registered"
        );
        self.conversations
            .insert(conversation.conversation_id.clone(), conversation.clone());
        conversation
    }

    /// Register a task. `None` when the conversation is unknown.
    pub fn create_task(&self, request: CreateTask) -> Option<Task> {
        if !self.conversations.contains_key(&request.conversation_id) {
            return None;
        }
        let task = Task {
            task_id: TaskId::new(format!("task-{}", self.next())),
            conversation_id: request.conversation_id,
            task_type: request.task_type,
            status: TaskStatus::Pending,
            details: serde_json::to_value(&request.details).ok(),
            created_at: Some(Utc::now()),
        };
        self.tasks.insert(
            task.task_id.clone(),
            TaskRecord {
                task: task.clone(),
                messages: Vec::new(),
            },
        );
        Some(task)
    }

    /// Record a new execution of `task_id`: the query and an in-progress answer.
    ///
    /// Returns the task type, or `None` for an unknown task.
    pub fn begin_execution(&self, task_id: &TaskId, query: &str) -> Option<TaskType> {
        let mut record = self.tasks.get_mut(task_id)?;
        record.task.status = TaskStatus::Processing;
        let task_type = record.task.task_type;
        record.messages.push(Message::user(query));
        let mut answer = Message::agent(String::new()).with_status(MessageStatus::InProgress);
        answer.task_type = Some(task_type);
        record.messages.push(answer);
        Some(task_type)
    }

    /// Append streamed text to the in-progress answer.
    pub fn append_progress(&self, task_id: &TaskId, text: &str) {
        if let Some(mut record) = self.tasks.get_mut(task_id) {
            if let Some(answer) = record.messages.last_mut() {
                answer.content.push_str(text);
            }
        }
    }

    /// Store the final answer and mark the task done.
    pub fn finish_execution(&self, task_id: &TaskId, answer: &str, metadata: Metadata) {
        if let Some(mut record) = self.tasks.get_mut(task_id) {
            record.task.status = TaskStatus::Done;
            if let Some(message) = record.messages.last_mut() {
                message.content = answer.to_string();
                message.status = MessageStatus::Done;
                message.metadata.extend(metadata);
            }
        }
    }

    /// Messages of a task.
    #[must_use]
    pub fn history(&self, task_id: &TaskId) -> Option<TaskHistory> {
        self.tasks.get(task_id).map(|record| TaskHistory {
            messages: record.messages.clone(),
        })
    }

    /// Tasks matching `query`, oldest first.
    #[must_use]
    pub fn list(&self, query: &TaskListQuery) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .map(|record| record.task.clone())
            .filter(|task| query.status.is_none_or(|status| task.status == status))
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.task_id.cmp(&b.task_id)));
        tasks
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .collect()
    }

    /// Optimization tasks waiting and running.
    #[must_use]
    pub fn queue_length(&self) -> QueueLength {
        let mut queue = QueueLength::default();
        for record in &self.tasks {
            if record.task.task_type != TaskType::Optimize {
                continue;
            }
            match record.task.status {
                TaskStatus::Queued => queue.length += 1,
                TaskStatus::Processing => queue.running += 1,
                _ => {}
            }
        }
        queue
    }
}
