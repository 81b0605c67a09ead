//! Ensure-exists orchestration for conversations and tasks.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::api::ApiResult;
use crate::lifecycle::context::ClientContext;
use crate::lifecycle::error::{LifecycleError, LifecycleResult};
use crate::lifecycle::ids::{ConversationId, CorrelationId, TaskId};
use crate::lifecycle::types::{
    Conversation, CreateConversation, CreateTask, QueueLength, Task, TaskDetails, TaskHistory,
    TaskListQuery, TaskType,
};

/// Title used when the caller gives no hint.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New conversation";

/// Server-side collaborator of the orchestrator and the poller.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    /// Create a conversation.
    async fn create_conversation(&self, request: CreateConversation) -> ApiResult<Conversation>;

    /// Create a task.
    async fn create_task(&self, request: CreateTask) -> ApiResult<Task>;

    /// Fetch the messages of a task.
    async fn fetch_task_history(&self, task_id: &TaskId) -> ApiResult<TaskHistory>;

    /// List tasks.
    async fn list_tasks(&self, query: TaskListQuery) -> ApiResult<Vec<Task>>;

    /// Snapshot of the optimization queue.
    async fn queue_length(&self) -> ApiResult<QueueLength>;
}

/// Guarantees a conversation and a task exist before a stream opens.
///
/// The context lock is held across each create-call, so concurrent callers
/// observe a single creation.
pub struct LifecycleOrchestrator<B: ?Sized> {
    backend: Arc<B>,
    context: Mutex<ClientContext>,
}

impl<B: TaskBackend + ?Sized> LifecycleOrchestrator<B> {
    /// Create an orchestrator with an empty context.
    #[must_use]
    pub fn new(backend: Arc<B>) -> Self {
        Self::with_context(backend, ClientContext::new())
    }

    /// Create an orchestrator resuming `context`.
    #[must_use]
    pub fn with_context(backend: Arc<B>, context: ClientContext) -> Self {
        Self {
            backend,
            context: Mutex::new(context),
        }
    }

    /// The backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Lock the context.
    pub async fn context(&self) -> MutexGuard<'_, ClientContext> {
        self.context.lock().await
    }

    /// Start a new conversation.
    pub async fn reset(&self) {
        self.context.lock().await.reset();
    }

    /// Return the active conversation, creating one if needed.
    ///
    /// # Errors
    /// Returns [`LifecycleError::ConversationUnavailable`] if creation fails;
    /// the caller must abort.
    pub async fn ensure_conversation(&self, title_hint: &str) -> LifecycleResult<ConversationId> {
        let mut context = self.context.lock().await;
        if let Some(id) = context.active_conversation() {
            return Ok(id.clone());
        }

        let title = match title_hint.trim() {
            "" => DEFAULT_CONVERSATION_TITLE.to_string(),
            hint => hint.to_string(),
        };
        let request = CreateConversation {
            title,
            conversation_id: CorrelationId::new(),
        };
        let correlation = request.conversation_id.clone();
        match self.backend.create_conversation(request).await {
            Ok(conversation) => {
                info!(
                    conversation_id = %conversation.conversation_id,
                    %correlation,
                    "conversation created"
                );
                context.set_active_conversation(Some(conversation.conversation_id.clone()));
                Ok(conversation.conversation_id)
            }
            Err(err) => {
                warn!(%err, %correlation, "conversation creation failed");
                Err(LifecycleError::ConversationUnavailable(err))
            }
        }
    }

    /// Return the active task, creating one in `conversation_id` if needed.
    ///
    /// # Errors
    /// Returns [`LifecycleError::TaskUnavailable`] if creation fails; the
    /// caller must roll back its optimistic messages.
    pub async fn ensure_task(
        &self,
        conversation_id: &ConversationId,
        task_type: TaskType,
        details: TaskDetails,
    ) -> LifecycleResult<TaskId> {
        let mut context = self.context.lock().await;
        let same_conversation = context.active_conversation() == Some(conversation_id);
        if let Some(id) = context.active_task().filter(|_| same_conversation) {
            return Ok(id.clone());
        }

        let request = CreateTask {
            conversation_id: conversation_id.clone(),
            task_type,
            details,
        };
        match self.backend.create_task(request).await {
            Ok(task) => {
                info!(task_id = %task.task_id, %conversation_id, %task_type, "task created");
                if !same_conversation {
                    context.set_active_conversation(Some(conversation_id.clone()));
                }
                context.set_active_task(Some(task.task_id.clone()));
                Ok(task.task_id)
            }
            Err(err) => {
                warn!(%err, %conversation_id, "task creation failed");
                Err(LifecycleError::TaskUnavailable(err))
            }
        }
    }
}
