//! End-to-end task submission.
//!
//! A submission appends the user message and an agent placeholder, makes
//! sure a conversation and a task exist, then opens a stream whose events are
//! folded into the transcript by a [`TranscriptWriter`].

use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiResult};
use crate::lifecycle::error::{LifecycleError, LifecycleResult};
use crate::lifecycle::ids::{ConversationId, TaskId};
use crate::lifecycle::orchestrator::{LifecycleOrchestrator, TaskBackend};
use crate::lifecycle::types::{TaskDetails, TaskType};
use crate::polling::PollingSupervisor;
use crate::stream::{
    SessionCanceller, SessionHandle, StreamError, StreamEvent, StreamHandler, StreamRequest,
    StreamTransport,
};
use crate::transcript::engine::{FinalPatch, MessageUpdate, SharedTranscript, WriterKind, WriterLease};
use crate::transcript::message::{Category, Message, MessageStatus, Metadata};

/// Notice written when the stream fails before the final answer.
pub const STREAM_FAILURE_NOTICE: &str = "Sorry, the request failed. Please try again later.";

/// Notice written when no conversation could be created.
pub const CONVERSATION_FAILURE_NOTICE: &str = "Could not start a conversation. Please try again.";

/// Notice written when no task could be created.
pub const TASK_FAILURE_NOTICE: &str = "Could not create the task. Please try again.";

/// User sent to the server when the caller gives none.
pub const ANONYMOUS_USER: &str = "anonymous";

const TITLE_HINT_CHARS: usize = 20;
const DETAILS_QUERY_CHARS: usize = 50;

static QUEUE_POSITION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?:Position|排队位置)\s*[:：]\s*(\d+)").ok());

/// Queue position announced in a text delta, if any.
#[must_use]
pub fn queue_position(text: &str) -> Option<u64> {
    let captures = QUEUE_POSITION.as_ref()?.captures(text)?;
    captures.get(1)?.as_str().parse().ok()
}

fn leading_chars(text: &str, count: usize) -> String {
    text.chars().take(count).collect()
}

/// A query to run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// User query.
    pub query: String,
    /// Kind of task.
    pub task_type: TaskType,
    /// Uploaded file the task works on.
    #[serde(default)]
    pub file_url: Option<String>,
    /// Display name of that file.
    #[serde(default)]
    pub file_name: Option<String>,
    /// Submitting user.
    #[serde(default = "default_user")]
    pub user: String,
}

fn default_user() -> String {
    ANONYMOUS_USER.to_string()
}

impl SubmitRequest {
    /// Anonymous request without a file.
    #[must_use]
    pub fn new(query: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            query: query.into(),
            task_type,
            file_url: None,
            file_name: None,
            user: default_user(),
        }
    }

    /// Attach an uploaded file.
    #[must_use]
    pub fn with_file(mut self, url: impl Into<String>, name: impl Into<String>) -> Self {
        self.file_url = Some(url.into());
        self.file_name = Some(name.into());
        self
    }

    /// Set the submitting user.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    fn execute_body(&self, conversation_id: &ConversationId, task_id: &TaskId) -> Value {
        let mut body = json!({
            "task_type": self.task_type,
            "query": self.query,
            "conversation_id": conversation_id,
            "task_id": task_id,
            "user": self.user,
            "files": [],
            "response_mode": "streaming",
        });
        if let (Some(url), Some(map)) = (&self.file_url, body.as_object_mut()) {
            map.insert("file_url".to_string(), Value::String(url.clone()));
        }
        body
    }
}

/// Marks the runner as busy until dropped.
#[derive(Debug)]
struct ActiveSlot(Arc<AtomicBool>);

impl ActiveSlot {
    fn claim(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Stream handler that folds events into the last transcript message.
///
/// Holds the stream writer lease and the runner's active slot until the
/// session closes or fails.
#[derive(Debug)]
pub struct TranscriptWriter {
    lease: Option<WriterLease>,
    slot: Option<ActiveSlot>,
    conversation_id: ConversationId,
    task_id: TaskId,
    cancel: CancellationToken,
    finished: bool,
    category: Option<Category>,
}

impl TranscriptWriter {
    fn new(
        lease: WriterLease,
        slot: ActiveSlot,
        conversation_id: ConversationId,
        task_id: TaskId,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            lease: Some(lease),
            slot: Some(slot),
            conversation_id,
            task_id,
            cancel,
            finished: false,
            category: None,
        }
    }

    /// Conversation of the session.
    #[must_use]
    pub const fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Task of the session.
    #[must_use]
    pub const fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Whether the final answer was applied.
    #[must_use]
    pub const fn finished(&self) -> bool {
        self.finished
    }

    /// Category assigned once the final answer was applied.
    #[must_use]
    pub const fn category(&self) -> Option<Category> {
        self.category
    }

    fn release(&mut self) {
        self.lease = None;
        self.slot = None;
    }
}

impl StreamHandler for TranscriptWriter {
    fn on_open(&mut self) {
        debug!(task_id = %self.task_id, "stream open");
    }

    fn on_event(&mut self, event: StreamEvent) {
        let Some(lease) = &self.lease else {
            return;
        };

        let position = match &event {
            StreamEvent::TextChunk(text) => queue_position(text),
            StreamEvent::ConversationInfo(info) => {
                debug!(
                    task_id = %self.task_id,
                    conversation = ?info.conversation_id,
                    server_task = ?info.task_id,
                    "conversation info"
                );
                None
            }
            _ => None,
        };
        let is_end = matches!(event, StreamEvent::MessageEnd(_));

        let outcome = lease.update_last(MessageUpdate::from_event(event));
        if let Some(position) = position {
            let mut patch = Metadata::new();
            patch.insert("queue_position".to_string(), Value::from(position));
            lease.update_last(MessageUpdate::MetadataPatch(patch));
        }
        if is_end && outcome.is_applied() {
            self.finished = true;
            self.category = lease.categorize_last();
            info!(task_id = %self.task_id, category = ?self.category, "final answer applied");
        }
    }

    fn on_error(&mut self, error: &StreamError) {
        warn!(task_id = %self.task_id, %error, "stream failed");
        if !self.finished {
            if let Some(lease) = &self.lease {
                lease.update_last(MessageUpdate::Final(FinalPatch::failure(STREAM_FAILURE_NOTICE)));
            }
        }
        self.release();
    }

    fn on_close(&mut self) {
        if !self.finished {
            if let Some(lease) = &self.lease {
                mark_interrupted(lease);
            }
            info!(
                task_id = %self.task_id,
                cancelled = self.cancel.is_cancelled(),
                "stream closed before the final answer"
            );
        }
        self.release();
    }
}

/// Leave the content as streamed, but stop presenting it as live.
fn mark_interrupted(lease: &WriterLease) {
    let current = lease
        .with_transcript(|transcript| transcript.last_agent().cloned())
        .flatten();
    if let Some(mut message) = current.filter(|m| m.status == MessageStatus::Streaming) {
        message.status = MessageStatus::InProgress;
        lease.update_last(MessageUpdate::Refresh(message));
    }
}

/// Runs submissions against one transcript, one session at a time.
pub struct TaskRunner<B: ?Sized> {
    orchestrator: Arc<LifecycleOrchestrator<B>>,
    polling: Arc<PollingSupervisor<B>>,
    transport: StreamTransport,
    endpoint: StreamRequest,
    transcript: SharedTranscript,
    active: Arc<AtomicBool>,
    canceller: Mutex<Option<SessionCanceller>>,
}

impl TaskRunner<ApiClient> {
    /// Wire a runner to the HTTP client.
    ///
    /// # Errors
    /// Returns an error if the execute URL does not parse.
    pub fn from_client(client: Arc<ApiClient>, transcript: SharedTranscript) -> ApiResult<Self> {
        let endpoint = client.stream_request(Value::Null)?;
        let transport = client.transport();
        let polling = Arc::new(PollingSupervisor::new(
            Arc::clone(&client),
            client.config().polling,
        ));
        let orchestrator = Arc::new(LifecycleOrchestrator::new(client));
        Ok(Self::new(orchestrator, polling, transport, endpoint, transcript))
    }
}

impl<B: TaskBackend + ?Sized + 'static> TaskRunner<B> {
    /// Create a runner. `endpoint` supplies the URL and token; its body is replaced.
    #[must_use]
    pub fn new(
        orchestrator: Arc<LifecycleOrchestrator<B>>,
        polling: Arc<PollingSupervisor<B>>,
        transport: StreamTransport,
        endpoint: StreamRequest,
        transcript: SharedTranscript,
    ) -> Self {
        Self {
            orchestrator,
            polling,
            transport,
            endpoint,
            transcript,
            active: Arc::new(AtomicBool::new(false)),
            canceller: Mutex::new(None),
        }
    }

    /// The transcript.
    #[must_use]
    pub const fn transcript(&self) -> &SharedTranscript {
        &self.transcript
    }

    /// The orchestrator.
    #[must_use]
    pub const fn orchestrator(&self) -> &Arc<LifecycleOrchestrator<B>> {
        &self.orchestrator
    }

    /// The polling supervisor.
    #[must_use]
    pub const fn polling(&self) -> &Arc<PollingSupervisor<B>> {
        &self.polling
    }

    /// Whether a submission or its session is in flight.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Cancel the running session, if any. The session moves to `Closing` at once.
    pub fn cancel_active(&self) {
        if let Some(canceller) = self.canceller.lock().as_ref() {
            canceller.cancel();
        }
    }

    /// Submit a query and open its stream.
    ///
    /// # Errors
    /// - [`LifecycleError::SessionActive`] while another session runs.
    /// - [`LifecycleError::TranscriptBusy`] if another stream writes the transcript.
    /// - [`LifecycleError::ConversationUnavailable`] / [`LifecycleError::TaskUnavailable`]
    ///   when the ids cannot be ensured; the placeholder then carries a failure notice.
    pub async fn submit(&self, request: SubmitRequest) -> LifecycleResult<SessionHandle<TranscriptWriter>> {
        let slot = ActiveSlot::claim(&self.active).ok_or(LifecycleError::SessionActive)?;
        let lease = self
            .transcript
            .try_acquire_writer(WriterKind::Stream)
            .ok_or(LifecycleError::TranscriptBusy)?;

        lease.append(Message::user(request.query.clone()));
        lease.append(Message::agent_placeholder(Some(request.task_type)));

        let title_hint = leading_chars(&request.query, TITLE_HINT_CHARS);
        let conversation_id = match self.orchestrator.ensure_conversation(&title_hint).await {
            Ok(id) => id,
            Err(err) => {
                lease.update_last(MessageUpdate::Final(FinalPatch::failure(CONVERSATION_FAILURE_NOTICE)));
                return Err(err);
            }
        };

        let details = TaskDetails {
            query: leading_chars(&request.query, DETAILS_QUERY_CHARS),
            file_name: request.file_name.clone(),
        };
        let task_id = match self
            .orchestrator
            .ensure_task(&conversation_id, request.task_type, details)
            .await
        {
            Ok(id) => id,
            Err(err) => {
                lease.update_last(MessageUpdate::Final(FinalPatch::failure(TASK_FAILURE_NOTICE)));
                return Err(err);
            }
        };

        self.polling.stop(&task_id).await;

        let stream_request = StreamRequest {
            body: request.execute_body(&conversation_id, &task_id),
            ..self.endpoint.clone()
        };
        let cancel = CancellationToken::new();

        info!(%conversation_id, %task_id, task_type = %request.task_type, "opening task stream");
        let writer = TranscriptWriter::new(lease, slot, conversation_id, task_id, cancel.clone());
        let handle = self.transport.open_with_token(stream_request, writer, cancel);
        *self.canceller.lock() = Some(handle.canceller());
        Ok(handle)
    }
}
