//! Transcript engine.
//!
//! An ordered list of messages where only the last entry is mutable, and only
//! when it was authored by the agent. Writers from different sources (the live
//! stream, the polling fallback) go through a [`SharedTranscript`], which hands
//! out at most one [`WriterLease`] at a time.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::stream::dispatch::StreamEvent;
use crate::transcript::classify::classify;
use crate::transcript::message::{
    Category, ImagePart, Message, MessageId, MessageStatus, Metadata, Part, StructuredPart,
};

/// Final-result patch for the streaming message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FinalPatch {
    /// Replaces the accumulated content.
    pub answer: String,
    /// Shallow-merged into the metadata.
    pub metadata: Option<Metadata>,
    /// Follow-up suggestions.
    pub suggested_follow_ups: Option<Vec<String>>,
    /// Server-supplied category.
    pub category: Option<Category>,
    /// Status after the patch.
    pub status: MessageStatus,
}

impl FinalPatch {
    /// Successful final answer.
    #[must_use]
    pub fn answer(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            ..Self::default()
        }
    }

    /// User-visible failure notice.
    #[must_use]
    pub fn failure(notice: impl Into<String>) -> Self {
        Self {
            answer: notice.into(),
            status: MessageStatus::Failed,
            ..Self::default()
        }
    }
}

/// A typed mutation of the last message.
#[derive(Clone, Debug, PartialEq)]
pub enum MessageUpdate {
    /// Append text.
    TextDelta(String),
    /// Append an image part.
    ImagePart(ImagePart),
    /// Append a structured part.
    StructuredPart(StructuredPart),
    /// Shallow-merge metadata.
    MetadataPatch(Metadata),
    /// Terminal update.
    Final(FinalPatch),
    /// Replace the message with a fresher server copy, keeping its id.
    Refresh(Message),
}

impl MessageUpdate {
    /// Map a stream event to the update it implies.
    #[must_use]
    pub fn from_event(event: StreamEvent) -> Self {
        match event {
            StreamEvent::ConversationInfo(info) => Self::MetadataPatch(info.metadata.unwrap_or_default()),
            StreamEvent::TextChunk(text) => Self::TextDelta(text),
            StreamEvent::ImageChunk(image) => Self::ImagePart(image),
            StreamEvent::PartChunk(part) => Self::StructuredPart(part),
            StreamEvent::MessageEnd(end) => Self::Final(FinalPatch {
                answer: end.answer,
                metadata: end.metadata,
                suggested_follow_ups: end.suggested_follow_ups,
                category: end.category,
                status: MessageStatus::Done,
            }),
        }
    }

    const fn name(&self) -> &'static str {
        match self {
            Self::TextDelta(_) => "text_delta",
            Self::ImagePart(_) => "image_part",
            Self::StructuredPart(_) => "structured_part",
            Self::MetadataPatch(_) => "metadata_patch",
            Self::Final(_) => "final",
            Self::Refresh(_) => "refresh",
        }
    }
}

/// Why an update was dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StaleReason {
    /// The transcript has no messages.
    Empty,
    /// The last message was not authored by the agent.
    NotAgent,
    /// A text delta arrived after the message was finalized.
    Finalized,
    /// The writer's lease was revoked.
    NotWriter,
}

/// Result of [`Transcript::update_last`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The last message changed.
    Applied(MessageId),
    /// Nothing changed.
    Stale(StaleReason),
}

impl UpdateOutcome {
    /// Whether the update was applied.
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Ordered messages of one conversation.
#[derive(Clone, Debug, Default)]
pub struct Transcript {
    messages: Vec<Message>,
    next_id: u64,
}

impl Transcript {
    /// Create an empty transcript.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and assign its id.
    pub fn append(&mut self, mut message: Message) -> MessageId {
        let id = MessageId(self.next_id);
        self.next_id += 1;
        message.id = id;
        self.messages.push(message);
        id
    }

    /// Apply `update` to the last message.
    pub fn update_last(&mut self, update: MessageUpdate) -> UpdateOutcome {
        let Some(last) = self.messages.last_mut() else {
            warn!(update = update.name(), "dropping update for empty transcript");
            return UpdateOutcome::Stale(StaleReason::Empty);
        };
        if !last.is_agent() {
            warn!(update = update.name(), id = %last.id, "dropping update for non-agent message");
            return UpdateOutcome::Stale(StaleReason::NotAgent);
        }

        match update {
            MessageUpdate::TextDelta(text) => {
                if last.status.is_terminal() {
                    warn!(id = %last.id, "dropping text delta after finalization");
                    return UpdateOutcome::Stale(StaleReason::Finalized);
                }
                last.content.push_str(&text);
            }
            MessageUpdate::ImagePart(image) => last.parts.push(Part::Image(image)),
            MessageUpdate::StructuredPart(part) => last.parts.push(Part::Structured(part)),
            MessageUpdate::MetadataPatch(patch) => merge_metadata(&mut last.metadata, patch),
            MessageUpdate::Final(patch) => {
                last.content = patch.answer;
                if let Some(metadata) = patch.metadata {
                    merge_metadata(&mut last.metadata, metadata);
                }
                // Follow-ups are fixed by the first finalization that carries them.
                if last.suggested_follow_ups.is_none() {
                    last.suggested_follow_ups = patch.suggested_follow_ups;
                }
                if patch.category.is_some() {
                    last.category = patch.category;
                }
                last.status = patch.status;
            }
            MessageUpdate::Refresh(mut fresh) => {
                fresh.id = last.id;
                *last = fresh;
            }
        }
        UpdateOutcome::Applied(last.id)
    }

    /// Install a server-fetched transcript. Ids are re-sequenced.
    pub fn replace_all(&mut self, messages: Vec<Message>) {
        self.messages.clear();
        self.messages.reserve(messages.len());
        for message in messages {
            self.append(message);
        }
        debug!(len = self.messages.len(), "transcript replaced");
    }

    /// Classify the last agent message and store its category.
    pub fn categorize_last(&mut self) -> Option<Category> {
        let last = self.messages.last_mut().filter(|message| message.is_agent())?;
        let category = classify(last);
        last.category = Some(category);
        Some(category)
    }

    /// All messages in order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Last message, whoever wrote it.
    #[must_use]
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Last message if it is the agent's.
    #[must_use]
    pub fn last_agent(&self) -> Option<&Message> {
        self.messages.last().filter(|message| message.is_agent())
    }

    /// Message by id.
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages
            .binary_search_by_key(&id, |message| message.id)
            .ok()
            .map(|index| &self.messages[index])
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether there are no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

fn merge_metadata(target: &mut Metadata, patch: Metadata) {
    for (key, value) in patch {
        target.insert(key, value);
    }
}

/// Source of writes to a shared transcript.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WriterKind {
    /// A live stream session.
    Stream,
    /// The polling fallback.
    Polling,
}

#[derive(Debug, Default)]
struct Shared {
    transcript: Transcript,
    writer: Option<(WriterKind, u64)>,
    next_lease: u64,
}

/// Transcript shared between the caller, the stream and the poller.
///
/// Reads are free. Writes go through a [`WriterLease`]; a stream lease
/// preempts a polling lease, never the other way around.
#[derive(Clone, Debug, Default)]
pub struct SharedTranscript {
    inner: Arc<Mutex<Shared>>,
}

impl SharedTranscript {
    /// Wrap an existing transcript.
    #[must_use]
    pub fn new(transcript: Transcript) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Shared {
                transcript,
                ..Shared::default()
            })),
        }
    }

    /// Try to become the single writer.
    ///
    /// Returns `None` when an equal or stronger writer holds the lease.
    #[must_use]
    pub fn try_acquire_writer(&self, kind: WriterKind) -> Option<WriterLease> {
        let mut shared = self.inner.lock();
        match (shared.writer, kind) {
            (None, _) => {}
            (Some((WriterKind::Polling, _)), WriterKind::Stream) => {
                debug!("stream writer preempts polling writer");
            }
            (Some((held, _)), _) => {
                debug!(?held, requested = ?kind, "writer lease busy");
                return None;
            }
        }
        let token = shared.next_lease;
        shared.next_lease += 1;
        shared.writer = Some((kind, token));
        Some(WriterLease {
            inner: Arc::clone(&self.inner),
            kind,
            token,
        })
    }

    /// Current writer, if any.
    #[must_use]
    pub fn writer(&self) -> Option<WriterKind> {
        self.inner.lock().writer.map(|(kind, _)| kind)
    }

    /// Run `f` against the transcript.
    pub fn read<R>(&self, f: impl FnOnce(&Transcript) -> R) -> R {
        f(&self.inner.lock().transcript)
    }

    /// Clone of all messages.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.read(|transcript| transcript.messages().to_vec())
    }
}

/// Exclusive write access to a [`SharedTranscript`].
///
/// Released on drop. Writes through a revoked lease are dropped.
#[derive(Debug)]
pub struct WriterLease {
    inner: Arc<Mutex<Shared>>,
    kind: WriterKind,
    token: u64,
}

impl WriterLease {
    /// Kind of this lease.
    #[must_use]
    pub const fn kind(&self) -> WriterKind {
        self.kind
    }

    /// Whether this lease still holds the writer slot.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.inner.lock().writer == Some((self.kind, self.token))
    }

    /// Append a message.
    pub fn append(&self, message: Message) -> Option<MessageId> {
        self.with_transcript(|transcript| transcript.append(message))
    }

    /// Apply an update to the last message.
    pub fn update_last(&self, update: MessageUpdate) -> UpdateOutcome {
        self.with_transcript(|transcript| transcript.update_last(update))
            .unwrap_or(UpdateOutcome::Stale(StaleReason::NotWriter))
    }

    /// Install a server-fetched transcript.
    pub fn replace_all(&self, messages: Vec<Message>) -> bool {
        self.with_transcript(|transcript| transcript.replace_all(messages))
            .is_some()
    }

    /// Classify the last agent message.
    pub fn categorize_last(&self) -> Option<Category> {
        self.with_transcript(Transcript::categorize_last).flatten()
    }

    /// Run `f` with the transcript while holding the lock.
    pub fn with_transcript<R>(&self, f: impl FnOnce(&mut Transcript) -> R) -> Option<R> {
        let mut shared = self.inner.lock();
        if shared.writer != Some((self.kind, self.token)) {
            warn!(kind = ?self.kind, "dropping write through revoked lease");
            return None;
        }
        Some(f(&mut shared.transcript))
    }
}

impl Drop for WriterLease {
    fn drop(&mut self) {
        let mut shared = self.inner.lock();
        if shared.writer == Some((self.kind, self.token)) {
            shared.writer = None;
        }
    }
}
