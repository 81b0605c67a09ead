//! Typed event dispatch.
//!
//! Maps a [`RawEvent`] to a [`StreamEvent`] variant. Unknown names are
//! dropped, malformed frames become diagnostics, and payloads that are not
//! JSON are still delivered in their raw form.

use std::fmt;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::stream::frame::RawEvent;
use crate::stream::session::StreamHandler;
use crate::transcript::message::{Category, ImagePart, Metadata, StructuredPart};

/// Event kinds understood by the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Early conversation/task metadata.
    ConversationInfo,
    /// Text delta.
    TextChunk,
    /// Image attachment.
    ImageChunk,
    /// Structured attachment.
    PartChunk,
    /// Final answer.
    MessageEnd,
}

impl EventKind {
    /// Resolve a wire event name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "conversation_info" => Some(Self::ConversationInfo),
            "text_chunk" => Some(Self::TextChunk),
            "image_chunk" => Some(Self::ImageChunk),
            "part_chunk" => Some(Self::PartChunk),
            "message_end" => Some(Self::MessageEnd),
            _ => None,
        }
    }

    /// Wire event name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConversationInfo => "conversation_info",
            Self::TextChunk => "text_chunk",
            Self::ImageChunk => "image_chunk",
            Self::PartChunk => "part_chunk",
            Self::MessageEnd => "message_end",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload after the JSON attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum EventPayload {
    /// Parsed (and possibly unwrapped) JSON.
    Json(Value),
    /// Payload text that was not valid JSON.
    Raw(String),
}

/// `conversation_info` payload.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ConversationInfo {
    /// Server conversation id, when echoed.
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Server task id, when echoed.
    #[serde(default)]
    pub task_id: Option<String>,
    /// Early metadata to merge into the streaming message.
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

/// `message_end` payload.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct MessageEnd {
    /// Final answer text; replaces streamed content.
    #[serde(default)]
    pub answer: String,
    /// Final metadata (result files).
    #[serde(default)]
    pub metadata: Option<Metadata>,
    /// Follow-up suggestions.
    #[serde(default, alias = "suggested_questions")]
    pub suggested_follow_ups: Option<Vec<String>>,
    /// Server-supplied category.
    #[serde(default)]
    pub category: Option<Category>,
}

impl MessageEnd {
    /// Final answer without metadata.
    #[must_use]
    pub fn answer(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            ..Self::default()
        }
    }
}

/// A decoded stream event.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Early metadata.
    ConversationInfo(ConversationInfo),
    /// Text delta.
    TextChunk(String),
    /// Image attachment.
    ImageChunk(ImagePart),
    /// Structured attachment.
    PartChunk(StructuredPart),
    /// Final answer.
    MessageEnd(MessageEnd),
}

impl StreamEvent {
    /// Build the typed event for `kind` from either payload form.
    #[must_use]
    pub fn from_payload(kind: EventKind, payload: EventPayload) -> Self {
        match kind {
            EventKind::ConversationInfo => Self::ConversationInfo(match payload {
                EventPayload::Json(value) => from_json_or(value, |_| ConversationInfo::default()),
                EventPayload::Raw(_) => ConversationInfo::default(),
            }),
            EventKind::TextChunk => Self::TextChunk(match payload {
                EventPayload::Json(Value::Object(mut map)) => match map.remove("text") {
                    Some(text) => text_of(text),
                    None => Value::Object(map).to_string(),
                },
                EventPayload::Json(value) => text_of(value),
                EventPayload::Raw(raw) => raw,
            }),
            EventKind::ImageChunk => Self::ImageChunk(match payload {
                EventPayload::Json(value @ Value::Object(_)) => {
                    from_json_or(value, |value| ImagePart::new(value.to_string(), ""))
                }
                EventPayload::Json(value) => ImagePart::new(text_of(value), ""),
                EventPayload::Raw(raw) => ImagePart::new(raw, ""),
            }),
            EventKind::PartChunk => Self::PartChunk(match payload {
                EventPayload::Json(Value::Object(mut map)) => match map.remove("part") {
                    Some(Value::Object(inner)) => StructuredPart(inner),
                    Some(other) => {
                        map.insert("part".to_string(), other);
                        StructuredPart(map)
                    }
                    None => StructuredPart(map),
                },
                EventPayload::Json(value) => raw_part(value),
                EventPayload::Raw(raw) => raw_part(Value::String(raw)),
            }),
            EventKind::MessageEnd => Self::MessageEnd(match payload {
                EventPayload::Json(value @ Value::Object(_)) => {
                    from_json_or(value, |value| MessageEnd::answer(value.to_string()))
                }
                EventPayload::Json(value) => MessageEnd::answer(text_of(value)),
                EventPayload::Raw(raw) => MessageEnd::answer(raw),
            }),
        }
    }

    /// Kind of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::ConversationInfo(_) => EventKind::ConversationInfo,
            Self::TextChunk(_) => EventKind::TextChunk,
            Self::ImageChunk(_) => EventKind::ImageChunk,
            Self::PartChunk(_) => EventKind::PartChunk,
            Self::MessageEnd(_) => EventKind::MessageEnd,
        }
    }
}

fn from_json_or<T, F>(value: Value, fallback: F) -> T
where
    T: DeserializeOwned,
    F: FnOnce(&Value) -> T,
{
    match T::deserialize(&value) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(%err, "event payload does not match its expected shape");
            fallback(&value)
        }
    }
}

fn text_of(value: Value) -> String {
    match value {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn raw_part(value: Value) -> StructuredPart {
    let mut map = Metadata::new();
    map.insert("raw".to_string(), value);
    StructuredPart(map)
}

/// Non-fatal framing problems surfaced to the handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameDiagnostic {
    /// A frame carried non-standard lines and was not dispatched.
    Malformed(RawEvent),
    /// The stream ended inside a frame; the partial frame was dropped.
    DroppedTrailing {
        /// Length of the dropped text.
        bytes: usize,
    },
}

/// Result of decoding one raw event.
#[derive(Clone, Debug, PartialEq)]
pub enum Dispatch {
    /// Deliver to the handler.
    Event(StreamEvent),
    /// Surface as a diagnostic only.
    Malformed(RawEvent),
    /// Unknown event name, dropped.
    Ignored(String),
}

/// Counters kept by a dispatcher.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Events delivered to the handler.
    pub dispatched: u64,
    /// Malformed frames withheld.
    pub malformed: u64,
    /// Payloads that were not JSON and went out raw.
    pub decode_failures: u64,
    /// Events with unknown names.
    pub ignored: u64,
}

/// Routes raw events to typed handler calls.
#[derive(Debug, Default)]
pub struct EventDispatcher {
    stats: DispatchStats,
}

impl EventDispatcher {
    /// Create a dispatcher with zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one raw event without delivering it.
    pub fn decode(&mut self, raw: RawEvent) -> Dispatch {
        if raw.malformed {
            self.stats.malformed += 1;
            warn!(event = %raw.name, "withholding malformed frame");
            return Dispatch::Malformed(raw);
        }

        let Some(kind) = EventKind::from_name(&raw.name) else {
            self.stats.ignored += 1;
            trace!(event = %raw.name, "ignoring unknown event");
            return Dispatch::Ignored(raw.name);
        };

        let payload = match serde_json::from_str::<Value>(&raw.payload) {
            Ok(Value::Object(mut map)) if map.contains_key(kind.as_str()) => {
                EventPayload::Json(map.remove(kind.as_str()).unwrap_or(Value::Null))
            }
            Ok(value) => EventPayload::Json(value),
            Err(err) => {
                self.stats.decode_failures += 1;
                debug!(event = %kind, %err, "payload is not JSON, passing it raw");
                EventPayload::Raw(raw.payload)
            }
        };

        Dispatch::Event(StreamEvent::from_payload(kind, payload))
    }

    /// Decode one raw event and deliver it to `handler`.
    pub fn dispatch<H: StreamHandler + ?Sized>(&mut self, raw: RawEvent, handler: &mut H) {
        match self.decode(raw) {
            Dispatch::Event(event) => {
                self.stats.dispatched += 1;
                handler.on_event(event);
            }
            Dispatch::Malformed(raw) => handler.on_diagnostic(FrameDiagnostic::Malformed(raw)),
            Dispatch::Ignored(_) => {}
        }
    }

    /// Counters so far.
    #[must_use]
    pub const fn stats(&self) -> DispatchStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        events: Vec<StreamEvent>,
        diagnostics: Vec<FrameDiagnostic>,
    }

    impl StreamHandler for Recorder {
        fn on_event(&mut self, event: StreamEvent) {
            self.events.push(event);
        }

        fn on_diagnostic(&mut self, diagnostic: FrameDiagnostic) {
            self.diagnostics.push(diagnostic);
        }
    }

    #[test]
    fn test_text_chunk_object() {
        let mut dispatcher = EventDispatcher::new();
        let dispatch = dispatcher.decode(RawEvent::new("text_chunk", r#"{"text":"hel"}"#));
        assert_eq!(dispatch, Dispatch::Event(StreamEvent::TextChunk("hel".to_string())));
    }

    #[test]
    fn test_unwraps_field_named_after_event() {
        let mut dispatcher = EventDispatcher::new();
        let dispatch = dispatcher.decode(RawEvent::new(
            "message_end",
            r#"{"message_end":{"answer":"done","suggested_questions":["next?"]}}"#,
        ));
        let Dispatch::Event(StreamEvent::MessageEnd(end)) = dispatch else {
            panic!("expected message_end, got {dispatch:?}");
        };
        assert_eq!(end.answer, "done");
        assert_eq!(end.suggested_follow_ups, Some(vec!["next?".to_string()]));
    }

    #[test]
    fn test_raw_payload_still_delivered() {
        let mut dispatcher = EventDispatcher::new();
        let mut recorder = Recorder::default();
        dispatcher.dispatch(RawEvent::new("text_chunk", "Position: 3"), &mut recorder);
        assert_eq!(recorder.events, vec![StreamEvent::TextChunk("Position: 3".to_string())]);
        assert_eq!(dispatcher.stats().decode_failures, 1);
        assert_eq!(dispatcher.stats().dispatched, 1);
    }

    #[test]
    fn test_malformed_becomes_diagnostic() {
        let mut dispatcher = EventDispatcher::new();
        let mut recorder = Recorder::default();
        let raw = RawEvent {
            name: "text_chunk".to_string(),
            payload: r#"{"text":"x"}"#.to_string(),
            malformed: true,
        };
        dispatcher.dispatch(raw.clone(), &mut recorder);
        assert!(recorder.events.is_empty());
        assert_eq!(recorder.diagnostics, vec![FrameDiagnostic::Malformed(raw)]);
        assert_eq!(dispatcher.stats().malformed, 1);
    }

    #[test]
    fn test_unknown_event_ignored() {
        let mut dispatcher = EventDispatcher::new();
        let mut recorder = Recorder::default();
        dispatcher.dispatch(RawEvent::new("heartbeat_v2", "{}"), &mut recorder);
        dispatcher.dispatch(RawEvent::new("message", "hello"), &mut recorder);
        assert!(recorder.events.is_empty());
        assert!(recorder.diagnostics.is_empty());
        assert_eq!(dispatcher.stats().ignored, 2);
    }

    #[test]
    fn test_image_chunk_shapes() {
        let event = StreamEvent::from_payload(
            EventKind::ImageChunk,
            EventPayload::Json(json!({"imageUrl": "/a.png", "altText": "screenshot"})),
        );
        assert_eq!(event, StreamEvent::ImageChunk(ImagePart::new("/a.png", "screenshot")));

        let event = StreamEvent::from_payload(EventKind::ImageChunk, EventPayload::Raw("/b.png".into()));
        assert_eq!(event, StreamEvent::ImageChunk(ImagePart::new("/b.png", "")));
    }

    #[test]
    fn test_part_chunk_unwraps_nested_part() {
        let event = StreamEvent::from_payload(
            EventKind::PartChunk,
            EventPayload::Json(json!({"part": {"name": "gear", "teeth": 24}})),
        );
        let StreamEvent::PartChunk(StructuredPart(fields)) = event else {
            panic!("expected part chunk");
        };
        assert_eq!(fields.get("name"), Some(&json!("gear")));
        assert!(!fields.contains_key("part"));
    }

    #[test]
    fn test_conversation_info_metadata() {
        let event = StreamEvent::from_payload(
            EventKind::ConversationInfo,
            EventPayload::Json(json!({"task_id": "t-1", "metadata": {"stage": "queued"}})),
        );
        let StreamEvent::ConversationInfo(info) = event else {
            panic!("expected conversation info");
        };
        assert_eq!(info.task_id.as_deref(), Some("t-1"));
        assert_eq!(info.metadata.and_then(|m| m.get("stage").cloned()), Some(json!("queued")));
    }

    #[test]
    fn test_message_end_wrong_shape_falls_back() {
        let event = StreamEvent::from_payload(
            EventKind::MessageEnd,
            EventPayload::Json(json!({"answer": 42})),
        );
        assert_eq!(event, StreamEvent::MessageEnd(MessageEnd::answer(r#"{"answer":42}"#)));
        assert_eq!(event.kind(), EventKind::MessageEnd);
    }
}
