//! Canned replies of the reference server, encoded as event-stream frames.

use serde_json::{Value, json};

use crate::lifecycle::ids::{ConversationId, TaskId};
use crate::lifecycle::types::TaskType;
use crate::stream::EventKind;
use crate::transcript::message::{Category, Metadata};

/// One frame to send.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Event name.
    pub kind: EventKind,
    /// JSON payload.
    pub data: Value,
}

impl Frame {
    fn new(kind: EventKind, data: Value) -> Self {
        Self { kind, data }
    }

    /// Wire form: `event:` and `data:` lines closed by a blank line.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = format!("event: {}\n", self.kind);
        for line in self.data.to_string().split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Final answer for a query.
#[must_use]
pub fn compose_answer(task_type: TaskType, query: &str) -> String {
    match task_type {
        TaskType::Geometry => format!(
            "Generated a model for \"{query}\".\n```py\nimport cadquery as cq\nresult = cq.Workplane(\"XY\").box(40, 20, 5)\n```"
        ),
        TaskType::Optimize => format!(
            "Optimization complete for \"{query}\".\nParameter 1: thickness: [1.0, 3.0]\nParameter 2: width: [10, 30]"
        ),
        TaskType::Retrieval => format!("Found 3 references related to \"{query}\"."),
    }
}

const fn category_of(task_type: TaskType) -> Category {
    match task_type {
        TaskType::Geometry => Category::Geometry,
        TaskType::Optimize => Category::Optimize,
        TaskType::Retrieval => Category::General,
    }
}

/// Metadata attached to the final answer.
#[must_use]
pub fn final_metadata(task_type: TaskType) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("task_type".to_string(), json!(task_type));
    if task_type == TaskType::Geometry {
        metadata.insert("code_file".to_string(), json!("model.py"));
    }
    metadata
}

/// Plan of one execution.
#[derive(Clone, Debug)]
pub struct ReplyScript {
    /// Opening conversation info.
    pub info: Frame,
    /// Text deltas, in order. Each is also recorded as server-side progress.
    pub deltas: Vec<String>,
    /// Closing message end.
    pub end: Frame,
    /// Final answer text.
    pub answer: String,
}

impl ReplyScript {
    /// Script the reply to `query`. `queue_ahead` is announced for optimization tasks.
    #[must_use]
    pub fn new(
        conversation_id: &ConversationId,
        task_id: &TaskId,
        task_type: TaskType,
        query: &str,
        queue_ahead: u64,
    ) -> Self {
        let info = Frame::new(
            EventKind::ConversationInfo,
            json!({
                "conversation_id": conversation_id,
                "task_id": task_id,
                "metadata": {"task_type": task_type},
            }),
        );

        let answer = compose_answer(task_type, query);
        let mut deltas = Vec::new();
        if task_type == TaskType::Optimize {
            deltas.push(format!("Position: {queue_ahead}\n"));
        }
        deltas.extend(answer.split_inclusive(' ').map(str::to_string));

        let end = Frame::new(
            EventKind::MessageEnd,
            json!({
                "answer": answer,
                "metadata": final_metadata(task_type),
                "suggested_questions": [format!("Refine \"{query}\"")],
                "category": category_of(task_type),
            }),
        );
        Self {
            info,
            deltas,
            end,
            answer,
        }
    }

    /// Frame of a text delta.
    #[must_use]
    pub fn delta_frame(text: &str) -> Frame {
        Frame::new(EventKind::TextChunk, json!({ "text": text }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Dispatch, EventDispatcher, FrameDecoder, StreamEvent};

    #[test]
    fn test_frames_decode_back() {
        let script = ReplyScript::new(
            &ConversationId::from("conv-1"),
            &TaskId::from("task-2"),
            TaskType::Optimize,
            "lighter bracket",
            2,
        );
        let wire: String = std::iter::once(script.info.encode())
            .chain(script.deltas.iter().map(|text| ReplyScript::delta_frame(text).encode()))
            .chain(std::iter::once(script.end.encode()))
            .collect();

        let mut decoder = FrameDecoder::new();
        let mut dispatcher = EventDispatcher::new();
        let mut text = String::new();
        let mut answer = None;
        for raw in decoder.feed_str(&wire) {
            match dispatcher.decode(raw) {
                Dispatch::Event(StreamEvent::TextChunk(chunk)) => text.push_str(&chunk),
                Dispatch::Event(StreamEvent::MessageEnd(end)) => answer = Some(end),
                _ => {}
            }
        }
        assert!(text.starts_with("Position: 2\n"));
        let end = answer.unwrap();
        assert_eq!(end.answer, script.answer);
        assert_eq!(end.category, Some(Category::Optimize));
        assert_eq!(end.suggested_follow_ups.map(|q| q.len()), Some(1));
    }
}
