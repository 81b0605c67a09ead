//! Transcript message model.
//!
//! The same shape is used for locally assembled messages and for messages
//! fetched from the task history endpoint, so deserialization is lenient:
//! unknown or `null` values fall back to defaults instead of failing the fetch.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::lifecycle::types::TaskType;

/// Free-form message metadata (file references, flags, progress).
pub type Metadata = Map<String, Value>;

/// Position of a message within its transcript.
///
/// Assigned by the transcript on append, strictly increasing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// Author of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Message typed by the user.
    #[serde(rename = "user")]
    User,
    /// Message produced by the task backend.
    #[serde(rename = "assistant", alias = "agent")]
    Agent,
}

impl Role {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Presentation category of a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Geometry modeling output (generated code, CAD files).
    Geometry,
    /// Design optimization log.
    Optimize,
    /// Anything else. Unknown server values map here.
    #[default]
    #[serde(other)]
    General,
}

impl Category {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Geometry => "geometry",
            Self::Optimize => "optimize",
            Self::General => "general",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Server-side progress of a message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Local placeholder being filled by a live stream.
    Streaming,
    /// The server has not finalized the answer yet.
    InProgress,
    /// Final answer received.
    #[default]
    #[serde(alias = "completed", alias = "success")]
    Done,
    /// The task failed; content holds a failure notice.
    #[serde(alias = "error")]
    Failed,
}

impl MessageStatus {
    /// Whether the message will not change anymore.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Image attachment.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePart {
    /// Location of the image.
    #[serde(default, rename = "imageUrl", alias = "url", alias = "image_url")]
    pub url: String,
    /// Human-readable label (also used to recognize chart images).
    #[serde(default, rename = "altText", alias = "alt_label", alias = "alt_text", alias = "alt")]
    pub alt_label: String,
}

impl ImagePart {
    /// Build an image part.
    #[must_use]
    pub fn new(url: impl Into<String>, alt_label: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            alt_label: alt_label.into(),
        }
    }
}

/// Structured attachment with backend-defined fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StructuredPart(pub Map<String, Value>);

/// Typed attachment on a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    /// Image attachment.
    Image(ImagePart),
    /// Structured attachment.
    #[serde(rename = "part")]
    Structured(StructuredPart),
}

/// One turn in a transcript.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Creation-ordered identifier.
    #[serde(default, deserialize_with = "lenient")]
    pub id: MessageId,
    /// Author.
    pub role: Role,
    /// Accumulated text.
    #[serde(default, deserialize_with = "lenient")]
    pub content: String,
    /// Append-only attachments.
    #[serde(default, deserialize_with = "lenient")]
    pub parts: Vec<Part>,
    /// Shallow-merged metadata.
    #[serde(default, deserialize_with = "lenient")]
    pub metadata: Metadata,
    /// Server-supplied or classified category.
    #[serde(default, deserialize_with = "lenient")]
    pub category: Option<Category>,
    /// Follow-up suggestions, set once at finalization.
    #[serde(
        default,
        rename = "suggested_questions",
        alias = "suggested_follow_ups",
        deserialize_with = "lenient"
    )]
    pub suggested_follow_ups: Option<Vec<String>>,
    /// Server-side progress.
    #[serde(default, deserialize_with = "lenient")]
    pub status: MessageStatus,
    /// Task type the message belongs to, when known.
    #[serde(default, deserialize_with = "lenient")]
    pub task_type: Option<TaskType>,
    /// Local creation time.
    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into(), MessageStatus::Done)
    }

    /// Build an empty agent placeholder that a stream will fill.
    #[must_use]
    pub fn agent_placeholder(task_type: Option<TaskType>) -> Self {
        let mut message = Self::new(Role::Agent, String::new(), MessageStatus::Streaming);
        message.task_type = task_type;
        message
    }

    /// Build a finished agent message.
    #[must_use]
    pub fn agent(content: impl Into<String>) -> Self {
        Self::new(Role::Agent, content.into(), MessageStatus::Done)
    }

    fn new(role: Role, content: String, status: MessageStatus) -> Self {
        Self {
            id: MessageId::default(),
            role,
            content,
            parts: Vec::new(),
            metadata: Metadata::new(),
            category: None,
            suggested_follow_ups: None,
            status,
            task_type: None,
            created_at: Utc::now(),
        }
    }

    /// Set the status.
    #[must_use]
    pub const fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the category.
    #[must_use]
    pub const fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    /// Insert one metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Append a part.
    #[must_use]
    pub fn with_part(mut self, part: Part) -> Self {
        self.parts.push(part);
        self
    }

    /// Whether the author is the agent.
    #[must_use]
    pub fn is_agent(&self) -> bool {
        self.role == Role::Agent
    }

    /// Image parts in arrival order.
    pub fn images(&self) -> impl Iterator<Item = &ImagePart> {
        self.parts.iter().filter_map(|part| match part {
            Part::Image(image) => Some(image),
            Part::Structured(_) => None,
        })
    }

    /// String value of a metadata key, if present and textual.
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Deserialize any value, falling back to `T::default()` when it does not fit.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_else(|_| Utc::now()))
}
