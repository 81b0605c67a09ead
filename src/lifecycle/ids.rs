//! Identifier types for conversations and tasks.
//!
//! Conversation and task ids are assigned by the server and treated as
//! opaque strings. Some endpoints return them as JSON numbers, so
//! deserialization accepts both forms.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Prefix of client-generated correlation ids.
pub const CORRELATION_PREFIX: &str = "temp-";

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Signed(i64),
    Unsigned(u64),
}

impl From<RawId> for String {
    fn from(value: RawId) -> Self {
        match value {
            RawId::Text(text) => text,
            RawId::Signed(number) => number.to_string(),
            RawId::Unsigned(number) => number.to_string(),
        }
    }
}

/// Declare an opaque server-assigned string id.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a server-assigned id.
            #[inline]
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the id text.
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Extract the id text.
            #[inline]
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            #[inline]
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            #[inline]
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl AsRef<str> for $name {
            #[inline]
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = core::convert::Infallible;

            #[inline]
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_string()))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                RawId::deserialize(deserializer).map(|raw| Self(raw.into()))
            }
        }
    };
}

define_string_id!(
    /// Server-assigned conversation identifier.
    ConversationId
);

define_string_id!(
    /// Server-assigned task identifier.
    TaskId
);

/// Client-generated id sent with a create-call (`temp-<uuid v4>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh correlation id.
    #[must_use]
    pub fn new() -> Self {
        Self(format!("{CORRELATION_PREFIX}{}", Uuid::new_v4()))
    }

    /// Borrow the id text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_accept_numbers() {
        let id: TaskId = serde_json::from_str("42").unwrap();
        assert_eq!(id.as_str(), "42");
        let id: ConversationId = serde_json::from_str("\"c-1\"").unwrap();
        assert_eq!(id, ConversationId::from("c-1"));
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"c-1\"");
    }

    #[test]
    fn test_correlation_id_shape() {
        let first = CorrelationId::new();
        let rest = first.as_str().strip_prefix(CORRELATION_PREFIX).unwrap();
        assert!(Uuid::parse_str(rest).is_ok());
        assert_ne!(first, CorrelationId::new());
    }
}
