//! In-memory conversation transcript.

pub mod classify;
pub mod engine;
pub mod message;

pub use classify::{ParameterExtractor, ParameterRange, classify, extract_parameter_ranges};
pub use engine::{
    FinalPatch, MessageUpdate, SharedTranscript, StaleReason, Transcript, UpdateOutcome,
    WriterKind, WriterLease,
};
pub use message::{Category, ImagePart, Message, MessageId, MessageStatus, Metadata, Part, Role, StructuredPart};
