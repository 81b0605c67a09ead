//! Streaming transport for task events.
//!
//! - [`frame`]: byte chunks to raw frames.
//! - [`dispatch`]: raw frames to typed [`StreamEvent`]s.
//! - [`session`]: one HTTP request, its read loop and cancellation.

pub mod dispatch;
pub mod error;
pub mod frame;
pub mod session;

pub use dispatch::{
    ConversationInfo, Dispatch, DispatchStats, EventDispatcher, EventKind, EventPayload,
    FrameDiagnostic, MessageEnd, StreamEvent,
};
pub use error::{StreamError, StreamResult};
pub use frame::{FrameDecoder, RawEvent, Utf8Decoder};
pub use session::{
    SessionCanceller, SessionHandle, SessionReport, SessionState, StreamHandler, StreamRequest,
    StreamTransport,
};
