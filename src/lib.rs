//! Client-side streaming and task lifecycle for a task-execution service.
//!
//! A query becomes a task inside a conversation; the server answers with an
//! event stream that is folded, event by event, into an in-memory transcript.
//! Tasks left in progress without a live stream are tracked by polling.

#![deny(unsafe_code)]
#![forbid(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(nonstandard_style)]
#![warn(unused_must_use)]
// Clippy
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![warn(clippy::print_stdout)]
#![warn(clippy::unwrap_in_result)]
#![warn(clippy::redundant_clone)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::too_many_lines,
        clippy::float_cmp
    )
)]

/// HTTP client for the task server.
pub mod api;
/// Conversation and task lifecycle.
pub mod lifecycle;
/// Polling fallback.
pub mod polling;
/// Reference task server.
#[allow(clippy::missing_errors_doc, clippy::unused_async)]
pub mod server;
/// Entry helpers for the binaries.
pub mod start_taskstream;
/// Event-stream transport.
pub mod stream;
/// In-memory transcript.
pub mod transcript;
