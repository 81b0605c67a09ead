//! Streaming transport.
//!
//! One [`SessionHandle`] owns one outbound request. The read loop runs on its
//! own tokio task, feeds the [`FrameDecoder`], and hands every decoded event to
//! the session's [`StreamHandler`] in arrival order.
//!
//! ```text
//! Idle -> Opening -> Open -> Closing -> Closed
//!            \         \
//!             +---------+--> Failed
//! ```
//!
//! The state lives in an atomic cell and every transition is a
//! compare-and-swap, so a `cancel()` racing the read loop has exactly one
//! winner. The cancellation token is checked at each await and before each
//! dispatch.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use futures::StreamExt;
use reqwest::header::ACCEPT;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::stream::dispatch::{DispatchStats, EventDispatcher, FrameDiagnostic, StreamEvent};
use crate::stream::error::{StreamError, StreamResult};
use crate::stream::frame::FrameDecoder;

const ERROR_BODY_LIMIT: usize = 512;

/// Lifecycle state of a stream session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// Created, request not yet sent.
    Idle = 0,
    /// Request sent, waiting for a success status.
    Opening = 1,
    /// Reading frames.
    Open = 2,
    /// End of stream or cancellation observed, shutting down.
    Closing = 3,
    /// Transport error or rejected request. Terminal.
    Failed = 4,
    /// Finished normally or after cancellation. Terminal.
    Closed = 5,
}

impl SessionState {
    /// Whether no further transition can happen.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Opening,
            2 => Self::Open,
            3 => Self::Closing,
            4 => Self::Failed,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    const fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    fn load(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move any live state to `Closing`. Returns false if already closing or terminal.
    fn begin_close(&self) -> bool {
        let mut current = self.load();
        while matches!(
            current,
            SessionState::Idle | SessionState::Opening | SessionState::Open
        ) {
            if self.transition(current, SessionState::Closing) {
                return true;
            }
            current = self.load();
        }
        false
    }

    /// Move a live state to `Failed`. Returns false if a close already won.
    fn fail(&self) -> bool {
        self.transition(SessionState::Opening, SessionState::Failed)
            || self.transition(SessionState::Open, SessionState::Failed)
    }

    fn close(&self) {
        self.0.store(SessionState::Closed as u8, Ordering::Release);
    }
}

/// One outbound stream request.
#[derive(Clone, Debug)]
pub struct StreamRequest {
    /// Endpoint to POST to.
    pub url: Url,
    /// JSON request body.
    pub body: Value,
    /// Bearer token, if any.
    pub bearer: Option<String>,
}

impl StreamRequest {
    /// Build an unauthenticated request.
    #[must_use]
    pub const fn new(url: Url, body: Value) -> Self {
        Self {
            url,
            body,
            bearer: None,
        }
    }

    /// Attach a bearer token.
    #[must_use]
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }
}

/// Lifecycle hooks of a session.
///
/// Hooks run on the session's read loop, one at a time and in frame order.
pub trait StreamHandler: Send {
    /// The server accepted the request.
    fn on_open(&mut self) {}

    /// A typed event arrived.
    fn on_event(&mut self, event: StreamEvent);

    /// A non-fatal framing problem was observed.
    fn on_diagnostic(&mut self, diagnostic: FrameDiagnostic) {
        let _ = diagnostic;
    }

    /// The session failed. Called at most once and never after cancellation.
    fn on_error(&mut self, error: &StreamError) {
        let _ = error;
    }

    /// The session closed, by end of stream or cancellation. Called at most once.
    fn on_close(&mut self) {}
}

/// What a finished session leaves behind.
#[derive(Debug)]
pub struct SessionReport<H> {
    /// Terminal state (`Closed` or `Failed`).
    pub state: SessionState,
    /// Dispatcher counters.
    pub stats: DispatchStats,
    /// The failure, for `Failed` sessions.
    pub error: Option<StreamError>,
    /// Whether the session ended because of a cancellation.
    pub cancelled: bool,
    /// The handler, returned to the caller.
    pub handler: H,
}

/// Handle to a running session.
#[derive(Debug)]
pub struct SessionHandle<H> {
    state: Arc<StateCell>,
    cancel: CancellationToken,
    task: JoinHandle<SessionReport<H>>,
}

impl<H> SessionHandle<H> {
    /// Stop event delivery.
    ///
    /// Idempotent. Does nothing once the session is `Closed` or `Failed`.
    pub fn cancel(&self) {
        cancel_session(&self.state, &self.cancel);
    }

    /// Detached canceller with the same effect as [`Self::cancel`].
    #[must_use]
    pub fn canceller(&self) -> SessionCanceller {
        SessionCanceller {
            state: Arc::clone(&self.state),
            cancel: self.cancel.clone(),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.load()
    }

    /// Whether the read loop has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Token observed by the read loop.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the read loop and take back the handler.
    ///
    /// # Errors
    /// Returns [`StreamError::Aborted`] if the read loop panicked.
    pub async fn join(self) -> StreamResult<SessionReport<H>> {
        self.task
            .await
            .map_err(|err| StreamError::Aborted(err.to_string()))
    }
}

/// Cancels a session without owning its handle.
#[derive(Clone, Debug)]
pub struct SessionCanceller {
    state: Arc<StateCell>,
    cancel: CancellationToken,
}

impl SessionCanceller {
    /// Move the session to `Closing` and stop event delivery.
    ///
    /// Idempotent. Does nothing once the session is `Closed` or `Failed`.
    pub fn cancel(&self) {
        cancel_session(&self.state, &self.cancel);
    }

    /// Current state of the session.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.load()
    }
}

fn cancel_session(state: &StateCell, cancel: &CancellationToken) {
    if state.begin_close() {
        debug!("stream session cancelled");
        cancel.cancel();
    }
}

/// Opens stream sessions over a shared HTTP client.
#[derive(Clone, Debug, Default)]
pub struct StreamTransport {
    client: reqwest::Client,
}

impl StreamTransport {
    /// Wrap an HTTP client. It must not carry a total request timeout.
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Open a session with a fresh cancellation token.
    pub fn open<H>(&self, request: StreamRequest, handler: H) -> SessionHandle<H>
    where
        H: StreamHandler + 'static,
    {
        self.open_with_token(request, handler, CancellationToken::new())
    }

    /// Open a session observing `cancel`.
    ///
    /// Cancelling the token directly has the same effect as
    /// [`SessionHandle::cancel`].
    pub fn open_with_token<H>(
        &self,
        request: StreamRequest,
        handler: H,
        cancel: CancellationToken,
    ) -> SessionHandle<H>
    where
        H: StreamHandler + 'static,
    {
        let state = Arc::new(StateCell::new(SessionState::Idle));
        let session = ReadLoop {
            client: self.client.clone(),
            state: Arc::clone(&state),
            cancel: cancel.clone(),
            dispatcher: EventDispatcher::new(),
        };
        let task = tokio::spawn(session.run(request, handler));
        SessionHandle {
            state,
            cancel,
            task,
        }
    }
}

enum LoopEnd {
    Finished,
    Cancelled,
    Failed(StreamError),
}

struct ReadLoop {
    client: reqwest::Client,
    state: Arc<StateCell>,
    cancel: CancellationToken,
    dispatcher: EventDispatcher,
}

impl ReadLoop {
    async fn run<H: StreamHandler>(mut self, request: StreamRequest, mut handler: H) -> SessionReport<H> {
        let end = if self.state.transition(SessionState::Idle, SessionState::Opening) {
            self.drive(request, &mut handler).await
        } else {
            LoopEnd::Cancelled
        };

        let (error, cancelled) = match end {
            LoopEnd::Failed(err) if self.state.fail() => {
                warn!(%err, "stream session failed");
                handler.on_error(&err);
                (Some(err), false)
            }
            LoopEnd::Failed(err) => {
                debug!(%err, "transport error after cancellation");
                self.finish_close(&mut handler);
                (None, true)
            }
            LoopEnd::Finished => {
                let cancelled = !self.state.begin_close();
                self.finish_close(&mut handler);
                (None, cancelled)
            }
            LoopEnd::Cancelled => {
                self.state.begin_close();
                self.finish_close(&mut handler);
                (None, true)
            }
        };

        SessionReport {
            state: self.state.load(),
            stats: self.dispatcher.stats(),
            error,
            cancelled,
            handler,
        }
    }

    fn finish_close<H: StreamHandler>(&self, handler: &mut H) {
        self.state.close();
        info!(stats = ?self.dispatcher.stats(), "stream session closed");
        handler.on_close();
    }

    async fn drive<H: StreamHandler>(&mut self, request: StreamRequest, handler: &mut H) -> LoopEnd {
        let mut builder = self
            .client
            .post(request.url.clone())
            .header(ACCEPT, "text/event-stream")
            .json(&request.body);
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }

        debug!(url = %request.url, "opening stream");
        let response = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return LoopEnd::Cancelled,
            response = builder.send() => match response {
                Ok(response) => response,
                Err(err) => return LoopEnd::Failed(err.into()),
            },
        };

        let status = response.status();
        if !status.is_success() {
            let body = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return LoopEnd::Cancelled,
                body = response.text() => body.unwrap_or_default(),
            };
            return LoopEnd::Failed(StreamError::Status {
                status: status.as_u16(),
                body: body.chars().take(ERROR_BODY_LIMIT).collect(),
            });
        }

        // A cancel that landed while opening wins and suppresses the open hook,
        // whether it came through the state cell or the bare token.
        if self.cancel.is_cancelled()
            || !self.state.transition(SessionState::Opening, SessionState::Open)
        {
            return LoopEnd::Cancelled;
        }
        info!(status = status.as_u16(), "stream opened");
        handler.on_open();

        let mut decoder = FrameDecoder::new();
        let mut body = std::pin::pin!(response.bytes_stream());
        loop {
            let chunk = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return LoopEnd::Cancelled,
                chunk = body.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    for raw in decoder.feed(&bytes) {
                        if self.cancel.is_cancelled() {
                            return LoopEnd::Cancelled;
                        }
                        self.dispatcher.dispatch(raw, handler);
                    }
                }
                Some(Err(err)) => return LoopEnd::Failed(err.into()),
                None => break,
            }
        }

        if let Some(bytes) = decoder.finish() {
            handler.on_diagnostic(FrameDiagnostic::DroppedTrailing { bytes });
        }
        LoopEnd::Finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::time::Duration;

    use axum::Router;
    use axum::body::Body;
    use axum::http::{StatusCode, header};
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;

    #[derive(Default)]
    struct Recorder {
        opened: usize,
        closed: usize,
        errors: usize,
        events: Vec<StreamEvent>,
        diagnostics: Vec<FrameDiagnostic>,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl StreamHandler for Recorder {
        fn on_open(&mut self) {
            self.opened += 1;
        }

        fn on_event(&mut self, event: StreamEvent) {
            self.events.push(event);
            if let Some((limit, token)) = &self.cancel_after {
                if self.events.len() == *limit {
                    token.cancel();
                }
            }
        }

        fn on_diagnostic(&mut self, diagnostic: FrameDiagnostic) {
            self.diagnostics.push(diagnostic);
        }

        fn on_error(&mut self, _error: &StreamError) {
            self.errors += 1;
        }

        fn on_close(&mut self) {
            self.closed += 1;
        }
    }

    fn event_stream(body: String) -> Response {
        ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
    }

    fn text_frames(count: usize) -> String {
        (0..count)
            .map(|i| format!("event: text_chunk\ndata: {{\"text\":\"{i}\"}}\n\n"))
            .collect()
    }

    async fn serve(router: Router) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/stream")).unwrap()
    }

    fn request(url: Url) -> StreamRequest {
        StreamRequest::new(url, serde_json::json!({"query": "hi"}))
    }

    #[tokio::test]
    async fn test_stream_closes_after_end_of_body() {
        let router = Router::new().route(
            "/stream",
            post(|| async { event_stream(format!("{}event: tail\ndata: x", text_frames(3))) }),
        );
        let url = serve(router).await;

        let handle = StreamTransport::default().open(request(url), Recorder::default());
        let report = handle.join().await.unwrap();

        assert_eq!(report.state, SessionState::Closed);
        assert!(!report.cancelled);
        assert_eq!(report.stats.dispatched, 3);
        let recorder = report.handler;
        assert_eq!((recorder.opened, recorder.closed, recorder.errors), (1, 1, 0));
        assert_eq!(recorder.events[2], StreamEvent::TextChunk("2".to_string()));
        assert_eq!(
            recorder.diagnostics,
            vec![FrameDiagnostic::DroppedTrailing {
                bytes: "event: tail\ndata: x".len()
            }]
        );
    }

    #[tokio::test]
    async fn test_rejected_status_fails_without_open() {
        let router = Router::new().route(
            "/stream",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "queue full") }),
        );
        let url = serve(router).await;

        let report = StreamTransport::default()
            .open(request(url), Recorder::default())
            .join()
            .await
            .unwrap();

        assert_eq!(report.state, SessionState::Failed);
        assert_eq!(report.error.as_ref().and_then(StreamError::status), Some(503));
        let recorder = report.handler;
        assert_eq!((recorder.opened, recorder.closed, recorder.errors), (0, 0, 1));
    }

    #[tokio::test]
    async fn test_connection_refused_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let url = Url::parse(&format!("http://{addr}/stream")).unwrap();

        let report = StreamTransport::default()
            .open(request(url), Recorder::default())
            .join()
            .await
            .unwrap();

        assert_eq!(report.state, SessionState::Failed);
        assert!(matches!(report.error, Some(StreamError::HttpRequest(_))));
        assert_eq!(report.handler.errors, 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_delivery_of_buffered_frames() {
        // All frames arrive in one chunk, so the remaining ones are already buffered.
        let router = Router::new().route("/stream", post(|| async { event_stream(text_frames(5)) }));
        let url = serve(router).await;

        let token = CancellationToken::new();
        let recorder = Recorder {
            cancel_after: Some((2, token.clone())),
            ..Recorder::default()
        };
        let report = StreamTransport::default()
            .open_with_token(request(url), recorder, token)
            .join()
            .await
            .unwrap();

        assert_eq!(report.state, SessionState::Closed);
        assert!(report.cancelled);
        assert_eq!(report.handler.events.len(), 2);
        assert_eq!((report.handler.closed, report.handler.errors), (1, 0));
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_between_chunks() {
        let router = Router::new().route(
            "/stream",
            post(|| async {
                let chunks = futures::stream::unfold(0_usize, |i| async move {
                    if i >= 50 {
                        return None;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Some((Ok::<_, Infallible>(text_frames(1)), i + 1))
                });
                Response::builder()
                    .header(header::CONTENT_TYPE, "text/event-stream")
                    .body(Body::from_stream(chunks))
                    .unwrap()
            }),
        );
        let url = serve(router).await;

        let handle = StreamTransport::default().open(request(url), Recorder::default());
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.cancel();
        handle.cancel();
        assert_eq!(handle.state(), SessionState::Closing);
        let report = handle.join().await.unwrap();

        assert_eq!(report.state, SessionState::Closed);
        assert!(report.handler.events.len() < 50);
        assert_eq!((report.handler.opened, report.handler.closed, report.handler.errors), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_cancel_while_opening_suppresses_open_hook() {
        let router = Router::new().route(
            "/stream",
            post(|| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                event_stream(text_frames(1))
            }),
        );
        let url = serve(router).await;

        let handle = StreamTransport::default().open(request(url), Recorder::default());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.state(), SessionState::Opening);
        handle.cancel();
        let report = handle.join().await.unwrap();

        assert_eq!(report.state, SessionState::Closed);
        assert!(report.cancelled);
        let recorder = report.handler;
        assert_eq!((recorder.opened, recorder.closed, recorder.errors), (0, 1, 0));
        assert!(recorder.events.is_empty());
    }

    #[tokio::test]
    async fn test_token_cancel_after_response_suppresses_open_hook() {
        let router = Router::new().route("/stream", post(|| async { event_stream(text_frames(3)) }));
        let url = serve(router).await;

        // The token is already cancelled, so the response can never be observed
        // as open even if `send()` resolves first.
        let token = CancellationToken::new();
        token.cancel();
        let report = StreamTransport::default()
            .open_with_token(request(url), Recorder::default(), token)
            .join()
            .await
            .unwrap();

        assert_eq!(report.state, SessionState::Closed);
        assert!(report.cancelled);
        let recorder = report.handler;
        assert_eq!((recorder.opened, recorder.closed, recorder.errors), (0, 1, 0));
        assert!(recorder.events.is_empty());
    }

    #[tokio::test]
    async fn test_canceller_moves_state_to_closing() {
        let router = Router::new().route(
            "/stream",
            post(|| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                event_stream(text_frames(1))
            }),
        );
        let url = serve(router).await;

        let handle = StreamTransport::default().open(request(url), Recorder::default());
        let canceller = handle.canceller();
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
        assert_eq!(handle.state(), SessionState::Closing);
        assert_eq!(canceller.state(), SessionState::Closing);
        assert!(handle.cancel_token().is_cancelled());

        let report = handle.join().await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.handler.opened, 0);
        canceller.cancel();
        assert_eq!(canceller.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_cancel_after_completion_is_noop() {
        let router = Router::new().route("/stream", post(|| async { event_stream(text_frames(1)) }));
        let url = serve(router).await;

        let handle = StreamTransport::default().open(request(url), Recorder::default());
        while !handle.state().is_terminal() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.cancel();
        handle.cancel();
        assert_eq!(handle.state(), SessionState::Closed);

        let report = handle.join().await.unwrap();
        assert!(!report.cancelled);
        assert_eq!(report.handler.closed, 1);
    }

    #[test]
    fn test_state_cell_single_winner() {
        let cell = StateCell::new(SessionState::Opening);
        assert!(cell.begin_close());
        assert!(!cell.transition(SessionState::Opening, SessionState::Open));
        assert!(!cell.fail());
        assert!(!cell.begin_close());
        cell.close();
        assert_eq!(cell.load(), SessionState::Closed);
        assert!(!cell.begin_close());
    }
}
