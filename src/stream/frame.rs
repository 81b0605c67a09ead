//! Frame decoding for the task event stream.
//!
//! The wire format is line oriented: an `event:` line names the frame, one or
//! more `data:` lines carry the payload, and a blank line terminates it.
//! Bytes arrive in arbitrary chunks, so both the UTF-8 decoding and the frame
//! splitting keep state across calls.

use tracing::{debug, warn};

/// Frame terminator (two consecutive newlines).
pub const FRAME_TERMINATOR: &str = "\n\n";
/// Event name used when a frame carries no `event:` line.
pub const DEFAULT_EVENT_NAME: &str = "message";

const EVENT_MARKER: &str = "event:";
const DATA_MARKER: &str = "data:";
const COMMENT_MARKER: char = ':';

/// One terminated frame, before payload interpretation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawEvent {
    /// Event name (`message` when absent).
    pub name: String,
    /// Concatenated data lines.
    pub payload: String,
    /// Whether the frame contained lines that are neither `event:` nor `data:`.
    pub malformed: bool,
}

impl RawEvent {
    /// Build a well-formed event.
    #[must_use]
    pub fn new(name: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
            malformed: false,
        }
    }
}

/// Incremental UTF-8 decoder that holds back split multi-byte sequences.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Create an empty decoder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Decode as much of `bytes` as possible.
    ///
    /// A trailing incomplete sequence is kept for the next call; invalid
    /// sequences are replaced with U+FFFD.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let keep = rest.len();
        let drain_to = self.pending.len() - keep;
        self.pending.drain(..drain_to);
        out
    }

    /// Flush whatever is still pending at end of stream.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }

    /// Number of bytes held back.
    #[must_use]
    pub const fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Splits decoded text into [`RawEvent`]s.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    text: Utf8Decoder,
    buffer: String,
    // Offset below which the buffer is known to hold no terminator.
    scanned: usize,
}

impl FrameDecoder {
    /// Create a decoder with an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from the transport.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<RawEvent> {
        let text = self.text.decode(bytes);
        self.feed_str(&text)
    }

    /// Feed already decoded text.
    pub fn feed_str(&mut self, text: &str) -> Vec<RawEvent> {
        self.buffer.extend(text.chars().filter(|c| *c != '\r'));

        let mut events = Vec::new();
        loop {
            let Some(offset) = self.buffer[self.scanned..].find(FRAME_TERMINATOR) else {
                // A terminator may straddle the next chunk: rescan the last byte.
                self.scanned = self.buffer.len().saturating_sub(1);
                while !self.buffer.is_char_boundary(self.scanned) {
                    self.scanned -= 1;
                }
                break;
            };
            let boundary = self.scanned + offset;
            let frame: String = self.buffer.drain(..boundary + FRAME_TERMINATOR.len()).collect();
            self.scanned = 0;
            if let Some(event) = parse_frame(&frame[..boundary]) {
                events.push(event);
            }
        }
        events
    }

    /// Signal end of stream.
    ///
    /// An unterminated trailing frame is never emitted; its length in bytes is
    /// returned so the caller can report it.
    pub fn finish(&mut self) -> Option<usize> {
        let tail = self.text.finish();
        self.buffer.push_str(&tail);
        let dropped = self.buffer.trim().len();
        self.buffer.clear();
        self.scanned = 0;
        if dropped == 0 {
            None
        } else {
            debug!(bytes = dropped, "dropping unterminated trailing frame");
            Some(dropped)
        }
    }

    /// Bytes of text waiting for a terminator.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() + self.text.pending_len()
    }
}

/// Parse one frame body (terminator already removed).
///
/// Returns `None` for empty and comment frames.
fn parse_frame(frame: &str) -> Option<RawEvent> {
    let frame = frame.trim();
    if frame.is_empty() || frame.starts_with(COMMENT_MARKER) {
        return None;
    }

    let mut name = DEFAULT_EVENT_NAME.to_string();
    let mut payload = String::new();
    let mut malformed = false;

    for line in frame.split('\n') {
        if let Some(value) = line.strip_prefix(EVENT_MARKER) {
            name = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix(DATA_MARKER) {
            payload.push_str(value.trim());
        } else if !line.trim().is_empty() {
            warn!(line, "non-standard line in event frame");
            malformed = true;
        }
    }

    Some(RawEvent {
        name,
        payload,
        malformed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = "event: text_chunk\ndata: {\"text\":\"hel\"}\n\nevent: text_chunk\ndata: {\"text\":\"lo\"}\n\nevent: message_end\ndata: {\"answer\":\"hello!\"}\n\n";

    fn feed_bytewise(input: &[u8]) -> Vec<RawEvent> {
        let mut decoder = FrameDecoder::new();
        input
            .iter()
            .flat_map(|byte| decoder.feed(std::slice::from_ref(byte)))
            .collect()
    }

    #[test]
    fn test_single_frame() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(b"event: text_chunk\ndata: {\"text\":\"hi\"}\n\n");
        assert_eq!(events, vec![RawEvent::new("text_chunk", "{\"text\":\"hi\"}")]);
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn test_chunk_boundary_independence() {
        let mut whole = FrameDecoder::new();
        let expected = whole.feed(SCENARIO.as_bytes());
        assert_eq!(expected.len(), 3);
        assert_eq!(feed_bytewise(SCENARIO.as_bytes()), expected);
    }

    #[test]
    fn test_chunk_boundary_independence_multibyte() {
        let input = "event: text_chunk\ndata: {\"text\":\"开始优化 ✓\"}\n\n: keepalive\n\ndata: é\n\n";
        let mut whole = FrameDecoder::new();
        let expected = whole.feed(input.as_bytes());
        assert_eq!(expected.len(), 2);
        assert_eq!(expected[0].payload, "{\"text\":\"开始优化 ✓\"}");
        assert_eq!(feed_bytewise(input.as_bytes()), expected);
    }

    #[test]
    fn test_default_event_name() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.feed_str("data: plain\n\n");
        assert_eq!(events[0].name, DEFAULT_EVENT_NAME);
        assert_eq!(events[0].payload, "plain");
    }

    #[test]
    fn test_multiple_data_lines_concatenate() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.feed_str("event: message_end\ndata: {\"answer\":\ndata: \"ok\"}\n\n");
        assert_eq!(events[0].payload, "{\"answer\":\"ok\"}");
    }

    #[test]
    fn test_comment_and_empty_frames_discarded() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.feed_str(": ping\n\n\n\n   \n\nevent: a\ndata: 1\n\n");
        assert_eq!(events, vec![RawEvent::new("a", "1")]);
    }

    #[test]
    fn test_malformed_frame_keeps_fields() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.feed_str("event: text_chunk\nDEBUG backend says hi\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert!(events[0].malformed);
        assert_eq!(events[0].name, "text_chunk");
        assert_eq!(events[0].payload, "x");
    }

    #[test]
    fn test_unterminated_frame_never_emitted() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed_str("event: a\ndata: 1\n").is_empty());
        assert_eq!(decoder.finish(), Some("event: a\ndata: 1".len()));
        assert!(decoder.feed_str("").is_empty());
    }

    #[test]
    fn test_crlf_frames() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(b"event: a\r\ndata: 1\r\n\r\nevent: b\r\n");
        assert_eq!(events, vec![RawEvent::new("a", "1")]);
        let events = decoder.feed(b"data: 2\r\n\r\n");
        assert_eq!(events, vec![RawEvent::new("b", "2")]);
    }

    #[test]
    fn test_utf8_decoder_split_sequence() {
        let bytes = "优".as_bytes();
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(&bytes[..1]), "");
        assert_eq!(decoder.pending_len(), 1);
        assert_eq!(decoder.decode(&bytes[1..]), "优");
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_utf8_decoder_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
        assert_eq!(decoder.decode(&[0xE4]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }
}
