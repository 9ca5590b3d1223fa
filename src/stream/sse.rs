//! Server-Sent Events framing.
//!
//! [`SseParser`] works on text, [`SseDecoder`] sits in front of it and
//! reassembles UTF-8 sequences split across network chunks. Field handling
//! follows the
//! [HTML event-stream rules](https://html.spec.whatwg.org/multipage/server-sent-events.html).

use std::borrow::Cow;

use memchr::memchr_iter;

/// The `data:` payload OpenAI-style providers send as the end-of-stream sentinel.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One dispatched SSE frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseFrame {
    /// Unnamed frame carrying `data`.
    #[must_use]
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
            id: None,
        }
    }

    /// Named frame, the shape Anthropic and the Responses API use.
    #[must_use]
    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
            id: None,
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_SENTINEL
    }
}

/// Fields collected for the frame being assembled.
#[derive(Debug, Default)]
struct PendingFrame {
    event: Option<String>,
    data: String,
    has_data: bool,
    // persists across frames
    last_id: Option<String>,
}

impl PendingFrame {
    fn apply_line(&mut self, line: &str, out: &mut Vec<SseFrame>) {
        if line.is_empty() {
            self.dispatch(out);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.has_data = true;
                self.data.push_str(value);
            }
            "event" => self.event = Some(value.to_string()),
            "id" => self.last_id = Some(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self, out: &mut Vec<SseFrame>) {
        if !self.has_data {
            self.event = None;
            return;
        }
        self.has_data = false;
        out.push(SseFrame {
            event: self.event.take(),
            data: std::mem::take(&mut self.data),
            id: self.last_id.clone(),
        });
    }
}

/// Incremental SSE text parser.
///
/// Chunks may split lines anywhere; complete lines are consumed and the
/// unterminated tail is kept for the next call.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    consumed: usize,
    pending: PendingFrame,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<SseFrame> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Parse `chunk` and append completed frames to `out`.
    ///
    /// `event:`, `data:` and `id:` are honored, `:` comments and other fields
    /// (`retry:`) are skipped, and a blank line dispatches the frame.
    pub fn feed_into(&mut self, chunk: &str, out: &mut Vec<SseFrame>) {
        self.buffer.push_str(chunk);
        let scan_from = self.consumed;
        for newline in memchr_iter(b'\n', &self.buffer.as_bytes()[scan_from..]) {
            let end = scan_from + newline;
            let line = &self.buffer[self.consumed..end];
            self.pending
                .apply_line(line.strip_suffix('\r').unwrap_or(line), out);
            self.consumed = end + 1;
        }
        self.compact();
    }

    /// Treat end of input as a line break followed by a blank line.
    pub fn finish_into(&mut self, out: &mut Vec<SseFrame>) {
        let tail = std::mem::take(&mut self.buffer);
        let line = &tail[self.consumed..];
        if !line.is_empty() {
            self.pending
                .apply_line(line.strip_suffix('\r').unwrap_or(line), out);
        }
        self.consumed = 0;
        self.pending.dispatch(out);
    }

    fn compact(&mut self) {
        if self.consumed == self.buffer.len() {
            self.buffer.clear();
            self.consumed = 0;
        } else if self.consumed >= 8 * 1024 || self.consumed >= self.buffer.len() / 2 {
            self.buffer.drain(..self.consumed);
            self.consumed = 0;
        }
    }
}

/// Byte-level front end for [`SseParser`] that holds back incomplete UTF-8
/// sequences split across network chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    parser: SseParser,
    remainder: Vec<u8>,
}

impl SseDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed_bytes(&mut self, bytes: &[u8], out: &mut Vec<SseFrame>) {
        let pending: Cow<'_, [u8]> = if self.remainder.is_empty() {
            Cow::Borrowed(bytes)
        } else {
            self.remainder.extend_from_slice(bytes);
            Cow::Owned(std::mem::take(&mut self.remainder))
        };
        let mut rest: &[u8] = &pending;
        while !rest.is_empty() {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.parser.feed_into(text, out);
                    break;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    if let Ok(text) = std::str::from_utf8(&rest[..valid_up_to]) {
                        self.parser.feed_into(text, out);
                    }
                    let Some(invalid_len) = err.error_len() else {
                        // incomplete sequence at the tail: hold it for the next chunk
                        self.remainder.extend_from_slice(&rest[valid_up_to..]);
                        break;
                    };
                    tracing::warn!("replacing invalid UTF-8 in SSE stream");
                    self.parser
                        .feed_into(char::REPLACEMENT_CHARACTER.encode_utf8(&mut [0; 4]), out);
                    rest = &rest[valid_up_to + invalid_len..];
                }
            }
        }
    }

    /// Flush whatever the source left behind at EOF.
    pub fn finish(&mut self, out: &mut Vec<SseFrame>) {
        if !self.remainder.is_empty() {
            let tail = String::from_utf8_lossy(&self.remainder).into_owned();
            self.remainder.clear();
            self.parser.feed_into(&tail, out);
        }
        self.parser.finish_into(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_data_frame() {
        let mut parser = SseParser::new();
        let frames = parser.feed("data: hello world\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "hello world");
        assert!(frames[0].event.is_none());
    }

    #[test]
    fn test_parse_named_event() {
        let mut parser = SseParser::new();
        let frames = parser.feed("event: message_start\ndata: {\"type\":\"message_start\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        assert_eq!(frames[0].data, "{\"type\":\"message_start\"}");
    }

    #[test]
    fn test_parse_multiline_data() {
        let mut parser = SseParser::new();
        let frames = parser.feed("data: line1\ndata: line2\ndata: line3\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "line1\nline2\nline3");
    }

    #[test]
    fn test_parse_ignores_comments_and_retry() {
        let mut parser = SseParser::new();
        let frames = parser.feed(": keep-alive\nretry: 3000\ndata: hello\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "hello");
    }

    #[test]
    fn test_parse_done_frame() {
        let mut parser = SseParser::new();
        let frames = parser.feed("data: [DONE]\n\n");
        assert!(frames[0].is_done());
    }

    #[test]
    fn test_parse_incremental_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed("data: hel").is_empty());
        assert!(parser.feed("lo\n").is_empty());
        let frames = parser.feed("\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "hello");
    }

    #[test]
    fn test_parse_crlf_line_endings() {
        let mut parser = SseParser::new();
        let frames = parser.feed("event: ping\r\ndata: {}\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("ping"));
        assert_eq!(frames[0].data, "{}");
    }

    #[test]
    fn test_parse_empty_lines_without_data_dont_emit() {
        let mut parser = SseParser::new();
        assert!(parser.feed("\n\n\n").is_empty());
    }

    #[test]
    fn test_field_without_colon_has_empty_value() {
        let mut parser = SseParser::new();
        let frames = parser.feed("data\ndata:x\n\n");
        assert_eq!(frames[0].data, "\nx");
    }

    #[test]
    fn test_parse_id_field() {
        let mut parser = SseParser::new();
        let frames = parser.feed("id: 42\ndata: x\n\n");
        assert_eq!(frames[0].id.as_deref(), Some("42"));
    }

    #[test]
    fn test_finish_flushes_unterminated_frame() {
        let mut parser = SseParser::new();
        let mut frames = parser.feed("data: {\"a\":1}");
        assert!(frames.is_empty());
        parser.finish_into(&mut frames);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"a\":1}");
    }

    #[test]
    fn test_decoder_split_utf8_sequence() {
        let mut decoder = SseDecoder::new();
        let mut frames = Vec::new();
        let payload = "data: héllo\n\n".as_bytes();
        // split inside the two-byte 'é'
        let split = payload.iter().position(|b| *b == 0xC3).unwrap() + 1;
        decoder.feed_bytes(&payload[..split], &mut frames);
        assert!(frames.is_empty());
        decoder.feed_bytes(&payload[split..], &mut frames);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "héllo");
    }

    #[test]
    fn test_decoder_invalid_byte_keeps_split_tail() {
        let mut decoder = SseDecoder::new();
        let mut frames = Vec::new();
        decoder.feed_bytes(b"data: a\xffb \xc3", &mut frames);
        assert!(frames.is_empty());
        decoder.feed_bytes(b"\xa9\n\n", &mut frames);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "a\u{fffd}b \u{e9}");
    }

    #[test]
    fn test_decoder_finish_flushes() {
        let mut decoder = SseDecoder::new();
        let mut frames = Vec::new();
        decoder.feed_bytes(b"event: done\ndata: 1\n", &mut frames);
        decoder.finish(&mut frames);
        assert_eq!(frames, vec![SseFrame::named("done", "1")]);
    }
}
