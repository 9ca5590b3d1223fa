use std::collections::VecDeque;
use std::time::Instant;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::LlmError;
use crate::observability::log_response_usage;
use crate::protocol::canonical::{Event, ProviderKind, Response};
use crate::stream::{ResponseAccumulator, SseDecoder, SseFrame, StreamTranslator};
use crate::transport::ByteStream;

/// Usage summary kept while events pass through, logged on `MessageStop`.
struct UsageLog {
    provider: String,
    kind: ProviderKind,
    started: Instant,
    summary: Response,
}

/// Pull-based stream of canonical events decoded from one provider response.
///
/// Owned by a single task. Each call to [`next`](EventStream::next) yields at
/// most one event; events already translated when a failure occurs are still
/// delivered before `next` reports the end. The byte source is released on
/// completion, on error, on [`close`](EventStream::close) and on drop.
pub struct EventStream {
    source: Option<ByteStream>,
    decoder: SseDecoder,
    translator: Box<dyn StreamTranslator>,
    frames: Vec<SseFrame>,
    pending: VecDeque<Event>,
    current: Option<Event>,
    error: Option<LlmError>,
    finished: bool,
    cancel: CancellationToken,
    usage_log: Option<UsageLog>,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("pending", &self.pending.len())
            .field("current", &self.current)
            .field("error", &self.error)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl EventStream {
    #[must_use]
    pub fn new(
        source: ByteStream,
        translator: Box<dyn StreamTranslator>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source: Some(source),
            decoder: SseDecoder::new(),
            translator,
            frames: Vec::new(),
            pending: VecDeque::new(),
            current: None,
            error: None,
            finished: false,
            cancel,
            usage_log: None,
        }
    }

    /// Log usage at INFO once the message completes.
    #[must_use]
    pub fn with_usage_log(mut self, provider: impl Into<String>, kind: ProviderKind) -> Self {
        self.usage_log = Some(UsageLog {
            provider: provider.into(),
            kind,
            started: Instant::now(),
            summary: Response::default(),
        });
        self
    }

    /// Advance to the next event.
    ///
    /// Returns `false` once `MessageStop` has been delivered, after
    /// [`close`](EventStream::close), or on an unrecoverable error; check
    /// [`err`](EventStream::err) to tell them apart.
    pub async fn next(&mut self) -> bool {
        loop {
            if let Some(event) = self.pending.pop_front() {
                self.observe(&event);
                self.current = Some(event);
                return true;
            }
            self.current = None;
            if self.finished {
                return false;
            }
            self.pump().await;
        }
    }

    /// The event the last successful [`next`](EventStream::next) moved to.
    #[must_use]
    pub fn event(&self) -> Option<&Event> {
        self.current.as_ref()
    }

    #[must_use]
    pub fn err(&self) -> Option<&LlmError> {
        self.error.as_ref()
    }

    /// Release the byte source. Safe to call more than once.
    pub fn close(&mut self) {
        if self.source.take().is_some() {
            tracing::debug!(undelivered = self.pending.len(), "event stream closed");
        }
        self.pending.clear();
        self.current = None;
        self.finished = true;
    }

    /// Drain the remaining events into a [`Response`].
    ///
    /// Folding starts at the first undelivered event, so this is meant to be
    /// called instead of iterating, not after it.
    ///
    /// # Errors
    ///
    /// Returns the stream's error, a [`LlmError::Decode`] from the
    /// accumulator, or [`LlmError::Stream`] when the stream was closed before
    /// `MessageStop`.
    pub async fn into_response(mut self) -> Result<Response, LlmError> {
        let mut acc = ResponseAccumulator::new();
        while self.next().await {
            if let Some(event) = self.current.as_ref() {
                acc.add_event(event)?;
            }
        }
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        if !acc.is_complete() {
            return Err(LlmError::Stream(
                "event stream closed before MessageStop".to_string(),
            ));
        }
        Ok(acc.into_response())
    }

    async fn pump(&mut self) {
        let Some(source) = self.source.as_mut() else {
            self.finished = true;
            return;
        };
        let chunk = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Some(Err(LlmError::Cancelled)),
            chunk = source.next() => chunk,
        };

        let mut out = Vec::new();
        let (result, at_eof) = match chunk {
            Some(Ok(bytes)) => (self.translate_bytes(&bytes, &mut out), false),
            Some(Err(err)) => (Err(err), false),
            None => (self.translate_eof(&mut out), true),
        };
        self.pending.extend(out);
        match result {
            Err(err) => self.fail(err),
            Ok(()) if at_eof || self.translator.is_terminal() => self.finish_source(),
            Ok(()) => {}
        }
    }

    fn translate_bytes(&mut self, bytes: &[u8], out: &mut Vec<Event>) -> Result<(), LlmError> {
        let mut frames = std::mem::take(&mut self.frames);
        self.decoder.feed_bytes(bytes, &mut frames);
        let result = self.translate_frames(&frames, out);
        frames.clear();
        self.frames = frames;
        result
    }

    fn translate_eof(&mut self, out: &mut Vec<Event>) -> Result<(), LlmError> {
        let mut frames = Vec::new();
        self.decoder.finish(&mut frames);
        self.translate_frames(&frames, out)?;
        if self.translator.is_terminal() {
            return Ok(());
        }
        self.translator.handle_end(out)
    }

    fn translate_frames(&mut self, frames: &[SseFrame], out: &mut Vec<Event>) -> Result<(), LlmError> {
        for (position, frame) in frames.iter().enumerate() {
            if self.translator.is_terminal() {
                tracing::debug!(
                    skipped = frames.len() - position,
                    "ignoring SSE frames after the terminal event"
                );
                break;
            }
            self.translator.handle_frame(frame, out)?;
        }
        Ok(())
    }

    fn fail(&mut self, err: LlmError) {
        tracing::debug!(error = %err, "event stream failed");
        self.error = Some(err);
        self.finish_source();
    }

    fn finish_source(&mut self) {
        self.source = None;
        self.finished = true;
    }

    fn observe(&mut self, event: &Event) {
        let Some(log) = self.usage_log.as_mut() else {
            return;
        };
        match event {
            Event::MessageStart { message } => {
                log.summary.id.clone_from(&message.id);
                log.summary.model.clone_from(&message.model);
                log.summary.usage.merge(&message.usage);
            }
            Event::MessageDelta { stop_reason, usage } => {
                if stop_reason.is_some() {
                    log.summary.stop_reason = *stop_reason;
                }
                if let Some(usage) = usage {
                    log.summary.usage.merge(usage);
                }
            }
            Event::MessageStop => {
                log_response_usage(&log.provider, log.kind, &log.summary, log.started.elapsed());
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{ContentBlock, StopReason};
    use crate::stream::translator_for;
    use bytes::Bytes;
    use serde_json::json;

    fn chat_chunk(content: &str, finish: Option<&str>) -> String {
        let body = json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": finish}]
        });
        format!("data: {body}\n\n")
    }

    fn stream_of(chunks: Vec<Result<Bytes, LlmError>>) -> EventStream {
        EventStream::new(
            Box::pin(futures_util::stream::iter(chunks)),
            translator_for(ProviderKind::OpenAi),
            CancellationToken::new(),
        )
    }

    fn split(text: &str, at: usize) -> Vec<Result<Bytes, LlmError>> {
        let bytes = Bytes::copy_from_slice(text.as_bytes());
        vec![Ok(bytes.slice(..at)), Ok(bytes.slice(at..))]
    }

    #[tokio::test]
    async fn test_into_response_across_chunk_boundaries() {
        let wire = format!(
            "{}{}data: [DONE]\n\n",
            chat_chunk("Héllo", None),
            chat_chunk("!", Some("stop"))
        );
        // split inside the two-byte 'é'
        let at = wire.find('é').unwrap() + 1;
        let response = stream_of(split(&wire, at)).into_response().await.unwrap();
        assert_eq!(response.content, vec![ContentBlock::text("Héllo!")]);
        assert_eq!(response.stop_reason, Some(StopReason::EndTurn));
    }

    #[tokio::test]
    async fn test_events_before_error_are_delivered() {
        let chunks = vec![
            Ok(Bytes::from(chat_chunk("partial", None))),
            Err(LlmError::Transport("connection reset".into())),
        ];
        let mut stream = stream_of(chunks);
        let mut seen = Vec::new();
        while stream.next().await {
            seen.push(stream.event().cloned().unwrap());
        }
        assert!(matches!(seen[0], Event::MessageStart { .. }));
        assert!(matches!(seen.last(), Some(Event::ContentBlockDelta { .. })));
        assert!(matches!(stream.err(), Some(LlmError::Transport(_))));
        assert!(stream.event().is_none());
        assert!(!stream.next().await);
    }

    #[tokio::test]
    async fn test_next_is_false_after_message_stop() {
        let wire = format!("{}data: [DONE]\n\n", chat_chunk("hi", Some("stop")));
        let mut stream = stream_of(vec![Ok(Bytes::from(wire))]);
        let mut last = None;
        while stream.next().await {
            last = stream.event().cloned();
        }
        assert_eq!(last, Some(Event::MessageStop));
        assert!(stream.err().is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut stream = stream_of(vec![Ok(Bytes::from(chat_chunk("hi", None)))]);
        assert!(stream.next().await);
        stream.close();
        stream.close();
        assert!(!stream.next().await);
        assert!(stream.err().is_none());
    }

    #[tokio::test]
    async fn test_cancellation_ends_stream() {
        let cancel = CancellationToken::new();
        let mut stream = EventStream::new(
            Box::pin(futures_util::stream::pending()),
            translator_for(ProviderKind::Anthropic),
            cancel.clone(),
        );
        cancel.cancel();
        assert!(!stream.next().await);
        assert!(matches!(stream.err(), Some(LlmError::Cancelled)));
    }

    #[tokio::test]
    async fn test_premature_eof_is_stream_error() {
        let wire = "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"type\":\"message\",\"role\":\"assistant\",\"model\":\"claude\",\"content\":[],\"usage\":{\"input_tokens\":3,\"output_tokens\":0}}}\n\n";
        let stream = EventStream::new(
            Box::pin(futures_util::stream::iter(vec![Ok(Bytes::from(wire))])),
            translator_for(ProviderKind::Anthropic),
            CancellationToken::new(),
        );
        assert!(matches!(stream.into_response().await, Err(LlmError::Stream(_))));
    }
}
