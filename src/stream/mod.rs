pub mod accumulator;
pub mod event_stream;
pub mod sse;
pub mod state;

pub use accumulator::ResponseAccumulator;
pub use event_stream::EventStream;
pub use sse::{SseDecoder, SseFrame, SseParser};
pub use state::{BlockKey, CloseMode, TranslatorState};

use serde::de::DeserializeOwned;

use crate::error::LlmError;
use crate::protocol::anthropic::stream::AnthropicStreamTranslator;
use crate::protocol::canonical::{Event, ProviderKind};
use crate::protocol::gemini::stream::GeminiStreamTranslator;
use crate::protocol::openai_chat::stream::OpenAiChatStreamTranslator;
use crate::protocol::openai_responses::stream::ResponsesStreamTranslator;

/// Turns one provider's SSE records into canonical [`Event`]s.
///
/// Implementations own a [`TranslatorState`], perform no I/O and stop
/// producing events after the first fatal error or the terminal event.
pub trait StreamTranslator: Send {
    /// Translate one dispatched SSE frame.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Decode`] for malformed records or fragments that
    /// reference an unknown block, and [`LlmError::Stream`] when the provider
    /// reports an error in-band.
    fn handle_frame(&mut self, frame: &SseFrame, out: &mut Vec<Event>) -> Result<(), LlmError>;

    /// The `[DONE]` sentinel arrived.
    ///
    /// # Errors
    ///
    /// Same as [`StreamTranslator::handle_end`].
    fn handle_done(&mut self, out: &mut Vec<Event>) -> Result<(), LlmError> {
        self.handle_end(out)
    }

    /// The byte source ended.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Stream`] when the stream ended before the provider's
    /// completion marker and the protocol has no implicit completion.
    fn handle_end(&mut self, out: &mut Vec<Event>) -> Result<(), LlmError>;

    fn is_terminal(&self) -> bool;

    /// Translate one frame into a fresh vector.
    ///
    /// # Errors
    ///
    /// Same as [`StreamTranslator::handle_frame`].
    fn translate(&mut self, frame: &SseFrame) -> Result<Vec<Event>, LlmError> {
        let mut out = Vec::new();
        self.handle_frame(frame, &mut out)?;
        Ok(out)
    }
}

/// Build the translator for a provider protocol.
#[must_use]
pub fn translator_for(kind: ProviderKind) -> Box<dyn StreamTranslator> {
    match kind {
        ProviderKind::Anthropic => Box::new(AnthropicStreamTranslator::new()),
        ProviderKind::OpenAi => Box::new(OpenAiChatStreamTranslator::new()),
        ProviderKind::OpenAiResponses => Box::new(ResponsesStreamTranslator::new()),
        ProviderKind::Gemini => Box::new(GeminiStreamTranslator::new()),
    }
}

/// Parse a frame's JSON payload, skipping keep-alive frames with empty data.
pub(crate) fn parse_frame<T: DeserializeOwned>(
    frame: &SseFrame,
    context: &str,
) -> Result<Option<T>, LlmError> {
    let data = frame.data.trim();
    if data.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(data)
        .map(Some)
        .map_err(|e| LlmError::decode(context, e))
}
