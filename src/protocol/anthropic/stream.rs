use crate::error::LlmError;
use crate::protocol::anthropic::response_decoder::block_from_wire;
use crate::protocol::anthropic::{parse_citation, AnthropicDelta, AnthropicStreamEvent};
use crate::protocol::canonical::{Delta, Event};
use crate::protocol::mapping::anthropic_stop_to_stop;
use crate::stream::{parse_frame, BlockKey, CloseMode, SseFrame, StreamTranslator, TranslatorState};

/// Translator for the Anthropic Messages stream.
///
/// Anthropic already numbers and closes blocks explicitly, so this is mostly
/// a re-keying pass; the state still guards against duplicate starts and
/// fragments for unknown indices.
#[derive(Debug)]
pub struct AnthropicStreamTranslator {
    state: TranslatorState,
}

impl AnthropicStreamTranslator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: TranslatorState::new(CloseMode::Explicit),
        }
    }

    fn handle_event(
        &mut self,
        event: AnthropicStreamEvent,
        out: &mut Vec<Event>,
    ) -> Result<(), LlmError> {
        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                self.state
                    .start(&message.id, &message.model, message.usage.to_usage(), out);
            }
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let key = BlockKey::Native(index);
                match block_from_wire(content_block) {
                    Some(block) => {
                        self.state.open(key, block, out)?;
                    }
                    None => self.state.ignore(key),
                }
            }
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => {
                let key = BlockKey::Native(index);
                let delta = match delta {
                    AnthropicDelta::TextDelta { text } => Delta::Text { text },
                    AnthropicDelta::ThinkingDelta { thinking } => Delta::Thinking { thinking },
                    AnthropicDelta::InputJsonDelta { partial_json } => {
                        Delta::InputJson { partial_json }
                    }
                    AnthropicDelta::SignatureDelta { signature } => Delta::Signature { signature },
                    AnthropicDelta::CitationsDelta { citation } => {
                        let Some(citation) = parse_citation(&citation) else {
                            return Ok(());
                        };
                        Delta::Citation { citation }
                    }
                    AnthropicDelta::Unknown => {
                        tracing::debug!(index, "skipping unknown anthropic delta type");
                        return Ok(());
                    }
                };
                self.state.delta(&key, delta, out)?;
            }
            AnthropicStreamEvent::ContentBlockStop { index } => {
                self.state.close(&BlockKey::Native(index), out);
            }
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                self.state
                    .record_stop(delta.stop_reason.as_deref().and_then(anthropic_stop_to_stop));
                self.state.record_usage(&usage.to_usage());
            }
            AnthropicStreamEvent::MessageStop {} => self.state.complete(out),
            AnthropicStreamEvent::Ping {} => {}
            AnthropicStreamEvent::Error { error } => {
                return Err(self
                    .state
                    .fail(format!("{}: {}", error.type_, error.message)));
            }
            AnthropicStreamEvent::Unknown => {
                tracing::debug!("skipping unknown anthropic stream event");
            }
        }
        Ok(())
    }
}

impl Default for AnthropicStreamTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTranslator for AnthropicStreamTranslator {
    fn handle_frame(&mut self, frame: &SseFrame, out: &mut Vec<Event>) -> Result<(), LlmError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        let Some(event) = parse_frame::<AnthropicStreamEvent>(frame, "anthropic stream event")?
        else {
            return Ok(());
        };
        self.handle_event(event, out)
    }

    fn handle_end(&mut self, _out: &mut Vec<Event>) -> Result<(), LlmError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        Err(self.state.fail("anthropic stream ended before message_stop"))
    }

    fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
