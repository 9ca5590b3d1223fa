use crate::error::LlmError;
use crate::protocol::canonical::{ContentBlock, Delta, Event, StopReason};
use crate::protocol::gemini::{GeminiResponse, PartContent, PartMapper};
use crate::protocol::mapping::gemini_finish_to_stop;
use crate::stream::{parse_frame, BlockKey, CloseMode, SseFrame, StreamTranslator, TranslatorState};
use crate::util::new_message_id;

const TEXT_SLOT: BlockKey = BlockKey::Slot("text");
const THOUGHT_SLOT: BlockKey = BlockKey::Slot("thought");

/// Translator for `streamGenerateContent?alt=sse` chunks.
///
/// Every chunk is a full `GenerateContentResponse` holding the next parts of
/// candidate 0. Parts have no identity, so text and thoughts run in named
/// slots and any other part closes them.
#[derive(Debug)]
pub struct GeminiStreamTranslator {
    state: TranslatorState,
    parts: PartMapper,
}

impl GeminiStreamTranslator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: TranslatorState::new(CloseMode::Implicit),
            parts: PartMapper::default(),
        }
    }

    fn handle_chunk(&mut self, chunk: GeminiResponse, out: &mut Vec<Event>) -> Result<(), LlmError> {
        if let Some(error) = chunk.error {
            return Err(self.state.fail(error.describe()));
        }
        if !self.state.is_started() {
            let id = chunk
                .response_id
                .clone()
                .unwrap_or_else(|| new_message_id("gemini_"));
            self.state.start(
                &id,
                chunk.model_version.as_deref().unwrap_or_default(),
                Default::default(),
                out,
            );
        }
        if let Some(usage) = &chunk.usage_metadata {
            self.state.record_usage(&usage.to_usage());
        }

        let Some(candidate) = chunk.candidates.into_iter().next() else {
            if let Some(reason) = chunk.prompt_feedback.and_then(|f| f.block_reason) {
                tracing::debug!(block_reason = %reason, "gemini prompt blocked");
                self.state.record_stop(Some(StopReason::ContentFilter));
                self.state.complete(out);
            }
            return Ok(());
        };

        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            // a signature on a thought part signs that part; on any other part it signs the preceding thought
            let signature = part.thought_signature.clone().filter(|s| !s.is_empty());
            let (before, after) = if part.thought == Some(true) {
                (None, signature)
            } else {
                (signature, None)
            };
            if let Some(signature) = before {
                self.attach_signature(signature, out)?;
            }
            match self.parts.map(&part) {
                Some(PartContent::Thought(thinking)) => {
                    self.state.ensure_open(
                        THOUGHT_SLOT,
                        || ContentBlock::Thinking {
                            thinking: String::new(),
                            signature: None,
                        },
                        out,
                    )?;
                    self.state.delta(&THOUGHT_SLOT, Delta::Thinking { thinking }, out)?;
                }
                Some(PartContent::Text(text)) => {
                    self.state.ensure_open(TEXT_SLOT, || ContentBlock::text(""), out)?;
                    self.state.delta(&TEXT_SLOT, Delta::Text { text }, out)?;
                }
                Some(PartContent::Whole(ContentBlock::ToolUse {
                    id,
                    name,
                    input,
                    server_name,
                })) => {
                    // arguments arrive complete and are forwarded as one fragment
                    let key = self.state.synthetic_key();
                    self.state.open(
                        key.clone(),
                        ContentBlock::ToolUse {
                            id,
                            name,
                            input: serde_json::Value::Object(serde_json::Map::new()),
                            server_name,
                        },
                        out,
                    )?;
                    self.state.delta(
                        &key,
                        Delta::InputJson {
                            partial_json: input.to_string(),
                        },
                        out,
                    )?;
                    self.state.close(&key, out);
                }
                Some(PartContent::Whole(block)) => {
                    self.state.emit_whole(block, out)?;
                }
                None => {}
            }
            if let Some(signature) = after {
                self.attach_signature(signature, out)?;
            }
        }

        if let Some(reason) = candidate.finish_reason {
            self.state.record_stop(gemini_finish_to_stop(&reason));
            self.state.complete(out);
        }
        Ok(())
    }

    fn attach_signature(&mut self, signature: String, out: &mut Vec<Event>) -> Result<(), LlmError> {
        if self.state.lookup_open(&THOUGHT_SLOT).is_some() {
            return self.state.delta(&THOUGHT_SLOT, Delta::Signature { signature }, out);
        }
        // thoughts were not included; keep the signature so the next turn can replay it
        self.state.emit_whole(
            ContentBlock::Thinking {
                thinking: String::new(),
                signature: Some(signature),
            },
            out,
        )?;
        Ok(())
    }
}

impl Default for GeminiStreamTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTranslator for GeminiStreamTranslator {
    fn handle_frame(&mut self, frame: &SseFrame, out: &mut Vec<Event>) -> Result<(), LlmError> {
        if self.state.is_terminal() || frame.is_done() {
            return Ok(());
        }
        let Some(chunk) = parse_frame::<GeminiResponse>(frame, "gemini stream chunk")? else {
            return Ok(());
        };
        self.handle_chunk(chunk, out)
    }

    fn handle_end(&mut self, out: &mut Vec<Event>) -> Result<(), LlmError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        if !self.state.is_started() {
            return Err(self.state.fail("gemini stream ended before any chunk"));
        }
        self.state.complete(out);
        Ok(())
    }

    fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
