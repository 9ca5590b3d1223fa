use rustc_hash::FxHashMap;

use crate::error::LlmError;
use crate::protocol::canonical::{ContentBlock, Delta, Event, Usage};
use crate::protocol::mapping::openai_finish_to_stop;
use crate::protocol::openai_chat::{OpenAiStreamChunk, OpenAiStreamToolCall};
use crate::stream::{parse_frame, BlockKey, CloseMode, SseFrame, StreamTranslator, TranslatorState};
use crate::util::next_call_id;

const TEXT_SLOT: BlockKey = BlockKey::Slot("text");
const REASONING_SLOT: BlockKey = BlockKey::Slot("reasoning");
const REFUSAL_SLOT: BlockKey = BlockKey::Slot("refusal");

/// Translator for Chat Completions chunks (OpenAI and compatible vendors).
///
/// Chunks carry no block boundaries: a run of text, reasoning or one tool
/// call ends when something else starts, so the state runs in implicit-close
/// mode. The message completes on `[DONE]` (or EOF) rather than on
/// `finish_reason`, because the usage chunk arrives after it.
#[derive(Debug)]
pub struct OpenAiChatStreamTranslator {
    state: TranslatorState,
    // id of the call currently streaming at each native tool-call index
    call_ids: FxHashMap<u64, String>,
}

impl OpenAiChatStreamTranslator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: TranslatorState::new(CloseMode::Implicit),
            call_ids: FxHashMap::default(),
        }
    }

    fn handle_chunk(&mut self, chunk: OpenAiStreamChunk, out: &mut Vec<Event>) -> Result<(), LlmError> {
        if let Some(error) = chunk.error {
            return Err(self.state.fail(error.describe()));
        }
        self.state.start(&chunk.id, &chunk.model, Usage::default(), out);

        // only the first choice is consumed
        if let Some(choice) = chunk.choices.into_iter().find(|c| c.index == 0) {
            let delta = choice.delta;
            let non_empty = |s: &String| !s.is_empty();
            if let Some(reasoning) = delta
                .reasoning_content
                .filter(non_empty)
                .or_else(|| delta.reasoning.filter(non_empty))
            {
                self.state.ensure_open(
                    REASONING_SLOT,
                    || ContentBlock::Thinking {
                        thinking: String::new(),
                        signature: None,
                    },
                    out,
                )?;
                self.state
                    .delta(&REASONING_SLOT, Delta::Thinking { thinking: reasoning }, out)?;
            }
            if let Some(text) = delta.content.filter(|s| !s.is_empty()) {
                self.state
                    .ensure_open(TEXT_SLOT, || ContentBlock::text(""), out)?;
                self.state.delta(&TEXT_SLOT, Delta::Text { text }, out)?;
            }
            if let Some(text) = delta.refusal.filter(|s| !s.is_empty()) {
                self.state.ensure_open(
                    REFUSAL_SLOT,
                    || ContentBlock::Refusal {
                        text: String::new(),
                    },
                    out,
                )?;
                self.state.delta(&REFUSAL_SLOT, Delta::Text { text }, out)?;
            }
            for call in delta.tool_calls.unwrap_or_default() {
                self.handle_tool_call(call, out)?;
            }
            if let Some(reason) = choice.finish_reason {
                self.state.record_stop(openai_finish_to_stop(&reason));
                self.state.close_all(out);
            }
        }

        if let Some(usage) = chunk.usage {
            self.state.record_usage(&usage.to_usage());
        }
        Ok(())
    }

    fn handle_tool_call(&mut self, call: OpenAiStreamToolCall, out: &mut Vec<Event>) -> Result<(), LlmError> {
        let key = BlockKey::Native(call.index);
        let function = call.function.unwrap_or_default();
        // the first fragment of a call carries its id and name
        let opens_call = call.id.is_some() || function.name.is_some();
        // vendors that omit or reuse `index` signal a new call only by its id
        let replaces_call = match (call.id.as_deref(), self.call_ids.get(&call.index)) {
            (Some(id), Some(current)) => id != current,
            _ => false,
        };
        if replaces_call {
            self.state.close(&key, out);
        }
        if opens_call && self.state.lookup_open(&key).is_none() {
            let id = call.id.unwrap_or_else(next_call_id);
            self.call_ids.insert(call.index, id.clone());
            self.state.open(
                key.clone(),
                ContentBlock::ToolUse {
                    id,
                    name: function.name.unwrap_or_default(),
                    input: serde_json::Value::Object(serde_json::Map::new()),
                    server_name: None,
                },
                out,
            )?;
        }
        if let Some(arguments) = function.arguments.filter(|s| !s.is_empty()) {
            self.state.delta(
                &key,
                Delta::InputJson {
                    partial_json: arguments,
                },
                out,
            )?;
        }
        Ok(())
    }
}

impl Default for OpenAiChatStreamTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTranslator for OpenAiChatStreamTranslator {
    fn handle_frame(&mut self, frame: &SseFrame, out: &mut Vec<Event>) -> Result<(), LlmError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        if frame.is_done() {
            return self.handle_done(out);
        }
        let Some(chunk) = parse_frame::<OpenAiStreamChunk>(frame, "openai chat chunk")? else {
            return Ok(());
        };
        self.handle_chunk(chunk, out)
    }

    fn handle_end(&mut self, out: &mut Vec<Event>) -> Result<(), LlmError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        if !self.state.is_started() {
            return Err(self.state.fail("openai chat stream ended before any chunk"));
        }
        self.state.complete(out);
        Ok(())
    }

    fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::StopReason;
    use serde_json::json;

    fn chunk(delta: serde_json::Value, finish: Option<&str>) -> SseFrame {
        SseFrame::data(
            json!({
                "id": "chatcmpl-1",
                "object": "chat.completion.chunk",
                "model": "gpt-4o",
                "choices": [{"index": 0, "delta": delta, "finish_reason": finish}]
            })
            .to_string(),
        )
    }

    fn run(frames: &[SseFrame]) -> Vec<Event> {
        let mut translator = OpenAiChatStreamTranslator::new();
        let mut out = Vec::new();
        for frame in frames {
            translator.handle_frame(frame, &mut out).unwrap();
        }
        out
    }

    #[test]
    fn test_text_then_tool_call_implicitly_closes_text() {
        let events = run(&[
            chunk(json!({"role": "assistant", "content": "Checking"}), None),
            chunk(
                json!({"tool_calls": [{"index": 0, "id": "call_a", "type": "function", "function": {"name": "weather", "arguments": ""}}]}),
                None,
            ),
            chunk(json!({"tool_calls": [{"index": 0, "function": {"arguments": "{\"city\":\"Oslo\"}"}}]}), None),
            chunk(json!({}), Some("tool_calls")),
            SseFrame::data(
                json!({"id": "chatcmpl-1", "model": "gpt-4o", "choices": [], "usage": {"prompt_tokens": 9, "completion_tokens": 4, "prompt_tokens_details": {"cached_tokens": 2}}})
                    .to_string(),
            ),
            SseFrame::data("[DONE]"),
        ]);

        assert!(matches!(events[0], Event::MessageStart { .. }));
        assert!(matches!(events[1], Event::ContentBlockStart { index: 0, .. }));
        assert!(matches!(events[2], Event::ContentBlockDelta { index: 0, .. }));
        assert_eq!(events[3], Event::ContentBlockStop { index: 0 });
        assert!(matches!(
            &events[4],
            Event::ContentBlockStart { index: 1, content_block: ContentBlock::ToolUse { id, .. } } if id == "call_a"
        ));
        assert_eq!(events[6], Event::ContentBlockStop { index: 1 });
        assert_eq!(
            events[7],
            Event::MessageDelta {
                stop_reason: Some(StopReason::ToolUse),
                usage: Some(Usage {
                    input_tokens: 9,
                    output_tokens: 4,
                    cache_creation_input_tokens: 0,
                    cache_read_input_tokens: 2,
                }),
            }
        );
        assert_eq!(events[8], Event::MessageStop);
        assert_eq!(events.len(), 9);
    }

    #[test]
    fn test_new_call_id_at_same_index_opens_new_block() {
        // no `index` field: both calls land on native index 0
        let events = run(&[
            chunk(
                json!({"tool_calls": [{"id": "call_a", "type": "function", "function": {"name": "lookup", "arguments": "{\"x\":1}"}}]}),
                None,
            ),
            chunk(
                json!({"tool_calls": [{"id": "call_b", "type": "function", "function": {"name": "lookup", "arguments": "{\"y\":2}"}}]}),
                Some("tool_calls"),
            ),
            SseFrame::data("[DONE]"),
        ]);

        let starts: Vec<(usize, String)> = events
            .iter()
            .filter_map(|e| match e {
                Event::ContentBlockStart {
                    index,
                    content_block: ContentBlock::ToolUse { id, .. },
                } => Some((*index, id.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec![(0, "call_a".to_string()), (1, "call_b".to_string())]);
        assert_eq!(events[3], Event::ContentBlockStop { index: 0 });

        let mut acc = crate::stream::ResponseAccumulator::new();
        for event in &events {
            acc.add_event(event).unwrap();
        }
        let inputs: Vec<serde_json::Value> = acc
            .into_response()
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { input, .. } => Some(input),
                _ => None,
            })
            .collect();
        assert_eq!(inputs, vec![json!({"x": 1}), json!({"y": 2})]);
    }

    #[test]
    fn test_repeated_call_id_continues_block() {
        let events = run(&[
            chunk(
                json!({"tool_calls": [{"index": 0, "id": "call_a", "function": {"name": "lookup", "arguments": "{\"x\":"}}]}),
                None,
            ),
            chunk(json!({"tool_calls": [{"index": 0, "id": "call_a", "function": {"arguments": "1}"}}]}), None),
        ]);
        let starts = events
            .iter()
            .filter(|e| matches!(e, Event::ContentBlockStart { .. }))
            .count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn test_empty_reasoning_content_falls_back_to_reasoning() {
        let events = run(&[chunk(json!({"reasoning_content": "", "reasoning": "plan"}), None)]);
        assert!(matches!(
            &events[1],
            Event::ContentBlockStart { content_block: ContentBlock::Thinking { .. }, .. }
        ));
        assert_eq!(
            events[2],
            Event::ContentBlockDelta {
                index: 0,
                delta: Delta::Thinking {
                    thinking: "plan".into()
                }
            }
        );
    }

    #[test]
    fn test_reasoning_content_becomes_thinking_block() {
        let events = run(&[
            chunk(json!({"reasoning_content": "think"}), None),
            chunk(json!({"content": "answer"}), Some("stop")),
            SseFrame::data("[DONE]"),
        ]);
        assert!(matches!(
            &events[1],
            Event::ContentBlockStart { content_block: ContentBlock::Thinking { .. }, .. }
        ));
        assert_eq!(events[3], Event::ContentBlockStop { index: 0 });
        assert!(matches!(
            events[events.len() - 2],
            Event::MessageDelta { stop_reason: Some(StopReason::EndTurn), .. }
        ));
    }

    #[test]
    fn test_arguments_for_unknown_call_index_fail() {
        let mut translator = OpenAiChatStreamTranslator::new();
        translator.translate(&chunk(json!({"content": "x"}), None)).unwrap();
        let err = translator
            .translate(&chunk(json!({"tool_calls": [{"index": 3, "function": {"arguments": "{}"}}]}), None))
            .unwrap_err();
        assert!(matches!(err, LlmError::Decode(_)));
    }

    #[test]
    fn test_length_finish_maps_to_max_tokens() {
        let events = run(&[
            chunk(json!({"content": "partial"}), Some("length")),
            SseFrame::data("[DONE]"),
        ]);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::MessageDelta { stop_reason: Some(StopReason::MaxTokens), .. }
        )));
    }

    #[test]
    fn test_eof_without_done_completes() {
        let mut translator = OpenAiChatStreamTranslator::new();
        let mut out = Vec::new();
        translator
            .handle_frame(&chunk(json!({"content": "hi"}), Some("stop")), &mut out)
            .unwrap();
        translator.handle_end(&mut out).unwrap();
        assert_eq!(out.last(), Some(&Event::MessageStop));
    }

    #[test]
    fn test_in_band_error_is_fatal() {
        let mut translator = OpenAiChatStreamTranslator::new();
        let err = translator
            .translate(&SseFrame::data(
                json!({"error": {"message": "Rate limit reached", "type": "rate_limit_error"}}).to_string(),
            ))
            .unwrap_err();
        assert!(matches!(err, LlmError::Stream(_)));
    }

    #[test]
    fn test_frames_after_done_are_ignored() {
        let mut translator = OpenAiChatStreamTranslator::new();
        translator.translate(&chunk(json!({"content": "x"}), Some("stop"))).unwrap();
        translator.translate(&SseFrame::data("[DONE]")).unwrap();
        assert!(translator
            .translate(&chunk(json!({"content": "late"}), None))
            .unwrap()
            .is_empty());
    }
}
