use rustc_hash::FxHashMap;

use crate::error::LlmError;
use crate::protocol::canonical::{ContentBlock, Delta, Event};
use crate::protocol::mapping::responses_incomplete_to_stop;
use crate::protocol::openai_responses::response_decoder::{
    code_interpreter_input, code_interpreter_result, function_call_id, image_generation_block,
    mcp_call_result, reasoning_summary_text, web_search_input, CODE_INTERPRETER_TOOL,
    WEB_SEARCH_TOOL,
};
use crate::protocol::openai_responses::{
    parse_annotation, ResponsesContentPart, ResponsesOutput, ResponsesOutputItem,
    ResponsesStreamEvent,
};
use crate::stream::{parse_frame, BlockKey, CloseMode, SseFrame, StreamTranslator, TranslatorState};

/// Translator for Responses API streaming events.
///
/// Blocks are keyed by output item id, plus the content or summary index for
/// message parts and reasoning summaries. Reasoning summaries stay open until
/// their item finishes so the encrypted signature can be attached.
#[derive(Debug)]
pub struct ResponsesStreamTranslator {
    state: TranslatorState,
    last_summary: FxHashMap<String, u32>,
}

impl ResponsesStreamTranslator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: TranslatorState::new(CloseMode::Explicit),
            last_summary: FxHashMap::default(),
        }
    }

    fn handle_event(&mut self, event: ResponsesStreamEvent, out: &mut Vec<Event>) -> Result<(), LlmError> {
        match event {
            ResponsesStreamEvent::Created { response } | ResponsesStreamEvent::InProgress { response } => {
                let usage = response.usage.as_ref().map(|u| u.to_usage()).unwrap_or_default();
                self.state.start(&response.id, &response.model, usage, out);
            }
            ResponsesStreamEvent::OutputItemAdded { item } => self.open_item(&item, out)?,
            ResponsesStreamEvent::OutputItemDone { item } => self.finish_item(item, out)?,
            ResponsesStreamEvent::ContentPartAdded {
                item_id,
                content_index,
                part,
            } => {
                let key = BlockKey::ItemPart(item_id, content_index);
                match part {
                    ResponsesContentPart::OutputText { .. } => {
                        self.state.open(key, ContentBlock::text(""), out)?;
                    }
                    ResponsesContentPart::Refusal { .. } => {
                        self.state.open(
                            key,
                            ContentBlock::Refusal {
                                text: String::new(),
                            },
                            out,
                        )?;
                    }
                    ResponsesContentPart::Unknown => self.state.ignore(key),
                }
            }
            ResponsesStreamEvent::OutputTextDelta {
                item_id,
                content_index,
                delta,
            }
            | ResponsesStreamEvent::RefusalDelta {
                item_id,
                content_index,
                delta,
            } => {
                self.state.delta(
                    &BlockKey::ItemPart(item_id, content_index),
                    Delta::Text { text: delta },
                    out,
                )?;
            }
            ResponsesStreamEvent::OutputTextAnnotationAdded {
                item_id,
                content_index,
                annotation,
            } => match parse_annotation(&annotation) {
                Some(citation) => self.state.delta(
                    &BlockKey::ItemPart(item_id, content_index),
                    Delta::Citation { citation },
                    out,
                )?,
                None => tracing::debug!("skipping unsupported output_text annotation"),
            },
            ResponsesStreamEvent::ContentPartDone {
                item_id,
                content_index,
            }
            | ResponsesStreamEvent::OutputTextDone {
                item_id,
                content_index,
            }
            | ResponsesStreamEvent::RefusalDone {
                item_id,
                content_index,
            } => self.state.close(&BlockKey::ItemPart(item_id, content_index), out),
            ResponsesStreamEvent::ReasoningSummaryPartAdded {
                item_id,
                summary_index,
            } => {
                self.state.open(
                    BlockKey::ItemSummary(item_id.clone(), summary_index),
                    ContentBlock::Thinking {
                        thinking: String::new(),
                        signature: None,
                    },
                    out,
                )?;
                self.last_summary.insert(item_id, summary_index);
            }
            ResponsesStreamEvent::ReasoningSummaryTextDelta {
                item_id,
                summary_index,
                delta,
            } => {
                self.state.delta(
                    &BlockKey::ItemSummary(item_id, summary_index),
                    Delta::Thinking { thinking: delta },
                    out,
                )?;
            }
            ResponsesStreamEvent::FunctionCallArgumentsDelta { item_id, delta }
            | ResponsesStreamEvent::McpCallArgumentsDelta { item_id, delta } => {
                self.state.delta(
                    &BlockKey::Item(item_id),
                    Delta::InputJson {
                        partial_json: delta,
                    },
                    out,
                )?;
            }
            ResponsesStreamEvent::Completed { response } => self.finish(&response, false, out),
            ResponsesStreamEvent::Incomplete { response } => self.finish(&response, true, out),
            ResponsesStreamEvent::Failed { response } => {
                let message = response
                    .error
                    .map_or_else(|| "response failed".to_string(), |e| e.describe());
                return Err(self.state.fail(message));
            }
            ResponsesStreamEvent::Error { code, message } => {
                let message = match code {
                    Some(code) => format!("{code}: {message}"),
                    None => message,
                };
                return Err(self.state.fail(message));
            }
            ResponsesStreamEvent::Unknown => {}
        }
        Ok(())
    }

    /// Open the block for a call-like item. Message and reasoning items open per part.
    fn open_item(&mut self, item: &ResponsesOutputItem, out: &mut Vec<Event>) -> Result<(), LlmError> {
        let empty = || serde_json::Value::Object(serde_json::Map::new());
        let block = match item.type_.as_str() {
            "function_call" => ContentBlock::ToolUse {
                id: function_call_id(item),
                name: item.name.clone().unwrap_or_default(),
                input: empty(),
                server_name: None,
            },
            "mcp_call" => ContentBlock::ToolUse {
                id: item.id.clone(),
                name: item.name.clone().unwrap_or_default(),
                input: empty(),
                server_name: Some(item.server_label.clone().unwrap_or_default()),
            },
            "web_search_call" => ContentBlock::ServerToolUse {
                id: item.id.clone(),
                name: WEB_SEARCH_TOOL.to_string(),
                input: empty(),
            },
            "code_interpreter_call" => ContentBlock::ServerToolUse {
                id: item.id.clone(),
                name: CODE_INTERPRETER_TOOL.to_string(),
                input: empty(),
            },
            _ => return Ok(()),
        };
        self.state.open(BlockKey::Item(item.id.clone()), block, out)?;
        Ok(())
    }

    fn finish_item(&mut self, item: ResponsesOutputItem, out: &mut Vec<Event>) -> Result<(), LlmError> {
        let key = BlockKey::Item(item.id.clone());
        match item.type_.as_str() {
            "function_call" | "mcp_call" | "web_search_call" | "code_interpreter_call" => {
                if !self.state.is_registered(&key) {
                    self.open_item(&item, out)?;
                }
                // arguments that were never streamed arrive whole here
                if !self.state.received_delta(&key) {
                    if let Some(partial_json) = final_input_json(&item) {
                        self.state.delta(&key, Delta::InputJson { partial_json }, out)?;
                    }
                }
                self.state.close(&key, out);
                let paired = match item.type_.as_str() {
                    "mcp_call" => mcp_call_result(&item),
                    "code_interpreter_call" => code_interpreter_result(&item),
                    _ => None,
                };
                if let Some(result) = paired {
                    self.state.emit_whole(result, out)?;
                }
            }
            "reasoning" => {
                let signature = item.encrypted_content.clone().filter(|s| !s.is_empty());
                match self.last_summary.remove(&item.id) {
                    Some(summary_index) => {
                        let summary_key = BlockKey::ItemSummary(item.id.clone(), summary_index);
                        if let Some(signature) = signature {
                            if self.state.lookup_open(&summary_key).is_some() {
                                self.state.delta(&summary_key, Delta::Signature { signature }, out)?;
                            } else {
                                self.state.emit_whole(
                                    ContentBlock::Thinking {
                                        thinking: String::new(),
                                        signature: Some(signature),
                                    },
                                    out,
                                )?;
                            }
                        }
                    }
                    None => {
                        let thinking = reasoning_summary_text(&item);
                        if !thinking.is_empty() || signature.is_some() {
                            self.state
                                .emit_whole(ContentBlock::Thinking { thinking, signature }, out)?;
                        }
                    }
                }
                self.state
                    .close_where(|k| k.item_id() == Some(item.id.as_str()), out);
            }
            "message" => self
                .state
                .close_where(|k| k.item_id() == Some(item.id.as_str()), out),
            "image_generation_call" => {
                if let Some(image) = image_generation_block(&item) {
                    self.state.emit_whole(image, out)?;
                }
            }
            other => tracing::debug!(item_type = other, "skipping unsupported responses output item"),
        }
        Ok(())
    }

    fn finish(&mut self, response: &ResponsesOutput, incomplete: bool, out: &mut Vec<Event>) {
        self.state
            .start(&response.id, &response.model, Default::default(), out);
        if let Some(usage) = &response.usage {
            self.state.record_usage(&usage.to_usage());
        }
        if incomplete {
            let reason = response
                .incomplete_details
                .as_ref()
                .and_then(|d| d.reason.as_deref());
            self.state.record_stop(Some(responses_incomplete_to_stop(reason)));
        }
        self.state.complete(out);
    }
}

/// The complete input of a call item, serialized for a single `InputJson` delta.
fn final_input_json(item: &ResponsesOutputItem) -> Option<String> {
    let input = match item.type_.as_str() {
        "function_call" | "mcp_call" => return item.arguments.clone().filter(|s| !s.trim().is_empty()),
        "web_search_call" => web_search_input(item),
        "code_interpreter_call" => code_interpreter_input(item),
        _ => return None,
    };
    input
        .as_object()
        .is_some_and(|o| !o.is_empty())
        .then(|| input.to_string())
}

impl Default for ResponsesStreamTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTranslator for ResponsesStreamTranslator {
    fn handle_frame(&mut self, frame: &SseFrame, out: &mut Vec<Event>) -> Result<(), LlmError> {
        if self.state.is_terminal() || frame.is_done() {
            return Ok(());
        }
        let Some(event) = parse_frame::<ResponsesStreamEvent>(frame, "responses stream event")? else {
            return Ok(());
        };
        self.handle_event(event, out)
    }

    fn handle_end(&mut self, _out: &mut Vec<Event>) -> Result<(), LlmError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        Err(self
            .state
            .fail("responses stream ended before response.completed"))
    }

    fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
