use crate::error::LlmError;
use crate::protocol::canonical::{ContentBlock, Delta, Event, Response};

#[derive(Debug)]
struct PartialBlock {
    block: ContentBlock,
    json: String,
    open: bool,
}

/// Folds an ordered canonical event sequence into a [`Response`].
///
/// Index bookkeeping is kept independently of the translators so recorded
/// event fixtures can be replayed without one.
#[derive(Debug, Default)]
pub struct ResponseAccumulator {
    response: Response,
    started: bool,
    complete: bool,
    blocks: Vec<Option<PartialBlock>>,
}

impl ResponseAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Decode`] on lifecycle violations: anything before
    /// `MessageStart` or after `MessageStop`, a duplicate block start, a delta or
    /// stop for a block that is not open, a delta kind the block cannot take, or
    /// tool input that is not valid JSON once the block stops.
    pub fn add_event(&mut self, event: &Event) -> Result<(), LlmError> {
        if self.complete {
            return Err(LlmError::Decode("event received after MessageStop".to_string()));
        }
        if !self.started && !matches!(event, Event::MessageStart { .. }) {
            return Err(LlmError::Decode(
                "event received before MessageStart".to_string(),
            ));
        }

        match event {
            Event::MessageStart { message } => {
                if self.started {
                    return Err(LlmError::Decode("duplicate MessageStart".to_string()));
                }
                self.started = true;
                self.response.id.clone_from(&message.id);
                self.response.model.clone_from(&message.model);
                self.response.role = message.role;
                self.response.usage.merge(&message.usage);
            }
            Event::ContentBlockStart {
                index,
                content_block,
            } => self.start_block(*index, content_block)?,
            Event::ContentBlockDelta { index, delta } => {
                let partial = self.open_block_mut(*index, "delta")?;
                apply_delta(partial, delta, *index)?;
            }
            Event::ContentBlockStop { index } => {
                let partial = self.open_block_mut(*index, "stop")?;
                finish_block(partial, *index)?;
            }
            Event::MessageDelta { stop_reason, usage } => {
                if stop_reason.is_some() {
                    self.response.stop_reason = *stop_reason;
                }
                if let Some(usage) = usage {
                    self.response.usage.merge(usage);
                }
            }
            Event::MessageStop => {
                if let Some(index) = self
                    .blocks
                    .iter()
                    .position(|slot| slot.as_ref().is_some_and(|partial| partial.open))
                {
                    return Err(LlmError::Decode(format!(
                        "MessageStop while content block {index} is still open"
                    )));
                }
                self.complete = true;
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The response accumulated so far; partial until [`Self::is_complete`].
    #[must_use]
    pub fn response(&self) -> Response {
        let mut response = self.response.clone();
        response.content = self
            .blocks
            .iter()
            .flatten()
            .map(|partial| partial.block.clone())
            .collect();
        response
    }

    #[must_use]
    pub fn into_response(self) -> Response {
        let mut response = self.response;
        response.content = self
            .blocks
            .into_iter()
            .flatten()
            .map(|partial| partial.block)
            .collect();
        response
    }

    fn start_block(&mut self, index: usize, block: &ContentBlock) -> Result<(), LlmError> {
        if self.blocks.len() <= index {
            self.blocks.resize_with(index + 1, || None);
        }
        if self.blocks[index].is_some() {
            return Err(LlmError::Decode(format!(
                "duplicate ContentBlockStart for index {index}"
            )));
        }
        self.blocks[index] = Some(PartialBlock {
            block: block.clone(),
            json: String::new(),
            open: true,
        });
        Ok(())
    }

    fn open_block_mut(&mut self, index: usize, what: &str) -> Result<&mut PartialBlock, LlmError> {
        match self.blocks.get_mut(index) {
            Some(Some(partial)) if partial.open => Ok(partial),
            _ => Err(LlmError::Decode(format!(
                "{what} for content block {index} which is not open"
            ))),
        }
    }
}

fn apply_delta(partial: &mut PartialBlock, delta: &Delta, index: usize) -> Result<(), LlmError> {
    match (&mut partial.block, delta) {
        (ContentBlock::Text { text, .. }, Delta::Text { text: fragment })
        | (ContentBlock::Refusal { text }, Delta::Text { text: fragment }) => {
            text.push_str(fragment);
        }
        (ContentBlock::Text { citations, .. }, Delta::Citation { citation }) => {
            citations.push(citation.clone());
        }
        (ContentBlock::Thinking { thinking, .. }, Delta::Thinking { thinking: fragment }) => {
            thinking.push_str(fragment);
        }
        (ContentBlock::Thinking { signature, .. }, Delta::Signature { signature: fragment }) => {
            signature.get_or_insert_with(String::new).push_str(fragment);
        }
        (
            ContentBlock::ToolUse { .. } | ContentBlock::ServerToolUse { .. },
            Delta::InputJson { partial_json },
        ) => partial.json.push_str(partial_json),
        (block, delta) => {
            return Err(LlmError::Decode(format!(
                "delta {delta:?} cannot apply to {:?} block at index {index}",
                block.kind()
            )));
        }
    }
    Ok(())
}

fn finish_block(partial: &mut PartialBlock, index: usize) -> Result<(), LlmError> {
    partial.open = false;
    if partial.json.trim().is_empty() {
        return Ok(());
    }
    let parsed: serde_json::Value = serde_json::from_str(&partial.json).map_err(|err| {
        LlmError::Decode(format!("invalid tool input JSON at index {index}: {err}"))
    })?;
    if let ContentBlock::ToolUse { input, .. } | ContentBlock::ServerToolUse { input, .. } =
        &mut partial.block
    {
        *input = parsed;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{Role, StopReason, Usage};
    use serde_json::json;

    fn start() -> Event {
        Event::MessageStart {
            message: Response {
                id: "msg_1".to_string(),
                model: "m".to_string(),
                role: Role::Assistant,
                usage: Usage {
                    input_tokens: 5,
                    ..Usage::default()
                },
                ..Response::default()
            },
        }
    }

    fn text_delta(index: usize, text: &str) -> Event {
        Event::ContentBlockDelta {
            index,
            delta: Delta::Text {
                text: text.to_string(),
            },
        }
    }

    #[test]
    fn test_fold_text_block() {
        let mut acc = ResponseAccumulator::new();
        let events = [
            start(),
            Event::ContentBlockStart {
                index: 0,
                content_block: ContentBlock::text(""),
            },
            text_delta(0, "Hello"),
            text_delta(0, "!"),
            Event::ContentBlockStop { index: 0 },
            Event::MessageDelta {
                stop_reason: Some(StopReason::EndTurn),
                usage: Some(Usage {
                    output_tokens: 2,
                    ..Usage::default()
                }),
            },
            Event::MessageStop,
        ];
        for event in &events {
            acc.add_event(event).unwrap();
        }
        assert!(acc.is_complete());
        let response = acc.into_response();
        assert_eq!(response.content, vec![ContentBlock::text("Hello!")]);
        assert_eq!(response.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(response.usage.input_tokens, 5);
        assert_eq!(response.usage.output_tokens, 2);
    }

    #[test]
    fn test_tool_input_parsed_at_stop() {
        let mut acc = ResponseAccumulator::new();
        acc.add_event(&start()).unwrap();
        acc.add_event(&Event::ContentBlockStart {
            index: 0,
            content_block: ContentBlock::ToolUse {
                id: "call_1".to_string(),
                name: "lookup".to_string(),
                input: json!({}),
                server_name: None,
            },
        })
        .unwrap();
        for fragment in ["{\"q\":", "\"x\"}"] {
            acc.add_event(&Event::ContentBlockDelta {
                index: 0,
                delta: Delta::InputJson {
                    partial_json: fragment.to_string(),
                },
            })
            .unwrap();
        }
        acc.add_event(&Event::ContentBlockStop { index: 0 }).unwrap();
        let response = acc.response();
        assert!(matches!(
            &response.content[0],
            ContentBlock::ToolUse { input, .. } if *input == json!({"q": "x"})
        ));
    }

    #[test]
    fn test_delta_before_start_is_error() {
        let mut acc = ResponseAccumulator::new();
        assert!(acc.add_event(&text_delta(0, "x")).is_err());
        acc.add_event(&start()).unwrap();
        assert!(acc.add_event(&text_delta(0, "x")).is_err());
    }

    #[test]
    fn test_duplicate_block_start_is_error() {
        let mut acc = ResponseAccumulator::new();
        acc.add_event(&start()).unwrap();
        let block_start = Event::ContentBlockStart {
            index: 0,
            content_block: ContentBlock::text(""),
        };
        acc.add_event(&block_start).unwrap();
        assert!(acc.add_event(&block_start).is_err());
    }

    #[test]
    fn test_mismatched_delta_kind_is_error() {
        let mut acc = ResponseAccumulator::new();
        acc.add_event(&start()).unwrap();
        acc.add_event(&Event::ContentBlockStart {
            index: 0,
            content_block: ContentBlock::Thinking {
                thinking: String::new(),
                signature: None,
            },
        })
        .unwrap();
        assert!(acc.add_event(&text_delta(0, "x")).is_err());
    }

    #[test]
    fn test_event_after_stop_is_error() {
        let mut acc = ResponseAccumulator::new();
        acc.add_event(&start()).unwrap();
        acc.add_event(&Event::MessageStop).unwrap();
        assert!(acc.add_event(&Event::MessageStop).is_err());
    }

    #[test]
    fn test_partial_response_before_completion() {
        let mut acc = ResponseAccumulator::new();
        acc.add_event(&start()).unwrap();
        acc.add_event(&Event::ContentBlockStart {
            index: 0,
            content_block: ContentBlock::text(""),
        })
        .unwrap();
        acc.add_event(&text_delta(0, "partial")).unwrap();
        assert!(!acc.is_complete());
        let response = acc.response();
        assert_eq!(response.text(), "partial");
        assert_eq!(response.stop_reason, None);
    }
}
