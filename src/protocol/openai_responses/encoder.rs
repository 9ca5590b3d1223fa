use serde_json::{json, Value};

use crate::error::LlmError;
use crate::protocol::canonical::{
    ContentBlock, GenerateOptions, MediaSource, Message, Role, ToolChoice,
};
use crate::protocol::openai_responses::{ResponsesReasoning, ResponsesRequest};
use crate::protocol::{collect_system_prompt, EncodeContext};

/// Encode a conversation into Responses API input items.
///
/// Stateless: every turn is replayed as input items and `store` is left to
/// provider options.
///
/// # Errors
///
/// Returns [`LlmError::InvalidRequest`] when no input item results.
pub fn encode_responses_request(
    messages: &[Message],
    options: &GenerateOptions,
    ctx: EncodeContext<'_>,
) -> Result<ResponsesRequest, LlmError> {
    let mut input = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            Role::System => {}
            Role::User => encode_user(message, &mut input),
            Role::Assistant => encode_assistant(message, &mut input),
        }
    }
    if input.is_empty() {
        return Err(LlmError::InvalidRequest(
            "responses request needs at least one input item".to_string(),
        ));
    }

    let has_tools = !options.tools.is_empty();
    let tools = has_tools.then(|| {
        options
            .tools
            .iter()
            .map(|t| {
                let mut tool = json!({
                    "type": "function",
                    "name": t.name,
                    "parameters": t.parameters,
                });
                if let Some(description) = &t.description {
                    tool["description"] = json!(description);
                }
                tool
            })
            .collect()
    });
    let tool_choice = if has_tools {
        options.tool_choice.as_ref().map(|choice| match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Any => json!("required"),
            ToolChoice::None => json!("none"),
            ToolChoice::Tool { name } => json!({"type": "function", "name": name}),
        })
    } else {
        None
    };

    let reasoning = options.reasoning_effort.map(|effort| ResponsesReasoning {
        effort: effort.as_str(),
        summary: "auto",
    });
    // encrypted reasoning is what lets a stateless caller replay thinking
    let include = reasoning
        .is_some()
        .then(|| vec!["reasoning.encrypted_content"]);

    Ok(ResponsesRequest {
        model: ctx.model.to_string(),
        input,
        instructions: collect_system_prompt(options.system_prompt.as_deref(), messages),
        tools,
        tool_choice,
        parallel_tool_calls: options.parallel_tool_calls.filter(|_| has_tools),
        stream: ctx.stream.then_some(true),
        temperature: options.temperature,
        max_output_tokens: options.max_tokens.or(ctx.default_max_tokens),
        reasoning,
        include,
        extra: options.provider_options.clone(),
    })
}

fn encode_user(message: &Message, input: &mut Vec<Value>) {
    let mut parts = Vec::new();
    for block in &message.content {
        match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => input.push(json!({
                "type": "function_call_output",
                "call_id": tool_use_id,
                "output": content,
            })),
            ContentBlock::Text { text, .. } => parts.push(json!({"type": "input_text", "text": text})),
            ContentBlock::Image { source, .. } => parts.push(json!({
                "type": "input_image",
                "image_url": media_url(source),
            })),
            ContentBlock::Document { source, title, .. } => parts.push(match source {
                MediaSource::Url { url } => json!({"type": "input_file", "file_url": url}),
                MediaSource::Base64 { .. } => json!({
                    "type": "input_file",
                    "filename": title.as_deref().unwrap_or("document"),
                    "file_data": media_url(source),
                }),
            }),
            _ => {}
        }
    }
    if !parts.is_empty() {
        input.push(json!({"type": "message", "role": "user", "content": parts}));
    }
}

fn encode_assistant(message: &Message, input: &mut Vec<Value>) {
    let mut text_parts = Vec::new();
    for block in &message.content {
        match block {
            ContentBlock::Text { text, .. } => {
                text_parts.push(json!({"type": "output_text", "text": text}));
            }
            ContentBlock::Refusal { text } => {
                text_parts.push(json!({"type": "refusal", "refusal": text}));
            }
            ContentBlock::Thinking {
                thinking,
                signature: Some(signature),
            } => {
                flush_text(&mut text_parts, input);
                let summary: Vec<Value> = if thinking.is_empty() {
                    Vec::new()
                } else {
                    vec![json!({"type": "summary_text", "text": thinking})]
                };
                input.push(json!({
                    "type": "reasoning",
                    "summary": summary,
                    "encrypted_content": signature,
                }));
            }
            ContentBlock::ToolUse {
                id,
                name,
                input: arguments,
                server_name: None,
            } => {
                flush_text(&mut text_parts, input);
                input.push(json!({
                    "type": "function_call",
                    "call_id": id,
                    "name": name,
                    "arguments": arguments.to_string(),
                }));
            }
            // server-executed calls and their results cannot be replayed as input
            _ => {}
        }
    }
    flush_text(&mut text_parts, input);
}

/// Emit buffered assistant text as one message item, keeping item order.
fn flush_text(parts: &mut Vec<Value>, input: &mut Vec<Value>) {
    if parts.is_empty() {
        return;
    }
    input.push(json!({
        "type": "message",
        "role": "assistant",
        "content": std::mem::take(parts),
    }));
}

fn media_url(source: &MediaSource) -> String {
    match source {
        MediaSource::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
        MediaSource::Url { url } => url.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{ReasoningEffort, ToolDefinition};

    fn ctx() -> EncodeContext<'static> {
        EncodeContext {
            model: "o4-mini",
            default_max_tokens: None,
            stream: true,
        }
    }

    #[test]
    fn test_tool_history_becomes_call_and_output_items() {
        let messages = vec![
            Message {
                role: Role::System,
                content: vec![ContentBlock::text("Be terse.")],
            },
            Message::user("weather?"),
            Message::assistant(vec![
                ContentBlock::Thinking {
                    thinking: "need a tool".into(),
                    signature: Some("enc".into()),
                },
                ContentBlock::text("Checking."),
                ContentBlock::ToolUse {
                    id: "call_1".into(),
                    name: "weather".into(),
                    input: json!({"city": "Oslo"}),
                    server_name: None,
                },
            ]),
            Message::tool_result("call_1", "rainy", false),
        ];
        let request = encode_responses_request(&messages, &GenerateOptions::default(), ctx()).unwrap();
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["instructions"], "Be terse.");
        let kinds: Vec<&str> = body["input"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["type"].as_str().unwrap())
            .collect();
        assert_eq!(
            kinds,
            vec!["message", "reasoning", "message", "function_call", "function_call_output"]
        );
        assert_eq!(body["input"][3]["arguments"], "{\"city\":\"Oslo\"}");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_reasoning_and_tools() {
        let options = GenerateOptions {
            reasoning_effort: Some(ReasoningEffort::High),
            tools: vec![ToolDefinition {
                name: "weather".into(),
                description: Some("Look up weather".into()),
                parameters: json!({"type": "object"}),
            }],
            tool_choice: Some(ToolChoice::Tool {
                name: "weather".into(),
            }),
            max_tokens: Some(1000),
            ..GenerateOptions::default()
        };
        let request = encode_responses_request(&[Message::user("hi")], &options, ctx()).unwrap();
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["reasoning"]["effort"], "high");
        assert_eq!(body["include"][0], "reasoning.encrypted_content");
        assert_eq!(body["tools"][0]["description"], "Look up weather");
        assert_eq!(body["tool_choice"]["name"], "weather");
        assert_eq!(body["max_output_tokens"], 1000);
    }

    #[test]
    fn test_empty_input_is_rejected() {
        assert!(matches!(
            encode_responses_request(&[], &GenerateOptions::default(), ctx()),
            Err(LlmError::InvalidRequest(_))
        ));
    }
}
