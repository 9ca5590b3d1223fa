use serde_json::json;

use crate::error::LlmError;
use crate::protocol::anthropic::{AnthropicMessage, AnthropicRequest, AnthropicThinking, AnthropicTool};
use crate::protocol::canonical::{
    ContentBlock, GenerateOptions, MediaSource, Message, Role, ToolChoice,
};
use crate::protocol::mapping::role_to_anthropic;
use crate::protocol::{collect_system_prompt, EncodeContext};

const DEFAULT_MAX_TOKENS: u64 = 4096;

/// Encode a conversation into the Anthropic Messages API wire format.
///
/// # Errors
///
/// Returns [`LlmError::InvalidRequest`] when the conversation has no
/// non-system messages.
pub fn encode_anthropic_request(
    messages: &[Message],
    options: &GenerateOptions,
    ctx: EncodeContext<'_>,
) -> Result<AnthropicRequest, LlmError> {
    let system = collect_system_prompt(options.system_prompt.as_deref(), messages);

    let wire_messages: Vec<AnthropicMessage> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| AnthropicMessage {
            role: role_to_anthropic(m.role),
            content: encode_blocks(m.role, &m.content),
        })
        .collect();
    if wire_messages.is_empty() {
        return Err(LlmError::InvalidRequest(
            "anthropic request needs at least one user or assistant message".to_string(),
        ));
    }

    let tools = (!options.tools.is_empty()).then(|| {
        options
            .tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect()
    });

    let thinking = options.thinking_budget().map(|budget_tokens| AnthropicThinking {
        type_: "enabled",
        budget_tokens,
    });

    let mut max_tokens = options
        .max_tokens
        .or(ctx.default_max_tokens)
        .unwrap_or(DEFAULT_MAX_TOKENS);
    if let Some(thinking) = &thinking {
        // the thinking budget counts against max_tokens and must stay below it
        if max_tokens <= thinking.budget_tokens {
            max_tokens = thinking.budget_tokens + DEFAULT_MAX_TOKENS;
        }
    }

    Ok(AnthropicRequest {
        model: ctx.model.to_string(),
        max_tokens,
        system,
        messages: wire_messages,
        tool_choice: encode_tool_choice(options),
        tools,
        stream: ctx.stream.then_some(true),
        temperature: options.temperature,
        thinking,
        extra: options.provider_options.clone(),
    })
}

/// Encode content blocks; tool results lead a user message.
fn encode_blocks(role: Role, content: &[ContentBlock]) -> Vec<serde_json::Value> {
    let mut blocks = Vec::with_capacity(content.len());
    if role == Role::User {
        let (results, rest): (Vec<_>, Vec<_>) = content
            .iter()
            .partition(|b| matches!(b, ContentBlock::ToolResult { .. }));
        for block in results.into_iter().chain(rest) {
            encode_block(role, block, &mut blocks);
        }
    } else {
        for block in content {
            encode_block(role, block, &mut blocks);
        }
    }
    blocks
}

fn encode_block(role: Role, block: &ContentBlock, out: &mut Vec<serde_json::Value>) {
    let value = match block {
        ContentBlock::Text { text, .. } | ContentBlock::Refusal { text } => {
            if text.is_empty() {
                return;
            }
            json!({"type": "text", "text": text})
        }
        ContentBlock::Thinking {
            thinking,
            signature,
        } => {
            // unsigned thinking cannot be replayed
            let Some(signature) = signature else {
                return;
            };
            json!({"type": "thinking", "thinking": thinking, "signature": signature})
        }
        ContentBlock::RedactedThinking { data } => json!({"type": "redacted_thinking", "data": data}),
        ContentBlock::ToolUse {
            id,
            name,
            input,
            server_name: None,
        } => json!({"type": "tool_use", "id": id, "name": name, "input": input}),
        ContentBlock::ToolUse {
            id,
            name,
            input,
            server_name: Some(server_name),
        } => json!({
            "type": "mcp_tool_use",
            "id": id,
            "name": name,
            "server_name": server_name,
            "input": input,
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let kind = if role == Role::Assistant {
                "mcp_tool_result"
            } else {
                "tool_result"
            };
            json!({
                "type": kind,
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            })
        }
        ContentBlock::ServerToolUse { id, name, input } => {
            json!({"type": "server_tool_use", "id": id, "name": name, "input": input})
        }
        ContentBlock::WebSearchToolResult {
            tool_use_id,
            results,
            error_code,
        } => {
            let content = match error_code {
                Some(code) => json!({"type": "web_search_tool_result_error", "error_code": code}),
                None => serde_json::Value::Array(
                    results
                        .iter()
                        .map(|r| {
                            json!({
                                "type": "web_search_result",
                                "url": r.url,
                                "title": r.title,
                                "encrypted_content": r.encrypted_content,
                                "page_age": r.page_age,
                            })
                        })
                        .collect(),
                ),
            };
            json!({"type": "web_search_tool_result", "tool_use_id": tool_use_id, "content": content})
        }
        ContentBlock::CodeExecutionResult {
            tool_use_id,
            output,
            return_code,
        } => json!({
            "type": "code_execution_tool_result",
            "tool_use_id": tool_use_id,
            "content": {
                "type": "code_execution_result",
                "stdout": output,
                "stderr": "",
                "return_code": return_code.unwrap_or_default(),
            },
        }),
        ContentBlock::Image { source, .. } => json!({"type": "image", "source": encode_source(source)}),
        ContentBlock::Document {
            source,
            title,
            context,
        } => {
            let mut doc = json!({"type": "document", "source": encode_source(source)});
            if let Some(title) = title {
                doc["title"] = json!(title);
            }
            if let Some(context) = context {
                doc["context"] = json!(context);
            }
            doc
        }
    };
    out.push(value);
}

fn encode_source(source: &MediaSource) -> serde_json::Value {
    match source {
        MediaSource::Base64 { media_type, data } => {
            json!({"type": "base64", "media_type": media_type, "data": data})
        }
        MediaSource::Url { url } => json!({"type": "url", "url": url}),
    }
}

fn encode_tool_choice(options: &GenerateOptions) -> Option<serde_json::Value> {
    if options.tools.is_empty() {
        return None;
    }
    let mut choice = match options.tool_choice.as_ref().unwrap_or(&ToolChoice::Auto) {
        ToolChoice::Auto => json!({"type": "auto"}),
        ToolChoice::Any => json!({"type": "any"}),
        ToolChoice::None => json!({"type": "none"}),
        ToolChoice::Tool { name } => json!({"type": "tool", "name": name}),
    };
    if options.parallel_tool_calls == Some(false) {
        choice["disable_parallel_tool_use"] = json!(true);
    }
    Some(choice)
}
