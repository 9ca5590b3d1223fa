use crate::error::LlmError;
use crate::protocol::anthropic::{
    parse_citation, AnthropicCodeExecutionContent, AnthropicContentBlock, AnthropicResponse,
};
use crate::protocol::canonical::{ContentBlock, Response, Role, WebSearchResult};
use crate::protocol::mapping::{anthropic_stop_to_stop, resolve_stop_reason};

/// Decode a raw Anthropic Messages API body.
///
/// # Errors
///
/// Returns [`LlmError::Decode`] when the body is not a valid Messages response.
pub fn decode_anthropic_body(body: &[u8]) -> Result<Response, LlmError> {
    let response: AnthropicResponse =
        serde_json::from_slice(body).map_err(|e| LlmError::decode("anthropic response", e))?;
    Ok(decode_anthropic_response(response))
}

/// Decode an Anthropic Messages API response into canonical form.
#[must_use]
pub fn decode_anthropic_response(response: AnthropicResponse) -> Response {
    let content: Vec<ContentBlock> = response
        .content
        .into_iter()
        .filter_map(block_from_wire)
        .collect();
    let saw_tool_call = content.iter().any(|block| block.kind().is_tool_call());
    let reported = response.stop_reason.as_deref().and_then(anthropic_stop_to_stop);

    Response {
        id: response.id,
        model: response.model,
        role: Role::Assistant,
        content,
        usage: response.usage.to_usage(),
        stop_reason: Some(resolve_stop_reason(reported, saw_tool_call)),
    }
}

/// Convert one wire block. Returns `None` for block kinds this crate does not model.
#[must_use]
pub fn block_from_wire(block: AnthropicContentBlock) -> Option<ContentBlock> {
    let block = match block {
        AnthropicContentBlock::Text { text, citations } => ContentBlock::Text {
            text,
            citations: citations
                .unwrap_or_default()
                .iter()
                .filter_map(parse_citation)
                .collect(),
        },
        AnthropicContentBlock::Thinking {
            thinking,
            signature,
        } => ContentBlock::Thinking {
            thinking,
            signature: signature.filter(|s| !s.is_empty()),
        },
        AnthropicContentBlock::RedactedThinking { data } => ContentBlock::RedactedThinking { data },
        AnthropicContentBlock::ToolUse { id, name, input } => ContentBlock::ToolUse {
            id,
            name,
            input: object_or_empty(input),
            server_name: None,
        },
        AnthropicContentBlock::ServerToolUse { id, name, input } => ContentBlock::ServerToolUse {
            id,
            name,
            input: object_or_empty(input),
        },
        AnthropicContentBlock::McpToolUse {
            id,
            name,
            server_name,
            input,
        } => ContentBlock::ToolUse {
            id,
            name,
            input: object_or_empty(input),
            server_name: Some(server_name),
        },
        AnthropicContentBlock::McpToolResult {
            tool_use_id,
            is_error,
            content,
        } => ContentBlock::ToolResult {
            tool_use_id,
            content: flatten_text_content(&content),
            is_error,
        },
        AnthropicContentBlock::WebSearchToolResult {
            tool_use_id,
            content,
        } => web_search_result(tool_use_id, content),
        AnthropicContentBlock::CodeExecutionToolResult {
            tool_use_id,
            content,
        } => code_execution_result(tool_use_id, content),
        AnthropicContentBlock::Unknown => return None,
    };
    Some(block)
}

fn object_or_empty(input: serde_json::Value) -> serde_json::Value {
    if input.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        input
    }
}

/// Tool result content is either a string or an array of `{type: text}` blocks.
fn flatten_text_content(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => {
            let mut out = String::new();
            for item in items {
                if let Some(text) = item.get("text").and_then(serde_json::Value::as_str) {
                    out.push_str(text);
                }
            }
            out
        }
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn web_search_result(tool_use_id: String, content: serde_json::Value) -> ContentBlock {
    match content {
        serde_json::Value::Array(items) => ContentBlock::WebSearchToolResult {
            tool_use_id,
            results: items
                .into_iter()
                .filter_map(|item| serde_json::from_value::<WebSearchResult>(item).ok())
                .collect(),
            error_code: None,
        },
        other => ContentBlock::WebSearchToolResult {
            tool_use_id,
            results: Vec::new(),
            error_code: other
                .get("error_code")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
        },
    }
}

fn code_execution_result(tool_use_id: String, content: AnthropicCodeExecutionContent) -> ContentBlock {
    let mut output = content.stdout;
    if !content.stderr.is_empty() {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&content.stderr);
    }
    ContentBlock::CodeExecutionResult {
        tool_use_id,
        output,
        return_code: content.return_code,
    }
}
