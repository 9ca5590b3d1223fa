use serde_json::{json, Value};

use crate::error::LlmError;
use crate::protocol::canonical::{ContentBlock, MediaSource, Response, Role, StopReason};
use crate::protocol::mapping::{resolve_stop_reason, responses_incomplete_to_stop};
use crate::protocol::openai_responses::{
    parse_annotation, value_text, ResponsesContentPart, ResponsesOutput, ResponsesOutputItem,
};
use crate::util::parse_arguments;

type ItemDecoder = fn(&ResponsesOutputItem) -> Result<Vec<ContentBlock>, LlmError>;

/// Output item decoders by `type` tag. Unlisted tags decode to nothing.
const ITEM_DECODERS: &[(&str, ItemDecoder)] = &[
    ("message", decode_message),
    ("function_call", decode_function_call),
    ("mcp_call", decode_mcp_call),
    ("reasoning", decode_reasoning),
    ("image_generation_call", decode_image_generation),
    ("web_search_call", decode_web_search),
    ("code_interpreter_call", decode_code_interpreter),
];

pub const WEB_SEARCH_TOOL: &str = "web_search";
pub const CODE_INTERPRETER_TOOL: &str = "code_interpreter";

/// Decode a raw Responses API body.
///
/// # Errors
///
/// Returns [`LlmError::Decode`] when the body is malformed or a call item
/// carries arguments that are not JSON.
pub fn decode_responses_body(body: &[u8]) -> Result<Response, LlmError> {
    let output: ResponsesOutput =
        serde_json::from_slice(body).map_err(|e| LlmError::decode("responses output", e))?;
    decode_responses_output(&output)
}

/// Decode a Responses API response object into canonical form.
///
/// # Errors
///
/// See [`decode_responses_body`].
pub fn decode_responses_output(output: &ResponsesOutput) -> Result<Response, LlmError> {
    let mut content = Vec::new();
    for item in &output.output {
        content.extend(decode_output_item(item)?);
    }

    let reported = match output.status.as_deref() {
        Some("incomplete") => Some(responses_incomplete_to_stop(
            output
                .incomplete_details
                .as_ref()
                .and_then(|d| d.reason.as_deref()),
        )),
        Some("failed") => Some(StopReason::Error),
        _ => None,
    };
    let saw_tool_call = content.iter().any(|b| b.kind().is_tool_call());

    Ok(Response {
        id: output.id.clone(),
        model: output.model.clone(),
        role: Role::Assistant,
        content,
        usage: output
            .usage
            .as_ref()
            .map(|u| u.to_usage())
            .unwrap_or_default(),
        stop_reason: Some(resolve_stop_reason(reported, saw_tool_call)),
    })
}

/// Decode one output item through the tag table.
///
/// # Errors
///
/// See [`decode_responses_body`].
pub fn decode_output_item(item: &ResponsesOutputItem) -> Result<Vec<ContentBlock>, LlmError> {
    match ITEM_DECODERS.iter().find(|(tag, _)| *tag == item.type_) {
        Some((_, decode)) => decode(item),
        None => {
            tracing::debug!(item_type = %item.type_, "skipping unsupported responses output item");
            Ok(Vec::new())
        }
    }
}

fn decode_message(item: &ResponsesOutputItem) -> Result<Vec<ContentBlock>, LlmError> {
    let blocks = item
        .content
        .iter()
        .filter_map(|part| match part {
            ResponsesContentPart::OutputText { text, annotations } => Some(ContentBlock::Text {
                text: text.clone(),
                citations: annotations.iter().filter_map(parse_annotation).collect(),
            }),
            ResponsesContentPart::Refusal { refusal } => Some(ContentBlock::Refusal {
                text: refusal.clone(),
            }),
            ResponsesContentPart::Unknown => None,
        })
        .collect();
    Ok(blocks)
}

fn decode_function_call(item: &ResponsesOutputItem) -> Result<Vec<ContentBlock>, LlmError> {
    Ok(vec![ContentBlock::ToolUse {
        id: function_call_id(item),
        name: item.name.clone().unwrap_or_default(),
        input: item_arguments(item)?,
        server_name: None,
    }])
}

/// A remote MCP call and, once the server finished it, its result.
pub(crate) fn decode_mcp_call(item: &ResponsesOutputItem) -> Result<Vec<ContentBlock>, LlmError> {
    let mut blocks = vec![ContentBlock::ToolUse {
        id: item.id.clone(),
        name: item.name.clone().unwrap_or_default(),
        input: item_arguments(item)?,
        server_name: Some(item.server_label.clone().unwrap_or_default()),
    }];
    blocks.extend(mcp_call_result(item));
    Ok(blocks)
}

/// The result half of an `mcp_call`; an error wins over output.
pub(crate) fn mcp_call_result(item: &ResponsesOutputItem) -> Option<ContentBlock> {
    let error = item.error.as_ref().and_then(value_text);
    let (content, is_error) = match error {
        Some(error) => (error, true),
        None => (item.output.as_ref().and_then(value_text)?, false),
    };
    Some(ContentBlock::ToolResult {
        tool_use_id: item.id.clone(),
        content,
        is_error,
    })
}

fn decode_reasoning(item: &ResponsesOutputItem) -> Result<Vec<ContentBlock>, LlmError> {
    let thinking = reasoning_summary_text(item);
    let signature = item.encrypted_content.clone().filter(|s| !s.is_empty());
    if thinking.is_empty() && signature.is_none() {
        return Ok(Vec::new());
    }
    Ok(vec![ContentBlock::Thinking { thinking, signature }])
}

pub(crate) fn reasoning_summary_text(item: &ResponsesOutputItem) -> String {
    let parts: Vec<&str> = item.summary.iter().map(|p| p.text.as_str()).collect();
    parts.join("\n\n")
}

fn decode_image_generation(item: &ResponsesOutputItem) -> Result<Vec<ContentBlock>, LlmError> {
    Ok(image_generation_block(item).into_iter().collect())
}

pub(crate) fn image_generation_block(item: &ResponsesOutputItem) -> Option<ContentBlock> {
    let data = item.result.as_deref().filter(|s| !s.is_empty())?;
    Some(ContentBlock::Image {
        source: MediaSource::Base64 {
            media_type: sniff_image_type(data).to_string(),
            data: data.to_string(),
        },
        generation_id: Some(item.id.clone()),
    })
}

/// Detect the image format from the leading base64 characters, defaulting to PNG.
fn sniff_image_type(data: &str) -> &'static str {
    if data.starts_with("/9j/") {
        "image/jpeg"
    } else if data.starts_with("R0lGOD") {
        "image/gif"
    } else if data.starts_with("UklGR") {
        "image/webp"
    } else {
        "image/png"
    }
}

fn decode_web_search(item: &ResponsesOutputItem) -> Result<Vec<ContentBlock>, LlmError> {
    Ok(vec![ContentBlock::ServerToolUse {
        id: item.id.clone(),
        name: WEB_SEARCH_TOOL.to_string(),
        input: web_search_input(item),
    }])
}

pub(crate) fn web_search_input(item: &ResponsesOutputItem) -> Value {
    match &item.action {
        Some(action) => json!({ "action": action }),
        None => json!({}),
    }
}

fn decode_code_interpreter(item: &ResponsesOutputItem) -> Result<Vec<ContentBlock>, LlmError> {
    let mut blocks = vec![ContentBlock::ServerToolUse {
        id: item.id.clone(),
        name: CODE_INTERPRETER_TOOL.to_string(),
        input: code_interpreter_input(item),
    }];
    blocks.extend(code_interpreter_result(item));
    Ok(blocks)
}

pub(crate) fn code_interpreter_input(item: &ResponsesOutputItem) -> Value {
    let mut input = serde_json::Map::new();
    if let Some(code) = &item.code {
        input.insert("code".to_string(), json!(code));
    }
    if let Some(container_id) = &item.container_id {
        input.insert("container_id".to_string(), json!(container_id));
    }
    Value::Object(input)
}

/// Logs of a finished interpreter call, joined in output order.
pub(crate) fn code_interpreter_result(item: &ResponsesOutputItem) -> Option<ContentBlock> {
    let outputs = item.outputs.as_ref().filter(|o| !o.is_empty())?;
    let logs: Vec<&str> = outputs
        .iter()
        .filter(|o| o.get("type").and_then(Value::as_str) == Some("logs"))
        .filter_map(|o| o.get("logs").and_then(Value::as_str))
        .collect();
    Some(ContentBlock::CodeExecutionResult {
        tool_use_id: item.id.clone(),
        output: logs.join("\n"),
        return_code: None,
    })
}

/// `call_id` is what a later `function_call_output` echoes back.
pub(crate) fn function_call_id(item: &ResponsesOutputItem) -> String {
    item.call_id.clone().unwrap_or_else(|| item.id.clone())
}

fn item_arguments(item: &ResponsesOutputItem) -> Result<Value, LlmError> {
    parse_arguments(item.arguments.as_deref().unwrap_or_default()).map_err(|e| {
        LlmError::Decode(format!(
            "{} '{}' has invalid arguments: {e}",
            item.type_, item.id
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::Citation;

    fn decode(body: &Value) -> Response {
        decode_responses_body(body.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_mcp_call_pairs_into_tool_use_and_result() {
        let response = decode(&json!({
            "id": "resp_1",
            "model": "gpt-4.1",
            "status": "completed",
            "output": [{
                "type": "mcp_call",
                "id": "t1",
                "name": "lookup",
                "server_label": "kb",
                "arguments": "{\"q\":\"x\"}",
                "output": "42"
            }]
        }));
        assert_eq!(
            response.content,
            vec![
                ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "lookup".into(),
                    input: json!({"q": "x"}),
                    server_name: Some("kb".into()),
                },
                ContentBlock::ToolResult {
                    tool_use_id: "t1".into(),
                    content: "42".into(),
                    is_error: false,
                },
            ]
        );
    }

    #[test]
    fn test_mcp_call_error_marks_result() {
        let response = decode(&json!({
            "id": "resp_1",
            "model": "m",
            "output": [{"type": "mcp_call", "id": "t1", "name": "lookup", "arguments": "{}", "error": "server unavailable", "output": null}]
        }));
        assert!(matches!(
            &response.content[1],
            ContentBlock::ToolResult { is_error: true, content, .. } if content == "server unavailable"
        ));
    }

    #[test]
    fn test_function_call_uses_call_id() {
        let response = decode(&json!({
            "id": "resp_1",
            "model": "m",
            "output": [{"type": "function_call", "id": "fc_1", "call_id": "call_9", "name": "weather", "arguments": "{\"city\":\"Oslo\"}"}]
        }));
        assert!(matches!(
            &response.content[0],
            ContentBlock::ToolUse { id, server_name: None, .. } if id == "call_9"
        ));
        assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
    }

    #[test]
    fn test_message_citations_reasoning_and_usage() {
        let response = decode(&json!({
            "id": "resp_1",
            "model": "o4-mini",
            "status": "completed",
            "output": [
                {"type": "reasoning", "id": "rs_1", "summary": [{"type": "summary_text", "text": "a"}, {"type": "summary_text", "text": "b"}], "encrypted_content": "enc"},
                {"type": "message", "id": "msg_1", "role": "assistant", "content": [
                    {"type": "output_text", "text": "See docs.", "annotations": [
                        {"type": "url_citation", "url": "https://example.com", "title": "Example", "start_index": 0, "end_index": 3}
                    ]}
                ]},
                {"type": "file_search_call", "id": "fs_1"}
            ],
            "usage": {"input_tokens": 10, "output_tokens": 3, "input_tokens_details": {"cached_tokens": 4}}
        }));
        assert_eq!(
            response.content[0],
            ContentBlock::Thinking {
                thinking: "a\n\nb".into(),
                signature: Some("enc".into())
            }
        );
        assert!(matches!(
            &response.content[1],
            ContentBlock::Text { citations, .. }
                if matches!(&citations[0], Citation::WebSearchResultLocation { url, .. } if url == "https://example.com")
        ));
        assert_eq!(response.content.len(), 2);
        assert_eq!(response.usage.cache_read_input_tokens, 4);
        assert_eq!(response.stop_reason, Some(StopReason::EndTurn));
    }

    #[test]
    fn test_incomplete_status_maps_reason() {
        let response = decode(&json!({
            "id": "resp_1",
            "model": "m",
            "status": "incomplete",
            "incomplete_details": {"reason": "content_filter"},
            "output": []
        }));
        assert_eq!(response.stop_reason, Some(StopReason::ContentFilter));
    }

    #[test]
    fn test_image_generation_and_code_interpreter() {
        let response = decode(&json!({
            "id": "resp_1",
            "model": "m",
            "output": [
                {"type": "image_generation_call", "id": "ig_1", "status": "completed", "result": "/9j/AAAA"},
                {"type": "code_interpreter_call", "id": "ci_1", "code": "print(1)", "container_id": "cntr", "outputs": [{"type": "logs", "logs": "1"}]}
            ]
        }));
        assert!(matches!(
            &response.content[0],
            ContentBlock::Image { source: MediaSource::Base64 { media_type, .. }, generation_id: Some(id) }
                if media_type == "image/jpeg" && id == "ig_1"
        ));
        assert!(matches!(
            &response.content[1],
            ContentBlock::ServerToolUse { name, input, .. } if name == CODE_INTERPRETER_TOOL && input["code"] == "print(1)"
        ));
        assert!(matches!(
            &response.content[2],
            ContentBlock::CodeExecutionResult { tool_use_id, output, .. } if tool_use_id == "ci_1" && output == "1"
        ));
    }
}
