use crate::error::LlmError;
use crate::protocol::canonical::{ContentBlock, Response, Role};
use crate::protocol::mapping::{openai_finish_to_stop, resolve_stop_reason};
use crate::protocol::openai_chat::OpenAiChatResponse;
use crate::util::parse_arguments;

/// Decode a raw Chat Completions body.
///
/// # Errors
///
/// Returns [`LlmError::Decode`] when the body is malformed, has no choices, or
/// a tool call carries arguments that are not JSON.
pub fn decode_openai_chat_body(body: &[u8]) -> Result<Response, LlmError> {
    let response: OpenAiChatResponse =
        serde_json::from_slice(body).map_err(|e| LlmError::decode("openai chat response", e))?;
    decode_openai_chat_response(response)
}

/// Decode a Chat Completions response into canonical form.
///
/// # Errors
///
/// See [`decode_openai_chat_body`].
pub fn decode_openai_chat_response(response: OpenAiChatResponse) -> Result<Response, LlmError> {
    let usage = response
        .usage
        .as_ref()
        .map(|u| u.to_usage())
        .unwrap_or_default();
    let Some(choice) = response.choices.into_iter().find(|c| c.index == 0) else {
        return Err(LlmError::Decode(
            "openai chat response has no choices".to_string(),
        ));
    };
    let message = choice.message;

    let mut content = Vec::new();
    if let Some(thinking) = message
        .reasoning_content
        .or(message.reasoning)
        .filter(|s| !s.is_empty())
    {
        content.push(ContentBlock::Thinking {
            thinking,
            signature: None,
        });
    }
    if let Some(text) = message.content.filter(|s| !s.is_empty()) {
        content.push(ContentBlock::text(text));
    }
    if let Some(text) = message.refusal.filter(|s| !s.is_empty()) {
        content.push(ContentBlock::Refusal { text });
    }
    for call in message.tool_calls.unwrap_or_default() {
        let input = parse_arguments(&call.function.arguments).map_err(|e| {
            LlmError::Decode(format!(
                "tool call '{}' has invalid arguments: {e}",
                call.id
            ))
        })?;
        content.push(ContentBlock::ToolUse {
            id: call.id,
            name: call.function.name,
            input,
            server_name: None,
        });
    }

    let saw_tool_call = content.iter().any(|b| b.kind().is_tool_call());
    let reported = choice.finish_reason.as_deref().and_then(openai_finish_to_stop);

    Ok(Response {
        id: response.id,
        model: response.model,
        role: Role::Assistant,
        content,
        usage,
        stop_reason: Some(resolve_stop_reason(reported, saw_tool_call)),
    })
}
