use serde_json::json;

use crate::error::LlmError;
use crate::protocol::canonical::{
    ContentBlock, GenerateOptions, MediaSource, Message, Role, ToolChoice,
};
use crate::protocol::mapping::role_to_openai;
use crate::protocol::openai_chat::{
    OpenAiChatRequest, OpenAiMessage, OpenAiStreamOptions, OpenAiTool, OpenAiToolCall,
    OpenAiToolCallFunction, OpenAiToolFunction,
};
use crate::protocol::{collect_system_prompt, EncodeContext};

/// Encode a conversation into the Chat Completions wire format.
///
/// # Errors
///
/// Returns [`LlmError::InvalidRequest`] when the conversation is empty.
pub fn encode_openai_chat_request(
    messages: &[Message],
    options: &GenerateOptions,
    ctx: EncodeContext<'_>,
) -> Result<OpenAiChatRequest, LlmError> {
    let mut wire = Vec::with_capacity(messages.len() + 1);
    if let Some(system) = collect_system_prompt(options.system_prompt.as_deref(), messages) {
        wire.push(OpenAiMessage {
            role: "system",
            content: Some(json!(system)),
            tool_calls: None,
            tool_call_id: None,
        });
    }
    for message in messages {
        match message.role {
            Role::System => {}
            Role::User => encode_user(message, &mut wire),
            Role::Assistant => encode_assistant(message, &mut wire),
        }
    }
    if wire.iter().all(|m| m.role == "system") {
        return Err(LlmError::InvalidRequest(
            "chat request needs at least one user or assistant message".to_string(),
        ));
    }

    let has_tools = !options.tools.is_empty();
    let tools = has_tools.then(|| {
        options
            .tools
            .iter()
            .map(|t| OpenAiTool {
                type_: "function",
                function: OpenAiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    });
    let tool_choice = if has_tools {
        options.tool_choice.as_ref().map(encode_tool_choice)
    } else {
        None
    };

    Ok(OpenAiChatRequest {
        model: ctx.model.to_string(),
        messages: wire,
        tools,
        tool_choice,
        parallel_tool_calls: options.parallel_tool_calls.filter(|_| has_tools),
        stream: ctx.stream.then_some(true),
        stream_options: ctx.stream.then_some(OpenAiStreamOptions {
            include_usage: true,
        }),
        temperature: options.temperature,
        max_completion_tokens: options.max_tokens.or(ctx.default_max_tokens),
        reasoning_effort: options.reasoning_effort.map(|e| e.as_str()),
        extra: options.provider_options.clone(),
    })
}

/// Tool results become `tool` messages ahead of the user's own content.
fn encode_user(message: &Message, wire: &mut Vec<OpenAiMessage>) {
    let mut parts = Vec::new();
    for block in &message.content {
        match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => wire.push(OpenAiMessage {
                role: "tool",
                content: Some(json!(content)),
                tool_calls: None,
                tool_call_id: Some(tool_use_id.clone()),
            }),
            ContentBlock::Text { text, .. } => parts.push(json!({"type": "text", "text": text})),
            ContentBlock::Image { source, .. } => parts.push(json!({
                "type": "image_url",
                "image_url": {"url": media_url(source)},
            })),
            ContentBlock::Document { source, title, .. } => {
                if matches!(source, MediaSource::Url { .. }) {
                    tracing::debug!("skipping URL document unsupported by chat completions");
                    continue;
                }
                let filename = title.as_deref().unwrap_or("document");
                parts.push(json!({
                    "type": "file",
                    "file": {"file_data": media_url(source), "filename": filename},
                }));
            }
            _ => {}
        }
    }
    if parts.is_empty() {
        return;
    }
    // plain text collapses to a string for compatible vendors that reject part arrays
    let content = if parts.iter().all(|p| p["type"] == "text") {
        let text: Vec<&str> = parts.iter().filter_map(|p| p["text"].as_str()).collect();
        json!(text.join("\n"))
    } else {
        serde_json::Value::Array(parts)
    };
    wire.push(OpenAiMessage {
        role: role_to_openai(message.role),
        content: Some(content),
        tool_calls: None,
        tool_call_id: None,
    });
}

fn encode_assistant(message: &Message, wire: &mut Vec<OpenAiMessage>) {
    let mut text = String::new();
    let mut calls = Vec::new();
    for block in &message.content {
        match block {
            ContentBlock::Text { text: t, .. } => text.push_str(t),
            ContentBlock::ToolUse {
                id,
                name,
                input,
                server_name: None,
            } => calls.push(OpenAiToolCall {
                id: id.clone(),
                type_: "function".to_string(),
                function: OpenAiToolCallFunction {
                    name: name.clone(),
                    arguments: input.to_string(),
                },
            }),
            _ => {}
        }
    }
    if text.is_empty() && calls.is_empty() {
        return;
    }
    wire.push(OpenAiMessage {
        role: role_to_openai(message.role),
        content: (!text.is_empty()).then(|| json!(text)),
        tool_calls: (!calls.is_empty()).then_some(calls),
        tool_call_id: None,
    });
}

fn media_url(source: &MediaSource) -> String {
    match source {
        MediaSource::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
        MediaSource::Url { url } => url.clone(),
    }
}

fn encode_tool_choice(choice: &ToolChoice) -> serde_json::Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::Any => json!("required"),
        ToolChoice::None => json!("none"),
        ToolChoice::Tool { name } => json!({"type": "function", "function": {"name": name}}),
    }
}
