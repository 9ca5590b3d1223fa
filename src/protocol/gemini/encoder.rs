use rustc_hash::FxHashMap;
use serde_json::json;

use crate::error::LlmError;
use crate::protocol::canonical::{
    ContentBlock, GenerateOptions, MediaSource, Message, Role, ToolChoice,
};
use crate::protocol::gemini::{
    GeminiBlob, GeminiCodeExecutionResult, GeminiContent, GeminiExecutableCode, GeminiFileData,
    GeminiFunctionCall, GeminiFunctionCallingConfig, GeminiFunctionDeclaration,
    GeminiFunctionResponse, GeminiGenerationConfig, GeminiPart, GeminiRequest,
    GeminiThinkingConfig, GeminiToolConfig, GeminiToolDeclaration, CODE_EXECUTION_TOOL,
};
use crate::protocol::mapping::role_to_gemini;
use crate::protocol::{collect_system_prompt, EncodeContext};

/// Encode a conversation into a `generateContent` request.
///
/// # Errors
///
/// Returns [`LlmError::InvalidRequest`] when no content results, or when a
/// tool result answers a call this conversation never made (Gemini matches
/// responses by function name).
pub fn encode_gemini_request(
    messages: &[Message],
    options: &GenerateOptions,
    ctx: EncodeContext<'_>,
) -> Result<GeminiRequest, LlmError> {
    let mut call_names: FxHashMap<&str, &str> = FxHashMap::default();
    let mut contents = Vec::with_capacity(messages.len());
    for message in messages.iter().filter(|m| m.role != Role::System) {
        let mut parts = Vec::with_capacity(message.content.len());
        let mut pending_signature: Option<String> = None;
        for block in &message.content {
            if let ContentBlock::ToolUse { id, name, .. } = block {
                call_names.insert(id, name);
            }
            if let ContentBlock::Thinking {
                signature: Some(signature),
                ..
            } = block
            {
                // replayed on the next part, which is where Gemini expects it
                pending_signature = Some(signature.clone());
                continue;
            }
            if let Some(mut part) = encode_block(block, &call_names)? {
                part.thought_signature = pending_signature.take();
                parts.push(part);
            }
        }
        if parts.is_empty() {
            continue;
        }
        contents.push(GeminiContent {
            role: Some(role_to_gemini(message.role).to_string()),
            parts,
        });
    }
    if contents.is_empty() {
        return Err(LlmError::InvalidRequest(
            "gemini request needs at least one non-empty message".to_string(),
        ));
    }

    let system_instruction =
        collect_system_prompt(options.system_prompt.as_deref(), messages).map(|text| GeminiContent {
            role: None,
            parts: vec![GeminiPart::text(text)],
        });

    let has_tools = !options.tools.is_empty();
    let tools = has_tools.then(|| {
        vec![GeminiToolDeclaration {
            function_declarations: options
                .tools
                .iter()
                .map(|t| GeminiFunctionDeclaration {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: Some(t.parameters.clone()),
                })
                .collect(),
        }]
    });
    let tool_config = options
        .tool_choice
        .as_ref()
        .filter(|_| has_tools)
        .map(|choice| GeminiToolConfig {
            function_calling_config: match choice {
                ToolChoice::Auto => calling_mode("AUTO", None),
                ToolChoice::Any => calling_mode("ANY", None),
                ToolChoice::None => calling_mode("NONE", None),
                ToolChoice::Tool { name } => calling_mode("ANY", Some(vec![name.clone()])),
            },
        });

    let generation_config = GeminiGenerationConfig {
        temperature: options.temperature,
        max_output_tokens: options.max_tokens.or(ctx.default_max_tokens),
        thinking_config: options
            .thinking_budget()
            .map(|thinking_budget| GeminiThinkingConfig {
                thinking_budget,
                include_thoughts: true,
            }),
    };
    let has_generation_config = generation_config.temperature.is_some()
        || generation_config.max_output_tokens.is_some()
        || generation_config.thinking_config.is_some();

    Ok(GeminiRequest {
        contents,
        tools,
        tool_config,
        system_instruction,
        generation_config: has_generation_config.then_some(generation_config),
        extra: options.provider_options.clone(),
    })
}

fn calling_mode(mode: &'static str, allowed: Option<Vec<String>>) -> GeminiFunctionCallingConfig {
    GeminiFunctionCallingConfig {
        mode,
        allowed_function_names: allowed,
    }
}

fn encode_block(
    block: &ContentBlock,
    call_names: &FxHashMap<&str, &str>,
) -> Result<Option<GeminiPart>, LlmError> {
    let part = match block {
        ContentBlock::Text { text, .. } if !text.is_empty() => GeminiPart::text(text.clone()),
        ContentBlock::Image { source, .. } | ContentBlock::Document { source, .. } => {
            encode_media(source)
        }
        ContentBlock::ToolUse {
            name,
            input,
            server_name: None,
            ..
        } => GeminiPart {
            function_call: Some(GeminiFunctionCall {
                id: None,
                name: name.clone(),
                args: input.clone(),
            }),
            ..GeminiPart::default()
        },
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let Some(name) = call_names.get(tool_use_id.as_str()) else {
                return Err(LlmError::InvalidRequest(format!(
                    "tool result '{tool_use_id}' has no preceding tool use"
                )));
            };
            let response = if *is_error {
                json!({ "error": content })
            } else {
                json!({ "content": content })
            };
            GeminiPart {
                function_response: Some(GeminiFunctionResponse {
                    id: None,
                    name: (*name).to_string(),
                    response,
                }),
                ..GeminiPart::default()
            }
        }
        ContentBlock::ServerToolUse { name, input, .. } if name == CODE_EXECUTION_TOOL => GeminiPart {
            executable_code: Some(GeminiExecutableCode {
                language: input
                    .get("language")
                    .and_then(|v| v.as_str())
                    .unwrap_or("PYTHON")
                    .to_string(),
                code: input
                    .get("code")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            }),
            ..GeminiPart::default()
        },
        ContentBlock::CodeExecutionResult {
            output,
            return_code,
            ..
        } => GeminiPart {
            code_execution_result: Some(GeminiCodeExecutionResult {
                outcome: match return_code {
                    Some(0) | None => "OUTCOME_OK",
                    Some(_) => "OUTCOME_FAILED",
                }
                .to_string(),
                output: Some(output.clone()),
            }),
            ..GeminiPart::default()
        },
        _ => return Ok(None),
    };
    Ok(Some(part))
}

fn encode_media(source: &MediaSource) -> GeminiPart {
    match source {
        MediaSource::Base64 { media_type, data } => GeminiPart {
            inline_data: Some(GeminiBlob {
                mime_type: media_type.clone(),
                data: data.clone(),
            }),
            ..GeminiPart::default()
        },
        MediaSource::Url { url } => GeminiPart {
            file_data: Some(GeminiFileData {
                mime_type: None,
                file_uri: url.clone(),
            }),
            ..GeminiPart::default()
        },
    }
}
