use crate::error::LlmError;
use crate::protocol::canonical::{ContentBlock, Response, Role, StopReason};
use crate::protocol::gemini::{GeminiResponse, PartContent, PartMapper};
use crate::protocol::mapping::{gemini_finish_to_stop, resolve_stop_reason};
use crate::util::new_message_id;

/// Decode a raw `generateContent` body.
///
/// # Errors
///
/// Returns [`LlmError::Decode`] when the body is malformed or carries neither
/// a candidate nor a prompt block reason, and [`LlmError::Stream`] for an
/// embedded error object.
pub fn decode_gemini_body(body: &[u8]) -> Result<Response, LlmError> {
    let response: GeminiResponse =
        serde_json::from_slice(body).map_err(|e| LlmError::decode("gemini response", e))?;
    decode_gemini_response(response)
}

/// Decode a Gemini response into canonical form.
///
/// # Errors
///
/// See [`decode_gemini_body`].
pub fn decode_gemini_response(response: GeminiResponse) -> Result<Response, LlmError> {
    if let Some(error) = response.error {
        return Err(LlmError::Stream(error.describe()));
    }
    let usage = response
        .usage_metadata
        .as_ref()
        .map(|u| u.to_usage())
        .unwrap_or_default();
    let id = response
        .response_id
        .unwrap_or_else(|| new_message_id("gemini_"));
    let model = response.model_version.unwrap_or_default();

    let Some(candidate) = response.candidates.into_iter().next() else {
        if response
            .prompt_feedback
            .and_then(|f| f.block_reason)
            .is_some()
        {
            return Ok(Response {
                id,
                model,
                role: Role::Assistant,
                content: Vec::new(),
                usage,
                stop_reason: Some(StopReason::ContentFilter),
            });
        }
        return Err(LlmError::Decode(
            "gemini response has no candidates".to_string(),
        ));
    };

    let mut mapper = PartMapper::default();
    let mut content: Vec<ContentBlock> = Vec::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        let signature = part.thought_signature.clone().filter(|s| !s.is_empty());
        let signs_self = part.thought == Some(true);
        if !signs_self {
            attach_signature(&mut content, signature.clone());
        }
        match mapper.map(&part) {
            // adjacent parts of the same kind form one block, as they do when streamed
            Some(PartContent::Text(fragment)) => match content.last_mut() {
                Some(ContentBlock::Text { text, .. }) => text.push_str(&fragment),
                _ => content.push(ContentBlock::text(fragment)),
            },
            Some(PartContent::Thought(fragment)) => match content.last_mut() {
                Some(ContentBlock::Thinking { thinking, .. }) => thinking.push_str(&fragment),
                _ => content.push(ContentBlock::Thinking {
                    thinking: fragment,
                    signature: None,
                }),
            },
            Some(PartContent::Whole(block)) => content.push(block),
            None => {}
        }
        if signs_self {
            attach_signature(&mut content, signature);
        }
    }

    let reported = candidate
        .finish_reason
        .as_deref()
        .and_then(gemini_finish_to_stop);
    let saw_tool_call = content.iter().any(|b| b.kind().is_tool_call());

    Ok(Response {
        id,
        model,
        role: Role::Assistant,
        content,
        usage,
        stop_reason: Some(resolve_stop_reason(reported, saw_tool_call)),
    })
}

fn attach_signature(content: &mut Vec<ContentBlock>, signature: Option<String>) {
    let Some(signature) = signature else {
        return;
    };
    match content.last_mut() {
        Some(ContentBlock::Thinking { signature: slot, .. }) => *slot = Some(signature),
        _ => content.push(ContentBlock::Thinking {
            thinking: String::new(),
            signature: Some(signature),
        }),
    }
}
