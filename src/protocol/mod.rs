pub mod anthropic;
pub mod canonical;
pub mod gemini;
pub mod mapping;
pub mod openai_chat;
pub mod openai_responses;

use canonical::{ContentBlock, Message, Role};

/// Provider-level values an encoder needs beyond the per-request options.
#[derive(Debug, Clone, Copy)]
pub struct EncodeContext<'a> {
    pub model: &'a str,
    pub default_max_tokens: Option<u64>,
    pub stream: bool,
}

/// Join the option-level system prompt with the text of any system-role messages.
pub(crate) fn collect_system_prompt(
    system_prompt: Option<&str>,
    messages: &[Message],
) -> Option<String> {
    let mut parts: Vec<&str> = system_prompt.into_iter().collect();
    for message in messages.iter().filter(|m| m.role == Role::System) {
        for block in &message.content {
            if let ContentBlock::Text { text, .. } = block {
                parts.push(text);
            }
        }
    }
    let joined = parts
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    (!joined.is_empty()).then_some(joined)
}
