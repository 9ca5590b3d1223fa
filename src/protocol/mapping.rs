use super::canonical::{Role, StopReason};

// ---------------------------------------------------------------------------
// Role mappings
// ---------------------------------------------------------------------------

#[must_use]
pub fn role_to_openai(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

#[must_use]
pub fn role_to_anthropic(role: Role) -> &'static str {
    match role {
        // system content is hoisted into the top-level `system` field
        Role::System | Role::User => "user",
        Role::Assistant => "assistant",
    }
}

#[must_use]
pub fn role_to_gemini(role: Role) -> &'static str {
    match role {
        Role::System | Role::User => "user",
        Role::Assistant => "model",
    }
}

// ---------------------------------------------------------------------------
// Stop reason mappings
// ---------------------------------------------------------------------------

/// Map an OpenAI Chat `finish_reason`.
#[must_use]
pub fn openai_finish_to_stop(s: &str) -> Option<StopReason> {
    match s {
        "stop" => Some(StopReason::EndTurn),
        "tool_calls" | "function_call" => Some(StopReason::ToolUse),
        "length" => Some(StopReason::MaxTokens),
        "content_filter" => Some(StopReason::ContentFilter),
        _ => None,
    }
}

/// Map an Anthropic `stop_reason`.
#[must_use]
pub fn anthropic_stop_to_stop(s: &str) -> Option<StopReason> {
    match s {
        "end_turn" | "stop_sequence" | "pause_turn" => Some(StopReason::EndTurn),
        "tool_use" => Some(StopReason::ToolUse),
        "max_tokens" | "model_context_window_exceeded" => Some(StopReason::MaxTokens),
        "refusal" => Some(StopReason::ContentFilter),
        _ => None,
    }
}

/// Map a Gemini `finishReason`. `STOP` carries no information about tool calls, so it maps
/// to `None` and the reason is inferred from the blocks seen.
#[must_use]
pub fn gemini_finish_to_stop(s: &str) -> Option<StopReason> {
    match s {
        "MAX_TOKENS" => Some(StopReason::MaxTokens),
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII"
        | "IMAGE_SAFETY" => Some(StopReason::ContentFilter),
        "MALFORMED_FUNCTION_CALL" | "UNEXPECTED_TOOL_CALL" => Some(StopReason::Error),
        _ => None,
    }
}

/// Map a Responses API `incomplete_details.reason`.
#[must_use]
pub fn responses_incomplete_to_stop(reason: Option<&str>) -> StopReason {
    match reason {
        Some("content_filter") => StopReason::ContentFilter,
        _ => StopReason::MaxTokens,
    }
}

/// Resolve the final stop reason from the provider's report and whether any tool call
/// block was produced. Incomplete and error reasons always win.
#[must_use]
pub fn resolve_stop_reason(reported: Option<StopReason>, saw_tool_call: bool) -> StopReason {
    match reported {
        Some(reason) if reason.is_overriding() => reason,
        Some(StopReason::ToolUse) => StopReason::ToolUse,
        _ if saw_tool_call => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}
