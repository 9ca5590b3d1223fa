use std::time::Duration;

use tracing::info;

use crate::protocol::canonical::{ProviderKind, Response, Usage};

/// Input plus output tokens. Cache reads and writes are already part of the
/// input count for every provider except Anthropic, where they are added.
#[must_use]
pub fn total_tokens(usage: &Usage, anthropic_style: bool) -> u64 {
    let total = usage.total_tokens();
    if !anthropic_style {
        return total;
    }
    total
        .saturating_add(usage.cache_creation_input_tokens)
        .saturating_add(usage.cache_read_input_tokens)
}

/// Log token usage for a completed request at INFO level.
pub fn log_response_usage(provider: &str, kind: ProviderKind, response: &Response, duration: Duration) {
    let usage = &response.usage;
    info!(
        provider = provider,
        kind = kind.as_str(),
        model = %response.model,
        response_id = %response.id,
        stop_reason = ?response.stop_reason,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        cache_creation_input_tokens = usage.cache_creation_input_tokens,
        cache_read_input_tokens = usage.cache_read_input_tokens,
        total_tokens = total_tokens(usage, kind == ProviderKind::Anthropic),
        duration_seconds = duration.as_secs_f64(),
        "request completed"
    );
}
