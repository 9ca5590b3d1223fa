use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::LlmError;

pub type ProviderOptions = serde_json::Map<String, serde_json::Value>;

/// The wire protocol a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "openai-responses")]
    OpenAiResponses,
    #[serde(rename = "gemini")]
    Gemini,
}

impl ProviderKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
            ProviderKind::OpenAiResponses => "openai-responses",
            ProviderKind::Gemini => "gemini",
        }
    }

    /// Public endpoint used when a provider config leaves `base_url` unset.
    #[must_use]
    pub fn default_base_url(self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
            ProviderKind::OpenAi | ProviderKind::OpenAiResponses => "https://api.openai.com/v1",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anthropic" => Ok(ProviderKind::Anthropic),
            "openai" => Ok(ProviderKind::OpenAi),
            "openai-responses" => Ok(ProviderKind::OpenAiResponses),
            "gemini" => Ok(ProviderKind::Gemini),
            other => Err(LlmError::Config(format!("unknown provider kind '{other}'"))),
        }
    }
}

/// Canonical message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    #[default]
    Assistant,
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    ContentFilter,
    Error,
}

impl StopReason {
    /// Reasons that describe an incomplete or failed turn and always win over inference.
    #[must_use]
    pub fn is_overriding(self) -> bool {
        matches!(
            self,
            StopReason::MaxTokens | StopReason::ContentFilter | StopReason::Error
        )
    }
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl Usage {
    /// Overwrite every field the later report sets to a non-zero value.
    pub fn merge(&mut self, later: &Usage) {
        if later.input_tokens > 0 {
            self.input_tokens = later.input_tokens;
        }
        if later.output_tokens > 0 {
            self.output_tokens = later.output_tokens;
        }
        if later.cache_creation_input_tokens > 0 {
            self.cache_creation_input_tokens = later.cache_creation_input_tokens;
        }
        if later.cache_read_input_tokens > 0 {
            self.cache_read_input_tokens = later.cache_read_input_tokens;
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Usage::default()
    }

    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// A source reference attached to generated text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Citation {
    CharLocation {
        cited_text: String,
        document_index: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        document_title: Option<String>,
        start_char_index: u32,
        end_char_index: u32,
    },
    PageLocation {
        cited_text: String,
        document_index: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        document_title: Option<String>,
        start_page_number: u32,
        end_page_number: u32,
    },
    WebSearchResultLocation {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default)]
        cited_text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encrypted_index: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSearchResult {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_age: Option<String>,
}

/// Where binary content lives: inline base64 or a URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

/// Canonical, fully materialized unit of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        citations: Vec<Citation>,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
        /// Set when the provider executed the call against a remote MCP server.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_name: Option<String>,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    ServerToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    WebSearchToolResult {
        tool_use_id: String,
        #[serde(default)]
        results: Vec<WebSearchResult>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
    CodeExecutionResult {
        tool_use_id: String,
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        return_code: Option<i64>,
    },
    Image {
        source: MediaSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generation_id: Option<String>,
    },
    Document {
        source: MediaSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
    },
    Refusal {
        text: String,
    },
}

/// Discriminant of [`ContentBlock`], used for lifecycle bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Text,
    Thinking,
    RedactedThinking,
    ToolUse,
    ToolResult,
    ServerToolUse,
    WebSearchToolResult,
    CodeExecutionResult,
    Image,
    Document,
    Refusal,
}

impl BlockKind {
    /// Blocks that represent a call the model asked for, client or server side.
    #[must_use]
    pub fn is_tool_call(self) -> bool {
        matches!(self, BlockKind::ToolUse | BlockKind::ServerToolUse)
    }
}

impl ContentBlock {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text {
            text: text.into(),
            citations: Vec::new(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> BlockKind {
        match self {
            ContentBlock::Text { .. } => BlockKind::Text,
            ContentBlock::Thinking { .. } => BlockKind::Thinking,
            ContentBlock::RedactedThinking { .. } => BlockKind::RedactedThinking,
            ContentBlock::ToolUse { .. } => BlockKind::ToolUse,
            ContentBlock::ToolResult { .. } => BlockKind::ToolResult,
            ContentBlock::ServerToolUse { .. } => BlockKind::ServerToolUse,
            ContentBlock::WebSearchToolResult { .. } => BlockKind::WebSearchToolResult,
            ContentBlock::CodeExecutionResult { .. } => BlockKind::CodeExecutionResult,
            ContentBlock::Image { .. } => BlockKind::Image,
            ContentBlock::Document { .. } => BlockKind::Document,
            ContentBlock::Refusal { .. } => BlockKind::Refusal,
        }
    }
}

/// Incremental payload carried by [`Event::ContentBlockDelta`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    Text { text: String },
    InputJson { partial_json: String },
    Thinking { thinking: String },
    Signature { signature: String },
    Citation { citation: Citation },
}

/// The canonical streaming event algebra every provider translator emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    MessageStart {
        message: Response,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: Delta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        #[serde(default)]
        stop_reason: Option<StopReason>,
        #[serde(default)]
        usage: Option<Usage>,
    },
    MessageStop,
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    #[must_use]
    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    #[must_use]
    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error,
            }],
        }
    }
}

/// Check that every `ToolResult` answers a `ToolUse` seen earlier in the conversation.
///
/// # Errors
///
/// Returns [`LlmError::InvalidRequest`] naming the first dangling result id.
pub fn validate_tool_results(messages: &[Message]) -> Result<(), LlmError> {
    let mut seen = rustc_hash::FxHashSet::default();
    for message in messages {
        for block in &message.content {
            match block {
                ContentBlock::ToolUse { id, .. } | ContentBlock::ServerToolUse { id, .. } => {
                    seen.insert(id.as_str());
                }
                ContentBlock::ToolResult { tool_use_id, .. } if !seen.contains(tool_use_id.as_str()) => {
                    return Err(LlmError::InvalidRequest(format!(
                        "tool result '{tool_use_id}' has no preceding tool use"
                    )));
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

/// Tool choice specification.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    #[default]
    Auto,
    Any,
    None,
    Tool { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }

    /// Thinking budget used by providers that take a token count instead of an effort level.
    #[must_use]
    pub fn budget_tokens(self) -> u64 {
        match self {
            ReasoningEffort::Low => 2_048,
            ReasoningEffort::Medium => 8_192,
            ReasoningEffort::High => 24_576,
        }
    }
}

/// Per-request generation settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateOptions {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub reasoning_budget_tokens: Option<u64>,
    pub parallel_tool_calls: Option<bool>,
    /// Merged verbatim into the provider request body.
    pub provider_options: ProviderOptions,
}

impl GenerateOptions {
    /// Thinking budget from an explicit token count, falling back to the effort level.
    #[must_use]
    pub fn thinking_budget(&self) -> Option<u64> {
        self.reasoning_budget_tokens
            .or_else(|| self.reasoning_effort.map(ReasoningEffort::budget_tokens))
    }
}

/// A complete (or, mid-stream, partially accumulated) model response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub model: String,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub usage: Usage,
    pub stop_reason: Option<StopReason>,
}

impl Response {
    /// Concatenated text of all text blocks.
    #[must_use]
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text, .. } = block {
                out.push_str(text);
            }
        }
        out
    }

    /// Client-side tool calls the caller is expected to execute.
    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &str, &serde_json::Value)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse {
                id,
                name,
                input,
                server_name: None,
            } => Some((id.as_str(), name.as_str(), input)),
            _ => None,
        })
    }
}
