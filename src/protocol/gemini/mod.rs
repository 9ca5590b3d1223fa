pub mod encoder;
pub mod response_decoder;
pub mod stream;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::protocol::canonical::{ContentBlock, MediaSource, Usage};
use crate::util::next_call_id;

/// Gemini v1beta generateContent request wire type.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiRequest {
    pub contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<GeminiToolDeclaration>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<GeminiToolConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GeminiGenerationConfig>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A content message in Gemini format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

/// A single part within a Gemini content message.
///
/// Exactly one payload field is set; `thought` and `thoughtSignature` ride
/// alongside it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<GeminiFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<GeminiFunctionResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<GeminiBlob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<GeminiFileData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_code: Option<GeminiExecutableCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_execution_result: Option<GeminiCodeExecutionResult>,
}

impl GeminiPart {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiFunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiFunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiBlob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiFileData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub file_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiExecutableCode {
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiCodeExecutionResult {
    #[serde(default)]
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Gemini generateContent response, also the unit of each stream chunk.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiResponse {
    #[serde(default)]
    pub candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    pub usage_metadata: Option<GeminiUsageMetadata>,
    #[serde(default)]
    pub model_version: Option<String>,
    #[serde(default)]
    pub response_id: Option<String>,
    #[serde(default)]
    pub prompt_feedback: Option<GeminiPromptFeedback>,
    #[serde(default)]
    pub error: Option<GeminiErrorBody>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiCandidate {
    #[serde(default)]
    pub content: Option<GeminiContent>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub index: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiPromptFeedback {
    #[serde(default)]
    pub block_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiUsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
    #[serde(default)]
    pub thoughts_token_count: u64,
    #[serde(default)]
    pub cached_content_token_count: u64,
}

impl GeminiUsageMetadata {
    /// Thought tokens are billed as output.
    #[must_use]
    pub fn to_usage(&self) -> Usage {
        Usage {
            input_tokens: self.prompt_token_count,
            output_tokens: self
                .candidates_token_count
                .saturating_add(self.thoughts_token_count),
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: self.cached_content_token_count,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeminiErrorBody {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl GeminiErrorBody {
    #[must_use]
    pub fn describe(&self) -> String {
        match &self.status {
            Some(status) => format!("{status}: {}", self.message),
            None => self.message.clone(),
        }
    }
}

/// A tool declaration (contains function declarations).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiToolDeclaration {
    pub function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeminiFunctionDeclaration {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiToolConfig {
    pub function_calling_config: GeminiFunctionCallingConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiFunctionCallingConfig {
    pub mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_function_names: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<GeminiThinkingConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiThinkingConfig {
    pub thinking_budget: u64,
    pub include_thoughts: bool,
}

pub const CODE_EXECUTION_TOOL: &str = "code_execution";

/// What one response part contributes to canonical content.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PartContent {
    Text(String),
    Thought(String),
    /// A block that arrives complete.
    Whole(ContentBlock),
}

/// Maps response parts to canonical content, pairing each `executableCode`
/// with the `codeExecutionResult` that follows it. Shared by the stream
/// translator and the body decoder; the pairing can span stream chunks.
#[derive(Debug, Default)]
pub(crate) struct PartMapper {
    pending_execution: Option<String>,
}

impl PartMapper {
    pub(crate) fn map(&mut self, part: &GeminiPart) -> Option<PartContent> {
        if let Some(text) = part.text.as_ref().filter(|t| !t.is_empty()) {
            return Some(if part.thought == Some(true) {
                PartContent::Thought(text.clone())
            } else {
                PartContent::Text(text.clone())
            });
        }
        if let Some(call) = &part.function_call {
            return Some(PartContent::Whole(ContentBlock::ToolUse {
                id: call.id.clone().unwrap_or_else(next_call_id),
                name: call.name.clone(),
                input: if call.args.is_null() { json!({}) } else { call.args.clone() },
                server_name: None,
            }));
        }
        if let Some(blob) = &part.inline_data {
            return Some(PartContent::Whole(ContentBlock::Image {
                source: MediaSource::Base64 {
                    media_type: blob.mime_type.clone(),
                    data: blob.data.clone(),
                },
                generation_id: None,
            }));
        }
        if let Some(code) = &part.executable_code {
            let id = next_call_id();
            self.pending_execution = Some(id.clone());
            return Some(PartContent::Whole(ContentBlock::ServerToolUse {
                id,
                name: CODE_EXECUTION_TOOL.to_string(),
                input: json!({"language": code.language, "code": code.code}),
            }));
        }
        if let Some(result) = &part.code_execution_result {
            let tool_use_id = self.pending_execution.take().unwrap_or_else(|| {
                tracing::debug!("code execution result without a preceding call");
                next_call_id()
            });
            return Some(PartContent::Whole(ContentBlock::CodeExecutionResult {
                tool_use_id,
                output: result.output.clone().unwrap_or_default(),
                return_code: outcome_return_code(&result.outcome),
            }));
        }
        None
    }
}

fn outcome_return_code(outcome: &str) -> Option<i64> {
    match outcome {
        "OUTCOME_OK" => Some(0),
        "OUTCOME_FAILED" => Some(1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_execution_pairs_call_and_result() {
        let mut mapper = PartMapper::default();
        let call: GeminiPart = serde_json::from_value(json!({
            "executableCode": {"language": "PYTHON", "code": "print(6*7)"}
        }))
        .unwrap();
        let result: GeminiPart = serde_json::from_value(json!({
            "codeExecutionResult": {"outcome": "OUTCOME_OK", "output": "42\n"}
        }))
        .unwrap();
        let Some(PartContent::Whole(ContentBlock::ServerToolUse { id, .. })) = mapper.map(&call) else {
            panic!("expected a server tool call");
        };
        assert_eq!(
            mapper.map(&result),
            Some(PartContent::Whole(ContentBlock::CodeExecutionResult {
                tool_use_id: id,
                output: "42\n".into(),
                return_code: Some(0),
            }))
        );
    }

    #[test]
    fn test_thought_text_and_empty_parts() {
        let mut mapper = PartMapper::default();
        let thought: GeminiPart =
            serde_json::from_value(json!({"text": "hmm", "thought": true})).unwrap();
        assert_eq!(mapper.map(&thought), Some(PartContent::Thought("hmm".into())));
        assert_eq!(mapper.map(&GeminiPart::text("")), None);
    }

    #[test]
    fn test_usage_counts_thoughts_as_output() {
        let usage = GeminiUsageMetadata {
            prompt_token_count: 10,
            candidates_token_count: 4,
            thoughts_token_count: 6,
            cached_content_token_count: 2,
        }
        .to_usage();
        assert_eq!(usage.output_tokens, 10);
        assert_eq!(usage.cache_read_input_tokens, 2);
    }
}
