pub mod encoder;
pub mod response_decoder;
pub mod stream;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::canonical::{Citation, Usage};

/// `OpenAI` Responses API request wire type.
#[derive(Debug, Clone, Serialize)]
pub struct ResponsesRequest {
    pub model: String,
    pub input: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ResponsesReasoning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<&'static str>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponsesReasoning {
    pub effort: &'static str,
    pub summary: &'static str,
}

/// The Responses API response object, also embedded in lifecycle stream events.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponsesOutput {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub output: Vec<ResponsesOutputItem>,
    #[serde(default)]
    pub usage: Option<ResponsesUsage>,
    #[serde(default)]
    pub incomplete_details: Option<ResponsesIncompleteDetails>,
    #[serde(default)]
    pub error: Option<ResponsesErrorBody>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponsesIncompleteDetails {
    #[serde(default)]
    pub reason: Option<String>,
}

/// One output item.
///
/// Item shapes vary widely by `type`, so the fields of every supported kind
/// live side by side and unknown kinds still deserialize.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponsesOutputItem {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    // message
    #[serde(default)]
    pub content: Vec<ResponsesContentPart>,
    // function_call, mcp_call
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
    #[serde(default)]
    pub server_label: Option<String>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    // reasoning
    #[serde(default)]
    pub summary: Vec<ResponsesSummaryPart>,
    #[serde(default)]
    pub encrypted_content: Option<String>,
    // image_generation_call
    #[serde(default)]
    pub result: Option<String>,
    // web_search_call
    #[serde(default)]
    pub action: Option<Value>,
    // code_interpreter_call
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub outputs: Option<Vec<Value>>,
    #[serde(default)]
    pub container_id: Option<String>,
}

/// A content part of a `message` item.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsesContentPart {
    OutputText {
        #[serde(default)]
        text: String,
        #[serde(default)]
        annotations: Vec<Value>,
    },
    Refusal {
        #[serde(default)]
        refusal: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponsesSummaryPart {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponsesUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub input_tokens_details: Option<ResponsesInputTokensDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponsesInputTokensDetails {
    #[serde(default)]
    pub cached_tokens: u64,
}

impl ResponsesUsage {
    #[must_use]
    pub fn to_usage(&self) -> Usage {
        Usage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: self
                .input_tokens_details
                .as_ref()
                .map_or(0, |d| d.cached_tokens),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponsesErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl ResponsesErrorBody {
    #[must_use]
    pub fn describe(&self) -> String {
        match &self.code {
            Some(code) => format!("{code}: {}", self.message),
            None => self.message.clone(),
        }
    }
}

/// Responses API streaming event types.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ResponsesStreamEvent {
    #[serde(rename = "response.created")]
    Created { response: ResponsesOutput },
    #[serde(rename = "response.in_progress")]
    InProgress { response: ResponsesOutput },
    #[serde(rename = "response.completed")]
    Completed { response: ResponsesOutput },
    #[serde(rename = "response.incomplete")]
    Incomplete { response: ResponsesOutput },
    #[serde(rename = "response.failed")]
    Failed { response: ResponsesOutput },
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded { item: ResponsesOutputItem },
    #[serde(rename = "response.output_item.done")]
    OutputItemDone { item: ResponsesOutputItem },
    #[serde(rename = "response.content_part.added")]
    ContentPartAdded {
        item_id: String,
        content_index: u32,
        part: ResponsesContentPart,
    },
    #[serde(rename = "response.content_part.done")]
    ContentPartDone { item_id: String, content_index: u32 },
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta {
        item_id: String,
        content_index: u32,
        delta: String,
    },
    #[serde(rename = "response.output_text.annotation.added")]
    OutputTextAnnotationAdded {
        item_id: String,
        content_index: u32,
        annotation: Value,
    },
    #[serde(rename = "response.output_text.done")]
    OutputTextDone { item_id: String, content_index: u32 },
    #[serde(rename = "response.refusal.delta")]
    RefusalDelta {
        item_id: String,
        content_index: u32,
        delta: String,
    },
    #[serde(rename = "response.refusal.done")]
    RefusalDone { item_id: String, content_index: u32 },
    #[serde(rename = "response.reasoning_summary_part.added")]
    ReasoningSummaryPartAdded { item_id: String, summary_index: u32 },
    #[serde(rename = "response.reasoning_summary_text.delta")]
    ReasoningSummaryTextDelta {
        item_id: String,
        summary_index: u32,
        delta: String,
    },
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta { item_id: String, delta: String },
    #[serde(rename = "response.mcp_call_arguments.delta")]
    McpCallArgumentsDelta { item_id: String, delta: String },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

/// Map a `url_citation` annotation; other annotation kinds yield `None`.
#[must_use]
pub fn parse_annotation(raw: &Value) -> Option<Citation> {
    if raw.get("type")?.as_str()? != "url_citation" {
        return None;
    }
    Some(Citation::WebSearchResultLocation {
        url: raw.get("url")?.as_str()?.to_string(),
        title: raw.get("title").and_then(Value::as_str).map(str::to_string),
        cited_text: String::new(),
        encrypted_index: None,
    })
}

/// Render a loosely typed string-or-object field as text.
pub(crate) fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
