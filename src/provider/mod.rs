pub mod registry;

pub use registry::ProviderRegistry;

use std::time::Instant;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderConfig;
use crate::error::LlmError;
use crate::observability::log_response_usage;
use crate::protocol::anthropic::encoder::encode_anthropic_request;
use crate::protocol::anthropic::response_decoder::decode_anthropic_body;
use crate::protocol::canonical::{
    validate_tool_results, GenerateOptions, Message, ProviderKind, Response,
};
use crate::protocol::gemini::encoder::encode_gemini_request;
use crate::protocol::gemini::response_decoder::decode_gemini_body;
use crate::protocol::openai_chat::encoder::encode_openai_chat_request;
use crate::protocol::openai_chat::response_decoder::decode_openai_chat_body;
use crate::protocol::openai_responses::encoder::encode_responses_request;
use crate::protocol::openai_responses::response_decoder::decode_responses_body;
use crate::protocol::EncodeContext;
use crate::stream::{translator_for, EventStream};
use crate::transport::{byte_stream, read_body, HttpTransport, RetryPolicy};

const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

/// One configured upstream: protocol, endpoint, credentials and retry policy.
///
/// `Send + Sync` and cheap to clone; clones share the HTTP connection pool.
#[derive(Debug, Clone)]
pub struct Provider {
    name: String,
    kind: ProviderKind,
    base_url: String,
    model: String,
    max_tokens: Option<u64>,
    headers: http::HeaderMap,
    transport: HttpTransport,
    retry: RetryPolicy,
}

impl Provider {
    /// Build a provider from its config entry.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Config`] when the key or an extra header cannot be
    /// sent as an HTTP header value.
    pub fn from_config(
        config: &ProviderConfig,
        retry: RetryPolicy,
        transport: HttpTransport,
    ) -> Result<Self, LlmError> {
        let api_key = config.resolve_api_key();
        if api_key.is_none() {
            tracing::warn!(provider = %config.name, "no API key configured; sending unauthenticated requests");
        }
        let mut headers = build_provider_headers(config.kind, api_key.as_deref(), config.api_version.as_deref())?;
        for extra in &config.headers {
            let name = http::HeaderName::from_bytes(extra.name.as_bytes())
                .map_err(|e| LlmError::Config(format!("invalid header name '{}': {e}", extra.name)))?;
            let value = http::HeaderValue::from_str(&extra.value)
                .map_err(|e| LlmError::Config(format!("invalid value for header '{}': {e}", extra.name)))?;
            headers.insert(name, value);
        }
        Ok(Self {
            name: config.name.clone(),
            kind: config.kind,
            base_url: config.base_url().trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            headers,
            transport,
            retry,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Endpoint for one call. Gemini puts the model in the path.
    #[must_use]
    pub fn request_url(&self, model: &str, stream: bool) -> String {
        let base = &self.base_url;
        match self.kind {
            ProviderKind::Anthropic => format!("{base}/messages"),
            ProviderKind::OpenAi => format!("{base}/chat/completions"),
            ProviderKind::OpenAiResponses => format!("{base}/responses"),
            ProviderKind::Gemini if stream => {
                format!("{base}/models/{model}:streamGenerateContent?alt=sse")
            }
            ProviderKind::Gemini => format!("{base}/models/{model}:generateContent"),
        }
    }

    /// Encode a conversation into this provider's JSON request body.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::InvalidRequest`] for a dangling tool result, a
    /// conversation the protocol cannot express, or a body that fails to
    /// serialize.
    pub fn encode_request(
        &self,
        messages: &[Message],
        options: &GenerateOptions,
        stream: bool,
    ) -> Result<Bytes, LlmError> {
        validate_tool_results(messages)?;
        let ctx = EncodeContext {
            model: self.model_for(options),
            default_max_tokens: self.max_tokens,
            stream,
        };
        let body = match self.kind {
            ProviderKind::Anthropic => {
                serde_json::to_vec(&encode_anthropic_request(messages, options, ctx)?)
            }
            ProviderKind::OpenAi => {
                serde_json::to_vec(&encode_openai_chat_request(messages, options, ctx)?)
            }
            ProviderKind::OpenAiResponses => {
                serde_json::to_vec(&encode_responses_request(messages, options, ctx)?)
            }
            ProviderKind::Gemini => serde_json::to_vec(&encode_gemini_request(messages, options, ctx)?),
        }
        .map_err(|e| LlmError::InvalidRequest(format!("failed to serialize request body: {e}")))?;
        Ok(Bytes::from(body))
    }

    /// Decode a non-streaming response body.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Decode`] for a malformed body, or
    /// [`LlmError::Stream`] when the body carries an in-band error.
    pub fn decode_response(&self, body: &[u8]) -> Result<Response, LlmError> {
        match self.kind {
            ProviderKind::Anthropic => decode_anthropic_body(body),
            ProviderKind::OpenAi => decode_openai_chat_body(body),
            ProviderKind::OpenAiResponses => decode_responses_body(body),
            ProviderKind::Gemini => decode_gemini_body(body),
        }
    }

    /// Run one non-streaming call, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Encoding errors, the retry policy's terminal error (including
    /// [`LlmError::RetryExhausted`] and [`LlmError::Cancelled`]), or a decode
    /// error for the final body.
    pub async fn generate(
        &self,
        messages: &[Message],
        options: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<Response, LlmError> {
        let started = Instant::now();
        let body = self.encode_request(messages, options, false)?;
        let url = self.request_url(self.model_for(options), false);
        let url = url.as_str();
        let headers = &self.headers;

        let raw = self
            .retry
            .execute(cancel, |attempt| {
                let body = body.clone();
                async move {
                    tracing::debug!(provider = %self.name, attempt, "sending request");
                    let response = self.transport.post_json(url, headers, body, cancel).await?;
                    read_body(response, cancel).await
                }
            })
            .await?;

        let response = self.decode_response(&raw)?;
        log_response_usage(&self.name, self.kind, &response, started.elapsed());
        Ok(response)
    }

    /// Open a streaming call.
    ///
    /// Only sending the request and checking its status are retried; once the
    /// stream is returned no retry happens, so events are never duplicated.
    ///
    /// # Errors
    ///
    /// Encoding errors, or the retry policy's terminal error.
    pub async fn stream(
        &self,
        messages: &[Message],
        options: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<EventStream, LlmError> {
        let body = self.encode_request(messages, options, true)?;
        let url = self.request_url(self.model_for(options), true);
        let url = url.as_str();
        let mut headers = self.headers.clone();
        headers.insert(
            http::header::ACCEPT,
            http::HeaderValue::from_static("text/event-stream"),
        );
        let headers = &headers;

        let response = self
            .retry
            .execute(cancel, |attempt| {
                let body = body.clone();
                async move {
                    tracing::debug!(provider = %self.name, attempt, "opening stream");
                    self.transport.post_json_stream(url, headers, body, cancel).await
                }
            })
            .await?;

        Ok(EventStream::new(
            byte_stream(response),
            translator_for(self.kind),
            cancel.clone(),
        )
        .with_usage_log(self.name.clone(), self.kind))
    }

    fn model_for<'a>(&'a self, options: &'a GenerateOptions) -> &'a str {
        options.model.as_deref().unwrap_or(&self.model)
    }
}

/// Authentication and version headers for a provider kind.
fn build_provider_headers(
    kind: ProviderKind,
    api_key: Option<&str>,
    api_version: Option<&str>,
) -> Result<http::HeaderMap, LlmError> {
    let mut headers = http::HeaderMap::new();
    let secret = |value: &str| {
        let mut value = http::HeaderValue::from_str(value)
            .map_err(|_| LlmError::Config("API key is not a valid header value".to_string()))?;
        value.set_sensitive(true);
        Ok::<_, LlmError>(value)
    };

    match kind {
        ProviderKind::OpenAi | ProviderKind::OpenAiResponses => {
            if let Some(key) = api_key {
                headers.insert(http::header::AUTHORIZATION, secret(&format!("Bearer {key}"))?);
            }
        }
        ProviderKind::Anthropic => {
            if let Some(key) = api_key {
                headers.insert("x-api-key", secret(key)?);
            }
            let version = api_version.unwrap_or(DEFAULT_ANTHROPIC_VERSION);
            let version = http::HeaderValue::from_str(version)
                .map_err(|_| LlmError::Config(format!("invalid anthropic version '{version}'")))?;
            headers.insert("anthropic-version", version);
        }
        ProviderKind::Gemini => {
            if let Some(key) = api_key {
                headers.insert("x-goog-api-key", secret(key)?);
            }
        }
    }
    Ok(headers)
}
