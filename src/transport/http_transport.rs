use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;

use crate::config::HttpConfig;
use crate::error::LlmError;

use super::retry_policy::parse_retry_after_delay;

const PARSED_URL_CACHE_MAX_ENTRIES: usize = 512;
/// Upper bound on how much of an error body ends up in an error message.
const ERROR_BODY_MAX_CHARS: usize = 2_048;

#[derive(Debug, Clone, Copy)]
enum TimeoutScope {
    WholeExchange,
    UntilHeaders,
}

/// Raw response body as delivered by the transport.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, LlmError>> + Send>>;

fn build_reqwest_client(config: &HttpConfig) -> Result<reqwest::Client, LlmError> {
    let pool_idle_timeout =
        (config.pool_idle_timeout_secs > 0).then(|| Duration::from_secs(config.pool_idle_timeout_secs));
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(pool_idle_timeout)
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .redirect(reqwest::redirect::Policy::none());

    if let Some(proxy_url) = config.proxy.as_deref() {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| LlmError::Config(format!("Invalid proxy URL: {err}")))?;
        builder = builder.no_proxy().proxy(proxy);
    } else if !config.use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| LlmError::Transport(format!("Failed to build HTTP client: {err}")))
}

/// Pooled HTTP client shared by every provider built from one config.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    request_timeout: Option<Duration>,
    parsed_url_cache: Arc<RwLock<FxHashMap<String, Arc<url::Url>>>>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport").finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Build a transport with pooling, timeouts and proxy settings from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Config`] for an unusable proxy URL and
    /// [`LlmError::Transport`] when the client cannot be built.
    pub fn new(config: &HttpConfig) -> Result<Self, LlmError> {
        let transport = Self::from_client(build_reqwest_client(config)?);
        Ok(transport.with_request_timeout(Duration::from_secs(config.timeout_secs)))
    }

    /// Wrap an already configured client. No per-request timeout is applied.
    #[must_use]
    pub fn from_client(client: reqwest::Client) -> Self {
        Self {
            client,
            request_timeout: None,
            parsed_url_cache: Arc::new(RwLock::new(FxHashMap::default())),
        }
    }

    /// Bound a buffered exchange end to end, and a streamed one until its
    /// response headers arrive.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    fn parsed_url(&self, url: &str) -> Result<Arc<url::Url>, LlmError> {
        if let Some(cached) = self.parsed_url_cache.read().get(url) {
            return Ok(cached.clone());
        }

        let parsed = url::Url::parse(url)
            .map_err(|e| LlmError::Config(format!("Invalid upstream URL '{url}': {e}")))?;

        let mut cache = self.parsed_url_cache.write();
        if let Some(existing) = cache.get(url) {
            return Ok(existing.clone());
        }
        if cache.len() >= PARSED_URL_CACHE_MAX_ENTRIES {
            cache.clear();
        }
        let parsed = Arc::new(parsed);
        cache.insert(url.to_string(), parsed.clone());
        Ok(parsed)
    }

    /// POST a JSON body once and return the response if its status is 2xx.
    ///
    /// The request timeout also covers reading the body, so use this for
    /// responses that are read whole. Retrying is the caller's business; see
    /// [`RetryPolicy`](super::RetryPolicy).
    ///
    /// # Errors
    ///
    /// - [`LlmError::Upstream`] for a non-2xx status, with the provider's
    ///   error message and `Retry-After` hint.
    /// - [`LlmError::Transport`] when the request cannot be sent or times out.
    /// - [`LlmError::Cancelled`] when `cancel` fires first.
    pub async fn post_json(
        &self,
        url: &str,
        headers: &http::HeaderMap,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, LlmError> {
        self.send(url, headers, body, TimeoutScope::WholeExchange, cancel)
            .await
    }

    /// Like [`post_json`](Self::post_json), but the timeout stops once the
    /// response headers arrive so a long stream is never cut off.
    ///
    /// # Errors
    ///
    /// Same as [`post_json`](Self::post_json).
    pub async fn post_json_stream(
        &self,
        url: &str,
        headers: &http::HeaderMap,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, LlmError> {
        self.send(url, headers, body, TimeoutScope::UntilHeaders, cancel)
            .await
    }

    async fn send(
        &self,
        url: &str,
        headers: &http::HeaderMap,
        body: Bytes,
        scope: TimeoutScope,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, LlmError> {
        let parsed_url = self.parsed_url(url)?;
        let mut request = reqwest::Request::new(http::Method::POST, parsed_url.as_ref().clone());
        *request.headers_mut() = headers.clone();
        request.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        *request.body_mut() = Some(reqwest::Body::from(body));
        let headers_deadline = match scope {
            TimeoutScope::WholeExchange => {
                *request.timeout_mut() = self.request_timeout;
                None
            }
            TimeoutScope::UntilHeaders => self.request_timeout,
        };

        let sent = async {
            let execute = self.client.execute(request);
            let result = match headers_deadline {
                Some(limit) => match tokio::time::timeout(limit, execute).await {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(LlmError::Transport(format!(
                            "no response headers within {}s",
                            limit.as_secs()
                        )))
                    }
                },
                None => execute.await,
            };
            result.map_err(|err| LlmError::Transport(describe_reqwest_error(&err)))
        };
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(LlmError::Cancelled),
            sent = sent => sent?,
        };
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = parse_retry_after_delay(response.headers());
        let body = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(LlmError::Cancelled),
            body = response.bytes() => body.unwrap_or_default(),
        };
        let message = upstream_error_message(&body);
        tracing::debug!(status = status.as_u16(), %message, "upstream returned error status");
        Err(LlmError::Upstream {
            status: status.as_u16(),
            message,
            retry_after,
        })
    }
}

/// Adapt a response body into a [`ByteStream`], mapping read failures to
/// [`LlmError::Transport`].
#[must_use]
pub fn byte_stream(response: reqwest::Response) -> ByteStream {
    Box::pin(
        response
            .bytes_stream()
            .map_err(|err| LlmError::Transport(describe_reqwest_error(&err))),
    )
}

/// Read a whole response body.
///
/// # Errors
///
/// Returns [`LlmError::Transport`] on a read failure and
/// [`LlmError::Cancelled`] when `cancel` fires first.
pub async fn read_body(response: reqwest::Response, cancel: &CancellationToken) -> Result<Bytes, LlmError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(LlmError::Cancelled),
        body = response.bytes() => body.map_err(|err| LlmError::Transport(describe_reqwest_error(&err))),
    }
}

/// reqwest's Display hides the root cause; walk the source chain so
/// connection resets stay recognizable.
fn describe_reqwest_error(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Pull a readable message out of a provider error body.
///
/// All supported providers nest it as `error.message`; Anthropic wraps that
/// in `{"type":"error"}` and Gemini adds `error.status`.
pub(crate) fn upstream_error_message(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        let error = value.get("error").unwrap_or(&value);
        let message = error.get("message").and_then(|m| m.as_str());
        let kind = error
            .get("type")
            .or_else(|| error.get("status"))
            .and_then(|t| t.as_str());
        match (kind, message) {
            (Some(kind), Some(message)) => return format!("{kind}: {message}"),
            (None, Some(message)) => return message.to_string(),
            _ => {}
        }
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return "empty error body".to_string();
    }
    text.chars().take(ERROR_BODY_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> HttpTransport {
        HttpTransport::new(&HttpConfig::default()).unwrap()
    }

    #[test]
    fn test_parsed_url_cache_hit() {
        let transport = transport();
        let url = "https://api.example.com/v1/chat/completions";
        let first = transport.parsed_url(url).unwrap();
        let second = transport.parsed_url(url).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(transport.parsed_url_cache.read().len(), 1);
    }

    #[test]
    fn test_parsed_url_cache_is_bounded() {
        let transport = transport();
        for idx in 0..(PARSED_URL_CACHE_MAX_ENTRIES + 32) {
            let url = format!("https://api.example.com/v1beta/models/gemini-{idx}:generateContent");
            let _ = transport.parsed_url(&url).unwrap();
        }
        assert!(transport.parsed_url_cache.read().len() <= PARSED_URL_CACHE_MAX_ENTRIES);
    }

    #[test]
    fn test_parsed_url_invalid() {
        let err = transport().parsed_url("://bad-url").unwrap_err();
        assert!(matches!(err, LlmError::Config(_)));
    }

    #[test]
    fn test_invalid_proxy_is_config_error() {
        let config = HttpConfig {
            proxy: Some("not a proxy".into()),
            ..HttpConfig::default()
        };
        assert!(matches!(HttpTransport::new(&config), Err(LlmError::Config(_))));
    }

    #[test]
    fn test_upstream_error_message_shapes() {
        assert_eq!(
            upstream_error_message(br#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#),
            "overloaded_error: Overloaded"
        );
        assert_eq!(
            upstream_error_message(br#"{"error":{"code":429,"message":"quota","status":"RESOURCE_EXHAUSTED"}}"#),
            "RESOURCE_EXHAUSTED: quota"
        );
        assert_eq!(upstream_error_message(br#"{"error":{"message":"bad key"}}"#), "bad key");
        assert_eq!(upstream_error_message(b"<html>502</html>"), "<html>502</html>");
        assert_eq!(upstream_error_message(b""), "empty error body");
    }
}
