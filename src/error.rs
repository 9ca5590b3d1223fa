use std::time::Duration;

/// Crate-wide error type returned by encoders, translators, the transport and the retry policy.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Stream error: {0}")]
    Stream(String),
    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<LlmError>,
    },
    #[error("Operation cancelled")]
    Cancelled,
}

/// Broad error category used by callers that surface errors to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Authentication,
    Permission,
    RateLimit,
    ServerError,
    Cancelled,
    Unknown,
}

/// Map an upstream HTTP status code to an error category.
#[must_use]
pub fn category_from_upstream_status(status: u16) -> ErrorCategory {
    match status {
        400 | 404 | 413 | 422 => ErrorCategory::InvalidRequest,
        401 => ErrorCategory::Authentication,
        403 => ErrorCategory::Permission,
        429 => ErrorCategory::RateLimit,
        500..=599 => ErrorCategory::ServerError,
        _ => ErrorCategory::Unknown,
    }
}

/// Whether an upstream status is transient: rate limiting or any server-side failure.
#[inline]
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

impl LlmError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            LlmError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            LlmError::Upstream { status, .. } => category_from_upstream_status(*status),
            LlmError::RetryExhausted { source, .. } => source.category(),
            LlmError::Cancelled => ErrorCategory::Cancelled,
            LlmError::Config(_)
            | LlmError::Transport(_)
            | LlmError::Decode(_)
            | LlmError::Stream(_) => ErrorCategory::ServerError,
        }
    }

    /// Transient failures worth another attempt: 429, 5xx and connection-level errors.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Upstream { status, .. } => is_retryable_status(*status),
            LlmError::Transport(_) => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LlmError::Cancelled)
    }

    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        match self {
            LlmError::Upstream { status, .. } => *status == 429,
            LlmError::RetryExhausted { source, .. } => source.is_rate_limited(),
            _ => false,
        }
    }

    /// Delay hint the provider attached to the failure, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::Upstream { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub(crate) fn decode(context: &str, err: impl std::fmt::Display) -> Self {
        LlmError::Decode(format!("{context}: {err}"))
    }
}
