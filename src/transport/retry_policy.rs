use std::future::Future;
use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::LlmError;

pub(crate) const RETRY_MAX_ATTEMPTS: u32 = 6;
pub(crate) const RETRY_BACKOFF_BASE_MS: u64 = 500;
pub(crate) const RETRY_BACKOFF_MAX_MS: u64 = 30_000;
const RETRY_TRANSPORT_FAST_SECOND_MS: u64 = 10;
/// Jitter is at most this fraction (1/n) of the computed delay.
const JITTER_DIVISOR: u64 = 10;

/// Bounded exponential backoff around one fallible async operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(RETRY_BACKOFF_BASE_MS),
            max_delay: Duration::from_millis(RETRY_BACKOFF_MAX_MS),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// A policy that makes exactly one attempt.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// `base * 2^attempt`, capped at `max_delay`.
    #[inline]
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let multiplier = 1_u32 << attempt.min(16);
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }

    /// Delay to wait after failed attempt `attempt` (zero-based) before the next one.
    #[must_use]
    pub fn delay_for(&self, err: &LlmError, attempt: u32) -> Duration {
        let base = match (err.retry_after(), err) {
            (Some(hint), _) => hint.min(self.max_delay),
            (None, LlmError::Transport(message)) if has_fast_retry_transport_signature(message) => {
                retry_transport_fast_delay(attempt)
            }
            (None, _) => self.backoff_delay(attempt),
        };
        self.with_jitter(base)
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        let spread = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX) / JITTER_DIVISOR;
        if spread == 0 {
            return delay;
        }
        let jitter = Duration::from_millis(fastrand::u64(0..=spread));
        delay.saturating_add(jitter).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails terminally, or attempts run out.
    ///
    /// `op` receives the zero-based attempt number. Both the attempt and the
    /// backoff sleep race `cancel`.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error unchanged,
    /// [`LlmError::RetryExhausted`] once `max_attempts` retryable failures
    /// have been seen, or [`LlmError::Cancelled`].
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, LlmError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0_u32;
        loop {
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(LlmError::Cancelled),
                result = op(attempt) => result,
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => err,
            };

            let completed = attempt + 1;
            if completed >= max_attempts {
                tracing::debug!(attempts = completed, error = %err, "retry budget exhausted");
                return Err(LlmError::RetryExhausted {
                    attempts: completed,
                    source: Box::new(err),
                });
            }

            let delay = self.delay_for(&err, attempt);
            if err.is_rate_limited() {
                tracing::warn!(
                    attempt = completed,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "upstream rate limited; backing off"
                );
            } else {
                tracing::debug!(
                    attempt = completed,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "retrying after transient failure"
                );
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(LlmError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
            attempt = completed;
        }
    }
}

#[inline]
fn retry_transport_fast_delay(attempt: u32) -> Duration {
    if attempt == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(RETRY_TRANSPORT_FAST_SECOND_MS)
    }
}

/// Dropped pooled connections are retried almost immediately.
#[inline]
fn has_fast_retry_transport_signature(message: &str) -> bool {
    const FAST_RETRY_NEEDLES: [&[u8]; 6] = [
        b"connection reset",
        b"connection aborted",
        b"broken pipe",
        b"http2 error",
        b"unexpected eof",
        b"stream closed",
    ];
    let haystack = message.as_bytes();
    FAST_RETRY_NEEDLES
        .iter()
        .any(|needle| contains_ascii_case_insensitive(haystack, needle))
}

#[inline]
fn contains_ascii_case_insensitive(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| {
        window
            .iter()
            .zip(needle.iter())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    })
}

/// Parse `Retry-After` as delta-seconds or an HTTP-date. The policy applies its own cap.
#[inline]
pub(crate) fn parse_retry_after_delay(headers: &http::HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let target = httpdate::parse_http_date(raw).ok()?;
    Some(target.duration_since(SystemTime::now()).unwrap_or_default())
}
