//! Retry with exponential backoff
//!
//! [`RetryPolicy`] re-runs a fallible async operation up to `max_retries`
//! extra times. Whether a failure is worth retrying is decided per error
//! through [`RetryableError`]: an explicit hint wins, otherwise the error
//! message is matched against known transient failures (timeouts, rate
//! limits, connection resets, HTTP 5xx/429/408).

use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use futures::future::try_join_all;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use squadron_kernel::AgentError;
use squadron_kernel::utils::duration_ms;
use tracing::{debug, warn};

/// Message fragments that mark a failure as transient
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "rate limit",
    "too many requests",
    "econnreset",
    "enotfound",
    "econnrefused",
    "etimedout",
    "connection reset",
    "connection refused",
];

static STATUS_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bstatus(?:\s+code)?[\s:=]*(\d{3})\b").expect("status pattern is valid")
});

/// Classification hook for retry eligibility
pub trait RetryableError: std::fmt::Display {
    /// Explicit verdict. `None` falls back to message inspection.
    fn retry_hint(&self) -> Option<bool> {
        None
    }
}

/// Decide whether `error` should be retried.
pub fn is_retryable<E: RetryableError + ?Sized>(error: &E) -> bool {
    error
        .retry_hint()
        .unwrap_or_else(|| is_transient_message(&error.to_string()))
}

/// Message-based classification used when an error carries no hint.
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }
    STATUS_CODE
        .captures(message)
        .and_then(|caps| caps[1].parse::<u16>().ok())
        .is_some_and(|status| status >= 500 || status == 429 || status == 408)
}

impl RetryableError for AgentError {
    fn retry_hint(&self) -> Option<bool> {
        if self.is_caller_error() {
            return Some(false);
        }
        match self {
            AgentError::Timeout { .. } | AgentError::RateLimited { .. } => Some(true),
            AgentError::ExecutionFailed(_) => None,
            _ => Some(false),
        }
    }
}

impl RetryableError for std::io::Error {
    fn retry_hint(&self) -> Option<bool> {
        use std::io::ErrorKind;
        match self.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionAborted
            | ErrorKind::TimedOut
            | ErrorKind::Interrupted => Some(true),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Additional attempts after the first
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Perturb each delay by up to ±10%
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = duration_ms(delay);
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = duration_ms(delay);
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("non-retryable failure after {attempts} attempt(s): {error}")]
    NonRetryable { attempts: u32, error: E },

    #[error("retries exhausted after {attempts} attempts: {error}")]
    Exhausted { attempts: u32, error: E },

    #[error("operation timeout after {timeout_ms}ms")]
    DeadlineExceeded { timeout_ms: u64 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::NonRetryable { attempts, .. } | Self::Exhausted { attempts, .. } => {
                Some(*attempts)
            }
            Self::DeadlineExceeded { .. } => None,
        }
    }

    /// The last operation error, if one was observed
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::NonRetryable { error, .. } | Self::Exhausted { error, .. } => Some(error),
            Self::DeadlineExceeded { .. } => None,
        }
    }
}

/// A deadline expiry is itself transient (HTTP 408 semantics).
impl<E> RetryableError for RetryError<E>
where
    E: std::fmt::Display,
{
    fn retry_hint(&self) -> Option<bool> {
        match self {
            Self::DeadlineExceeded { .. } => Some(true),
            _ => Some(false),
        }
    }
}

impl From<RetryError<AgentError>> for AgentError {
    fn from(err: RetryError<AgentError>) -> Self {
        match err {
            RetryError::NonRetryable { error, .. } => error,
            RetryError::Exhausted { attempts, error } => AgentError::RetriesExhausted {
                attempts,
                last_error: error.to_string(),
            },
            RetryError::DeadlineExceeded { timeout_ms } => AgentError::Timeout {
                duration_ms: timeout_ms,
            },
        }
    }
}

/// Cumulative state reported to progress callbacks after every attempt
#[derive(Debug, Clone, Default)]
pub struct RetryProgress {
    pub attempts: u32,
    pub total_delay: Duration,
    pub last_error: Option<String>,
    pub success: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn update_config(&mut self, config: RetryConfig) {
        self.config = config;
    }

    /// Backoff before retrying after failed attempt `attempt` (0-based):
    /// `min(base * multiplier^attempt, max)`, then jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.config.base_delay_ms as f64 * self.config.backoff_multiplier.powi(exp);
        let mut delay = raw.min(self.config.max_delay_ms as f64);
        if self.config.jitter && delay > 0.0 {
            let factor: f64 = rand::thread_rng().gen_range(-0.1..=0.1);
            delay += delay * factor;
        }
        Duration::from_millis(delay.max(0.0).floor() as u64)
    }

    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError,
    {
        self.execute_with_progress(operation, |_| {}).await
    }

    /// Like [`execute`](Self::execute), invoking `on_progress` after every attempt.
    pub async fn execute_with_progress<F, Fut, T, E, P>(
        &self,
        mut operation: F,
        mut on_progress: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError,
        P: FnMut(&RetryProgress),
    {
        let max_retries = self.config.max_retries;
        let mut progress = RetryProgress::default();
        let mut attempt = 0u32;

        loop {
            progress.attempts = attempt + 1;
            let error = match operation().await {
                Ok(value) => {
                    progress.success = true;
                    on_progress(&progress);
                    if attempt > 0 {
                        debug!(attempts = progress.attempts, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            progress.last_error = Some(error.to_string());
            if !is_retryable(&error) {
                on_progress(&progress);
                debug!(attempt = progress.attempts, %error, "non-retryable failure");
                return Err(RetryError::NonRetryable {
                    attempts: progress.attempts,
                    error,
                });
            }
            if attempt >= max_retries {
                on_progress(&progress);
                warn!(attempts = progress.attempts, %error, "retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts: progress.attempts,
                    error,
                });
            }

            let delay = self.delay_for_attempt(attempt);
            progress.total_delay += delay;
            on_progress(&progress);
            debug!(
                attempt = progress.attempts,
                max_retries,
                delay_ms = duration_ms(delay),
                %error,
                "retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Race the whole retry chain against an absolute deadline.
    pub async fn execute_with_timeout<F, Fut, T, E>(
        &self,
        operation: F,
        timeout: Duration,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError,
    {
        match tokio::time::timeout(timeout, self.execute(operation)).await {
            Ok(result) => result,
            Err(_) => Err(RetryError::DeadlineExceeded {
                timeout_ms: duration_ms(timeout),
            }),
        }
    }

    /// Apply the policy to every operation concurrently.
    ///
    /// Returns all results in input order, or the first unrecoverable failure.
    pub async fn execute_parallel<F, Fut, T, E>(
        &self,
        operations: Vec<F>,
    ) -> Result<Vec<T>, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError,
    {
        try_join_all(operations.into_iter().map(|op| self.execute(op))).await
    }
}
