//! Sliding-window rate limiting
//!
//! One [`RateLimiter`] guards one logical service. Each admission check
//! prunes timestamps that fell out of the window, then rejects when the
//! burst, per-window or per-hour budget is spent, reporting how long until
//! the oldest counted request expires.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use squadron_kernel::AgentError;
use squadron_kernel::utils::duration_ms;
use tokio::time::Instant;
use tracing::{debug, warn};

const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    /// Requests allowed in one window regardless of the per-minute budget
    pub burst_limit: u32,
    pub window_size_ms: u64,
    /// Wait-and-retry cycles `execute_with_retry` performs before giving up
    pub max_wait_cycles: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 1000,
            burst_limit: 10,
            window_size_ms: 60_000,
            max_wait_cycles: 10,
        }
    }
}

impl RateLimiterConfig {
    pub fn window_size(&self) -> Duration {
        Duration::from_millis(self.window_size_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    Burst,
    Minute,
    Hour,
}

impl std::fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitScope::Burst => write!(f, "burst"),
            RateLimitScope::Minute => write!(f, "per-minute"),
            RateLimitScope::Hour => write!(f, "per-hour"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{scope} rate limit of {limit} exceeded, retry after {retry_after:?}")]
pub struct RateLimitExceeded {
    pub scope: RateLimitScope,
    pub limit: u32,
    pub retry_after: Duration,
}

impl From<RateLimitExceeded> for AgentError {
    fn from(err: RateLimitExceeded) -> Self {
        AgentError::RateLimited {
            scope: err.scope.to_string(),
            retry_after: err.retry_after,
        }
    }
}

impl crate::retry::RetryableError for RateLimitExceeded {
    fn retry_hint(&self) -> Option<bool> {
        Some(true)
    }
}

/// Capacity left after an admitted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub requests_in_window: u32,
    pub remaining: u32,
    pub reset_in: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimiterStats {
    pub requests_in_window: u32,
    pub requests_in_hour: u32,
    pub remaining_in_window: u32,
    pub remaining_in_hour: u32,
    pub remaining_burst: u32,
}

#[derive(Debug, Default)]
struct RateWindow {
    window: VecDeque<Instant>,
    hour: VecDeque<Instant>,
}

impl RateWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while self
            .window
            .front()
            .is_some_and(|t| now.duration_since(*t) >= window)
        {
            self.window.pop_front();
        }
        while self
            .hour
            .front()
            .is_some_and(|t| now.duration_since(*t) >= HOUR)
        {
            self.hour.pop_front();
        }
    }
}

fn count(queue: &VecDeque<Instant>) -> u32 {
    u32::try_from(queue.len()).unwrap_or(u32::MAX)
}

fn retry_after(oldest: Option<&Instant>, span: Duration, now: Instant) -> Duration {
    oldest
        .map(|t| span.saturating_sub(now.duration_since(*t)))
        .unwrap_or(Duration::ZERO)
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    requests: Mutex<RateWindow>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            requests: Mutex::new(RateWindow::default()),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Admit one request or report which budget is spent.
    pub fn check_limit(&self) -> Result<RateLimitStatus, RateLimitExceeded> {
        let now = Instant::now();
        let window = self.config.window_size();
        let mut requests = self.requests.lock();
        requests.prune(now, window);

        let in_window = count(&requests.window);
        let exceeded = if in_window >= self.config.burst_limit {
            Some((RateLimitScope::Burst, self.config.burst_limit, window, requests.window.front()))
        } else if in_window >= self.config.requests_per_minute {
            Some((
                RateLimitScope::Minute,
                self.config.requests_per_minute,
                window,
                requests.window.front(),
            ))
        } else if count(&requests.hour) >= self.config.requests_per_hour {
            Some((RateLimitScope::Hour, self.config.requests_per_hour, HOUR, requests.hour.front()))
        } else {
            None
        };

        if let Some((scope, limit, span, oldest)) = exceeded {
            let err = RateLimitExceeded {
                scope,
                limit,
                retry_after: retry_after(oldest, span, now),
            };
            debug!(%scope, limit, retry_after_ms = duration_ms(err.retry_after), "rate limited");
            return Err(err);
        }

        requests.window.push_back(now);
        requests.hour.push_back(now);
        let requests_in_window = in_window + 1;
        Ok(RateLimitStatus {
            requests_in_window,
            remaining: self.config.requests_per_minute.saturating_sub(requests_in_window),
            reset_in: retry_after(requests.window.front(), window, now),
        })
    }

    /// Sleep until a request is admitted.
    pub async fn wait_for_limit(&self) -> RateLimitStatus {
        loop {
            match self.check_limit() {
                Ok(status) => return status,
                Err(err) => {
                    tokio::time::sleep(err.retry_after.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    /// Run `operation` if admitted; a rejection converts into the caller's error type.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<RateLimitExceeded>,
    {
        self.check_limit()?;
        operation().await
    }

    /// Like [`execute`](Self::execute), waiting out rejections up to
    /// `max_wait_cycles` times.
    pub async fn execute_with_retry<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<RateLimitExceeded>,
    {
        let mut cycles = 0u32;
        loop {
            match self.check_limit() {
                Ok(_) => return operation().await,
                Err(err) if cycles < self.config.max_wait_cycles => {
                    cycles += 1;
                    tokio::time::sleep(err.retry_after.max(Duration::from_millis(1))).await;
                }
                Err(err) => {
                    warn!(cycles, %err, "rate limit wait cycles exhausted");
                    return Err(err.into());
                }
            }
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        let mut requests = self.requests.lock();
        requests.prune(Instant::now(), self.config.window_size());
        let in_window = count(&requests.window);
        let in_hour = count(&requests.hour);
        RateLimiterStats {
            requests_in_window: in_window,
            requests_in_hour: in_hour,
            remaining_in_window: self.config.requests_per_minute.saturating_sub(in_window),
            remaining_in_hour: self.config.requests_per_hour.saturating_sub(in_hour),
            remaining_burst: self.config.burst_limit.saturating_sub(in_window),
        }
    }

    pub fn reset(&self) {
        let mut requests = self.requests.lock();
        requests.window.clear();
        requests.hour.clear();
    }
}
