//! Circuit Breaker Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Name used in logs, errors and events
    pub name: String,
    /// Consecutive failures (while closed) that open the circuit
    pub failure_threshold: u32,
    /// Successes needed in half-open to close the circuit
    pub success_threshold: u32,
    /// Time since the last failure before an open circuit admits a trial call
    pub recovery_timeout_ms: u64,
    /// Period of the counter reset performed while closed
    pub monitoring_period_ms: u64,
    /// Trial calls admitted while half-open
    pub half_open_max_calls: u32,
    /// A disabled breaker admits everything and records nothing
    pub enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout_ms: 60_000,
            monitoring_period_ms: 10_000,
            half_open_max_calls: 3,
            enabled: true,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Also raises `half_open_max_calls` so enough trial calls are admitted
    /// to reach the threshold.
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self.half_open_max_calls = self.half_open_max_calls.max(self.success_threshold);
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout_ms = squadron_kernel::utils::duration_ms(timeout);
        self
    }

    pub fn with_monitoring_period(mut self, period: Duration) -> Self {
        self.monitoring_period_ms = squadron_kernel::utils::duration_ms(period);
        self
    }

    /// Also lowers `success_threshold` when it exceeds the new cap.
    pub fn with_half_open_max_calls(mut self, max: u32) -> Self {
        self.half_open_max_calls = max.max(1);
        self.success_threshold = self.success_threshold.min(self.half_open_max_calls);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Half-open successes that close the circuit. Capped at the trial
    /// calls half-open admits, so a half-open circuit can always close.
    pub fn close_threshold(&self) -> u32 {
        self.success_threshold.min(self.half_open_max_calls).max(1)
    }

    /// Problems with this configuration, empty when usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.failure_threshold == 0 {
            problems.push("failure_threshold must be positive".to_string());
        }
        if self.success_threshold == 0 {
            problems.push("success_threshold must be positive".to_string());
        }
        if self.half_open_max_calls == 0 {
            problems.push("half_open_max_calls must be positive".to_string());
        }
        if self.success_threshold > self.half_open_max_calls {
            problems.push(format!(
                "success_threshold ({}) must not exceed half_open_max_calls ({})",
                self.success_threshold, self.half_open_max_calls
            ));
        }
        problems
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn monitoring_period(&self) -> Duration {
        Duration::from_millis(self.monitoring_period_ms)
    }

    /// Opens quickly, closes after two clean trial calls
    pub fn strict() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout_ms: 10_000,
            half_open_max_calls: 2,
            ..Default::default()
        }
    }

    /// Tolerates long failure streaks
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 5,
            recovery_timeout_ms: 60_000,
            half_open_max_calls: 5,
            ..Default::default()
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}
