//! Orchestrator configuration
//!
//! One serde document covering every component. Every section is optional
//! and falls back to its defaults, so a file only needs the values it
//! changes:
//!
//! ```yaml
//! manager:
//!   default_timeout_ms: 10000
//! router:
//!   fallback_agent_type: general
//!   rules:
//!     - id: expenses
//!       name: Expense tracking
//!       intents: [add_expense]
//!       agent_type: financial
//!       priority: high
//!       min_confidence: 0.7
//! rate_limiter:
//!   requests_per_minute: ${SQUADRON_RPM}
//! ```

use serde::{Deserialize, Serialize};
use squadron_kernel::config::{self, Format};
use squadron_kernel::logging::LoggingConfig;
use squadron_kernel::{AgentError, AgentResult};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::health::HealthCheckConfig;
use crate::load_balancer::LoadBalancerConfig;
use crate::manager::ManagerConfig;
use crate::metrics::MetricsConfig;
use crate::rate_limiter::RateLimiterConfig;
use crate::retry::RetryConfig;
use crate::routing::RouterConfig;
use crate::state_machine::StateMachineConfig;

/// Prefix for environment overrides, e.g. `SQUADRON_MANAGER__AUTO_RECOVERY`
pub const ENV_PREFIX: &str = "SQUADRON";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub manager: ManagerConfig,
    pub load_balancer: LoadBalancerConfig,
    pub state_machine: StateMachineConfig,
    pub health: HealthCheckConfig,
    pub metrics: MetricsConfig,
    pub router: RouterConfig,
    pub retry: RetryConfig,
    pub rate_limiter: RateLimiterConfig,
    /// Breaker guarding calls made outside the load balancer
    pub circuit_breaker: CircuitBreakerConfig,
    pub logging: LoggingConfig,
}

impl OrchestratorConfig {
    /// Load from a YAML, TOML or JSON file.
    pub fn from_file(path: &str) -> AgentResult<Self> {
        let config: Self = config::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, then apply `SQUADRON_*` environment overrides.
    pub fn from_file_with_env(path: &str) -> AgentResult<Self> {
        let config: Self = config::load_with_env(path, ENV_PREFIX)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_str(content: &str, format: Format) -> AgentResult<Self> {
        let config: Self = config::from_str(content, format)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> AgentResult<()> {
        let mut problems = Vec::new();
        if self.manager.default_timeout_ms == 0 {
            problems.push("manager.default_timeout_ms must be positive".to_string());
        }
        if self.health.timeout_ms == 0 {
            problems.push("health.timeout_ms must be positive".to_string());
        }
        if self.health.batch_concurrency == 0 {
            problems.push("health.batch_concurrency must be positive".to_string());
        }
        if self.rate_limiter.window_size_ms == 0 {
            problems.push("rate_limiter.window_size_ms must be positive".to_string());
        }
        if self.retry.backoff_multiplier < 1.0 {
            problems.push("retry.backoff_multiplier must be at least 1".to_string());
        }
        for (prefix, breaker) in [
            ("circuit_breaker", &self.circuit_breaker),
            ("load_balancer.circuit_breaker", &self.load_balancer.circuit_breaker),
        ] {
            problems.extend(breaker.validate().into_iter().map(|p| format!("{prefix}.{p}")));
        }
        for (name, factor) in [
            ("router.domain_confidence_factor", self.router.domain_confidence_factor),
            ("router.suggestion_confidence_factor", self.router.suggestion_confidence_factor),
            ("router.fallback_confidence", self.router.fallback_confidence),
        ] {
            if !(0.0..=1.0).contains(&factor) {
                problems.push(format!("{name} must be between 0 and 1"));
            }
        }
        if self.router.fallback_agent_type.trim().is_empty() {
            problems.push("router.fallback_agent_type must not be empty".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(AgentError::Config(problems.join("; ")))
        }
    }
}
