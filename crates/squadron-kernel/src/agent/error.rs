//! Agent error types
//!
//! Unified error taxonomy for registry, lifecycle, dispatch and routing
//! failures.

use crate::agent::types::LifecycleState;
use std::time::Duration;
use thiserror::Error;

/// Result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Agent error type
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    /// Unknown agent id
    #[error("Agent not found: {0}")]
    NotFound(String),

    /// Known agent that cannot take work right now
    #[error("Agent not available: {agent_id} ({reason})")]
    NotAvailable { agent_id: String, reason: String },

    #[error("Invalid state transition for agent {agent_id}: {from} -> {to}")]
    InvalidTransition {
        agent_id: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    /// Call rejected by an open circuit breaker without being executed
    #[error("Circuit breaker '{0}' is open")]
    BreakerOpen(String),

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Rate limit exceeded ({scope}), retry after {retry_after:?}")]
    RateLimited { scope: String, retry_after: Duration },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("No route available for intent '{0}'")]
    RoutingExhausted(String),

    #[error("Recovery exhausted for agent {agent_id} after {attempts} attempts")]
    RecoveryExhausted { agent_id: String, attempts: u32 },

    #[error("Agent execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AgentError {
    pub fn not_available(agent_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotAvailable {
            agent_id: agent_id.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_transition(
        agent_id: impl Into<String>,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Self {
        Self::InvalidTransition {
            agent_id: agent_id.into(),
            from,
            to,
        }
    }

    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Errors that reflect caller mistakes rather than agent standing.
    ///
    /// These are surfaced as-is and never retried.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::InvalidTransition { .. }
                | Self::RegistrationFailed(_)
                | Self::Config(_)
        )
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Serialization(err.to_string())
    }
}
