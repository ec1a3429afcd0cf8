//! Squadron foundation
//!
//! Policy components for a pool of pluggable agents, and the
//! [`Orchestrator`] that ties them into one submission path.

// circuit breaker module - three-state failure isolation
pub mod circuit_breaker;

// retry module - bounded retry with exponential backoff
pub mod retry;

// rate limiter module - sliding-window admission control
pub mod rate_limiter;

// state machine module - lifecycle transitions and recovery
pub mod state_machine;

// health module - active probing
pub mod health;

// metrics module - counters, alerts, performance score
pub mod metrics;

// load balancer module - per-type strategies behind per-agent breakers
pub mod load_balancer;

// manager module - registry and dispatch
pub mod manager;

// routing module - intent to agent type
pub mod routing;

// config module
pub mod config;

pub mod orchestrator;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerMetrics,
    CircuitBreakerMetricsSnapshot, CircuitBreakerStats, CircuitState, StateTransition,
};
pub use config::OrchestratorConfig;
pub use health::{HealthCheckConfig, HealthCheckResult, HealthChecker, HealthStatus, HealthSummary};
pub use load_balancer::{
    AgentCandidate, LoadBalancer, LoadBalancerConfig, LoadBalancerStats, LoadBalancingStrategy,
};
pub use manager::{AgentInfo, AgentManager, ManagerConfig, ManagerStats};
pub use metrics::{AgentMetrics, AlertThresholds, MetricsCollector, MetricsConfig, SystemMetrics};
pub use orchestrator::{Orchestrator, Submission};
pub use rate_limiter::{RateLimitExceeded, RateLimitScope, RateLimiter, RateLimiterConfig};
pub use retry::{RetryConfig, RetryError, RetryPolicy, RetryableError, is_retryable};
pub use routing::{
    AgentDirectory, AgentRoute, AgentRouter, ConditionOperator, ContextCondition,
    IntentClassification, RouteSource, RoutePriority, RouterConfig, RoutingMetrics, RoutingRule,
};
pub use state_machine::{AgentStateMachine, RecoveryOutcome, StateMachineConfig};

pub use squadron_kernel as kernel;
