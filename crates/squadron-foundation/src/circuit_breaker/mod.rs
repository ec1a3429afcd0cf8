//! Circuit Breaker
//!
//! Three-state failure isolation around any fallible async operation.
//!
//! ```text
//!    +---------+   failure_threshold    +--------+
//!    | CLOSED  | ---------------------> |  OPEN  | <----+
//!    +---------+                        +--------+      |
//!         ^                                 |           |
//!         |                  recovery_timeout, next call|
//!         |                                 v           |
//!         |   success_threshold     +-------------+     |
//!         +------------------------ |  HALF-OPEN  | ----+
//!                                   +-------------+  any failure
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use squadron_foundation::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::sync::Arc;
//!
//! let breaker = Arc::new(CircuitBreaker::new("billing-api", CircuitBreakerConfig::default()));
//! let _monitor = breaker.spawn_monitor();
//!
//! let invoice = breaker.execute(|| fetch_invoice(id)).await?;
//! ```

pub mod config;
pub mod metrics;
pub mod state;

pub use config::CircuitBreakerConfig;
pub use metrics::{CircuitBreakerMetrics, CircuitBreakerMetricsSnapshot, StateTransition};
pub use state::{CircuitBreaker, CircuitBreakerError, CircuitBreakerStats, CircuitState};
