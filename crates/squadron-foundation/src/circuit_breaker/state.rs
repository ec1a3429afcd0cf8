//! Circuit Breaker State Machine
//!
//! - Closed: calls run; consecutive failures are counted
//! - Open: calls are refused without running until the recovery timeout has
//!   elapsed since the last failure
//! - Half-Open: a bounded number of trial calls run; enough successes close
//!   the circuit, any failure reopens it

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use squadron_kernel::{AgentError, EventBus, OrchestratorEvent};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::CircuitBreakerConfig;
use super::metrics::{CircuitBreakerMetrics, StateTransition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Rejected without running the operation
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },

    #[error(transparent)]
    Operation(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            Self::Open { .. } => None,
        }
    }
}

impl From<CircuitBreakerError<AgentError>> for AgentError {
    fn from(err: CircuitBreakerError<AgentError>) -> Self {
        match err {
            CircuitBreakerError::Open { name } => AgentError::BreakerOpen(name),
            CircuitBreakerError::Operation(e) => e,
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    /// Working counters, cleared by the monitor while closed
    pub failures: u32,
    pub successes: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub total_rejected: u64,
    pub success_rate: f64,
    pub failure_rate: f64,
    /// Remaining cooldown while open
    pub retry_in: Option<Duration>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    half_open_calls: u32,
    last_failure_at: Option<Instant>,
}

impl BreakerInner {
    fn cooled_down(&self, timeout: Duration) -> bool {
        match self.last_failure_at {
            Some(at) => at.elapsed() >= timeout,
            None => true,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    metrics: CircuitBreakerMetrics,
    events: Option<EventBus>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let mut config = config;
        config.name = name.into();
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                half_open_calls: 0,
                last_failure_at: None,
            }),
            metrics: CircuitBreakerMetrics::new(),
            events: None,
        }
    }

    pub fn with_default(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Publish `CircuitStateChanged` on every transition.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CircuitBreakerMetrics {
        &self.metrics
    }

    /// Current state. Does not move an expired open circuit to half-open;
    /// only an admitted call does that.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether a call would be admitted right now, without counting it.
    pub fn is_call_permitted(&self) -> bool {
        if !self.config.enabled {
            return true;
        }
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner.cooled_down(self.config.recovery_timeout()),
            CircuitState::HalfOpen => inner.half_open_calls < self.config.half_open_max_calls,
        }
    }

    /// Admit one call, or refuse it.
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open and
    /// admits this call as its first trial.
    pub fn try_acquire(&self) -> Result<(), CircuitBreakerError<std::convert::Infallible>> {
        if !self.config.enabled {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let admitted = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if inner.cooled_down(self.config.recovery_timeout()) {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.half_open_calls = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls < self.config.half_open_max_calls {
                    inner.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        };
        drop(inner);

        if admitted {
            Ok(())
        } else {
            self.metrics.record_rejected();
            debug!(breaker = %self.config.name, "call rejected, circuit open");
            Err(CircuitBreakerError::Open {
                name: self.config.name.clone(),
            })
        }
    }

    pub fn record_success(&self) {
        if !self.config.enabled {
            return;
        }
        self.metrics.record_success();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
                inner.successes = inner.successes.saturating_add(1);
            }
            CircuitState::HalfOpen => {
                inner.successes = inner.successes.saturating_add(1);
                if inner.successes >= self.config.close_threshold() {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            // result of a call admitted before the circuit opened
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        if !self.config.enabled {
            return;
        }
        self.metrics.record_failure();
        let mut inner = self.inner.lock();
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failures = inner.failures.saturating_add(1);
                inner.successes = 0;
                if inner.failures >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.failures = inner.failures.saturating_add(1);
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {
                inner.failures = inner.failures.saturating_add(1);
            }
        }
    }

    /// Run `operation` under the breaker.
    ///
    /// When the circuit refuses the call, `operation` is never invoked.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Err(CircuitBreakerError::Open { name }) = self.try_acquire() {
            return Err(CircuitBreakerError::Open { name });
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitBreakerError::Operation(e))
            }
        }
    }

    /// Force the circuit open, starting a fresh cooldown.
    pub fn open(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure_at = Some(Instant::now());
        self.transition(&mut inner, CircuitState::Open);
        warn!(breaker = %self.config.name, "circuit forced open");
    }

    /// Force the circuit closed.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
        info!(breaker = %self.config.name, "circuit forced closed");
    }

    /// Closed with all working and lifetime counters cleared.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
        inner.last_failure_at = None;
        drop(inner);
        self.metrics.reset();
    }

    /// Clear working counters if the circuit is closed. Returns whether it did.
    pub fn reset_counters_if_closed(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            return false;
        }
        inner.failures = 0;
        inner.successes = 0;
        true
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        let retry_in = match (inner.state, inner.last_failure_at) {
            (CircuitState::Open, Some(at)) => {
                Some(self.config.recovery_timeout().saturating_sub(at.elapsed()))
            }
            _ => None,
        };
        CircuitBreakerStats {
            name: self.config.name.clone(),
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            total_requests: self.metrics.total_requests(),
            total_failures: self.metrics.total_failures(),
            total_successes: self.metrics.total_successes(),
            total_rejected: self.metrics.total_rejected(),
            success_rate: self.metrics.success_rate(),
            failure_rate: self.metrics.failure_rate(),
            retry_in,
        }
    }

    /// Spawn the periodic counter reset. The task ends once the breaker is dropped.
    pub fn spawn_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.monitoring_period().max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(breaker) = weak.upgrade() else {
                    break;
                };
                if breaker.reset_counters_if_closed() {
                    debug!(breaker = %breaker.name(), "counters reset");
                }
            }
        })
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.failures = 0;
        inner.successes = 0;
        inner.half_open_calls = 0;
        if from == to {
            return;
        }
        inner.state = to;
        self.metrics.record_transition(StateTransition::new(from, to));
        match to {
            CircuitState::Open => {
                warn!(breaker = %self.config.name, %from, "circuit opened")
            }
            _ => info!(breaker = %self.config.name, %from, %to, "circuit state changed"),
        }
        if let Some(events) = &self.events {
            events.publish(OrchestratorEvent::CircuitStateChanged {
                name: self.config.name.clone(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
    }
}
