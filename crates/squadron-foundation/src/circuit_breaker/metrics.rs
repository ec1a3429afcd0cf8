//! Circuit Breaker Metrics
//!
//! Lifetime counters and a bounded log of state transitions. Unlike the
//! breaker's working counters these are never cleared by the periodic
//! monitor, only by an explicit [`CircuitBreakerMetrics::reset`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use squadron_kernel::utils::now_ms;

use super::state::CircuitState;

const TRANSITION_HISTORY: usize = 100;

/// State transition event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from_state: CircuitState,
    pub to_state: CircuitState,
    /// Milliseconds since Unix epoch
    pub timestamp_ms: u64,
}

impl StateTransition {
    pub fn new(from_state: CircuitState, to_state: CircuitState) -> Self {
        Self {
            from_state,
            to_state,
            timestamp_ms: now_ms(),
        }
    }
}

#[derive(Debug, Default)]
pub struct CircuitBreakerMetrics {
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    /// Calls refused without running the operation
    total_rejected: AtomicU64,
    total_transitions: AtomicU64,
    last_opened_ms: AtomicU64,
    last_closed_ms: AtomicU64,
    transitions: RwLock<VecDeque<StateTransition>>,
}

impl CircuitBreakerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.total_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transition(&self, transition: StateTransition) {
        self.total_transitions.fetch_add(1, Ordering::Relaxed);
        match transition.to_state {
            CircuitState::Open => self
                .last_opened_ms
                .store(transition.timestamp_ms, Ordering::Relaxed),
            CircuitState::Closed => self
                .last_closed_ms
                .store(transition.timestamp_ms, Ordering::Relaxed),
            CircuitState::HalfOpen => {}
        }

        let mut transitions = self.transitions.write();
        if transitions.len() == TRANSITION_HISTORY {
            transitions.pop_front();
        }
        transitions.push_back(transition);
    }

    pub fn total_successes(&self) -> u64 {
        self.total_successes.load(Ordering::Relaxed)
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    pub fn total_rejected(&self) -> u64 {
        self.total_rejected.load(Ordering::Relaxed)
    }

    pub fn total_transitions(&self) -> u64 {
        self.total_transitions.load(Ordering::Relaxed)
    }

    /// Executed calls (success + failure); rejections are not requests served
    pub fn total_requests(&self) -> u64 {
        self.total_successes() + self.total_failures()
    }

    /// Failure rate as a fraction in `[0, 1]`
    pub fn failure_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 0.0;
        }
        self.total_failures() as f64 / total as f64
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 0.0;
        }
        self.total_successes() as f64 / total as f64
    }

    pub fn transitions(&self) -> Vec<StateTransition> {
        self.transitions.read().iter().cloned().collect()
    }

    pub fn recent_transitions(&self, n: usize) -> Vec<StateTransition> {
        let transitions = self.transitions.read();
        let skip = transitions.len().saturating_sub(n);
        transitions.iter().skip(skip).cloned().collect()
    }

    pub fn reset(&self) {
        self.total_successes.store(0, Ordering::Relaxed);
        self.total_failures.store(0, Ordering::Relaxed);
        self.total_rejected.store(0, Ordering::Relaxed);
        self.total_transitions.store(0, Ordering::Relaxed);
        self.last_opened_ms.store(0, Ordering::Relaxed);
        self.last_closed_ms.store(0, Ordering::Relaxed);
        self.transitions.write().clear();
    }

    pub fn snapshot(&self) -> CircuitBreakerMetricsSnapshot {
        let opt = |v: u64| if v == 0 { None } else { Some(v) };
        CircuitBreakerMetricsSnapshot {
            total_successes: self.total_successes(),
            total_failures: self.total_failures(),
            total_rejected: self.total_rejected(),
            total_requests: self.total_requests(),
            failure_rate: self.failure_rate(),
            success_rate: self.success_rate(),
            total_transitions: self.total_transitions(),
            last_opened_ms: opt(self.last_opened_ms.load(Ordering::Relaxed)),
            last_closed_ms: opt(self.last_closed_ms.load(Ordering::Relaxed)),
        }
    }
}

/// Serializable metrics for monitoring/display
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetricsSnapshot {
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejected: u64,
    pub total_requests: u64,
    pub failure_rate: f64,
    pub success_rate: f64,
    pub total_transitions: u64,
    pub last_opened_ms: Option<u64>,
    pub last_closed_ms: Option<u64>,
}

impl std::fmt::Display for CircuitBreakerMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Circuit Breaker Metrics:")?;
        writeln!(f, "  Total Requests: {}", self.total_requests)?;
        writeln!(f, "  Successes: {}", self.total_successes)?;
        writeln!(f, "  Failures: {}", self.total_failures)?;
        writeln!(f, "  Rejected: {}", self.total_rejected)?;
        writeln!(f, "  Success Rate: {:.2}%", self.success_rate * 100.0)?;
        writeln!(f, "  Failure Rate: {:.2}%", self.failure_rate * 100.0)?;
        writeln!(f, "  Total State Transitions: {}", self.total_transitions)
    }
}
