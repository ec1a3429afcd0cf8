//! Orchestrator events
//!
//! Components publish typed [`OrchestratorEvent`] values on an [`EventBus`]
//! handed to them at construction. Subscribers (telemetry forwarders, the
//! manager's auto-recovery loop, tests) each get their own receiver.
//! Publishing with no subscriber attached is not an error.

use crate::agent::types::LifecycleState;
use crate::utils::now_ms;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity; slow receivers observe `Lagged` past this.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Kind of threshold breach raised by metrics collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighProcessingTime,
    HighErrorRate,
    HighErrorCount,
    HighMemoryUsage,
    HighLoad,
    LowUptime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub agent_id: String,
    pub kind: AlertKind,
    pub value: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    AgentRegistered {
        agent_id: String,
        agent_type: String,
    },
    AgentUnregistered {
        agent_id: String,
    },
    StateChanged {
        agent_id: String,
        from: Option<LifecycleState>,
        to: LifecycleState,
        reason: Option<String>,
    },
    AgentError {
        agent_id: String,
        error: String,
    },
    RecoveryFailed {
        agent_id: String,
        attempts: u32,
        error: String,
    },
    Alert(Alert),
    MetricsCollected {
        agents: usize,
        total_selections: u64,
        total_errors: u64,
    },
    CircuitStateChanged {
        name: String,
        from: String,
        to: String,
    },
    AgentSelected {
        agent_id: String,
        agent_type: String,
        strategy: String,
    },
    CandidatesExhausted {
        agent_type: String,
        candidates: usize,
    },
    HealthChecked {
        agent_id: String,
        healthy: bool,
        response_time_ms: u64,
    },
    AgentUnhealthy {
        agent_id: String,
        consecutive_failures: u32,
    },
    AgentHealthy {
        agent_id: String,
        consecutive_successes: u32,
    },
    Routed {
        intent: String,
        agent_type: String,
        priority: String,
        confidence: f64,
    },
    RoutingFailed {
        intent: String,
    },
}

impl OrchestratorEvent {
    /// Agent the event concerns, if any
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Self::AgentRegistered { agent_id, .. }
            | Self::AgentUnregistered { agent_id }
            | Self::StateChanged { agent_id, .. }
            | Self::AgentError { agent_id, .. }
            | Self::RecoveryFailed { agent_id, .. }
            | Self::AgentSelected { agent_id, .. }
            | Self::HealthChecked { agent_id, .. }
            | Self::AgentUnhealthy { agent_id, .. }
            | Self::AgentHealthy { agent_id, .. } => Some(agent_id),
            Self::Alert(alert) => Some(&alert.agent_id),
            Self::CircuitStateChanged { name, .. } => Some(name),
            Self::MetricsCollected { .. }
            | Self::CandidatesExhausted { .. }
            | Self::Routed { .. }
            | Self::RoutingFailed { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::AgentRegistered { .. } => "agent_registered",
            Self::AgentUnregistered { .. } => "agent_unregistered",
            Self::StateChanged { .. } => "state_changed",
            Self::AgentError { .. } => "agent_error",
            Self::RecoveryFailed { .. } => "recovery_failed",
            Self::Alert(_) => "alert",
            Self::MetricsCollected { .. } => "metrics_collected",
            Self::CircuitStateChanged { .. } => "circuit_state_changed",
            Self::AgentSelected { .. } => "agent_selected",
            Self::CandidatesExhausted { .. } => "candidates_exhausted",
            Self::HealthChecked { .. } => "health_checked",
            Self::AgentUnhealthy { .. } => "agent_unhealthy",
            Self::AgentHealthy { .. } => "agent_healthy",
            Self::Routed { .. } => "routed",
            Self::RoutingFailed { .. } => "routing_failed",
        }
    }
}

/// Event with identity and timestamp, as delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    /// Milliseconds since the UNIX epoch
    pub timestamp: u64,
    pub event: OrchestratorEvent,
}

impl EventEnvelope {
    pub fn new(event: OrchestratorEvent) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_ms(),
            event,
        }
    }
}

/// Broadcast channel for orchestrator events
///
/// Cheap to clone; all clones publish to the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Returns the number of receivers it reached.
    pub fn publish(&self, event: OrchestratorEvent) -> usize {
        let kind = event.kind();
        match self.sender.send(EventEnvelope::new(event)) {
            Ok(n) => n,
            Err(_) => {
                trace!(kind, "event dropped, no subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
