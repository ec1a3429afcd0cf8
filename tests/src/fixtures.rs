use anyhow::Result;
use squadron_foundation::OrchestratorConfig;
use squadron_foundation::manager::AgentManager;
use squadron_kernel::logging::{LoggingConfig, init_logging};
use squadron_kernel::{AgentMetadata, EventEnvelope};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;

use crate::agent::MockAgent;

/// Install a debug-level subscriber once; later calls are no-ops.
pub fn init_test_logging() {
    let _ = init_logging(&LoggingConfig {
        default_directive: "debug".to_string(),
        json: false,
    });
}

/// Defaults shrunk to test-friendly timings, with jitter off.
pub fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.manager.default_timeout_ms = 1000;
    config.manager.restart_cooldown_ms = 10;
    config.manager.health_check_interval_ms = 1000;
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 100;
    config.retry.jitter = false;
    config.state_machine.recovery_delay_ms = 100;
    config.state_machine.recovery_timeout_ms = 1000;
    config.health.timeout_ms = 500;
    config.health.retries = 0;
    config.load_balancer.circuit_breaker.failure_threshold = 3;
    config.load_balancer.circuit_breaker.recovery_timeout_ms = 1000;
    config.load_balancer.circuit_breaker.success_threshold = 1;
    config
}

/// Register a default [`MockAgent`] and hand back a handle to script it.
pub async fn register_mock(
    manager: &AgentManager,
    agent_id: &str,
    agent_type: &str,
) -> Result<Arc<MockAgent>> {
    let agent = Arc::new(MockAgent::new(agent_id));
    manager
        .register_agent(agent.clone(), AgentMetadata::new(agent_id, agent_type))
        .await?;
    Ok(agent)
}

/// Captures orchestrator events for assertions.
pub struct EventLog {
    receiver: broadcast::Receiver<EventEnvelope>,
    seen: Vec<EventEnvelope>,
}

impl EventLog {
    pub fn new(receiver: broadcast::Receiver<EventEnvelope>) -> Self {
        Self {
            receiver,
            seen: Vec::new(),
        }
    }

    fn drain(&mut self) {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) => self.seen.push(envelope),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    pub fn events(&mut self) -> &[EventEnvelope] {
        self.drain();
        &self.seen
    }

    pub fn kinds(&mut self) -> Vec<&'static str> {
        self.drain();
        self.seen.iter().map(|e| e.event.kind()).collect()
    }

    pub fn count(&mut self, kind: &str) -> usize {
        self.drain();
        self.seen.iter().filter(|e| e.event.kind() == kind).count()
    }

    /// Wait until an event of `kind` arrives or `timeout` passes.
    pub async fn wait_for(&mut self, kind: &str, timeout: Duration) -> Option<EventEnvelope> {
        self.drain();
        if let Some(found) = self.seen.iter().find(|e| e.event.kind() == kind) {
            return Some(found.clone());
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let envelope = match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                Ok(Ok(envelope)) => envelope,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
            };
            self.seen.push(envelope.clone());
            if envelope.event.kind() == kind {
                return Some(envelope);
            }
        }
    }

    pub fn clear(&mut self) {
        self.drain();
        self.seen.clear();
    }
}
