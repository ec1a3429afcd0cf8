//! Agent lifecycle state machine
//!
//! Single owner of every agent's [`LifecycleState`]. Transitions are checked
//! against [`LifecycleState::can_transition_to`]; each accepted move is
//! appended to a bounded per-agent history and published as a
//! `StateChanged` event. Entering `error` additionally publishes an
//! `AgentError` event, which is what the manager's auto-recovery listens to.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use squadron_kernel::utils::now_ms;
use squadron_kernel::{AgentError, AgentResult, EventBus, LifecycleState, OrchestratorEvent};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateMachineConfig {
    pub max_recovery_attempts: u32,
    /// Pause before a recovery attempt starts
    pub recovery_delay_ms: u64,
    /// Upper bound on the recovery work itself
    pub recovery_timeout_ms: u64,
    pub state_history_size: usize,
    /// Require unknown ids to enter through `initializing`
    pub strict_new_agents: bool,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            max_recovery_attempts: 3,
            recovery_delay_ms: 5000,
            recovery_timeout_ms: 30_000,
            state_history_size: 50,
            strict_new_agents: false,
        }
    }
}

impl StateMachineConfig {
    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransitionRecord {
    /// `None` for the first state of a new id
    pub from: Option<LifecycleState>,
    pub to: LifecycleState,
    pub timestamp_ms: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Recovered,
    /// Nothing to do; carries the state the agent was in
    NotInError(Option<LifecycleState>),
    /// Another recovery for the same agent is running
    InProgress,
    /// Attempt failed; the agent is back in `error`
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct StateMachineStats {
    /// Agents not yet shut down
    pub total_agents: usize,
    pub by_state: HashMap<LifecycleState, usize>,
    pub recovery_attempts: HashMap<String, u32>,
    pub total_transitions: usize,
}

#[derive(Debug, Clone)]
struct AgentLifecycle {
    state: LifecycleState,
    recovery_attempts: u32,
    recovering: bool,
}

impl AgentLifecycle {
    fn new(state: LifecycleState) -> Self {
        Self {
            state,
            recovery_attempts: 0,
            recovering: false,
        }
    }
}

pub struct AgentStateMachine {
    config: StateMachineConfig,
    agents: DashMap<String, AgentLifecycle>,
    history: DashMap<String, VecDeque<StateTransitionRecord>>,
    events: EventBus,
}

impl AgentStateMachine {
    pub fn new(config: StateMachineConfig, events: EventBus) -> Self {
        Self {
            config,
            agents: DashMap::new(),
            history: DashMap::new(),
            events,
        }
    }

    pub fn config(&self) -> &StateMachineConfig {
        &self.config
    }

    /// Move `agent_id` to `state`.
    ///
    /// Setting the current state again is a no-op. An id seen for the first
    /// time is placed directly in `state` unless `strict_new_agents` is set.
    pub fn set_state(
        &self,
        agent_id: &str,
        state: LifecycleState,
        reason: Option<&str>,
    ) -> AgentResult<()> {
        let from = match self.agents.entry(agent_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let lifecycle = occupied.get_mut();
                let current = lifecycle.state;
                if current == state {
                    return Ok(());
                }
                if !current.can_transition_to(state) {
                    return Err(AgentError::invalid_transition(agent_id, current, state));
                }
                lifecycle.state = state;
                match state {
                    LifecycleState::Active => lifecycle.recovery_attempts = 0,
                    LifecycleState::Shutdown => {
                        lifecycle.recovery_attempts = 0;
                        lifecycle.recovering = false;
                    }
                    _ => {}
                }
                Some(current)
            }
            Entry::Vacant(vacant) => {
                if state != LifecycleState::Initializing {
                    if self.config.strict_new_agents {
                        return Err(AgentError::RegistrationFailed(format!(
                            "agent {agent_id} must enter through initializing, not {state}"
                        )));
                    }
                    warn!(%agent_id, %state, "new agent placed directly in state without transition check");
                }
                vacant.insert(AgentLifecycle::new(state));
                None
            }
        };

        let reason = reason.unwrap_or("manual state change").to_string();
        self.record(agent_id, from, state, reason.clone());

        match from {
            Some(from) => info!(%agent_id, %from, to = %state, %reason, "agent state changed"),
            None => debug!(%agent_id, to = %state, "agent state initialised"),
        }
        self.events.publish(OrchestratorEvent::StateChanged {
            agent_id: agent_id.to_string(),
            from,
            to: state,
            reason: Some(reason.clone()),
        });
        if state == LifecycleState::Error {
            self.events.publish(OrchestratorEvent::AgentError {
                agent_id: agent_id.to_string(),
                error: reason,
            });
        }
        Ok(())
    }

    pub fn get_state(&self, agent_id: &str) -> Option<LifecycleState> {
        self.agents.get(agent_id).map(|l| l.state)
    }

    pub fn is_active(&self, agent_id: &str) -> bool {
        self.get_state(agent_id) == Some(LifecycleState::Active)
    }

    pub fn get_agents_in_state(&self, state: LifecycleState) -> Vec<String> {
        let mut ids: Vec<String> = self
            .agents
            .iter()
            .filter(|e| e.value().state == state)
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn get_state_history(&self, agent_id: &str) -> Vec<StateTransitionRecord> {
        self.history
            .get(agent_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn recovery_attempts(&self, agent_id: &str) -> u32 {
        self.agents
            .get(agent_id)
            .map(|l| l.recovery_attempts)
            .unwrap_or(0)
    }

    pub fn increment_recovery_attempts(&self, agent_id: &str) -> u32 {
        match self.agents.get_mut(agent_id) {
            Some(mut lifecycle) => {
                lifecycle.recovery_attempts = lifecycle.recovery_attempts.saturating_add(1);
                lifecycle.recovery_attempts
            }
            None => 0,
        }
    }

    pub fn reset_recovery_attempts(&self, agent_id: &str) {
        if let Some(mut lifecycle) = self.agents.get_mut(agent_id) {
            lifecycle.recovery_attempts = 0;
        }
    }

    pub fn can_recover(&self, agent_id: &str) -> bool {
        self.recovery_attempts(agent_id) < self.config.max_recovery_attempts
    }

    /// Drive an agent in `error` back to `active`.
    ///
    /// Waits `recovery_delay`, enters `recovering`, runs `recovery` under
    /// `recovery_timeout`, then enters `active`. A failed attempt counts
    /// against `max_recovery_attempts` and returns the agent to `error`.
    /// Once the cap is reached the call fails with `RecoveryExhausted`.
    pub async fn recover_agent<F, Fut>(
        &self,
        agent_id: &str,
        recovery: F,
    ) -> AgentResult<RecoveryOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AgentResult<()>>,
    {
        {
            let Some(mut lifecycle) = self.agents.get_mut(agent_id) else {
                return Ok(RecoveryOutcome::NotInError(None));
            };
            if lifecycle.recovery_attempts >= self.config.max_recovery_attempts {
                let attempts = lifecycle.recovery_attempts;
                drop(lifecycle);
                warn!(%agent_id, attempts, "recovery attempts exhausted");
                self.events.publish(OrchestratorEvent::RecoveryFailed {
                    agent_id: agent_id.to_string(),
                    attempts,
                    error: "max recovery attempts reached".to_string(),
                });
                return Err(AgentError::RecoveryExhausted {
                    agent_id: agent_id.to_string(),
                    attempts,
                });
            }
            if lifecycle.state != LifecycleState::Error {
                return Ok(RecoveryOutcome::NotInError(Some(lifecycle.state)));
            }
            if lifecycle.recovering {
                return Ok(RecoveryOutcome::InProgress);
            }
            lifecycle.recovering = true;
        }

        let result = self.run_recovery(agent_id, recovery).await;

        if let Some(mut lifecycle) = self.agents.get_mut(agent_id) {
            lifecycle.recovering = false;
        }

        match result {
            Ok(()) => {
                info!(%agent_id, "agent recovered");
                Ok(RecoveryOutcome::Recovered)
            }
            Err(err) => {
                let attempts = self.increment_recovery_attempts(agent_id);
                let message = err.to_string();
                warn!(%agent_id, attempts, error = %message, "recovery attempt failed");
                if self.get_state(agent_id) == Some(LifecycleState::Recovering) {
                    self.set_state(
                        agent_id,
                        LifecycleState::Error,
                        Some(&format!("recovery failed: {message}")),
                    )?;
                }
                self.events.publish(OrchestratorEvent::RecoveryFailed {
                    agent_id: agent_id.to_string(),
                    attempts,
                    error: message.clone(),
                });
                Ok(RecoveryOutcome::Failed(message))
            }
        }
    }

    async fn run_recovery<F, Fut>(&self, agent_id: &str, recovery: F) -> AgentResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AgentResult<()>>,
    {
        tokio::time::sleep(self.config.recovery_delay()).await;
        self.set_state(agent_id, LifecycleState::Recovering, Some("recovery attempt"))?;

        let timeout = self.config.recovery_timeout();
        match tokio::time::timeout(timeout, recovery()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(AgentError::timeout(timeout)),
        }

        self.set_state(agent_id, LifecycleState::Active, Some("recovery successful"))?;
        self.reset_recovery_attempts(agent_id);
        Ok(())
    }

    /// Move to `shutdown`. The id is kept as a terminal marker so it cannot
    /// be silently revived; its history is retained.
    pub fn shutdown_agent(&self, agent_id: &str) -> AgentResult<()> {
        match self.get_state(agent_id) {
            Some(LifecycleState::Shutdown) => Ok(()),
            Some(_) => self.set_state(agent_id, LifecycleState::Shutdown, Some("shutdown requested")),
            None => Err(AgentError::NotFound(agent_id.to_string())),
        }
    }

    /// Forget the agent entirely, history included.
    pub fn remove_agent(&self, agent_id: &str) -> bool {
        let existed = self.agents.remove(agent_id).is_some();
        self.history.remove(agent_id);
        existed
    }

    pub fn stats(&self) -> StateMachineStats {
        let mut by_state: HashMap<LifecycleState, usize> =
            LifecycleState::ALL.into_iter().map(|s| (s, 0)).collect();
        let mut recovery_attempts = HashMap::new();
        for entry in self.agents.iter() {
            *by_state.entry(entry.state).or_insert(0) += 1;
            if entry.recovery_attempts > 0 {
                recovery_attempts.insert(entry.key().clone(), entry.recovery_attempts);
            }
        }
        let total_agents = self.agents.len() - by_state[&LifecycleState::Shutdown];
        let total_transitions = self.history.iter().map(|h| h.len()).sum();
        StateMachineStats {
            total_agents,
            by_state,
            recovery_attempts,
            total_transitions,
        }
    }

    fn record(
        &self,
        agent_id: &str,
        from: Option<LifecycleState>,
        to: LifecycleState,
        reason: String,
    ) {
        let cap = self.config.state_history_size.max(1);
        let mut history = self.history.entry(agent_id.to_string()).or_default();
        if history.len() >= cap {
            history.pop_front();
        }
        history.push_back(StateTransitionRecord {
            from,
            to,
            timestamp_ms: now_ms(),
            reason,
        });
    }
}
