//! Agent registry and dispatch
//!
//! [`AgentManager`] owns the registry of agent handles and wires the policy
//! components together: selection goes through the [`LoadBalancer`],
//! lifecycle moves through the [`AgentStateMachine`], performance counters
//! through the [`MetricsCollector`] and probes through the
//! [`HealthChecker`]. Each component stays the single owner of its state;
//! the manager only calls their public operations.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use squadron_kernel::agent::types::compare_versions;
use squadron_kernel::utils::duration_ms;
use squadron_kernel::{
    AgentError, AgentInput, AgentMetadata, AgentRequirements, AgentResult, EventBus, EventEnvelope,
    IdArena, LifecycleState, OrchestratorEvent, SquadAgent,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::CircuitState;
use crate::config::OrchestratorConfig;
use crate::health::{HealthChecker, HealthStatus};
use crate::load_balancer::{AgentCandidate, LoadBalancer, LoadBalancerStats};
use crate::metrics::MetricsCollector;
use crate::routing::AgentDirectory;
use crate::state_machine::{AgentStateMachine, RecoveryOutcome};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub health_check_interval_ms: u64,
    /// Dispatch timeout for agents that do not set their own
    pub default_timeout_ms: u64,
    /// Pause between shutdown and re-initialisation in `restart_agent`
    pub restart_cooldown_ms: u64,
    /// Master switch for event-driven recovery
    pub auto_recovery: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 30_000,
            default_timeout_ms: 30_000,
            restart_cooldown_ms: 5000,
            auto_recovery: true,
        }
    }
}

impl ManagerConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_millis(self.restart_cooldown_ms)
    }
}

struct AgentRecord {
    handle: Arc<dyn SquadAgent>,
    metadata: AgentMetadata,
    registered_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    active_connections: u32,
    consecutive_failures: u32,
}

/// Read-only view of a registered agent
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub id: String,
    pub agent_type: String,
    pub metadata: AgentMetadata,
    pub state: Option<LifecycleState>,
    pub health: HealthStatus,
    pub circuit: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub active_connections: u32,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub total_agents: usize,
    pub active_agents: usize,
    pub agents_by_type: HashMap<String, usize>,
    pub capabilities: Vec<String>,
    pub states: HashMap<LifecycleState, usize>,
    pub load_balancer: LoadBalancerStats,
}

/// Decrements the connection count when a dispatch ends, however it ends.
struct ConnectionGuard<'a> {
    manager: &'a AgentManager,
    agent_id: &'a str,
}

impl<'a> ConnectionGuard<'a> {
    fn open(manager: &'a AgentManager, agent_id: &'a str) -> Self {
        manager.adjust_connections(agent_id, 1);
        Self { manager, agent_id }
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.manager.adjust_connections(self.agent_id, -1);
    }
}

pub struct AgentManager {
    config: ManagerConfig,
    registry: RwLock<IdArena<AgentRecord>>,
    load_balancer: LoadBalancer,
    state_machine: AgentStateMachine,
    health: Arc<HealthChecker>,
    metrics: Arc<MetricsCollector>,
    events: EventBus,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentManager {
    pub fn new(config: &OrchestratorConfig, events: EventBus) -> Self {
        let load_balancer = LoadBalancer::new(config.load_balancer.clone(), events.clone());
        Self::with_load_balancer(config, events, load_balancer)
    }

    /// Use a prepared balancer, e.g. one seeded for reproducible draws.
    pub fn with_load_balancer(
        config: &OrchestratorConfig,
        events: EventBus,
        load_balancer: LoadBalancer,
    ) -> Self {
        Self {
            config: config.manager.clone(),
            registry: RwLock::new(IdArena::new()),
            load_balancer,
            state_machine: AgentStateMachine::new(config.state_machine.clone(), events.clone()),
            health: Arc::new(HealthChecker::new(config.health.clone(), events.clone())),
            metrics: Arc::new(MetricsCollector::new(config.metrics.clone(), events.clone())),
            events,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.load_balancer
    }

    pub fn state_machine(&self) -> &AgentStateMachine {
        &self.state_machine
    }

    pub fn health(&self) -> &HealthChecker {
        &self.health
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register and initialise an agent, leaving it `active`.
    ///
    /// Fails with `RegistrationFailed` when the id or type is blank, the id
    /// is taken, a dependency type has no active agent, or `initialize`
    /// fails. A failed registration leaves no trace in any component.
    pub async fn register_agent(
        &self,
        handle: Arc<dyn SquadAgent>,
        metadata: AgentMetadata,
    ) -> AgentResult<()> {
        if metadata.id.trim().is_empty() {
            return Err(AgentError::RegistrationFailed("agent id is required".into()));
        }
        if metadata.agent_type.trim().is_empty() {
            return Err(AgentError::RegistrationFailed(format!(
                "agent {} has no type",
                metadata.id
            )));
        }
        for dependency in &metadata.dependencies {
            if !self.has_available_agent(dependency) {
                return Err(AgentError::RegistrationFailed(format!(
                    "agent {} depends on unavailable type {dependency}",
                    metadata.id
                )));
            }
        }

        let agent_id = metadata.id.clone();
        let agent_type = metadata.agent_type.clone();
        let now = Utc::now();
        let record = AgentRecord {
            handle: Arc::clone(&handle),
            metadata: metadata.clone(),
            registered_at: now,
            last_heartbeat: now,
            active_connections: 0,
            consecutive_failures: 0,
        };
        if self.registry.write().insert(agent_id.as_str(), record).is_err() {
            return Err(AgentError::RegistrationFailed(format!(
                "agent {agent_id} is already registered"
            )));
        }

        if let Err(err) = self.bring_up(&agent_id, &metadata, handle.as_ref()).await {
            self.registry.write().remove(&agent_id);
            self.state_machine.remove_agent(&agent_id);
            self.load_balancer.remove_agent(&agent_id);
            self.metrics.remove_agent(&agent_id);
            self.health.remove_agent(&agent_id);
            error!(%agent_id, error = %err, "agent registration failed");
            return Err(match err {
                AgentError::RegistrationFailed(_) => err,
                other => AgentError::RegistrationFailed(format!("agent {agent_id}: {other}")),
            });
        }

        info!(%agent_id, %agent_type, version = %metadata.version, "agent registered");
        self.events.publish(OrchestratorEvent::AgentRegistered {
            agent_id,
            agent_type,
        });
        Ok(())
    }

    async fn bring_up(
        &self,
        agent_id: &str,
        metadata: &AgentMetadata,
        handle: &dyn SquadAgent,
    ) -> AgentResult<()> {
        self.state_machine
            .set_state(agent_id, LifecycleState::Initializing, Some("registered"))?;
        handle.initialize().await?;
        self.load_balancer.add_agent(agent_id, metadata.weight);
        self.metrics.track(agent_id);
        self.health.track(agent_id);
        self.state_machine
            .set_state(agent_id, LifecycleState::Active, Some("initialized"))
    }

    /// Remove an agent and purge its state from every component.
    pub async fn unregister_agent(&self, agent_id: &str) -> AgentResult<()> {
        let record = self
            .registry
            .write()
            .remove(agent_id)
            .ok_or_else(|| AgentError::NotFound(agent_id.to_string()))?;

        if let Err(err) = record.handle.shutdown().await {
            warn!(%agent_id, error = %err, "agent shutdown hook failed");
        }

        self.load_balancer.remove_agent(agent_id);
        if let Err(err) = self.state_machine.shutdown_agent(agent_id) {
            debug!(%agent_id, error = %err, "no lifecycle to shut down");
        }
        self.state_machine.remove_agent(agent_id);
        self.metrics.remove_agent(agent_id);
        self.health.remove_agent(agent_id);

        info!(%agent_id, "agent unregistered");
        self.events.publish(OrchestratorEvent::AgentUnregistered {
            agent_id: agent_id.to_string(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Selection and dispatch
    // ------------------------------------------------------------------

    /// Choose an active agent of `agent_type` meeting `requirements`.
    pub fn get_available_agent(
        &self,
        agent_type: &str,
        requirements: Option<&AgentRequirements>,
    ) -> Option<String> {
        let candidates: Vec<AgentCandidate> = {
            let registry = self.registry.read();
            registry
                .iter()
                .filter(|(_, r)| r.metadata.agent_type == agent_type)
                .filter(|(id, _)| self.state_machine.is_active(id))
                .filter(|(_, r)| requirements.is_none_or(|req| meets_requirements(r, req)))
                .map(|(id, r)| {
                    AgentCandidate::new(id)
                        .with_connections(r.active_connections)
                        .with_load(r.handle.current_load())
                })
                .collect()
        };

        if candidates.is_empty() {
            debug!(%agent_type, "no active agent meets the requirements");
            return None;
        }

        let selected = self.load_balancer.select_agent(agent_type, &candidates)?;
        self.metrics.record_selection(&selected);
        Some(selected)
    }

    /// Dispatch one work item to `agent_id`.
    ///
    /// The call is bounded by the agent's timeout (or the manager default);
    /// a timeout counts as a failure everywhere. Consecutive failures
    /// reaching the agent's `max_retries` move it to `error`.
    pub async fn process_message(
        &self,
        agent_id: &str,
        input: AgentInput,
        context: &serde_json::Value,
    ) -> AgentResult<serde_json::Value> {
        let (handle, metadata) = {
            let registry = self.registry.read();
            let record = registry
                .get(agent_id)
                .ok_or_else(|| AgentError::NotFound(agent_id.to_string()))?;
            (Arc::clone(&record.handle), record.metadata.clone())
        };

        match self.state_machine.get_state(agent_id) {
            Some(LifecycleState::Active) => {}
            Some(state) => return Err(AgentError::not_available(agent_id, format!("agent is {state}"))),
            None => return Err(AgentError::not_available(agent_id, "agent has no lifecycle state")),
        }
        self.load_balancer
            .acquire(agent_id)
            .map_err(|_| AgentError::not_available(agent_id, "circuit open"))?;

        let timeout = metadata.timeout().unwrap_or_else(|| self.config.default_timeout());
        let started = Instant::now();
        let result = {
            let _connection = ConnectionGuard::open(self, agent_id);
            match tokio::time::timeout(timeout, handle.accept(input, context)).await {
                Ok(result) => result,
                Err(_) => Err(AgentError::timeout(timeout)),
            }
        };
        let elapsed = started.elapsed();

        self.metrics.record_processing_time(agent_id, elapsed);
        self.metrics
            .record_resource_usage(agent_id, handle.memory_usage(), handle.current_load());

        match result {
            Ok(output) => {
                self.load_balancer.record_success(agent_id);
                if let Some(record) = self.registry.write().get_mut(agent_id) {
                    record.consecutive_failures = 0;
                }
                debug!(%agent_id, elapsed_ms = duration_ms(elapsed), "message processed");
                Ok(output)
            }
            Err(err) => {
                self.metrics.record_error(agent_id, &err.to_string());
                self.load_balancer.record_failure(agent_id);
                let failures = self
                    .registry
                    .write()
                    .get_mut(agent_id)
                    .map(|record| {
                        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
                        record.consecutive_failures
                    })
                    .unwrap_or(0);
                warn!(%agent_id, failures, elapsed_ms = duration_ms(elapsed), error = %err, "message processing failed");

                if metadata.max_retries > 0
                    && failures >= metadata.max_retries
                    && self.state_machine.is_active(agent_id)
                {
                    let reason = format!("{failures} consecutive failures: {err}");
                    if let Err(transition) =
                        self.state_machine
                            .set_state(agent_id, LifecycleState::Error, Some(&reason))
                    {
                        debug!(%agent_id, error = %transition, "could not move agent to error");
                    }
                }
                Err(err)
            }
        }
    }

    fn adjust_connections(&self, agent_id: &str, delta: i64) {
        let connections = {
            let mut registry = self.registry.write();
            let Some(record) = registry.get_mut(agent_id) else {
                return;
            };
            record.active_connections = if delta >= 0 {
                record.active_connections.saturating_add(1)
            } else {
                record.active_connections.saturating_sub(1)
            };
            record.active_connections
        };
        self.metrics.record_connections(agent_id, connections);
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Shut the agent down, wait the restart cooldown, initialise it again
    /// and return it to `active` with fresh metrics.
    pub async fn restart_agent(&self, agent_id: &str) -> AgentResult<()> {
        let handle = self
            .agent(agent_id)
            .ok_or_else(|| AgentError::NotFound(agent_id.to_string()))?;
        info!(%agent_id, "restarting agent");

        handle.shutdown().await?;
        tokio::time::sleep(self.config.restart_cooldown()).await;
        handle.initialize().await?;

        match self.state_machine.get_state(agent_id) {
            Some(LifecycleState::Active) => {}
            Some(LifecycleState::Error) => {
                self.state_machine
                    .set_state(agent_id, LifecycleState::Recovering, Some("restart"))?;
                self.state_machine
                    .set_state(agent_id, LifecycleState::Active, Some("restarted"))?;
            }
            _ => {
                self.state_machine
                    .set_state(agent_id, LifecycleState::Active, Some("restarted"))?;
            }
        }

        self.metrics.reset_agent(agent_id);
        if let Some(record) = self.registry.write().get_mut(agent_id) {
            record.consecutive_failures = 0;
        }
        info!(%agent_id, "agent restarted");
        Ok(())
    }

    /// Run one recovery attempt through the state machine.
    pub async fn recover_agent(&self, agent_id: &str) -> AgentResult<RecoveryOutcome> {
        let handle = self
            .agent(agent_id)
            .ok_or_else(|| AgentError::NotFound(agent_id.to_string()))?;
        let outcome = self
            .state_machine
            .recover_agent(agent_id, move || async move {
                handle.shutdown().await?;
                handle.initialize().await
            })
            .await?;
        if outcome == RecoveryOutcome::Recovered {
            self.metrics.reset_agent(agent_id);
            if let Some(record) = self.registry.write().get_mut(agent_id) {
                record.consecutive_failures = 0;
            }
        }
        Ok(outcome)
    }

    fn wants_auto_recovery(&self, agent_id: &str) -> bool {
        self.config.auto_recovery
            && self
                .registry
                .read()
                .get(agent_id)
                .is_some_and(|r| r.metadata.auto_recovery)
    }

    /// Recover agents as `AgentError` events arrive. A failed attempt
    /// returns the agent to `error`, raising the next event, until the
    /// state machine reports the attempts exhausted.
    pub fn start_auto_recovery(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                let envelope = match rx.recv().await {
                    Ok(envelope) => envelope,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "auto-recovery listener lagged, rescanning");
                        let Some(manager) = weak.upgrade() else {
                            break;
                        };
                        manager.recover_stranded_agents();
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let OrchestratorEvent::AgentError { agent_id, .. } = envelope.event else {
                    continue;
                };
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                if !manager.wants_auto_recovery(&agent_id) {
                    continue;
                }
                manager.spawn_recovery(agent_id);
            }
        })
    }

    /// Start recovery for every auto-recovering agent left in `error` with
    /// attempts to spare. Returns how many were started.
    ///
    /// Error events can be lost when a bus subscriber lags, so the listener
    /// and the health monitor both fall back to this scan.
    pub fn recover_stranded_agents(self: &Arc<Self>) -> usize {
        let stranded: Vec<String> = self
            .state_machine
            .get_agents_in_state(LifecycleState::Error)
            .into_iter()
            .filter(|id| self.wants_auto_recovery(id) && self.state_machine.can_recover(id))
            .collect();
        let started = stranded.len();
        for agent_id in stranded {
            debug!(%agent_id, "recovering stranded agent");
            Arc::clone(self).spawn_recovery(agent_id);
        }
        started
    }

    fn spawn_recovery(self: Arc<Self>, agent_id: String) {
        tokio::spawn(async move {
            match self.recover_agent(&agent_id).await {
                Ok(outcome) => debug!(%agent_id, ?outcome, "auto-recovery finished"),
                Err(err) => warn!(%agent_id, error = %err, "auto-recovery gave up"),
            }
        });
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    /// Probe every live agent once and reconcile lifecycle states.
    ///
    /// An active agent classified unhealthy moves to `error`. An agent in
    /// `error` without auto-recovery that is classified healthy again is
    /// walked back to `active`.
    pub async fn run_health_sweep(&self) -> HashMap<String, bool> {
        let targets: Vec<(String, Arc<dyn SquadAgent>)> = self
            .registry
            .read()
            .iter()
            .map(|(id, r)| (id.to_string(), Arc::clone(&r.handle)))
            .collect();
        if targets.is_empty() {
            return HashMap::new();
        }

        let results = self.health.check_health_batch(targets).await;
        let now = Utc::now();
        for (agent_id, healthy) in &results {
            if let Some(record) = self.registry.write().get_mut(agent_id) {
                record.last_heartbeat = now;
            } else {
                continue;
            }

            let status = self.health.get_health_status(agent_id);
            match (self.state_machine.get_state(agent_id), status) {
                (Some(LifecycleState::Active), HealthStatus::Unhealthy) if !healthy => {
                    if let Err(err) = self.state_machine.set_state(
                        agent_id,
                        LifecycleState::Error,
                        Some("health check failed"),
                    ) {
                        debug!(%agent_id, error = %err, "could not mark agent unhealthy");
                    }
                }
                (Some(LifecycleState::Error), HealthStatus::Healthy)
                    if !self.wants_auto_recovery(agent_id) =>
                {
                    let restored = self
                        .state_machine
                        .set_state(agent_id, LifecycleState::Recovering, Some("health restored"))
                        .and_then(|_| {
                            self.state_machine.set_state(
                                agent_id,
                                LifecycleState::Active,
                                Some("health restored"),
                            )
                        });
                    if let Err(err) = restored {
                        debug!(%agent_id, error = %err, "could not restore agent");
                    }
                }
                _ => {}
            }
        }
        results
    }

    pub fn start_health_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.health_check_interval().max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let results = manager.run_health_sweep().await;
                let unhealthy = results.values().filter(|ok| !**ok).count();
                let recovering = manager.recover_stranded_agents();
                debug!(checked = results.len(), unhealthy, recovering, "health sweep finished");
            }
        })
    }

    /// Start the health monitor, metrics collection and, when enabled,
    /// auto-recovery. Tasks are stopped by [`AgentManager::shutdown`].
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        tasks.push(self.start_health_monitor());
        tasks.push(self.metrics.spawn_collection());
        if self.config.auto_recovery {
            tasks.push(self.start_auto_recovery());
        }
    }

    /// Stop background tasks and unregister every agent.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        let ids = self.registry.read().ids();
        for agent_id in ids {
            if let Err(err) = self.unregister_agent(&agent_id).await {
                debug!(%agent_id, error = %err, "agent already gone during shutdown");
            }
        }
        info!("agent manager shut down");
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn agent(&self, agent_id: &str) -> Option<Arc<dyn SquadAgent>> {
        self.registry.read().get(agent_id).map(|r| Arc::clone(&r.handle))
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.registry.read().contains(agent_id)
    }

    pub fn agent_info(&self, agent_id: &str) -> Option<AgentInfo> {
        let registry = self.registry.read();
        registry.get(agent_id).map(|r| self.info(agent_id, r))
    }

    pub fn agents(&self) -> Vec<AgentInfo> {
        let registry = self.registry.read();
        let mut agents: Vec<AgentInfo> = registry.iter().map(|(id, r)| self.info(id, r)).collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn agents_of_type(&self, agent_type: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .registry
            .read()
            .iter()
            .filter(|(_, r)| r.metadata.agent_type == agent_type)
            .map(|(id, _)| id.to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Whether some active agent of `agent_type` would pass its breaker.
    pub fn has_available_agent(&self, agent_type: &str) -> bool {
        self.registry.read().iter().any(|(id, r)| {
            r.metadata.agent_type == agent_type
                && self.state_machine.is_active(id)
                && self.load_balancer.is_eligible(id)
        })
    }

    pub fn stats(&self) -> ManagerStats {
        let registry = self.registry.read();
        let mut agents_by_type: HashMap<String, usize> = HashMap::new();
        let mut capabilities: HashSet<String> = HashSet::new();
        let mut active_agents = 0;
        for (id, record) in registry.iter() {
            *agents_by_type.entry(record.metadata.agent_type.clone()).or_insert(0) += 1;
            capabilities.extend(record.handle.capabilities());
            if self.state_machine.is_active(id) {
                active_agents += 1;
            }
        }
        let mut capabilities: Vec<String> = capabilities.into_iter().collect();
        capabilities.sort();

        ManagerStats {
            total_agents: registry.len(),
            active_agents,
            agents_by_type,
            capabilities,
            states: self.state_machine.stats().by_state,
            load_balancer: self.load_balancer.stats(),
        }
    }

    fn info(&self, agent_id: &str, record: &AgentRecord) -> AgentInfo {
        AgentInfo {
            id: agent_id.to_string(),
            agent_type: record.metadata.agent_type.clone(),
            metadata: record.metadata.clone(),
            state: self.state_machine.get_state(agent_id),
            health: self.health.get_health_status(agent_id),
            circuit: self
                .load_balancer
                .breaker_state(agent_id)
                .map(|s: CircuitState| s.to_string()),
            registered_at: record.registered_at,
            last_heartbeat: record.last_heartbeat,
            active_connections: record.active_connections,
            consecutive_failures: record.consecutive_failures,
        }
    }
}

impl AgentDirectory for AgentManager {
    fn is_type_available(&self, agent_type: &str) -> bool {
        self.has_available_agent(agent_type)
    }
}

impl Drop for AgentManager {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

fn meets_requirements(record: &AgentRecord, requirements: &AgentRequirements) -> bool {
    if let Some(specialization) = &requirements.specialization {
        if !record.metadata.specializations.contains(specialization) {
            return false;
        }
    }
    if let Some(min_version) = &requirements.min_version {
        if compare_versions(&record.metadata.version, min_version).is_lt() {
            return false;
        }
    }
    if !requirements.capabilities.is_empty() {
        let offered = record.handle.capabilities();
        if !requirements.capabilities.iter().all(|c| offered.contains(c)) {
            return false;
        }
    }
    if let Some(max_load) = requirements.max_load {
        if record.handle.current_load() > max_load {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use squadron_kernel::AgentInput;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct TestAgent {
        fail: AtomicBool,
        healthy: AtomicBool,
        fail_init: bool,
        delay: Duration,
        probe_delay: Duration,
        initialized: AtomicU32,
        shutdowns: AtomicU32,
        capabilities: Vec<String>,
        load: f64,
    }

    impl TestAgent {
        fn new() -> Self {
            Self {
                fail: AtomicBool::new(false),
                healthy: AtomicBool::new(true),
                fail_init: false,
                delay: Duration::ZERO,
                probe_delay: Duration::ZERO,
                initialized: AtomicU32::new(0),
                shutdowns: AtomicU32::new(0),
                capabilities: vec!["chat".into()],
                load: 0.2,
            }
        }
    }

    #[async_trait]
    impl SquadAgent for TestAgent {
        async fn accept(&self, input: AgentInput, _ctx: &serde_json::Value) -> AgentResult<serde_json::Value> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(AgentError::ExecutionFailed("invalid ledger entry".into()));
            }
            Ok(json!({ "echo": input.as_text() }))
        }

        async fn is_healthy(&self) -> AgentResult<bool> {
            if !self.probe_delay.is_zero() {
                tokio::time::sleep(self.probe_delay).await;
            }
            Ok(self.healthy.load(Ordering::SeqCst))
        }

        fn capabilities(&self) -> Vec<String> {
            self.capabilities.clone()
        }

        fn current_load(&self) -> f64 {
            self.load
        }

        fn memory_usage(&self) -> u64 {
            4096
        }

        async fn initialize(&self) -> AgentResult<()> {
            self.initialized.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                return Err(AgentError::ExecutionFailed("no credentials".into()));
            }
            Ok(())
        }

        async fn shutdown(&self) -> AgentResult<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager() -> AgentManager {
        AgentManager::new(&OrchestratorConfig::default(), EventBus::new())
    }

    async fn register(manager: &AgentManager, id: &str, agent_type: &str) -> Arc<TestAgent> {
        let agent = Arc::new(TestAgent::new());
        manager
            .register_agent(agent.clone(), AgentMetadata::new(id, agent_type))
            .await
            .unwrap();
        agent
    }

    #[tokio::test]
    async fn test_register_and_dispatch() {
        let manager = manager();
        let mut rx = manager.subscribe();
        let agent = register(&manager, "fin-1", "financial").await;

        assert_eq!(agent.initialized.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state_machine().get_state("fin-1"), Some(LifecycleState::Active));
        assert!(manager.metrics().is_tracked("fin-1"));
        assert_eq!(manager.load_balancer().breaker_state("fin-1"), Some(CircuitState::Closed));

        let selected = manager.get_available_agent("financial", None).unwrap();
        assert_eq!(selected, "fin-1");
        let output = manager
            .process_message(&selected, AgentInput::text("lunch 12.50"), &json!({}))
            .await
            .unwrap();
        assert_eq!(output["echo"], "lunch 12.50");

        let metrics = manager.metrics().get_metrics("fin-1").unwrap();
        assert_eq!(metrics.total_selections, 1);
        assert_eq!(metrics.total_requests, 1);
        assert_eq!(metrics.total_errors, 0);
        assert_eq!(manager.agent_info("fin-1").unwrap().active_connections, 0);

        let kinds: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.event.kind())
            .collect();
        assert!(kinds.contains(&"agent_registered"));
        assert!(kinds.contains(&"agent_selected"));
    }

    #[tokio::test]
    async fn test_registration_rejections() {
        let manager = manager();
        let blank = manager
            .register_agent(Arc::new(TestAgent::new()), AgentMetadata::new("", "financial"))
            .await;
        assert!(matches!(blank, Err(AgentError::RegistrationFailed(_))));

        let untyped = manager
            .register_agent(Arc::new(TestAgent::new()), AgentMetadata::new("x", " "))
            .await;
        assert!(matches!(untyped, Err(AgentError::RegistrationFailed(_))));

        register(&manager, "fin-1", "financial").await;
        let duplicate = manager
            .register_agent(Arc::new(TestAgent::new()), AgentMetadata::new("fin-1", "financial"))
            .await;
        assert!(matches!(duplicate, Err(AgentError::RegistrationFailed(_))));
        assert_eq!(manager.stats().total_agents, 1);
    }

    #[tokio::test]
    async fn test_dependencies_must_be_available() {
        let manager = manager();
        let metadata = AgentMetadata::new("orch-1", "orchestrator").with_dependency("general");
        let missing = manager
            .register_agent(Arc::new(TestAgent::new()), metadata.clone())
            .await;
        assert!(matches!(missing, Err(AgentError::RegistrationFailed(_))));
        assert!(!manager.is_registered("orch-1"));

        register(&manager, "gen-1", "general").await;
        manager
            .register_agent(Arc::new(TestAgent::new()), metadata)
            .await
            .unwrap();
        assert!(manager.is_registered("orch-1"));
    }

    #[tokio::test]
    async fn test_failed_initialize_leaves_no_trace() {
        let manager = manager();
        let agent = Arc::new(TestAgent {
            fail_init: true,
            ..TestAgent::new()
        });
        let result = manager
            .register_agent(agent, AgentMetadata::new("hr-1", "hr"))
            .await;
        assert!(matches!(result, Err(AgentError::RegistrationFailed(_))));
        assert!(!manager.is_registered("hr-1"));
        assert_eq!(manager.state_machine().get_state("hr-1"), None);
        assert!(manager.load_balancer().breaker("hr-1").is_none());
        assert!(!manager.metrics().is_tracked("hr-1"));
    }

    #[tokio::test]
    async fn test_dispatch_errors() {
        let manager = manager();
        register(&manager, "fin-1", "financial").await;

        let unknown = manager
            .process_message("ghost", AgentInput::Empty, &json!({}))
            .await;
        assert!(matches!(unknown, Err(AgentError::NotFound(_))));

        manager
            .state_machine()
            .set_state("fin-1", LifecycleState::Inactive, Some("paused"))
            .unwrap();
        let inactive = manager
            .process_message("fin-1", AgentInput::Empty, &json!({}))
            .await;
        assert!(matches!(inactive, Err(AgentError::NotAvailable { .. })));
        assert!(manager.get_available_agent("financial", None).is_none());
        assert!(!manager.is_type_available("financial"));
    }

    #[tokio::test]
    async fn test_open_breaker_makes_agent_unavailable() {
        let manager = manager();
        register(&manager, "gen-1", "general").await;
        for _ in 0..5 {
            manager.load_balancer().record_failure("gen-1");
        }
        assert_eq!(manager.load_balancer().breaker_state("gen-1"), Some(CircuitState::Open));
        assert!(!manager.has_available_agent("general"));
        let result = manager
            .process_message("gen-1", AgentInput::Empty, &json!({}))
            .await;
        assert!(matches!(result, Err(AgentError::NotAvailable { .. })));
    }

    #[tokio::test]
    async fn test_requirements_filter_candidates() {
        let manager = manager();
        manager
            .register_agent(
                Arc::new(TestAgent::new()),
                AgentMetadata::new("fin-old", "financial").with_version("1.2.0"),
            )
            .await
            .unwrap();
        manager
            .register_agent(
                Arc::new(TestAgent::new()),
                AgentMetadata::new("fin-tax", "financial")
                    .with_version("2.1.0")
                    .with_specialization("tax"),
            )
            .await
            .unwrap();

        let tax = AgentRequirements {
            specialization: Some("tax".into()),
            ..Default::default()
        };
        assert_eq!(manager.get_available_agent("financial", Some(&tax)).as_deref(), Some("fin-tax"));

        let modern = AgentRequirements {
            min_version: Some("2.0".into()),
            ..Default::default()
        };
        assert_eq!(manager.get_available_agent("financial", Some(&modern)).as_deref(), Some("fin-tax"));

        let impossible = AgentRequirements {
            capabilities: vec!["ocr".into()],
            ..Default::default()
        };
        assert!(manager.get_available_agent("financial", Some(&impossible)).is_none());

        let light = AgentRequirements {
            max_load: Some(0.1),
            ..Default::default()
        };
        assert!(manager.get_available_agent("financial", Some(&light)).is_none());
    }

    #[tokio::test]
    async fn test_round_robin_through_manager() {
        let manager = manager();
        register(&manager, "mkt-b", "marketing_sales").await;
        register(&manager, "mkt-a", "marketing_sales").await;

        let picks: Vec<String> = (0..4)
            .filter_map(|_| manager.get_available_agent("marketing_sales", None))
            .collect();
        assert_eq!(picks, ["mkt-a", "mkt-b", "mkt-a", "mkt-b"]);
    }

    #[tokio::test]
    async fn test_consecutive_failures_move_agent_to_error() {
        let manager = manager();
        let agent = Arc::new(TestAgent::new());
        agent.fail.store(true, Ordering::SeqCst);
        manager
            .register_agent(
                agent.clone(),
                AgentMetadata::new("fin-1", "financial").with_max_retries(2),
            )
            .await
            .unwrap();

        for _ in 0..2 {
            let result = manager
                .process_message("fin-1", AgentInput::Empty, &json!({}))
                .await;
            assert!(matches!(result, Err(AgentError::ExecutionFailed(_))));
        }
        assert_eq!(manager.state_machine().get_state("fin-1"), Some(LifecycleState::Error));
        assert_eq!(manager.agent_info("fin-1").unwrap().consecutive_failures, 2);
        let metrics = manager.metrics().get_metrics("fin-1").unwrap();
        assert_eq!(metrics.total_errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_timeout_counts_as_failure() {
        let manager = manager();
        let agent = Arc::new(TestAgent {
            delay: Duration::from_millis(200),
            ..TestAgent::new()
        });
        manager
            .register_agent(
                agent,
                AgentMetadata::new("slow-1", "general").with_timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap();

        let result = manager
            .process_message("slow-1", AgentInput::Empty, &json!({}))
            .await;
        assert!(matches!(result, Err(AgentError::Timeout { duration_ms: 50 })));
        assert_eq!(manager.metrics().get_metrics("slow-1").unwrap().total_errors, 1);
        assert_eq!(manager.load_balancer().breaker("slow-1").unwrap().stats().failures, 1);
    }

    #[tokio::test]
    async fn test_unregister_purges_everything() {
        let manager = manager();
        let mut rx = manager.subscribe();
        let agent = register(&manager, "hr-1", "hr").await;
        manager.run_health_sweep().await;

        manager.unregister_agent("hr-1").await.unwrap();
        assert_eq!(agent.shutdowns.load(Ordering::SeqCst), 1);
        assert!(!manager.is_registered("hr-1"));
        assert_eq!(manager.state_machine().get_state("hr-1"), None);
        assert!(manager.load_balancer().breaker("hr-1").is_none());
        assert!(manager.metrics().get_metrics("hr-1").is_none());
        assert_eq!(manager.health().get_health_status("hr-1"), HealthStatus::Unknown);

        manager.metrics().record_error("hr-1", "late result");
        assert!(manager.metrics().get_metrics("hr-1").is_none());

        assert!(matches!(
            manager.unregister_agent("hr-1").await,
            Err(AgentError::NotFound(_))
        ));
        let unregistered = std::iter::from_fn(|| rx.try_recv().ok())
            .any(|e| e.event.kind() == "agent_unregistered");
        assert!(unregistered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_agent() {
        let manager = manager();
        let agent = register(&manager, "fin-1", "financial").await;

        let outcome = manager.recover_agent("fin-1").await.unwrap();
        assert_eq!(outcome, RecoveryOutcome::NotInError(Some(LifecycleState::Active)));

        manager
            .state_machine()
            .set_state("fin-1", LifecycleState::Error, Some("boom"))
            .unwrap();
        let outcome = manager.recover_agent("fin-1").await.unwrap();
        assert_eq!(outcome, RecoveryOutcome::Recovered);
        assert_eq!(manager.state_machine().get_state("fin-1"), Some(LifecycleState::Active));
        assert_eq!(manager.state_machine().recovery_attempts("fin-1"), 0);
        assert_eq!(agent.initialized.load(Ordering::SeqCst), 2);
        assert_eq!(agent.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_recovery_on_error_event() {
        let manager = Arc::new(manager());
        register(&manager, "fin-1", "financial").await;
        let task = manager.start_auto_recovery();
        tokio::task::yield_now().await;

        manager
            .state_machine()
            .set_state("fin-1", LifecycleState::Error, Some("dispatch failures"))
            .unwrap();
        for _ in 0..100 {
            if manager.state_machine().is_active("fin-1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert!(manager.state_machine().is_active("fin-1"));
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lagged_listener_rescans_for_errored_agents() {
        let manager = Arc::new(AgentManager::new(
            &OrchestratorConfig::default(),
            EventBus::with_capacity(4),
        ));
        register(&manager, "fin-1", "financial").await;
        let task = manager.start_auto_recovery();
        tokio::task::yield_now().await;

        manager
            .state_machine()
            .set_state("fin-1", LifecycleState::Error, Some("dispatch failures"))
            .unwrap();
        for i in 0..8 {
            manager.events().publish(OrchestratorEvent::AgentUnregistered {
                agent_id: format!("other-{i}"),
            });
        }

        for _ in 0..100 {
            if manager.state_machine().is_active("fin-1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert!(manager.state_machine().is_active("fin-1"));
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_monitor_recovers_stranded_agent() {
        let mut config = OrchestratorConfig::default();
        config.manager.health_check_interval_ms = 1000;
        let manager = Arc::new(AgentManager::new(&config, EventBus::new()));
        register(&manager, "fin-1", "financial").await;
        let task = manager.start_health_monitor();

        // no auto-recovery listener running, so the error event goes unseen
        manager
            .state_machine()
            .set_state("fin-1", LifecycleState::Error, Some("dispatch failures"))
            .unwrap();

        for _ in 0..100 {
            if manager.state_machine().is_active("fin-1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert!(manager.state_machine().is_active("fin-1"));
        assert_eq!(manager.state_machine().recovery_attempts("fin-1"), 0);
        task.abort();
    }

    #[tokio::test]
    async fn test_stranded_scan_skips_opted_out_agents() {
        let manager = Arc::new(manager());
        let agent = Arc::new(TestAgent::new());
        manager
            .register_agent(agent, AgentMetadata::new("hr-1", "hr").with_auto_recovery(false))
            .await
            .unwrap();
        manager
            .state_machine()
            .set_state("hr-1", LifecycleState::Error, None)
            .unwrap();
        assert_eq!(manager.recover_stranded_agents(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_during_health_sweep_drops_result() {
        let manager = manager();
        let mut agent = TestAgent::new();
        agent.probe_delay = Duration::from_millis(500);
        manager
            .register_agent(Arc::new(agent), AgentMetadata::new("hr-1", "hr"))
            .await
            .unwrap();
        assert!(manager.health().is_tracked("hr-1"));

        let (results, unregistered) = tokio::join!(manager.run_health_sweep(), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            manager.unregister_agent("hr-1").await
        });
        assert!(unregistered.is_ok());
        assert_eq!(results.get("hr-1"), Some(&true));
        assert!(!manager.health().is_tracked("hr-1"));
        assert!(manager.health().get_health_history("hr-1", 10).is_empty());
        assert_eq!(manager.health().health_summary().total_agents, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_agent() {
        let manager = manager();
        let agent = register(&manager, "gen-1", "general").await;
        manager
            .process_message("gen-1", AgentInput::Empty, &json!({}))
            .await
            .unwrap();

        manager.restart_agent("gen-1").await.unwrap();
        assert_eq!(manager.state_machine().get_state("gen-1"), Some(LifecycleState::Active));
        assert_eq!(agent.initialized.load(Ordering::SeqCst), 2);
        assert_eq!(agent.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(manager.metrics().get_metrics("gen-1").unwrap().total_requests, 0);
        assert!(matches!(
            manager.restart_agent("ghost").await,
            Err(AgentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_health_sweep_reconciles_state() {
        let manager = manager();
        let agent = Arc::new(TestAgent::new());
        manager
            .register_agent(
                agent.clone(),
                AgentMetadata::new("hr-1", "hr").with_auto_recovery(false),
            )
            .await
            .unwrap();

        agent.healthy.store(false, Ordering::SeqCst);
        let results = manager.run_health_sweep().await;
        assert_eq!(results.get("hr-1"), Some(&false));
        assert!(manager.state_machine().is_active("hr-1"));
        manager.run_health_sweep().await;
        assert_eq!(manager.state_machine().get_state("hr-1"), Some(LifecycleState::Error));

        agent.healthy.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            manager.run_health_sweep().await;
        }
        assert!(manager.state_machine().is_active("hr-1"));
    }

    #[tokio::test]
    async fn test_stats_and_shutdown() {
        let manager = manager();
        register(&manager, "fin-1", "financial").await;
        register(&manager, "fin-2", "financial").await;
        let hr = register(&manager, "hr-1", "hr").await;

        let stats = manager.stats();
        assert_eq!(stats.total_agents, 3);
        assert_eq!(stats.active_agents, 3);
        assert_eq!(stats.agents_by_type["financial"], 2);
        assert_eq!(stats.capabilities, vec!["chat".to_string()]);
        assert_eq!(manager.agents_of_type("financial"), ["fin-1", "fin-2"]);
        assert_eq!(manager.agents().len(), 3);

        manager.shutdown().await;
        assert_eq!(manager.stats().total_agents, 0);
        assert_eq!(hr.shutdowns.load(Ordering::SeqCst), 1);
    }
}
