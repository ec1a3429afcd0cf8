//! Agent selection among instances of one type
//!
//! Candidates whose circuit breaker would refuse a call are dropped first,
//! then the per-type strategy picks one of the rest. The load balancer owns
//! one [`CircuitBreaker`] per agent; dispatch outcomes are fed back through
//! [`LoadBalancer::record_success`] and [`LoadBalancer::record_failure`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use squadron_kernel::{AgentError, AgentResult, EventBus, IdArena, OrchestratorEvent};
use tracing::{debug, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    LeastConnections,
    Weighted,
    LeastLoad,
}

impl LoadBalancingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
            Self::Weighted => "weighted",
            Self::LeastLoad => "least_load",
        }
    }
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Built-in strategy per agent type
pub fn default_strategies() -> HashMap<String, LoadBalancingStrategy> {
    use LoadBalancingStrategy::*;
    [
        ("financial", LeastLoad),
        ("marketing_sales", RoundRobin),
        ("hr", Weighted),
        ("general", LeastConnections),
        ("orchestrator", LeastLoad),
    ]
    .into_iter()
    .map(|(agent_type, strategy)| (agent_type.to_string(), strategy))
    .collect()
}

fn agent_breaker_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 5,
        success_threshold: 3,
        recovery_timeout_ms: 30_000,
        half_open_max_calls: 3,
        ..CircuitBreakerConfig::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// Used for types with no built-in or configured strategy
    pub default_strategy: LoadBalancingStrategy,
    /// Overrides applied on top of [`default_strategies`]
    pub strategies: HashMap<String, LoadBalancingStrategy>,
    /// Template for every per-agent breaker
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            default_strategy: LoadBalancingStrategy::RoundRobin,
            strategies: HashMap::new(),
            circuit_breaker: agent_breaker_config(),
        }
    }
}

/// Live view of one eligible agent, supplied by the caller at selection time
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCandidate {
    pub id: String,
    pub active_connections: u32,
    pub current_load: f64,
}

impl AgentCandidate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            active_connections: 0,
            current_load: 0.0,
        }
    }

    pub fn with_connections(mut self, connections: u32) -> Self {
        self.active_connections = connections;
        self
    }

    pub fn with_load(mut self, load: f64) -> Self {
        self.current_load = load;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerStats {
    pub total_agents: usize,
    pub strategies: HashMap<String, LoadBalancingStrategy>,
    pub open_breakers: Vec<String>,
    pub half_open_breakers: Vec<String>,
}

/// Upper bound on a single agent's weight, so summed weights stay finite
pub const MAX_WEIGHT: f64 = 1_000_000.0;

/// `None` for weights that cannot take part in a draw.
fn checked_weight(weight: f64) -> Option<f64> {
    (weight.is_finite() && weight >= 0.0).then(|| weight.min(MAX_WEIGHT))
}

struct BalancedAgent {
    breaker: Arc<CircuitBreaker>,
    weight: f64,
}

pub struct LoadBalancer {
    config: LoadBalancerConfig,
    strategies: RwLock<HashMap<String, LoadBalancingStrategy>>,
    agents: RwLock<IdArena<BalancedAgent>>,
    counters: Mutex<HashMap<String, u64>>,
    rng: Mutex<StdRng>,
    events: EventBus,
}

impl LoadBalancer {
    pub fn new(config: LoadBalancerConfig, events: EventBus) -> Self {
        Self::with_rng(config, events, StdRng::from_entropy())
    }

    /// Deterministic weighted draws
    pub fn with_seed(config: LoadBalancerConfig, events: EventBus, seed: u64) -> Self {
        Self::with_rng(config, events, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: LoadBalancerConfig, events: EventBus, rng: StdRng) -> Self {
        let mut strategies = default_strategies();
        strategies.extend(config.strategies.clone());
        Self {
            config,
            strategies: RwLock::new(strategies),
            agents: RwLock::new(IdArena::new()),
            counters: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
            events,
        }
    }

    pub fn config(&self) -> &LoadBalancerConfig {
        &self.config
    }

    /// Register an agent with a fresh closed breaker. Weight defaults to 1,
    /// as does a negative or non-finite weight; weights above
    /// [`MAX_WEIGHT`] are clamped.
    pub fn add_agent(&self, agent_id: &str, weight: Option<f64>) -> bool {
        let weight = match weight {
            None => 1.0,
            Some(raw) => checked_weight(raw).unwrap_or_else(|| {
                warn!(%agent_id, weight = raw, "unusable weight, defaulting to 1");
                1.0
            }),
        };
        let breaker = CircuitBreaker::new(agent_id, self.config.circuit_breaker.clone())
            .with_event_bus(self.events.clone());
        let entry = BalancedAgent {
            breaker: Arc::new(breaker),
            weight,
        };
        self.agents.write().insert(agent_id, entry).is_ok()
    }

    pub fn remove_agent(&self, agent_id: &str) -> bool {
        self.agents.write().remove(agent_id).is_some()
    }

    /// Returns false for unknown agents and for negative or non-finite
    /// weights. Weights above [`MAX_WEIGHT`] are clamped.
    pub fn set_weight(&self, agent_id: &str, weight: f64) -> bool {
        let Some(weight) = checked_weight(weight) else {
            warn!(%agent_id, weight, "rejected unusable weight");
            return false;
        };
        match self.agents.write().get_mut(agent_id) {
            Some(agent) => {
                agent.weight = weight;
                true
            }
            None => false,
        }
    }

    pub fn weight(&self, agent_id: &str) -> f64 {
        self.agents.read().get(agent_id).map(|a| a.weight).unwrap_or(1.0)
    }

    pub fn set_strategy(&self, agent_type: &str, strategy: LoadBalancingStrategy) {
        debug!(%agent_type, %strategy, "load balancing strategy set");
        self.strategies.write().insert(agent_type.to_string(), strategy);
    }

    pub fn strategy_for(&self, agent_type: &str) -> LoadBalancingStrategy {
        self.strategies
            .read()
            .get(agent_type)
            .copied()
            .unwrap_or(self.config.default_strategy)
    }

    pub fn breaker(&self, agent_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.agents.read().get(agent_id).map(|a| Arc::clone(&a.breaker))
    }

    pub fn breaker_state(&self, agent_id: &str) -> Option<CircuitState> {
        self.breaker(agent_id).map(|b| b.state())
    }

    /// Whether the agent's breaker would admit a call now. Agents without a
    /// breaker are always eligible.
    pub fn is_eligible(&self, agent_id: &str) -> bool {
        self.breaker(agent_id)
            .map(|b| b.is_call_permitted())
            .unwrap_or(true)
    }

    /// Admit one call through the agent's breaker.
    pub fn acquire(&self, agent_id: &str) -> AgentResult<()> {
        match self.breaker(agent_id) {
            Some(breaker) => breaker.try_acquire().map_err(|_| AgentError::BreakerOpen(agent_id.to_string())),
            None => Ok(()),
        }
    }

    pub fn record_success(&self, agent_id: &str) {
        if let Some(breaker) = self.breaker(agent_id) {
            breaker.record_success();
        }
    }

    pub fn record_failure(&self, agent_id: &str) {
        if let Some(breaker) = self.breaker(agent_id) {
            breaker.record_failure();
        }
    }

    /// Pick one of `candidates` for `agent_type`.
    ///
    /// Returns `None` when no candidate passes its breaker; a
    /// `CandidatesExhausted` event is published in that case.
    pub fn select_agent(&self, agent_type: &str, candidates: &[AgentCandidate]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }

        let mut eligible: Vec<(&AgentCandidate, f64)> = {
            let agents = self.agents.read();
            candidates
                .iter()
                .filter_map(|c| match agents.get(&c.id) {
                    Some(agent) if agent.breaker.is_call_permitted() => Some((c, agent.weight)),
                    Some(_) => None,
                    None => Some((c, 1.0)),
                })
                .collect()
        };

        if eligible.is_empty() {
            warn!(%agent_type, candidates = candidates.len(), "all candidates have open circuits");
            self.events.publish(OrchestratorEvent::CandidatesExhausted {
                agent_type: agent_type.to_string(),
                candidates: candidates.len(),
            });
            return None;
        }
        eligible.sort_by(|a, b| a.0.id.cmp(&b.0.id));

        let strategy = self.strategy_for(agent_type);
        let index = match strategy {
            LoadBalancingStrategy::RoundRobin => self.round_robin(agent_type, eligible.len()),
            LoadBalancingStrategy::LeastConnections => {
                least_by(&eligible, |c| c.active_connections as f64)
            }
            LoadBalancingStrategy::LeastLoad => least_by(&eligible, |c| c.current_load),
            LoadBalancingStrategy::Weighted => self.weighted(&eligible),
        };
        let selected = eligible[index].0.id.clone();

        debug!(%agent_type, agent_id = %selected, %strategy, "agent selected");
        self.events.publish(OrchestratorEvent::AgentSelected {
            agent_id: selected.clone(),
            agent_type: agent_type.to_string(),
            strategy: strategy.to_string(),
        });
        Some(selected)
    }

    fn round_robin(&self, agent_type: &str, len: usize) -> usize {
        let mut counters = self.counters.lock();
        let counter = counters.entry(agent_type.to_string()).or_insert(0);
        let index = (*counter % len as u64) as usize;
        *counter = counter.wrapping_add(1);
        index
    }

    fn weighted(&self, eligible: &[(&AgentCandidate, f64)]) -> usize {
        let total: f64 = eligible.iter().map(|(_, w)| w.max(0.0)).sum();
        if !total.is_finite() || total <= 0.0 {
            return 0;
        }
        let mut draw = self.rng.lock().gen_range(0.0..total);
        for (index, (_, weight)) in eligible.iter().enumerate() {
            let weight = weight.max(0.0);
            if draw < weight {
                return index;
            }
            draw -= weight;
        }
        eligible.len() - 1
    }

    pub fn stats(&self) -> LoadBalancerStats {
        let agents = self.agents.read();
        let mut open_breakers = Vec::new();
        let mut half_open_breakers = Vec::new();
        for (id, agent) in agents.iter() {
            match agent.breaker.state() {
                CircuitState::Open => open_breakers.push(id.to_string()),
                CircuitState::HalfOpen => half_open_breakers.push(id.to_string()),
                CircuitState::Closed => {}
            }
        }
        open_breakers.sort();
        half_open_breakers.sort();
        LoadBalancerStats {
            total_agents: agents.len(),
            strategies: self.strategies.read().clone(),
            open_breakers,
            half_open_breakers,
        }
    }
}

/// First index holding the minimum of `key`
fn least_by<F>(eligible: &[(&AgentCandidate, f64)], key: F) -> usize
where
    F: Fn(&AgentCandidate) -> f64,
{
    let mut best = 0;
    for (index, (candidate, _)) in eligible.iter().enumerate().skip(1) {
        if key(candidate) < key(eligible[best].0) {
            best = index;
        }
    }
    best
}
