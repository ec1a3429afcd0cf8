//! Active health probing
//!
//! [`HealthChecker`] calls an agent's health capability under a hard timeout,
//! then runs auxiliary checks against the agent's reported memory, load and
//! capabilities. Results go into a bounded per-agent history from which a
//! [`HealthStatus`] is derived. These thresholds are independent of any
//! circuit breaker.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde::{Deserialize, Serialize};
use squadron_kernel::utils::{duration_ms, now_ms};
use squadron_kernel::{EventBus, OrchestratorEvent, SquadAgent};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub check_interval_ms: u64,
    pub timeout_ms: u64,
    /// Extra probe attempts after a probe error or timeout
    pub retries: u32,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    pub memory_threshold_bytes: u64,
    pub load_threshold: f64,
    /// Maximum probes in flight during a batch
    pub batch_concurrency: usize,
    pub history_size: usize,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            timeout_ms: 5000,
            retries: 3,
            healthy_threshold: 3,
            unhealthy_threshold: 2,
            memory_threshold_bytes: 1024 * 1024 * 1024,
            load_threshold: 0.9,
            batch_concurrency: 5,
            history_size: 100,
        }
    }
}

impl HealthCheckConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    pub response_time_ms: u64,
    pub memory_usage: u64,
    pub load: f64,
    /// Failed probe attempts
    pub errors: u32,
    pub timestamp_ms: u64,
    pub details: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSummary {
    pub total_agents: usize,
    pub healthy_agents: usize,
    pub unhealthy_agents: usize,
    pub unknown_agents: usize,
    pub average_response_time_ms: f64,
    pub total_health_checks: usize,
    pub failure_rate: f64,
}

#[derive(Debug, Default)]
struct AgentHealth {
    history: VecDeque<HealthCheckResult>,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

struct ProbeOutcome {
    healthy: Result<bool, String>,
    response_time: Duration,
    errors: u32,
}

pub struct HealthChecker {
    config: HealthCheckConfig,
    agents: DashMap<String, AgentHealth>,
    events: EventBus,
}

impl HealthChecker {
    pub fn new(config: HealthCheckConfig, events: EventBus) -> Self {
        Self {
            config,
            agents: DashMap::new(),
            events,
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Start keeping history for `agent_id`. Results for ids that are not
    /// tracked are returned but not recorded.
    pub fn track(&self, agent_id: &str) {
        self.agents.entry(agent_id.to_string()).or_default();
    }

    pub fn is_tracked(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Probe one agent and record the result. Never fails; probe errors and
    /// timeouts become an unhealthy result.
    pub async fn check_health(&self, agent_id: &str, agent: &dyn SquadAgent) -> HealthCheckResult {
        let probe = self.probe(agent_id, agent).await;
        let result = self.evaluate(agent, probe);
        self.record(agent_id, result.clone());
        result
    }

    /// Probe many agents with at most `batch_concurrency` probes in flight.
    pub async fn check_health_batch(
        &self,
        agents: Vec<(String, Arc<dyn SquadAgent>)>,
    ) -> HashMap<String, bool> {
        let limit = self.config.batch_concurrency.max(1);
        let mut results = HashMap::with_capacity(agents.len());
        let mut pending = agents.into_iter().peekable();
        while pending.peek().is_some() {
            let chunk: Vec<BoxFuture<'_, (String, bool)>> = pending
                .by_ref()
                .take(limit)
                .map(|(id, agent)| {
                    async move {
                        let result = self.check_health(&id, agent.as_ref()).await;
                        (id, result.healthy)
                    }
                    .boxed()
                })
                .collect();
            results.extend(join_all(chunk).await);
        }
        results
    }

    async fn probe(&self, agent_id: &str, agent: &dyn SquadAgent) -> ProbeOutcome {
        let timeout = self.config.timeout();
        let attempts = self.config.retries.saturating_add(1);
        let mut errors = 0;
        let mut last_error = String::new();
        let mut response_time = Duration::ZERO;

        for attempt in 1..=attempts {
            let started = Instant::now();
            let outcome = tokio::time::timeout(timeout, agent.is_healthy()).await;
            response_time = started.elapsed();
            match outcome {
                Ok(Ok(healthy)) => {
                    return ProbeOutcome {
                        healthy: Ok(healthy),
                        response_time,
                        errors,
                    };
                }
                Ok(Err(err)) => last_error = err.to_string(),
                Err(_) => last_error = format!("health probe timed out after {}ms", self.config.timeout_ms),
            }
            errors += 1;
            debug!(%agent_id, attempt, error = %last_error, "health probe attempt failed");
        }

        ProbeOutcome {
            healthy: Err(last_error),
            response_time,
            errors,
        }
    }

    fn evaluate(&self, agent: &dyn SquadAgent, probe: ProbeOutcome) -> HealthCheckResult {
        let mut problems = Vec::new();
        let mut healthy = true;

        match &probe.healthy {
            Ok(true) => {}
            Ok(false) => {
                healthy = false;
                problems.push("agent reported unhealthy".to_string());
            }
            Err(err) => {
                healthy = false;
                problems.push(format!("health probe failed: {err}"));
            }
        }

        let memory_usage = agent.memory_usage();
        if memory_usage > self.config.memory_threshold_bytes {
            healthy = false;
            problems.push("high memory usage".to_string());
        }

        let load = agent.current_load();
        if load > self.config.load_threshold {
            healthy = false;
            problems.push("high load".to_string());
        }

        if agent.capabilities().is_empty() {
            healthy = false;
            problems.push("no capabilities".to_string());
        }

        let response_time_ms = duration_ms(probe.response_time);
        if probe.healthy.is_ok() && response_time_ms as f64 > self.config.timeout_ms as f64 * 0.8 {
            healthy = false;
            problems.push("slow response".to_string());
        }

        let details = if problems.is_empty() {
            "all checks passed".to_string()
        } else {
            problems.join("; ")
        };

        HealthCheckResult {
            healthy,
            response_time_ms,
            memory_usage,
            load,
            errors: probe.errors,
            timestamp_ms: now_ms(),
            details,
        }
    }

    fn record(&self, agent_id: &str, result: HealthCheckResult) {
        let cap = self.config.history_size.max(1);
        let (failures, successes) = {
            let Some(mut entry) = self.agents.get_mut(agent_id) else {
                debug!(%agent_id, "dropping health result for untracked agent");
                return;
            };
            if entry.history.len() >= cap {
                entry.history.pop_front();
            }
            if result.healthy {
                entry.consecutive_successes = entry.consecutive_successes.saturating_add(1);
                entry.consecutive_failures = 0;
            } else {
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                entry.consecutive_successes = 0;
            }
            entry.history.push_back(result.clone());
            (entry.consecutive_failures, entry.consecutive_successes)
        };

        self.events.publish(OrchestratorEvent::HealthChecked {
            agent_id: agent_id.to_string(),
            healthy: result.healthy,
            response_time_ms: result.response_time_ms,
        });

        if failures == self.config.unhealthy_threshold {
            warn!(%agent_id, failures, details = %result.details, "agent marked unhealthy");
            self.events.publish(OrchestratorEvent::AgentUnhealthy {
                agent_id: agent_id.to_string(),
                consecutive_failures: failures,
            });
        }
        if successes == self.config.healthy_threshold {
            info!(%agent_id, successes, "agent marked healthy");
            self.events.publish(OrchestratorEvent::AgentHealthy {
                agent_id: agent_id.to_string(),
                consecutive_successes: successes,
            });
        }
    }

    /// Most recent `limit` results, oldest first.
    pub fn get_health_history(&self, agent_id: &str, limit: usize) -> Vec<HealthCheckResult> {
        self.agents
            .get(agent_id)
            .map(|h| {
                let skip = h.history.len().saturating_sub(limit);
                h.history.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// `Healthy` when the last `healthy_threshold` results all passed,
    /// `Unhealthy` when the last `unhealthy_threshold` all failed.
    pub fn get_health_status(&self, agent_id: &str) -> HealthStatus {
        match self.agents.get(agent_id) {
            Some(h) => self.classify(&h.history),
            None => HealthStatus::Unknown,
        }
    }

    fn classify(&self, history: &VecDeque<HealthCheckResult>) -> HealthStatus {
        let tail_all = |n: u32, healthy: bool| {
            let n = n.max(1) as usize;
            history.len() >= n && history.iter().rev().take(n).all(|r| r.healthy == healthy)
        };
        if tail_all(self.config.healthy_threshold, true) {
            HealthStatus::Healthy
        } else if tail_all(self.config.unhealthy_threshold, false) {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Unknown
        }
    }

    pub fn consecutive_failures(&self, agent_id: &str) -> u32 {
        self.agents.get(agent_id).map(|h| h.consecutive_failures).unwrap_or(0)
    }

    pub fn consecutive_successes(&self, agent_id: &str) -> u32 {
        self.agents.get(agent_id).map(|h| h.consecutive_successes).unwrap_or(0)
    }

    pub fn reset_health_history(&self, agent_id: &str) {
        if let Some(mut h) = self.agents.get_mut(agent_id) {
            *h = AgentHealth::default();
        }
    }

    pub fn remove_agent(&self, agent_id: &str) -> bool {
        self.agents.remove(agent_id).is_some()
    }

    pub fn health_summary(&self) -> HealthSummary {
        let mut summary = HealthSummary::default();
        let mut total_response = 0u64;
        let mut failed = 0usize;

        for entry in self.agents.iter() {
            summary.total_agents += 1;
            match self.classify(&entry.history) {
                HealthStatus::Healthy => summary.healthy_agents += 1,
                HealthStatus::Unhealthy => summary.unhealthy_agents += 1,
                HealthStatus::Unknown => summary.unknown_agents += 1,
            }
            summary.total_health_checks += entry.history.len();
            failed += entry.history.iter().filter(|r| !r.healthy).count();
            total_response += entry.history.iter().map(|r| r.response_time_ms).sum::<u64>();
        }

        if summary.total_health_checks > 0 {
            let checks = summary.total_health_checks as f64;
            summary.average_response_time_ms = total_response as f64 / checks;
            summary.failure_rate = failed as f64 / checks;
        }
        summary
    }

    /// Probe whatever `targets` returns every `check_interval`. The task
    /// stops once the checker is dropped.
    pub fn spawn_periodic<F>(self: &Arc<Self>, targets: F) -> JoinHandle<()>
    where
        F: Fn() -> Vec<(String, Arc<dyn SquadAgent>)> + Send + Sync + 'static,
    {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.check_interval().max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(checker) = weak.upgrade() else {
                    break;
                };
                let agents = targets();
                if agents.is_empty() {
                    continue;
                }
                let results = checker.check_health_batch(agents).await;
                let unhealthy = results.values().filter(|ok| !**ok).count();
                debug!(checked = results.len(), unhealthy, "periodic health sweep");
            }
        })
    }
}
