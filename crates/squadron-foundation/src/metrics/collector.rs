use std::fmt::Write as _;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use squadron_kernel::utils::duration_ms;
use squadron_kernel::{AgentResult, Alert, AlertKind, EventBus, IdArena, OrchestratorEvent};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::types::{
    AgentMetrics, AgentPerformance, AlertSummary, AlertThresholds, ApiCallSample, MetricsConfig,
    SystemMetrics,
};

pub struct MetricsCollector {
    config: MetricsConfig,
    agents: RwLock<IdArena<AgentMetrics>>,
    events: EventBus,
}

#[derive(Serialize)]
struct MetricsExport<'a> {
    timestamp: String,
    metrics: &'a [AgentMetrics],
    system: SystemMetrics,
    alerts: AlertSummary,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig, events: EventBus) -> Self {
        Self {
            config,
            agents: RwLock::new(IdArena::new()),
            events,
        }
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.config.alert_thresholds
    }

    /// Start tracking `agent_id`. Updates for untracked ids are ignored so a
    /// late update cannot resurrect a removed agent.
    pub fn track(&self, agent_id: &str) -> bool {
        self.agents
            .write()
            .insert(agent_id, AgentMetrics::new(agent_id))
            .is_ok()
    }

    pub fn is_tracked(&self, agent_id: &str) -> bool {
        self.agents.read().contains(agent_id)
    }

    pub fn remove_agent(&self, agent_id: &str) -> bool {
        self.agents.write().remove(agent_id).is_some()
    }

    pub fn reset_agent(&self, agent_id: &str) -> bool {
        match self.agents.write().get_mut(agent_id) {
            Some(metrics) => {
                metrics.reset();
                true
            }
            None => false,
        }
    }

    pub fn record_selection(&self, agent_id: &str) {
        self.update(agent_id, |m, _| {
            m.total_selections += 1;
            m.last_selected_at = Some(Utc::now());
            m.refresh_error_rate();
            Vec::new()
        });
    }

    pub fn record_processing_time(&self, agent_id: &str, elapsed: Duration) {
        let elapsed_ms = duration_ms(elapsed);
        self.update(agent_id, |m, t| {
            m.add_processing_time(elapsed_ms);
            let mut alerts = Vec::new();
            if elapsed_ms > t.max_processing_time_ms {
                alerts.push(alert(
                    m,
                    AlertKind::HighProcessingTime,
                    elapsed_ms as f64,
                    t.max_processing_time_ms as f64,
                ));
            }
            alerts
        });
    }

    pub fn record_error(&self, agent_id: &str, error: &str) {
        self.update(agent_id, |m, t| {
            m.total_errors += 1;
            m.last_error = Some(error.to_string());
            m.last_error_at = Some(Utc::now());
            m.refresh_error_rate();
            let mut alerts = Vec::new();
            if m.total_errors > t.max_errors {
                alerts.push(alert(
                    m,
                    AlertKind::HighErrorCount,
                    m.total_errors as f64,
                    t.max_errors as f64,
                ));
            }
            if m.error_rate > t.max_error_rate {
                alerts.push(alert(m, AlertKind::HighErrorRate, m.error_rate, t.max_error_rate));
            }
            alerts
        });
    }

    pub fn record_resource_usage(&self, agent_id: &str, memory_bytes: u64, load: f64) {
        self.update(agent_id, |m, t| {
            m.memory_usage = memory_bytes;
            m.current_load = load;
            let mut alerts = Vec::new();
            if memory_bytes > t.max_memory_bytes {
                alerts.push(alert(
                    m,
                    AlertKind::HighMemoryUsage,
                    memory_bytes as f64,
                    t.max_memory_bytes as f64,
                ));
            }
            if load > t.max_load {
                alerts.push(alert(m, AlertKind::HighLoad, load, t.max_load));
            }
            alerts
        });
    }

    pub fn record_connections(&self, agent_id: &str, connections: u32) {
        self.update(agent_id, |m, _| {
            m.active_connections = connections;
            Vec::new()
        });
    }

    pub fn record_api_call(
        &self,
        agent_id: &str,
        endpoint: &str,
        status_code: u16,
        response_time: Duration,
    ) {
        self.update(agent_id, |m, _| {
            m.push_api_sample(ApiCallSample {
                timestamp: Utc::now(),
                endpoint: endpoint.to_string(),
                status_code,
                response_time_ms: duration_ms(response_time),
            });
            Vec::new()
        });
    }

    fn update<F>(&self, agent_id: &str, apply: F)
    where
        F: FnOnce(&mut AgentMetrics, &AlertThresholds) -> Vec<Alert>,
    {
        let alerts = {
            let mut agents = self.agents.write();
            let Some(metrics) = agents.get_mut(agent_id) else {
                debug!(%agent_id, "metrics update for untracked agent ignored");
                return;
            };
            apply(metrics, &self.config.alert_thresholds)
        };
        for alert in alerts {
            warn!(agent_id = %alert.agent_id, kind = ?alert.kind, value = alert.value, threshold = alert.threshold, "metrics alert");
            self.events.publish(OrchestratorEvent::Alert(alert));
        }
    }

    /// Snapshot for one agent with uptime refreshed
    pub fn get_metrics(&self, agent_id: &str) -> Option<AgentMetrics> {
        self.agents.read().get(agent_id).map(|m| {
            let mut snapshot = m.clone();
            snapshot.refresh_uptime();
            snapshot
        })
    }

    pub fn all_metrics(&self) -> Vec<AgentMetrics> {
        let mut all: Vec<AgentMetrics> = self
            .agents
            .read()
            .values()
            .map(|m| {
                let mut snapshot = m.clone();
                snapshot.refresh_uptime();
                snapshot
            })
            .collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }

    /// Composite 0-100 score used for reporting only.
    pub fn performance_score(&self, metrics: &AgentMetrics) -> f64 {
        let t = &self.config.alert_thresholds;
        let mut score = 100.0;

        if metrics.average_processing_time_ms > 0.0 && t.max_processing_time_ms > 0 {
            score -= (metrics.average_processing_time_ms / t.max_processing_time_ms as f64 * 20.0)
                .min(20.0);
        }
        if metrics.total_requests.max(metrics.total_selections) > 0 {
            score -= (metrics.error_rate * 100.0).min(30.0);
        }
        if metrics.memory_usage > 0 && t.max_memory_bytes > 0 {
            score -= (metrics.memory_usage as f64 / t.max_memory_bytes as f64 * 15.0).min(15.0);
        }
        if metrics.current_load > 0.0 && t.max_load > 0.0 {
            score -= (metrics.current_load / t.max_load * 10.0).min(10.0);
        }
        if metrics.total_selections > 100 {
            score += (metrics.total_selections as f64 / 1000.0).min(5.0);
        }
        score.clamp(0.0, 100.0)
    }

    fn ranked(&self) -> Vec<AgentPerformance> {
        self.all_metrics()
            .into_iter()
            .map(|metrics| AgentPerformance {
                agent_id: metrics.agent_id.clone(),
                score: self.performance_score(&metrics),
                metrics,
            })
            .collect()
    }

    pub fn top_performers(&self, limit: usize) -> Vec<AgentPerformance> {
        let mut ranked = self.ranked();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked.truncate(limit);
        ranked
    }

    pub fn worst_performers(&self, limit: usize) -> Vec<AgentPerformance> {
        let mut ranked = self.ranked();
        ranked.sort_by(|a, b| a.score.total_cmp(&b.score));
        ranked.truncate(limit);
        ranked
    }

    pub fn system_metrics(&self) -> SystemMetrics {
        let agents = self.agents.read();
        let mut system = SystemMetrics {
            total_agents: agents.len(),
            ..Default::default()
        };
        let mut processing_ms = 0u64;
        let mut memory = 0f64;
        let mut load = 0f64;

        for m in agents.values() {
            system.total_selections += m.total_selections;
            system.total_requests += m.total_requests;
            system.total_errors += m.total_errors;
            system.total_connections += u64::from(m.active_connections);
            processing_ms = processing_ms.saturating_add(m.total_processing_time_ms);
            memory += m.memory_usage as f64;
            load += m.current_load;

            let minutes = (m.uptime().as_secs_f64() / 60.0).max(1.0 / 60.0);
            system.selections_per_minute += m.total_selections as f64 / minutes;
            system.errors_per_minute += m.total_errors as f64 / minutes;
        }

        if system.total_requests > 0 {
            system.average_processing_time_ms = processing_ms as f64 / system.total_requests as f64;
        }
        if system.total_agents > 0 {
            system.average_memory_usage = memory / system.total_agents as f64;
            system.average_load = load / system.total_agents as f64;
        }
        let base = system.total_requests.max(system.total_selections);
        if base > 0 {
            system.error_rate = system.total_errors as f64 / base as f64;
        }
        system
    }

    pub fn alert_summary(&self) -> AlertSummary {
        let t = &self.config.alert_thresholds;
        let agents = self.agents.read();
        let mut summary = AlertSummary::default();
        for m in agents.values() {
            if m.average_processing_time_ms > t.max_processing_time_ms as f64 {
                summary.high_processing_time += 1;
            }
            if m.error_rate > t.max_error_rate {
                summary.high_error_rate += 1;
            }
            if m.total_errors > t.max_errors {
                summary.high_error_count += 1;
            }
            if m.memory_usage > t.max_memory_bytes {
                summary.high_memory_usage += 1;
            }
            if m.current_load > t.max_load {
                summary.high_load += 1;
            }
            if duration_ms(m.uptime()) < t.min_uptime_ms {
                summary.low_uptime += 1;
            }
        }
        summary
    }

    pub fn export_json(&self) -> AgentResult<String> {
        let metrics = self.all_metrics();
        let export = MetricsExport {
            timestamp: Utc::now().to_rfc3339(),
            metrics: &metrics,
            system: self.system_metrics(),
            alerts: self.alert_summary(),
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }

    pub fn export_csv(&self) -> String {
        let mut out = String::from(
            "agent_id,total_selections,total_requests,average_processing_time_ms,total_errors,\
             error_rate,memory_usage,current_load,active_connections,uptime_ms,last_selected_at,last_error_at",
        );
        for m in self.all_metrics() {
            let _ = write!(
                out,
                "\n{},{},{},{:.2},{},{:.4},{},{:.3},{},{},{},{}",
                m.agent_id,
                m.total_selections,
                m.total_requests,
                m.average_processing_time_ms,
                m.total_errors,
                m.error_rate,
                m.memory_usage,
                m.current_load,
                m.active_connections,
                m.uptime_ms,
                m.last_selected_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
                m.last_error_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            );
        }
        out
    }

    /// Refresh uptimes and publish `MetricsCollected` every
    /// `collection_interval`. Stops once the collector is dropped.
    pub fn spawn_collection(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.collection_interval().max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(collector) = weak.upgrade() else {
                    break;
                };
                collector.collect();
            }
        })
    }

    fn collect(&self) {
        let (agents, total_selections, total_errors) = {
            let mut arena = self.agents.write();
            let mut selections = 0;
            let mut errors = 0;
            for (_, m) in arena.iter_mut() {
                m.refresh_uptime();
                selections += m.total_selections;
                errors += m.total_errors;
            }
            (arena.len(), selections, errors)
        };
        debug!(agents, total_selections, total_errors, "metrics collected");
        self.events.publish(OrchestratorEvent::MetricsCollected {
            agents,
            total_selections,
            total_errors,
        });
    }
}

fn alert(metrics: &AgentMetrics, kind: AlertKind, value: f64, threshold: f64) -> Alert {
    Alert {
        agent_id: metrics.agent_id.clone(),
        kind,
        value,
        threshold,
    }
}
