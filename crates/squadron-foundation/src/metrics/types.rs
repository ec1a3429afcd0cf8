use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use squadron_kernel::utils::duration_ms;
use tokio::time::Instant;

/// Samples of API-call outcomes retained per agent
pub const API_SAMPLE_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub max_processing_time_ms: u64,
    /// Fraction of requests that failed
    pub max_error_rate: f64,
    pub max_errors: u64,
    pub max_memory_bytes: u64,
    pub max_load: f64,
    pub min_uptime_ms: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_processing_time_ms: 5000,
            max_error_rate: 0.1,
            max_errors: 10,
            max_memory_bytes: 500 * 1024 * 1024,
            max_load: 0.8,
            min_uptime_ms: 60 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub collection_interval_ms: u64,
    pub alert_thresholds: AlertThresholds,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            collection_interval_ms: 60_000,
            alert_thresholds: AlertThresholds::default(),
        }
    }
}

impl MetricsConfig {
    pub fn collection_interval(&self) -> Duration {
        Duration::from_millis(self.collection_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiCallSample {
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    pub status_code: u16,
    pub response_time_ms: u64,
}

/// Running counters for one agent
#[derive(Debug, Clone, Serialize)]
pub struct AgentMetrics {
    pub agent_id: String,
    pub total_selections: u64,
    /// Dispatches with a recorded processing time
    pub total_requests: u64,
    pub total_processing_time_ms: u64,
    pub average_processing_time_ms: f64,
    pub min_processing_time_ms: Option<u64>,
    pub max_processing_time_ms: u64,
    pub total_errors: u64,
    pub error_rate: f64,
    pub last_error: Option<String>,
    pub last_selected_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub memory_usage: u64,
    pub current_load: f64,
    pub active_connections: u32,
    pub uptime_ms: u64,
    pub total_api_calls: u64,
    pub api_calls_by_endpoint: HashMap<String, u64>,
    pub api_calls_by_status: HashMap<u16, u64>,
    pub api_samples: VecDeque<ApiCallSample>,
    #[serde(skip)]
    pub(crate) reset_at: Instant,
}

impl AgentMetrics {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            total_selections: 0,
            total_requests: 0,
            total_processing_time_ms: 0,
            average_processing_time_ms: 0.0,
            min_processing_time_ms: None,
            max_processing_time_ms: 0,
            total_errors: 0,
            error_rate: 0.0,
            last_error: None,
            last_selected_at: None,
            last_error_at: None,
            memory_usage: 0,
            current_load: 0.0,
            active_connections: 0,
            uptime_ms: 0,
            total_api_calls: 0,
            api_calls_by_endpoint: HashMap::new(),
            api_calls_by_status: HashMap::new(),
            api_samples: VecDeque::new(),
            reset_at: Instant::now(),
        }
    }

    pub(crate) fn add_processing_time(&mut self, elapsed_ms: u64) {
        self.total_requests += 1;
        self.total_processing_time_ms = self.total_processing_time_ms.saturating_add(elapsed_ms);
        self.average_processing_time_ms =
            self.total_processing_time_ms as f64 / self.total_requests as f64;
        self.min_processing_time_ms = Some(match self.min_processing_time_ms {
            Some(min) => min.min(elapsed_ms),
            None => elapsed_ms,
        });
        self.max_processing_time_ms = self.max_processing_time_ms.max(elapsed_ms);
        self.refresh_error_rate();
    }

    pub(crate) fn refresh_error_rate(&mut self) {
        let base = self.total_requests.max(self.total_selections);
        self.error_rate = if base == 0 {
            0.0
        } else {
            (self.total_errors as f64 / base as f64).min(1.0)
        };
    }

    pub(crate) fn push_api_sample(&mut self, sample: ApiCallSample) {
        self.total_api_calls += 1;
        *self
            .api_calls_by_endpoint
            .entry(sample.endpoint.clone())
            .or_insert(0) += 1;
        *self.api_calls_by_status.entry(sample.status_code).or_insert(0) += 1;
        if self.api_samples.len() >= API_SAMPLE_LIMIT {
            self.api_samples.pop_front();
        }
        self.api_samples.push_back(sample);
    }

    pub(crate) fn refresh_uptime(&mut self) {
        self.uptime_ms = duration_ms(self.reset_at.elapsed());
    }

    pub fn uptime(&self) -> Duration {
        self.reset_at.elapsed()
    }

    /// Zero every counter and restart the uptime clock.
    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.agent_id));
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentPerformance {
    pub agent_id: String,
    /// Composite score in `[0, 100]`
    pub score: f64,
    pub metrics: AgentMetrics,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemMetrics {
    pub total_agents: usize,
    pub total_selections: u64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub average_processing_time_ms: f64,
    pub average_memory_usage: f64,
    pub average_load: f64,
    pub total_connections: u64,
    pub error_rate: f64,
    pub selections_per_minute: f64,
    pub errors_per_minute: f64,
}

/// Number of agents currently breaching each threshold
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AlertSummary {
    pub high_processing_time: usize,
    pub high_error_rate: usize,
    pub high_error_count: usize,
    pub high_memory_usage: usize,
    pub high_load: usize,
    pub low_uptime: usize,
}
