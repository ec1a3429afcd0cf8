//! Agent performance metrics and alerting
//!
//! One [`AgentMetrics`] snapshot per tracked agent, held in an
//! [`IdArena`](squadron_kernel::IdArena). Every update re-checks the alert
//! thresholds and publishes an `Alert` event on breach; alerts never block
//! the caller. System-wide figures are summed from the per-agent snapshots
//! on demand.

pub mod collector;
pub mod types;

pub use collector::MetricsCollector;
pub use types::{
    AgentMetrics, AgentPerformance, AlertSummary, AlertThresholds, ApiCallSample, MetricsConfig,
    SystemMetrics,
};
