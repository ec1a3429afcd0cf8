//! Agent core type definitions
//!
//! Lifecycle states, registration metadata, selection requirements and
//! the work payload handed to agents.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

// ============================================================================
// Lifecycle
// ============================================================================

/// Lifecycle state of a registered agent
///
/// ```text
///  Initializing ──► Active ◄──► Inactive
///       │             │            │
///       ▼             ▼            ▼
///     Error ◄─────────┴────────────┘
///       │  ▲
///       ▼  │
///   Recovering ──► Active
///
///  every state except Shutdown ──► Shutdown (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Initializing,
    Active,
    Inactive,
    Error,
    Recovering,
    Shutdown,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 6] = [
        LifecycleState::Initializing,
        LifecycleState::Active,
        LifecycleState::Inactive,
        LifecycleState::Error,
        LifecycleState::Recovering,
        LifecycleState::Shutdown,
    ];

    /// Check if transition to target is possible
    pub fn can_transition_to(&self, target: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, target),
            (Initializing, Active)
                | (Initializing, Error)
                | (Initializing, Shutdown)
                | (Active, Inactive)
                | (Active, Error)
                | (Active, Shutdown)
                | (Inactive, Active)
                | (Inactive, Error)
                | (Inactive, Shutdown)
                | (Error, Recovering)
                | (Error, Shutdown)
                | (Recovering, Active)
                | (Recovering, Error)
                | (Recovering, Shutdown)
        )
    }

    /// Legal targets from this state
    pub fn valid_targets(&self) -> Vec<LifecycleState> {
        Self::ALL
            .into_iter()
            .filter(|s| self.can_transition_to(*s))
            .collect()
    }

    /// Whether the agent may take work
    pub fn is_active(&self) -> bool {
        matches!(self, LifecycleState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Shutdown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Initializing => "initializing",
            LifecycleState::Active => "active",
            LifecycleState::Inactive => "inactive",
            LifecycleState::Error => "error",
            LifecycleState::Recovering => "recovering",
            LifecycleState::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Metadata
// ============================================================================

/// Registration metadata for an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub id: String,
    /// Type tag grouping agents that offer the same service
    pub agent_type: String,
    pub name: String,
    pub version: String,
    /// Selection weight for the weighted strategy
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub specializations: Vec<String>,
    /// Agent types that need an active instance before this agent registers
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_true")]
    pub auto_recovery: bool,
    /// Consecutive dispatch failures tolerated before the agent is moved to `error`
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Dispatch timeout; `None` uses the manager default
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

impl AgentMetadata {
    pub fn new(id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            agent_type: agent_type.into(),
            version: "1.0.0".to_string(),
            weight: None,
            specializations: Vec::new(),
            dependencies: Vec::new(),
            auto_recovery: true,
            max_retries: default_max_retries(),
            timeout_ms: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_specialization(mut self, specialization: impl Into<String>) -> Self {
        self.specializations.push(specialization.into());
        self
    }

    pub fn with_dependency(mut self, agent_type: impl Into<String>) -> Self {
        self.dependencies.push(agent_type.into());
        self
    }

    pub fn with_auto_recovery(mut self, enabled: bool) -> Self {
        self.auto_recovery = enabled;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Optional filters applied before load balancing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRequirements {
    pub specialization: Option<String>,
    /// Minimum dotted version, compared numerically per component
    pub min_version: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Reject agents whose reported load exceeds this fraction
    pub max_load: Option<f64>,
}

impl AgentRequirements {
    pub fn is_empty(&self) -> bool {
        self.specialization.is_none()
            && self.min_version.is_none()
            && self.capabilities.is_empty()
            && self.max_load.is_none()
    }
}

/// Compare dotted version strings numerically, missing components as zero.
///
/// Non-numeric components compare as zero.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim_start_matches('v')
            .split('.')
            .map(|p| p.parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (pa, pb) = (parse(a), parse(b));
    let len = pa.len().max(pb.len());
    for i in 0..len {
        let x = pa.get(i).copied().unwrap_or(0);
        let y = pb.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

// ============================================================================
// Payload
// ============================================================================

/// Work item handed to an agent
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub enum AgentInput {
    Text(String),
    Json(serde_json::Value),
    Map(HashMap<String, serde_json::Value>),
    #[default]
    Empty,
}

impl AgentInput {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self::Json(value)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for AgentInput {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for AgentInput {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}
