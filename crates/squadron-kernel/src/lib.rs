//! Squadron kernel
//!
//! Contracts shared by every orchestration component: the agent capability
//! trait, lifecycle states, the error taxonomy, typed events, dense id-keyed
//! storage, configuration loading and logging bootstrap. Policy lives in
//! `squadron-foundation`.

pub mod agent;
pub mod arena;
pub mod config;
pub mod event;
pub mod logging;
pub mod utils;

pub use agent::{
    AgentError, AgentInput, AgentMetadata, AgentRequirements, AgentResult, LifecycleState,
    SquadAgent,
};
pub use arena::{ArenaIndex, IdArena};
pub use event::{Alert, AlertKind, EventBus, EventEnvelope, OrchestratorEvent};
