//! Agent capability contract
//!
//! Every pluggable agent implements [`SquadAgent`]. The trait is the only
//! thing the orchestration core knows about an agent: it can take work,
//! report health, list its capabilities, and report load and memory use.
//! Variants are independent types selected at registration time; there is
//! no shared base state.
//!
//! ```rust,ignore
//! use squadron_kernel::agent::prelude::*;
//!
//! struct EchoAgent;
//!
//! #[async_trait]
//! impl SquadAgent for EchoAgent {
//!     async fn accept(&self, input: AgentInput, _ctx: &serde_json::Value) -> AgentResult<serde_json::Value> {
//!         Ok(serde_json::json!({ "echo": input.as_text() }))
//!     }
//!     async fn is_healthy(&self) -> AgentResult<bool> { Ok(true) }
//!     fn capabilities(&self) -> Vec<String> { vec!["echo".into()] }
//!     fn current_load(&self) -> f64 { 0.0 }
//!     fn memory_usage(&self) -> u64 { 0 }
//! }
//! ```

pub mod error;
pub mod types;

use async_trait::async_trait;

pub use error::{AgentError, AgentResult};
pub use types::{AgentInput, AgentMetadata, AgentRequirements, LifecycleState};

/// Capability set every agent exposes to the orchestrator
///
/// Methods take `&self`; agents are shared behind `Arc` and dispatched
/// concurrently, so implementations keep their own interior mutability.
#[async_trait]
pub trait SquadAgent: Send + Sync + 'static {
    /// Process one unit of work.
    async fn accept(
        &self,
        input: AgentInput,
        context: &serde_json::Value,
    ) -> AgentResult<serde_json::Value>;

    /// Primary health probe. May fail or hang; callers bound it with a timeout.
    async fn is_healthy(&self) -> AgentResult<bool>;

    fn capabilities(&self) -> Vec<String>;

    /// Current load as a fraction in `[0, 1]`
    fn current_load(&self) -> f64;

    /// Resident memory in bytes
    fn memory_usage(&self) -> u64;

    /// Called once during registration, before the agent becomes active.
    async fn initialize(&self) -> AgentResult<()> {
        Ok(())
    }

    /// Called on unregistration and restart.
    async fn shutdown(&self) -> AgentResult<()> {
        Ok(())
    }
}

pub mod prelude {
    pub use super::SquadAgent;
    pub use super::error::{AgentError, AgentResult};
    pub use super::types::{AgentInput, AgentMetadata, AgentRequirements, LifecycleState};
    pub use async_trait::async_trait;
}
