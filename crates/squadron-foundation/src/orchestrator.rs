//! Work submission facade
//!
//! [`Orchestrator`] wires the control flow end to end: admission through the
//! rate limiter, intent routing, instance selection through the manager's
//! load balancer, and dispatch under the retry policy. Every component is
//! built from one [`OrchestratorConfig`] and shares one [`EventBus`].

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use squadron_kernel::utils::duration_ms;
use squadron_kernel::{
    AgentError, AgentInput, AgentMetadata, AgentRequirements, AgentResult, EventBus,
    EventEnvelope, SquadAgent,
};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::manager::AgentManager;
use crate::rate_limiter::RateLimiter;
use crate::retry::{RetryPolicy, RetryProgress};
use crate::routing::{AgentDirectory, AgentRoute, AgentRouter, IntentClassification};

/// Outcome of a successful submission
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub route: AgentRoute,
    /// Agent that produced `output`
    pub agent_id: String,
    pub output: Value,
    /// Dispatch attempts, including the successful one
    pub attempts: u32,
    pub elapsed_ms: u64,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    manager: Arc<AgentManager>,
    router: AgentRouter,
    rate_limiter: RateLimiter,
    retry: RetryPolicy,
    events: EventBus,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_event_bus(config, EventBus::new())
    }

    pub fn with_event_bus(config: OrchestratorConfig, events: EventBus) -> Self {
        let manager = Arc::new(AgentManager::new(&config, events.clone()));
        Self::with_manager(config, manager)
    }

    /// Build around an existing manager, sharing its event bus.
    pub fn with_manager(config: OrchestratorConfig, manager: Arc<AgentManager>) -> Self {
        let events = manager.events().clone();
        let directory: Arc<dyn AgentDirectory> = manager.clone();
        Self {
            router: AgentRouter::new(config.router.clone(), directory, events.clone()),
            rate_limiter: RateLimiter::new(config.rate_limiter.clone()),
            retry: RetryPolicy::new(config.retry.clone()),
            manager,
            config,
            events,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<AgentManager> {
        &self.manager
    }

    pub fn router(&self) -> &AgentRouter {
        &self.router
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    /// Start background health probing, metrics collection and recovery.
    pub fn start(&self) {
        self.manager.start();
        info!(rules = self.router.rules().len(), "orchestrator started");
    }

    pub async fn register_agent(
        &self,
        handle: Arc<dyn SquadAgent>,
        metadata: AgentMetadata,
    ) -> AgentResult<()> {
        self.manager.register_agent(handle, metadata).await
    }

    pub async fn unregister_agent(&self, agent_id: &str) -> AgentResult<()> {
        self.manager.unregister_agent(agent_id).await
    }

    /// Route a classified work item and dispatch it.
    ///
    /// Fails with `RateLimited` when admission is denied and with
    /// `RoutingExhausted` when no agent type along the fallback chain is
    /// available. Dispatch failures are retried per the retry policy; each
    /// attempt selects an instance afresh, so a timed-out agent can be
    /// passed over by the balancer on the next attempt.
    pub async fn submit(
        &self,
        intent: &IntentClassification,
        context: &Value,
        input: AgentInput,
    ) -> AgentResult<Submission> {
        self.submit_with_requirements(intent, context, input, None).await
    }

    pub async fn submit_with_requirements(
        &self,
        intent: &IntentClassification,
        context: &Value,
        input: AgentInput,
        requirements: Option<&AgentRequirements>,
    ) -> AgentResult<Submission> {
        let started = Instant::now();
        self.rate_limiter.check_limit().map_err(|err| {
            warn!(intent = %intent.intent, error = %err, "submission rejected");
            AgentError::from(err)
        })?;

        let route = self.router.try_route(intent, context)?;
        let agent_type = route.agent_type.as_str();

        let mut attempts = 0u32;
        let result = self
            .retry
            .execute_with_progress(
                || {
                    let input = input.clone();
                    async move { self.dispatch_once(agent_type, requirements, input, context).await }
                },
                |progress: &RetryProgress| attempts = progress.attempts,
            )
            .await;

        match result {
            Ok((agent_id, output)) => {
                let elapsed_ms = duration_ms(started.elapsed());
                debug!(%agent_id, %agent_type, attempts, elapsed_ms, "submission completed");
                Ok(Submission {
                    route,
                    agent_id,
                    output,
                    attempts,
                    elapsed_ms,
                })
            }
            Err(err) => {
                warn!(intent = %intent.intent, %agent_type, attempts, error = %err, "submission failed");
                Err(err.into())
            }
        }
    }

    async fn dispatch_once(
        &self,
        agent_type: &str,
        requirements: Option<&AgentRequirements>,
        input: AgentInput,
        context: &Value,
    ) -> AgentResult<(String, Value)> {
        let agent_id = self
            .manager
            .get_available_agent(agent_type, requirements)
            .ok_or_else(|| AgentError::not_available(agent_type, "no eligible instance"))?;
        let output = self.manager.process_message(&agent_id, input, context).await?;
        Ok((agent_id, output))
    }

    /// Stop background tasks and unregister every agent.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }
}
