use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use squadron_kernel::{AgentError, AgentInput, AgentResult, SquadAgent};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// What a [`MockAgent`] does with the next work item
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Reply `{ "agent": <label>, "input": <input> }`
    Echo,
    Reply(Value),
    /// Fail with `AgentError::ExecutionFailed(message)`
    Fail(String),
    /// Never answer; only a dispatch timeout ends the call
    Hang,
}

/// A scriptable agent.
///
/// Queued outcomes are consumed one per call; once the queue is empty the
/// fallback outcome applies to every call.
pub struct MockAgent {
    label: String,
    capabilities: Vec<String>,
    script: Mutex<VecDeque<MockOutcome>>,
    fallback: Mutex<MockOutcome>,
    delay: Mutex<Duration>,
    load: Mutex<f64>,
    memory: AtomicU64,
    healthy: AtomicBool,
    health_errors: AtomicBool,
    fail_initialize: AtomicBool,
    initialize_calls: AtomicU32,
    shutdown_calls: AtomicU32,
    health_checks: AtomicU32,
    /// Every input this agent accepted, in arrival order
    pub call_history: Arc<RwLock<Vec<AgentInput>>>,
}

impl MockAgent {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            capabilities: vec!["chat".to_string()],
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(MockOutcome::Echo),
            delay: Mutex::new(Duration::ZERO),
            load: Mutex::new(0.1),
            memory: AtomicU64::new(64 * 1024 * 1024),
            healthy: AtomicBool::new(true),
            health_errors: AtomicBool::new(false),
            fail_initialize: AtomicBool::new(false),
            initialize_calls: AtomicU32::new(0),
            shutdown_calls: AtomicU32::new(0),
            health_checks: AtomicU32::new(0),
            call_history: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_load(self, load: f64) -> Self {
        *self.load.lock() = load;
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = delay;
        self
    }

    pub fn with_fallback(self, outcome: MockOutcome) -> Self {
        *self.fallback.lock() = outcome;
        self
    }

    pub fn failing_initialize(self) -> Self {
        self.fail_initialize.store(true, Ordering::SeqCst);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queue outcomes for the next calls.
    pub fn push_outcomes(&self, outcomes: impl IntoIterator<Item = MockOutcome>) {
        self.script.lock().extend(outcomes);
    }

    pub fn set_fallback(&self, outcome: MockOutcome) {
        *self.fallback.lock() = outcome;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Make health probes fail with an error instead of answering.
    pub fn set_health_errors(&self, failing: bool) {
        self.health_errors.store(failing, Ordering::SeqCst);
    }

    pub fn set_fail_initialize(&self, failing: bool) {
        self.fail_initialize.store(failing, Ordering::SeqCst);
    }

    pub fn set_load(&self, load: f64) {
        *self.load.lock() = load;
    }

    pub fn set_memory(&self, bytes: u64) {
        self.memory.store(bytes, Ordering::SeqCst);
    }

    pub async fn history(&self) -> Vec<AgentInput> {
        self.call_history.read().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.call_history.read().await.len()
    }

    pub fn initialize_count(&self) -> u32 {
        self.initialize_calls.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> u32 {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    pub fn health_check_count(&self) -> u32 {
        self.health_checks.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> MockOutcome {
        match self.script.lock().pop_front() {
            Some(outcome) => outcome,
            None => self.fallback.lock().clone(),
        }
    }
}

#[async_trait]
impl SquadAgent for MockAgent {
    async fn accept(&self, input: AgentInput, _context: &Value) -> AgentResult<Value> {
        self.call_history.write().await.push(input.clone());
        let outcome = self.next_outcome();
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match outcome {
            MockOutcome::Echo => Ok(json!({
                "agent": self.label,
                "input": serde_json::to_value(&input).unwrap_or(Value::Null),
            })),
            MockOutcome::Reply(value) => Ok(value),
            MockOutcome::Fail(message) => Err(AgentError::ExecutionFailed(message)),
            MockOutcome::Hang => {
                std::future::pending::<()>().await;
                Ok(Value::Null)
            }
        }
    }

    async fn is_healthy(&self) -> AgentResult<bool> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        if self.health_errors.load(Ordering::SeqCst) {
            return Err(AgentError::ExecutionFailed("health endpoint unreachable".into()));
        }
        Ok(self.healthy.load(Ordering::SeqCst))
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    fn current_load(&self) -> f64 {
        *self.load.lock()
    }

    fn memory_usage(&self) -> u64 {
        self.memory.load(Ordering::SeqCst)
    }

    async fn initialize(&self) -> AgentResult<()> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(AgentError::ExecutionFailed(format!("{} failed to start", self.label)));
        }
        Ok(())
    }

    async fn shutdown(&self) -> AgentResult<()> {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
