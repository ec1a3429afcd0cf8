use serde_json::json;
use squadron_foundation::manager::AgentManager;
use squadron_foundation::{
    CircuitState, LoadBalancer, LoadBalancingStrategy, Orchestrator, RecoveryOutcome,
};
use squadron_kernel::{AgentError, AgentInput, AgentMetadata, EventBus, LifecycleState};
use squadron_testing::{
    EventLog, MockAgent, MockOutcome, assert_event_emitted, fast_config, register_mock,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_removes_agent_from_rotation() {
    let manager = AgentManager::new(&fast_config(), EventBus::new());
    let mut log = EventLog::new(manager.subscribe());
    manager.load_balancer().set_strategy("financial", LoadBalancingStrategy::RoundRobin);

    let flaky = Arc::new(MockAgent::new("fin-a"));
    flaky.push_outcomes(std::iter::repeat_n(MockOutcome::Fail("ledger offline".into()), 3));
    manager
        .register_agent(flaky.clone(), AgentMetadata::new("fin-a", "financial").with_max_retries(0))
        .await
        .unwrap();
    register_mock(&manager, "fin-b", "financial").await.unwrap();

    for _ in 0..3 {
        assert!(manager.process_message("fin-a", AgentInput::Empty, &json!({})).await.is_err());
    }
    assert_eq!(manager.load_balancer().breaker_state("fin-a"), Some(CircuitState::Open));
    assert!(manager.state_machine().is_active("fin-a"));
    assert_event_emitted!(log, "circuit_state_changed");

    for _ in 0..4 {
        assert_eq!(manager.get_available_agent("financial", None).as_deref(), Some("fin-b"));
    }
    let rejected = manager.process_message("fin-a", AgentInput::Empty, &json!({})).await;
    assert!(matches!(rejected, Err(AgentError::NotAvailable { .. })));
    assert_eq!(flaky.call_count().await, 3);

    tokio::time::advance(Duration::from_millis(1100)).await;
    assert!(manager.load_balancer().is_eligible("fin-a"));
    manager
        .process_message("fin-a", AgentInput::Empty, &json!({}))
        .await
        .unwrap();
    assert_eq!(manager.load_balancer().breaker_state("fin-a"), Some(CircuitState::Closed));
}

#[tokio::test]
async fn test_all_breakers_open_exhausts_candidates() {
    let manager = AgentManager::new(&fast_config(), EventBus::new());
    let mut log = EventLog::new(manager.subscribe());
    register_mock(&manager, "gen-1", "general").await.unwrap();
    manager.load_balancer().breaker("gen-1").unwrap().open();

    assert!(manager.get_available_agent("general", None).is_none());
    assert_event_emitted!(log, "candidates_exhausted");
    assert_eq!(manager.load_balancer().stats().open_breakers, vec!["gen-1".to_string()]);
}

#[tokio::test]
async fn test_weighted_selection_through_manager() {
    let config = fast_config();
    let events = EventBus::new();
    let balancer = LoadBalancer::with_seed(config.load_balancer.clone(), events.clone(), 7);
    let manager = AgentManager::with_load_balancer(&config, events, balancer);
    for (id, weight) in [("hr-1", 1.0), ("hr-2", 2.0)] {
        manager
            .register_agent(
                Arc::new(MockAgent::new(id)),
                AgentMetadata::new(id, "hr").with_weight(weight),
            )
            .await
            .unwrap();
    }
    assert_eq!(manager.load_balancer().strategy_for("hr"), LoadBalancingStrategy::Weighted);

    let mut counts: HashMap<String, u32> = HashMap::new();
    for _ in 0..400 {
        let id = manager.get_available_agent("hr", None).unwrap();
        *counts.entry(id).or_insert(0) += 1;
    }
    let ratio = f64::from(counts["hr-2"]) / f64::from(counts["hr-1"]);
    assert!((1.4..=2.9).contains(&ratio), "ratio {ratio}");
}

#[tokio::test(start_paused = true)]
async fn test_auto_recovery_after_dispatch_failures() {
    let orchestrator = Orchestrator::new(fast_config());
    let mut log = EventLog::new(orchestrator.subscribe());
    let agent = Arc::new(MockAgent::new("fin-1"));
    agent.push_outcomes([MockOutcome::Fail("ledger offline".into())]);
    orchestrator
        .register_agent(agent.clone(), AgentMetadata::new("fin-1", "financial").with_max_retries(1))
        .await
        .unwrap();
    orchestrator.start();
    tokio::task::yield_now().await;

    let manager = orchestrator.manager();
    assert!(manager.process_message("fin-1", AgentInput::Empty, &json!({})).await.is_err());
    assert_eq!(manager.state_machine().get_state("fin-1"), Some(LifecycleState::Error));

    assert!(wait_until(|| manager.state_machine().is_active("fin-1")).await);
    assert_eq!(agent.initialize_count(), 2);
    assert_eq!(agent.shutdown_count(), 1);
    assert_event_emitted!(log, "agent_error");
    manager
        .process_message("fin-1", AgentInput::Empty, &json!({}))
        .await
        .unwrap();
    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_recovery_gives_up_after_max_attempts() {
    let manager = AgentManager::new(&fast_config(), EventBus::new());
    let mut log = EventLog::new(manager.subscribe());
    let agent = register_mock(&manager, "hr-1", "hr").await.unwrap();
    agent.set_fail_initialize(true);
    manager
        .state_machine()
        .set_state("hr-1", LifecycleState::Error, Some("crashed"))
        .unwrap();

    for attempt in 1..=3 {
        let outcome = manager.recover_agent("hr-1").await.unwrap();
        assert!(matches!(outcome, RecoveryOutcome::Failed(_)), "attempt {attempt}");
        assert_eq!(manager.state_machine().recovery_attempts("hr-1"), attempt);
        assert_eq!(manager.state_machine().get_state("hr-1"), Some(LifecycleState::Error));
    }
    assert!(matches!(
        manager.recover_agent("hr-1").await,
        Err(AgentError::RecoveryExhausted { attempts: 3, .. })
    ));
    assert!(log.count("recovery_failed") >= 4);
    assert!(!manager.state_machine().can_recover("hr-1"));
}

#[tokio::test(start_paused = true)]
async fn test_health_monitor_marks_unhealthy_agent() {
    let orchestrator = Orchestrator::new(fast_config());
    let agent = Arc::new(MockAgent::new("gen-1"));
    orchestrator
        .register_agent(agent.clone(), AgentMetadata::new("gen-1", "general").with_auto_recovery(false))
        .await
        .unwrap();
    orchestrator.start();

    agent.set_healthy(false);
    let manager = orchestrator.manager();
    assert!(
        wait_until(|| manager.state_machine().get_state("gen-1") == Some(LifecycleState::Error)).await
    );
    assert!(agent.health_check_count() >= 2);
    assert!(!manager.has_available_agent("general"));

    agent.set_healthy(true);
    assert!(wait_until(|| manager.state_machine().is_active("gen-1")).await);
    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_health_probe_errors_count_as_unhealthy() {
    let manager = AgentManager::new(&fast_config(), EventBus::new());
    let agent = register_mock(&manager, "gen-1", "general").await.unwrap();
    agent.set_health_errors(true);

    let results = manager.run_health_sweep().await;
    assert_eq!(results.get("gen-1"), Some(&false));
    let history = manager.health().get_health_history("gen-1", 10);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].errors, 1);
    assert!(history[0].details.contains("health probe failed"));
}

#[tokio::test]
async fn test_metrics_exports_cover_registered_agents() {
    let manager = AgentManager::new(&fast_config(), EventBus::new());
    register_mock(&manager, "fin-1", "financial").await.unwrap();
    register_mock(&manager, "hr-1", "hr").await.unwrap();
    manager
        .process_message("fin-1", AgentInput::text("salary"), &json!({}))
        .await
        .unwrap();

    let json = manager.metrics().export_json().unwrap();
    assert!(json.contains("fin-1") && json.contains("hr-1"));
    let csv = manager.metrics().export_csv();
    assert_eq!(csv.lines().count(), 3);
}
