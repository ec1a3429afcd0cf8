use serde_json::json;
use squadron_foundation::{
    ConditionOperator, ContextCondition, IntentClassification, Orchestrator, OrchestratorConfig,
    RoutePriority, RouteSource, RoutingRule,
};
use squadron_kernel::config::Format;
use squadron_kernel::{AgentError, AgentInput, AgentMetadata, AgentRequirements};
use squadron_testing::{
    EventLog, MockAgent, MockOutcome, assert_event_emitted, fast_config, init_test_logging,
    register_mock,
};
use std::sync::Arc;
use std::time::Duration;

fn expense_rule() -> RoutingRule {
    RoutingRule::new("expenses", "Expense tracking", "financial")
        .with_intent("add_expense")
        .with_priority(RoutePriority::High)
        .with_min_confidence(0.7)
}

fn add_expense() -> IntentClassification {
    IntentClassification::new("add_expense", "financial", 0.9)
}

#[tokio::test]
async fn test_rule_route_dispatches_to_agent() {
    init_test_logging();
    let orchestrator = Orchestrator::new(fast_config());
    let mut log = EventLog::new(orchestrator.subscribe());
    let fin = register_mock(orchestrator.manager(), "fin-1", "financial").await.unwrap();
    orchestrator.router().add_rule(expense_rule()).unwrap();

    let submission = orchestrator
        .submit(&add_expense(), &json!({ "user": { "id": "u-1" } }), AgentInput::text("coffee 3.20"))
        .await
        .unwrap();

    assert_eq!(submission.agent_id, "fin-1");
    assert_eq!(submission.route.priority, RoutePriority::High);
    assert_eq!(submission.route.source, RouteSource::Rule("expenses".into()));
    assert!((submission.route.confidence - 0.9).abs() < 1e-9);
    assert_eq!(submission.attempts, 1);
    assert_eq!(submission.output["agent"], "fin-1");
    assert_eq!(fin.call_count().await, 1);

    assert_event_emitted!(log, "routed");
    assert_event_emitted!(log, "agent_selected");
    let metrics = orchestrator.manager().metrics().get_metrics("fin-1").unwrap();
    assert_eq!(metrics.total_selections, 1);
    assert_eq!(metrics.total_requests, 1);
}

#[tokio::test]
async fn test_suggested_agent_when_no_rule_or_domain() {
    let mut config = fast_config();
    config.router.domain_mapping.clear();
    let orchestrator = Orchestrator::new(config);
    register_mock(orchestrator.manager(), "fin-1", "financial").await.unwrap();

    let intent = add_expense().with_suggested_agent("financial");
    let submission = orchestrator
        .submit(&intent, &json!({}), AgentInput::Empty)
        .await
        .unwrap();
    assert_eq!(submission.route.source, RouteSource::Suggested);
    assert_eq!(submission.route.priority, RoutePriority::Normal);
    assert!((submission.route.confidence - 0.63).abs() < 1e-9);
}

#[tokio::test]
async fn test_global_fallback() {
    let orchestrator = Orchestrator::new(fast_config());
    register_mock(orchestrator.manager(), "gen-1", "general").await.unwrap();

    let intent = IntentClassification::new("weather", "smalltalk", 0.95);
    let submission = orchestrator
        .submit(&intent, &json!({}), AgentInput::text("will it rain?"))
        .await
        .unwrap();
    assert_eq!(submission.agent_id, "gen-1");
    assert_eq!(submission.route.priority, RoutePriority::Low);
    assert!((submission.route.confidence - 0.3).abs() < 1e-9);
}

#[tokio::test]
async fn test_unroutable_when_nothing_is_available() {
    let orchestrator = Orchestrator::new(fast_config());
    let mut log = EventLog::new(orchestrator.subscribe());
    orchestrator.router().add_rule(expense_rule()).unwrap();

    let result = orchestrator
        .submit(&add_expense().with_suggested_agent("financial"), &json!({}), AgentInput::Empty)
        .await;
    assert!(matches!(result, Err(AgentError::RoutingExhausted(_))));
    assert_event_emitted!(log, "routing_failed");
    assert_eq!(orchestrator.router().metrics().failed_routes, 1);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let orchestrator = Orchestrator::new(fast_config());
    let agent = register_mock(orchestrator.manager(), "gen-a", "general").await.unwrap();
    agent.push_outcomes([MockOutcome::Fail("upstream returned status 503".into())]);

    let submission = orchestrator
        .submit(&IntentClassification::new("chat", "general", 0.8), &json!({}), AgentInput::text("hi"))
        .await
        .unwrap();
    assert_eq!(submission.attempts, 2);
    assert_eq!(agent.call_count().await, 2);
    assert_eq!(
        orchestrator.manager().metrics().get_metrics("gen-a").unwrap().total_errors,
        1
    );
}

#[tokio::test]
async fn test_permanent_failure_surfaces_immediately() {
    let orchestrator = Orchestrator::new(fast_config());
    let agent = Arc::new(MockAgent::new("gen-a").with_fallback(MockOutcome::Fail("invalid ledger entry".into())));
    orchestrator
        .register_agent(agent.clone(), AgentMetadata::new("gen-a", "general"))
        .await
        .unwrap();

    let result = orchestrator
        .submit(&IntentClassification::new("chat", "general", 0.8), &json!({}), AgentInput::Empty)
        .await;
    assert!(matches!(result, Err(AgentError::ExecutionFailed(_))));
    assert_eq!(agent.call_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_agent_is_routed_around() {
    let orchestrator = Orchestrator::new(fast_config());
    let slow = Arc::new(
        MockAgent::new("fin-slow")
            .with_load(0.1)
            .with_fallback(MockOutcome::Hang),
    );
    orchestrator
        .register_agent(
            slow.clone(),
            AgentMetadata::new("fin-slow", "financial").with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap();
    let fast = Arc::new(MockAgent::new("fin-fast").with_load(0.5));
    orchestrator
        .register_agent(fast.clone(), AgentMetadata::new("fin-fast", "financial"))
        .await
        .unwrap();

    let submission = orchestrator
        .submit(&add_expense(), &json!({}), AgentInput::text("rent 900"))
        .await
        .unwrap();

    assert_eq!(submission.agent_id, "fin-fast");
    assert_eq!(submission.attempts, 4);
    assert_eq!(slow.call_count().await, 3);
    assert!(!orchestrator.manager().state_machine().is_active("fin-slow"));
}

#[tokio::test]
async fn test_rate_limit_rejects_before_routing() {
    let mut config = fast_config();
    config.rate_limiter.burst_limit = 2;
    let orchestrator = Orchestrator::new(config);
    register_mock(orchestrator.manager(), "gen-1", "general").await.unwrap();
    let intent = IntentClassification::new("chat", "general", 0.8);

    for _ in 0..2 {
        orchestrator.submit(&intent, &json!({}), AgentInput::Empty).await.unwrap();
    }
    let result = orchestrator.submit(&intent, &json!({}), AgentInput::Empty).await;
    assert!(matches!(result, Err(AgentError::RateLimited { .. })));
    assert_eq!(orchestrator.router().metrics().total_routes, 2);
}

#[tokio::test]
async fn test_requirements_narrow_selection() {
    let orchestrator = Orchestrator::new(fast_config());
    register_mock(orchestrator.manager(), "fin-1", "financial").await.unwrap();
    orchestrator
        .register_agent(
            Arc::new(MockAgent::new("fin-tax")),
            AgentMetadata::new("fin-tax", "financial").with_specialization("tax"),
        )
        .await
        .unwrap();

    let tax = AgentRequirements {
        specialization: Some("tax".into()),
        ..Default::default()
    };
    for _ in 0..3 {
        let submission = orchestrator
            .submit_with_requirements(&add_expense(), &json!({}), AgentInput::Empty, Some(&tax))
            .await
            .unwrap();
        assert_eq!(submission.agent_id, "fin-tax");
    }
}

#[tokio::test]
async fn test_context_conditions_pick_rule() {
    let orchestrator = Orchestrator::new(fast_config());
    register_mock(orchestrator.manager(), "fin-1", "financial").await.unwrap();
    register_mock(orchestrator.manager(), "vip-1", "concierge").await.unwrap();
    orchestrator.router().add_rule(expense_rule()).unwrap();
    orchestrator
        .router()
        .add_rule(
            RoutingRule::new("vip", "VIP desk", "concierge")
                .with_domain("financial")
                .with_priority(RoutePriority::High)
                .with_condition(ContextCondition::new(
                    "user.tier",
                    ConditionOperator::Equals,
                    Some(json!("vip")),
                )),
        )
        .unwrap();

    let regular = orchestrator
        .submit(&add_expense(), &json!({ "user": { "tier": "basic" } }), AgentInput::Empty)
        .await
        .unwrap();
    assert_eq!(regular.agent_id, "fin-1");

    orchestrator.router().remove_rule("expenses");
    let vip = orchestrator
        .submit(&add_expense(), &json!({ "user": { "tier": "vip" } }), AgentInput::Empty)
        .await
        .unwrap();
    assert_eq!(vip.agent_id, "vip-1");
}

#[tokio::test]
async fn test_rules_from_configuration() {
    let yaml = r#"
router:
  rules:
    - id: hiring
      name: Hiring requests
      intents: [open_position]
      agent_type: hr
      priority: high
rate_limiter:
  burst_limit: 50
"#;
    let config = OrchestratorConfig::from_str(yaml, Format::Yaml).unwrap();
    let orchestrator = Orchestrator::new(config);
    register_mock(orchestrator.manager(), "hr-1", "hr").await.unwrap();
    assert_eq!(orchestrator.router().rules().len(), 1);

    let submission = orchestrator
        .submit(&IntentClassification::new("open_position", "general", 0.4), &json!({}), AgentInput::Empty)
        .await
        .unwrap();
    assert_eq!(submission.agent_id, "hr-1");
    assert_eq!(submission.route.source, RouteSource::Rule("hiring".into()));
}

#[tokio::test]
async fn test_concurrent_submissions() {
    let mut config = fast_config();
    config.rate_limiter.burst_limit = 100;
    config.rate_limiter.requests_per_minute = 100;
    let orchestrator = Arc::new(Orchestrator::new(config));
    for id in ["gen-1", "gen-2", "gen-3"] {
        register_mock(orchestrator.manager(), id, "general").await.unwrap();
    }

    let handles: Vec<_> = (0..30)
        .map(|i| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .submit(
                        &IntentClassification::new("chat", "general", 0.8),
                        &json!({}),
                        AgentInput::text(format!("message {i}")),
                    )
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let system = orchestrator.manager().metrics().system_metrics();
    assert_eq!(system.total_requests, 30);
    assert_eq!(system.total_errors, 0);
    assert!(orchestrator.manager().agents().iter().all(|a| a.active_connections == 0));
}
