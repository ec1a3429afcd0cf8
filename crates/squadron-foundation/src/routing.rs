//! Rule-based routing of classified intents to agent types
//!
//! Enabled [`RoutingRule`]s are evaluated in priority order (ties keep
//! registration order). The first matching rule whose agent type has an
//! available instance wins with the classifier's confidence unchanged.
//! Otherwise the router falls back, in order, to the domain mapping, the
//! classifier's suggested agent and finally a global fallback type, each
//! with reduced confidence.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use squadron_kernel::{AgentError, AgentResult, EventBus, OrchestratorEvent};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DOMAIN_ROUTE_ESTIMATE_MS: u64 = 2000;
const SUGGESTED_ROUTE_ESTIMATE_MS: u64 = 2500;
const FALLBACK_ROUTE_ESTIMATE_MS: u64 = 3000;

/// Answers whether an agent type currently has a live instance.
pub trait AgentDirectory: Send + Sync {
    fn is_type_available(&self, agent_type: &str) -> bool;
}

impl<F> AgentDirectory for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_type_available(&self, agent_type: &str) -> bool {
        self(agent_type)
    }
}

// ============================================================================
// Rules
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutePriority {
    High,
    #[default]
    Normal,
    Low,
}

impl RoutePriority {
    fn rank(self) -> u8 {
        match self {
            Self::High => 3,
            Self::Normal => 2,
            Self::Low => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for RoutePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    Contains,
    Exists,
    NotExists,
    GreaterThan,
    LessThan,
}

/// Predicate over one dotted path of the conversation context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextCondition {
    /// Dotted path, e.g. `"user.profile.tier"`; numeric segments index arrays
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub description: String,
}

impl ContextCondition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: Option<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            description: String::new(),
        }
    }

    pub fn evaluate(&self, context: &Value) -> bool {
        let actual = lookup_path(context, &self.field);
        let expected = self.value.as_ref();
        match self.operator {
            ConditionOperator::Exists => actual.is_some_and(|v| !v.is_null()),
            ConditionOperator::NotExists => actual.is_none_or(Value::is_null),
            ConditionOperator::Equals => match (actual, expected) {
                (Some(a), Some(e)) => values_equal(a, e),
                _ => false,
            },
            ConditionOperator::Contains => match (actual, expected) {
                (Some(Value::String(a)), Some(Value::String(e))) => a.contains(e.as_str()),
                (Some(Value::Array(items)), Some(e)) => items.iter().any(|i| values_equal(i, e)),
                _ => false,
            },
            ConditionOperator::GreaterThan => compare_numbers(actual, expected, |a, e| a > e),
            ConditionOperator::LessThan => compare_numbers(actual, expected, |a, e| a < e),
        }
    }
}

fn lookup_path<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(context, |value, segment| match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn compare_numbers(actual: Option<&Value>, expected: Option<&Value>, cmp: fn(f64, f64) -> bool) -> bool {
    match (actual.and_then(Value::as_f64), expected.and_then(Value::as_f64)) {
        (Some(a), Some(e)) => cmp(a, e),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: String,
    pub name: String,
    /// Empty matches any intent
    #[serde(default)]
    pub intents: Vec<String>,
    /// Empty matches any domain
    #[serde(default)]
    pub domains: Vec<String>,
    pub agent_type: String,
    #[serde(default)]
    pub priority: RoutePriority,
    #[serde(default)]
    pub min_confidence: f64,
    #[serde(default)]
    pub max_confidence: Option<f64>,
    /// All must hold
    #[serde(default)]
    pub context_conditions: Vec<ContextCondition>,
    #[serde(default)]
    pub estimated_time_ms: u64,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
}

fn enabled_by_default() -> bool {
    true
}

impl RoutingRule {
    pub fn new(id: impl Into<String>, name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            intents: Vec::new(),
            domains: Vec::new(),
            agent_type: agent_type.into(),
            priority: RoutePriority::Normal,
            min_confidence: 0.0,
            max_confidence: None,
            context_conditions: Vec::new(),
            estimated_time_ms: 0,
            enabled: true,
            description: String::new(),
        }
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intents.push(intent.into());
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domains.push(domain.into());
        self
    }

    pub fn with_priority(mut self, priority: RoutePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_min_confidence(mut self, confidence: f64) -> Self {
        self.min_confidence = confidence;
        self
    }

    pub fn with_max_confidence(mut self, confidence: f64) -> Self {
        self.max_confidence = Some(confidence);
        self
    }

    pub fn with_condition(mut self, condition: ContextCondition) -> Self {
        self.context_conditions.push(condition);
        self
    }

    pub fn with_estimated_time_ms(mut self, estimate: u64) -> Self {
        self.estimated_time_ms = estimate;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Reasons this rule does not match; empty when it does.
    pub fn mismatches(&self, intent: &IntentClassification, context: &Value) -> Vec<String> {
        let mut reasons = Vec::new();
        if !self.enabled {
            reasons.push("rule disabled".to_string());
        }
        if !self.intents.is_empty() && !self.intents.contains(&intent.intent) {
            reasons.push(format!("intent {} not listed", intent.intent));
        }
        if !self.domains.is_empty() && !self.domains.contains(&intent.domain) {
            reasons.push(format!("domain {} not listed", intent.domain));
        }
        if intent.confidence < self.min_confidence {
            reasons.push(format!(
                "confidence {} below {}",
                intent.confidence, self.min_confidence
            ));
        }
        if let Some(max) = self.max_confidence {
            if intent.confidence > max {
                reasons.push(format!("confidence {} above {max}", intent.confidence));
            }
        }
        for condition in &self.context_conditions {
            if !condition.evaluate(context) {
                reasons.push(format!("condition on {} failed", condition.field));
            }
        }
        reasons
    }

    pub fn matches(&self, intent: &IntentClassification, context: &Value) -> bool {
        self.enabled
            && (self.intents.is_empty() || self.intents.contains(&intent.intent))
            && (self.domains.is_empty() || self.domains.contains(&intent.domain))
            && intent.confidence >= self.min_confidence
            && self.max_confidence.is_none_or(|max| intent.confidence <= max)
            && self.context_conditions.iter().all(|c| c.evaluate(context))
    }
}

/// Problems with a rule; empty when the rule is usable.
pub fn validate_rule(rule: &RoutingRule) -> Vec<String> {
    let mut errors = Vec::new();
    if rule.id.trim().is_empty() {
        errors.push("rule id is required".to_string());
    }
    if rule.name.trim().is_empty() {
        errors.push("rule name is required".to_string());
    }
    if rule.agent_type.trim().is_empty() {
        errors.push("agent type is required".to_string());
    }
    if rule.intents.is_empty() && rule.domains.is_empty() {
        errors.push("rule must specify at least one intent or domain".to_string());
    }
    if !(0.0..=1.0).contains(&rule.min_confidence) {
        errors.push("min confidence must be between 0 and 1".to_string());
    }
    if let Some(max) = rule.max_confidence {
        if !(0.0..=1.0).contains(&max) {
            errors.push("max confidence must be between 0 and 1".to_string());
        }
        if rule.min_confidence > max {
            errors.push("min confidence cannot exceed max confidence".to_string());
        }
    }
    errors
}

// ============================================================================
// Requests and routes
// ============================================================================

/// Output of an upstream intent classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentClassification {
    pub intent: String,
    pub domain: String,
    pub confidence: f64,
    #[serde(default)]
    pub suggested_agent: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl IntentClassification {
    pub fn new(intent: impl Into<String>, domain: impl Into<String>, confidence: f64) -> Self {
        Self {
            intent: intent.into(),
            domain: domain.into(),
            confidence,
            suggested_agent: None,
            reasoning: None,
        }
    }

    pub fn with_suggested_agent(mut self, agent_type: impl Into<String>) -> Self {
        self.suggested_agent = Some(agent_type.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "rule_id", rename_all = "snake_case")]
pub enum RouteSource {
    Rule(String),
    Domain,
    Suggested,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRoute {
    pub agent_type: String,
    pub priority: RoutePriority,
    pub confidence: f64,
    pub reason: String,
    pub estimated_time_ms: u64,
    pub source: RouteSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub fallback_agent_type: String,
    pub domain_confidence_factor: f64,
    pub suggestion_confidence_factor: f64,
    pub fallback_confidence: f64,
    /// Domain name to agent type
    pub domain_mapping: HashMap<String, String>,
    pub rules: Vec<RoutingRule>,
}

pub fn default_domain_mapping() -> HashMap<String, String> {
    [
        ("financial", "financial"),
        ("marketing", "marketing_sales"),
        ("hr", "hr"),
        ("system", "general"),
        ("general", "general"),
    ]
    .into_iter()
    .map(|(domain, agent_type)| (domain.to_string(), agent_type.to_string()))
    .collect()
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            fallback_agent_type: "general".to_string(),
            domain_confidence_factor: 0.8,
            suggestion_confidence_factor: 0.7,
            fallback_confidence: 0.3,
            domain_mapping: default_domain_mapping(),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingMetrics {
    pub total_routes: u64,
    pub successful_routes: u64,
    pub failed_routes: u64,
    pub average_routing_time_ms: f64,
    pub routes_by_agent: HashMap<String, u64>,
    pub routes_by_priority: HashMap<String, u64>,
    pub routes_by_intent: HashMap<String, u64>,
    pub last_reset: DateTime<Utc>,
}

impl Default for RoutingMetrics {
    fn default() -> Self {
        Self {
            total_routes: 0,
            successful_routes: 0,
            failed_routes: 0,
            average_routing_time_ms: 0.0,
            routes_by_agent: HashMap::new(),
            routes_by_priority: HashMap::new(),
            routes_by_intent: HashMap::new(),
            last_reset: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleEvaluation {
    pub rule_id: String,
    pub matched: bool,
    pub agent_available: bool,
    pub reasons: Vec<String>,
}

/// Dry run of [`AgentRouter::route`]; touches no metrics.
#[derive(Debug, Clone, Serialize)]
pub struct RouteDebug {
    pub rules: Vec<RuleEvaluation>,
    pub domain_agent_type: Option<String>,
    pub domain_available: bool,
    pub suggested_available: bool,
    pub fallback_available: bool,
    pub final_route: Option<AgentRoute>,
}

// ============================================================================
// Router
// ============================================================================

pub struct AgentRouter {
    config: RouterConfig,
    rules: RwLock<Vec<RoutingRule>>,
    domain_mapping: RwLock<HashMap<String, String>>,
    directory: Arc<dyn AgentDirectory>,
    metrics: Mutex<RoutingMetrics>,
    events: EventBus,
}

impl AgentRouter {
    /// Rules from `config` that fail validation are skipped with a warning.
    pub fn new(config: RouterConfig, directory: Arc<dyn AgentDirectory>, events: EventBus) -> Self {
        let router = Self {
            domain_mapping: RwLock::new(config.domain_mapping.clone()),
            rules: RwLock::new(Vec::new()),
            config,
            directory,
            metrics: Mutex::new(RoutingMetrics::default()),
            events,
        };
        for rule in router.config.rules.clone() {
            let rule_id = rule.id.clone();
            if let Err(err) = router.add_rule(rule) {
                warn!(%rule_id, error = %err, "routing rule skipped");
            }
        }
        router
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn add_rule(&self, rule: RoutingRule) -> AgentResult<()> {
        let errors = validate_rule(&rule);
        if !errors.is_empty() {
            return Err(AgentError::Config(format!("rule {}: {}", rule.id, errors.join("; "))));
        }
        let mut rules = self.rules.write();
        if rules.iter().any(|r| r.id == rule.id) {
            return Err(AgentError::Config(format!("rule {} already exists", rule.id)));
        }
        debug!(rule_id = %rule.id, agent_type = %rule.agent_type, priority = %rule.priority, "routing rule added");
        rules.push(rule);
        Ok(())
    }

    /// Replace a rule in place, keeping its registration position.
    pub fn update_rule(&self, rule: RoutingRule) -> AgentResult<()> {
        let errors = validate_rule(&rule);
        if !errors.is_empty() {
            return Err(AgentError::Config(format!("rule {}: {}", rule.id, errors.join("; "))));
        }
        let mut rules = self.rules.write();
        let slot = rules
            .iter_mut()
            .find(|r| r.id == rule.id)
            .ok_or_else(|| AgentError::NotFound(format!("routing rule {}", rule.id)))?;
        *slot = rule;
        Ok(())
    }

    pub fn remove_rule(&self, rule_id: &str) -> Option<RoutingRule> {
        let mut rules = self.rules.write();
        let index = rules.iter().position(|r| r.id == rule_id)?;
        Some(rules.remove(index))
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<RoutingRule> {
        self.rules.read().iter().find(|r| r.id == rule_id).cloned()
    }

    /// All rules in registration order
    pub fn rules(&self) -> Vec<RoutingRule> {
        self.rules.read().clone()
    }

    pub fn validate_rule(&self, rule: &RoutingRule) -> Vec<String> {
        validate_rule(rule)
    }

    pub fn set_domain_mapping(&self, domain: impl Into<String>, agent_type: impl Into<String>) {
        self.domain_mapping.write().insert(domain.into(), agent_type.into());
    }

    /// Matching rules, highest priority first, ties in registration order.
    fn matching_rules(&self, intent: &IntentClassification, context: &Value) -> Vec<RoutingRule> {
        let mut matching: Vec<RoutingRule> = self
            .rules
            .read()
            .iter()
            .filter(|r| r.matches(intent, context))
            .cloned()
            .collect();
        matching.sort_by_key(|r| std::cmp::Reverse(r.priority.rank()));
        matching
    }

    fn resolve(&self, intent: &IntentClassification, context: &Value) -> Option<AgentRoute> {
        for rule in self.matching_rules(intent, context) {
            if self.directory.is_type_available(&rule.agent_type) {
                return Some(AgentRoute {
                    reason: if rule.description.is_empty() {
                        rule.name.clone()
                    } else {
                        format!("{}: {}", rule.name, rule.description)
                    },
                    agent_type: rule.agent_type,
                    priority: rule.priority,
                    confidence: intent.confidence,
                    estimated_time_ms: rule.estimated_time_ms,
                    source: RouteSource::Rule(rule.id),
                });
            }
        }

        let domain_type = self.domain_mapping.read().get(&intent.domain).cloned();
        if let Some(agent_type) = domain_type {
            if self.directory.is_type_available(&agent_type) {
                return Some(AgentRoute {
                    agent_type,
                    priority: RoutePriority::Normal,
                    confidence: intent.confidence * self.config.domain_confidence_factor,
                    reason: format!("domain routing: {}", intent.domain),
                    estimated_time_ms: DOMAIN_ROUTE_ESTIMATE_MS,
                    source: RouteSource::Domain,
                });
            }
        }

        if let Some(suggested) = &intent.suggested_agent {
            if self.directory.is_type_available(suggested) {
                return Some(AgentRoute {
                    agent_type: suggested.clone(),
                    priority: RoutePriority::Normal,
                    confidence: intent.confidence * self.config.suggestion_confidence_factor,
                    reason: format!("classifier suggested {suggested}"),
                    estimated_time_ms: SUGGESTED_ROUTE_ESTIMATE_MS,
                    source: RouteSource::Suggested,
                });
            }
        }

        let fallback = &self.config.fallback_agent_type;
        if self.directory.is_type_available(fallback) {
            return Some(AgentRoute {
                agent_type: fallback.clone(),
                priority: RoutePriority::Low,
                confidence: self.config.fallback_confidence,
                reason: format!("fallback to {fallback}"),
                estimated_time_ms: FALLBACK_ROUTE_ESTIMATE_MS,
                source: RouteSource::Fallback,
            });
        }
        None
    }

    /// Pick an agent type for `intent`. `None` means nothing along the
    /// fallback chain has an available agent.
    pub fn route(&self, intent: &IntentClassification, context: &Value) -> Option<AgentRoute> {
        let started = Instant::now();
        let route = self.resolve(intent, context);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        {
            let mut metrics = self.metrics.lock();
            metrics.total_routes += 1;
            let n = metrics.total_routes as f64;
            let average = metrics.average_routing_time_ms;
            metrics.average_routing_time_ms = average + (elapsed_ms - average) / n;
            match &route {
                Some(route) => {
                    metrics.successful_routes += 1;
                    *metrics.routes_by_agent.entry(route.agent_type.clone()).or_insert(0) += 1;
                    *metrics
                        .routes_by_priority
                        .entry(route.priority.to_string())
                        .or_insert(0) += 1;
                    *metrics.routes_by_intent.entry(intent.intent.clone()).or_insert(0) += 1;
                }
                None => metrics.failed_routes += 1,
            }
        }

        match &route {
            Some(route) => {
                info!(intent = %intent.intent, agent_type = %route.agent_type, priority = %route.priority, confidence = route.confidence, "intent routed");
                self.events.publish(OrchestratorEvent::Routed {
                    intent: intent.intent.clone(),
                    agent_type: route.agent_type.clone(),
                    priority: route.priority.to_string(),
                    confidence: route.confidence,
                });
            }
            None => {
                warn!(intent = %intent.intent, domain = %intent.domain, "no available agent for intent");
                self.events.publish(OrchestratorEvent::RoutingFailed {
                    intent: intent.intent.clone(),
                });
            }
        }
        route
    }

    pub fn try_route(&self, intent: &IntentClassification, context: &Value) -> AgentResult<AgentRoute> {
        self.route(intent, context)
            .ok_or_else(|| AgentError::RoutingExhausted(intent.intent.clone()))
    }

    pub fn debug_route(&self, intent: &IntentClassification, context: &Value) -> RouteDebug {
        let mut rules: Vec<RuleEvaluation> = self
            .rules
            .read()
            .iter()
            .map(|rule| {
                let reasons = rule.mismatches(intent, context);
                RuleEvaluation {
                    rule_id: rule.id.clone(),
                    matched: reasons.is_empty(),
                    agent_available: self.directory.is_type_available(&rule.agent_type),
                    reasons,
                }
            })
            .collect();
        rules.sort_by_key(|e| !e.matched);

        let domain_agent_type = self.domain_mapping.read().get(&intent.domain).cloned();
        RouteDebug {
            domain_available: domain_agent_type
                .as_deref()
                .is_some_and(|t| self.directory.is_type_available(t)),
            domain_agent_type,
            suggested_available: intent
                .suggested_agent
                .as_deref()
                .is_some_and(|t| self.directory.is_type_available(t)),
            fallback_available: self
                .directory
                .is_type_available(&self.config.fallback_agent_type),
            final_route: self.resolve(intent, context),
            rules,
        }
    }

    pub fn metrics(&self) -> RoutingMetrics {
        self.metrics.lock().clone()
    }

    pub fn reset_metrics(&self) {
        *self.metrics.lock() = RoutingMetrics::default();
        debug!("routing metrics reset");
    }

    pub fn success_rate(&self) -> f64 {
        let metrics = self.metrics.lock();
        if metrics.total_routes == 0 {
            0.0
        } else {
            metrics.successful_routes as f64 / metrics.total_routes as f64
        }
    }

    /// Successful routes that landed on `agent_type`
    pub fn agent_load(&self, agent_type: &str) -> u64 {
        self.metrics
            .lock()
            .routes_by_agent
            .get(agent_type)
            .copied()
            .unwrap_or(0)
    }
}
