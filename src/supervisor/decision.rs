//! Operational decisions and the external decision provider seam

use crate::error::Result;
use crate::predicate::Predicate;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    ResourceAllocation,
    ConflictResolution,
    EmergencyResponse,
    LoadBalancing,
    AgentCoordination,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionType::ResourceAllocation => "resource_allocation",
            DecisionType::ConflictResolution => "conflict_resolution",
            DecisionType::EmergencyResponse => "emergency_response",
            DecisionType::LoadBalancing => "load_balancing",
            DecisionType::AgentCoordination => "agent_coordination",
        }
    }
}

impl std::fmt::Display for DecisionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Pending,
    Executed,
    /// Constraints did not hold
    Rejected,
    /// Never became urgent within its time to live
    Expired,
    /// Commands could not be dispatched
    Failed,
}

/// Who produced the executed plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Provider,
    LocalFallback,
}

/// A decision awaiting (or done with) execution
#[derive(Debug, Clone, Serialize)]
pub struct OperationalDecision {
    pub id: String,
    #[serde(rename = "type")]
    pub decision_type: DecisionType,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub affected_agents: Vec<String>,
    pub decision_data: Value,
    pub confidence_score: f64,
    /// Must hold over `decision_data` for the decision to execute
    pub constraints: Option<Predicate>,
    pub status: DecisionStatus,
    pub executed_by: Option<DecisionSource>,
    pub execution_result: Option<Value>,
    #[serde(skip)]
    pub(crate) submitted_at: Instant,
}

impl OperationalDecision {
    pub fn new(
        decision_type: DecisionType,
        description: impl Into<String>,
        affected_agents: Vec<String>,
        decision_data: Value,
        confidence_score: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            decision_type,
            description: description.into(),
            timestamp: Utc::now(),
            affected_agents,
            decision_data,
            confidence_score: confidence_score.clamp(0.0, 1.0),
            constraints: None,
            status: DecisionStatus::Pending,
            executed_by: None,
            execution_result: None,
            submitted_at: Instant::now(),
        }
    }

    pub fn with_constraints(mut self, constraints: Predicate) -> Self {
        self.constraints = Some(constraints);
        self
    }

    pub fn age(&self) -> Duration {
        self.submitted_at.elapsed()
    }

    pub fn constraints_hold(&self) -> bool {
        self.constraints
            .as_ref()
            .map_or(true, |c| c.evaluate(&self.decision_data))
    }
}

/// What the decision provider is asked about
#[derive(Debug, Clone, Serialize)]
pub struct DecisionContext {
    pub decision_id: String,
    pub decision_type: DecisionType,
    pub affected_agents: Vec<String>,
    pub decision_data: Value,
    pub system_metrics: HashMap<String, f64>,
}

impl DecisionContext {
    pub fn for_decision(decision: &OperationalDecision, system_metrics: HashMap<String, f64>) -> Self {
        Self {
            decision_id: decision.id.clone(),
            decision_type: decision.decision_type,
            affected_agents: decision.affected_agents.clone(),
            decision_data: decision.decision_data.clone(),
            system_metrics,
        }
    }
}

/// Structured answer from a decision provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDecision {
    pub action: String,
    pub confidence: f64,
    #[serde(default)]
    pub execution_plan: Vec<String>,
    #[serde(default)]
    pub rollback_plan: Vec<String>,
    #[serde(default)]
    pub monitoring_metrics: Vec<String>,
}

/// External decision provider. Treated as a black box with a timeout.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    async fn evaluate(&self, context: &DecisionContext) -> Result<ProviderDecision>;
}

/// Typed result of consulting the provider
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionOutcome {
    Decided(ProviderDecision),
    Timeout,
    ProviderError(String),
}

/// Ask the provider, bounded by `timeout`
pub async fn consult(
    provider: &dyn DecisionProvider,
    context: &DecisionContext,
    timeout: Duration,
) -> DecisionOutcome {
    match tokio::time::timeout(timeout, provider.evaluate(context)).await {
        Ok(Ok(decision)) => DecisionOutcome::Decided(decision),
        Ok(Err(e)) => DecisionOutcome::ProviderError(e.to_string()),
        Err(_) => DecisionOutcome::Timeout,
    }
}

/// Deterministic plan used when the provider is missing, slow or failing
pub fn local_fallback(decision: &OperationalDecision) -> ProviderDecision {
    let (action, plan): (&str, &[&str]) = match decision.decision_type {
        DecisionType::ResourceAllocation => (
            "allocate_resources",
            &["reserve_capacity", "apply_allocation"],
        ),
        DecisionType::ConflictResolution => (
            "priority_based_resolution",
            &["rank_agents_by_priority", "grant_highest_priority"],
        ),
        DecisionType::EmergencyResponse => (
            "execute_emergency_protocol",
            &["stabilize_affected_agents", "notify_operators"],
        ),
        DecisionType::LoadBalancing => (
            "redistribute_workload",
            &["drain_affected_agents", "rebalance_to_healthy_agents"],
        ),
        DecisionType::AgentCoordination => (
            "coordinate_agents",
            &["synchronize_agent_state", "confirm_coordination"],
        ),
    };

    ProviderDecision {
        action: action.to_string(),
        confidence: decision.confidence_score,
        execution_plan: plan.iter().map(|s| s.to_string()).collect(),
        rollback_plan: vec!["restore_previous_state".to_string()],
        monitoring_metrics: vec![
            "avg_response_time_ms".to_string(),
            "success_rate".to_string(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HiveError;
    use crate::predicate::CompareOp;
    use serde_json::json;

    fn decision() -> OperationalDecision {
        OperationalDecision::new(
            DecisionType::LoadBalancing,
            "rebalance",
            vec!["roxy".into()],
            json!({"risk_level": 4}),
            0.9,
        )
    }

    #[tokio::test]
    async fn test_consult_decided() {
        let mut provider = MockDecisionProvider::new();
        provider.expect_evaluate().returning(|_| {
            Ok(ProviderDecision {
                action: "shift_traffic".into(),
                confidence: 0.92,
                execution_plan: vec!["step".into()],
                rollback_plan: vec![],
                monitoring_metrics: vec![],
            })
        });

        let ctx = DecisionContext::for_decision(&decision(), HashMap::new());
        let outcome = consult(&provider, &ctx, Duration::from_secs(1)).await;
        assert!(matches!(outcome, DecisionOutcome::Decided(d) if d.action == "shift_traffic"));
    }

    #[tokio::test]
    async fn test_consult_provider_error() {
        let mut provider = MockDecisionProvider::new();
        provider
            .expect_evaluate()
            .returning(|_| Err(HiveError::Transient("model unavailable".into())));

        let ctx = DecisionContext::for_decision(&decision(), HashMap::new());
        let outcome = consult(&provider, &ctx, Duration::from_secs(1)).await;
        assert!(matches!(outcome, DecisionOutcome::ProviderError(e) if e.contains("model unavailable")));
    }

    #[test]
    fn test_fallback_is_deterministic() {
        let d = decision();
        assert_eq!(local_fallback(&d), local_fallback(&d));
        assert_eq!(local_fallback(&d).action, "redistribute_workload");
    }

    #[test]
    fn test_constraints() {
        let ok = decision().with_constraints(Predicate::condition("risk_level", CompareOp::Lt, 7));
        assert!(ok.constraints_hold());
        let blocked = decision().with_constraints(Predicate::parse("risk_level > 7").unwrap());
        assert!(!blocked.constraints_hold());
    }
}
