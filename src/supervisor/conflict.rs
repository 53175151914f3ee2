//! Agent conflicts and priority-based resolution

use crate::emergency::Severity;
use crate::monitoring::{AgentRecord, AgentStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    ResourceContention,
    ContradictoryActions,
    PriorityConflict,
    DataInconsistency,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::ResourceContention => "resource_contention",
            ConflictType::ContradictoryActions => "contradictory_actions",
            ConflictType::PriorityConflict => "priority_conflict",
            ConflictType::DataInconsistency => "data_inconsistency",
        }
    }
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentConflict {
    pub id: String,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub involved_agents: Vec<String>,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    /// Contended resource, when the conflict is about one
    pub resource: Option<String>,
    pub resolution_strategy: Option<String>,
    pub winner: Option<String>,
    pub resolved: bool,
    pub escalated: bool,
    pub attempts: u32,
}

impl AgentConflict {
    pub fn new(
        conflict_type: ConflictType,
        involved_agents: Vec<String>,
        description: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conflict_type,
            involved_agents,
            description: description.into(),
            timestamp: Utc::now(),
            severity,
            resource: None,
            resolution_strategy: None,
            winner: None,
            resolved: false,
            escalated: false,
            attempts: 0,
        }
    }

    pub fn over_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResolution {
    Resolved { winner: String, strategy: &'static str },
    Unresolvable(String),
}

/// Pick the winning agent among the parties to a conflict.
///
/// Only registered, non-offline parties are eligible. Lowest `priority_level`
/// wins, ties go to the most recent heartbeat, then to the smallest id.
pub fn resolve_by_priority(conflict: &AgentConflict, agents: &[AgentRecord]) -> ConflictResolution {
    let winner = agents
        .iter()
        .filter(|a| conflict.involved_agents.contains(&a.agent_id))
        .filter(|a| a.status != AgentStatus::Offline)
        .min_by(|a, b| {
            a.priority_level
                .cmp(&b.priority_level)
                .then_with(|| b.last_heartbeat.cmp(&a.last_heartbeat))
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });

    match winner {
        Some(agent) => ConflictResolution::Resolved {
            winner: agent.agent_id.clone(),
            strategy: "priority_based",
        },
        None => ConflictResolution::Unresolvable(format!(
            "no eligible party among [{}]",
            conflict.involved_agents.join(", ")
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::AgentRegistry;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_highest_priority_wins() {
        let registry = AgentRegistry::new();
        registry.register("scheduler", "booking", vec![], 2).await;
        registry.register("roxy", "call_handler", vec![], 1).await;
        registry.register("auditor", "audit", vec![], 1).await;

        let conflict = AgentConflict::new(
            ConflictType::ResourceContention,
            vec!["scheduler".into(), "roxy".into()],
            "both want the calendar",
            Severity::Medium,
        );
        let outcome = resolve_by_priority(&conflict, &registry.snapshot().await);
        assert_eq!(
            outcome,
            ConflictResolution::Resolved {
                winner: "roxy".into(),
                strategy: "priority_based"
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_tie_goes_to_latest_heartbeat() {
        let registry = AgentRegistry::new();
        registry.register("a", "worker", vec![], 2).await;
        registry.register("b", "worker", vec![], 2).await;
        let later = Utc::now() + chrono::Duration::seconds(5);
        registry.heartbeat("b", None, Some(later)).await;

        let conflict = AgentConflict::new(
            ConflictType::PriorityConflict,
            vec!["a".into(), "b".into()],
            "same priority",
            Severity::Low,
        );
        let outcome = resolve_by_priority(&conflict, &registry.snapshot().await);
        assert!(matches!(outcome, ConflictResolution::Resolved { winner, .. } if winner == "b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_parties_are_not_eligible() {
        let registry = AgentRegistry::new();
        registry.register("a", "worker", vec![], 1).await;
        tokio::time::advance(Duration::from_secs(31)).await;
        registry.sweep_offline(Duration::from_secs(30)).await;

        let conflict = AgentConflict::new(
            ConflictType::DataInconsistency,
            vec!["a".into(), "ghost".into()],
            "stale records",
            Severity::High,
        );
        let outcome = resolve_by_priority(&conflict, &registry.snapshot().await);
        assert!(matches!(outcome, ConflictResolution::Unresolvable(_)));
    }
}
