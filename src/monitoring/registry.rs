//! Shared agent registry
//!
//! Owned by the control plane and handed to both the monitoring probe and the
//! supervisor. All mutation goes through these methods; callers only ever see
//! cloned snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Performance samples kept per agent
pub const PERFORMANCE_SAMPLES_PER_AGENT: usize = 100;

/// Default priority for agents that do not declare one (1 = highest)
pub const DEFAULT_PRIORITY_LEVEL: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Healthy => "healthy",
            AgentStatus::Degraded => "degraded",
            AgentStatus::Unhealthy => "unhealthy",
            AgentStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(AgentStatus::Healthy),
            "degraded" => Some(AgentStatus::Degraded),
            "unhealthy" => Some(AgentStatus::Unhealthy),
            "offline" => Some(AgentStatus::Offline),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields an agent may report in a status update
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_count: Option<u64>,
}

/// Resource figures an agent may report in a performance metric
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
}

/// Point-in-time performance of one agent
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSample {
    pub timestamp: DateTime<Utc>,
    pub response_time_ms: f64,
    pub success_rate: f64,
    pub error_count: u64,
}

/// Registration plus live metrics of one agent
#[derive(Debug, Clone, Serialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    pub priority_level: u8,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
    /// Never moves backwards
    pub last_heartbeat: DateTime<Utc>,
    pub response_time_ms: f64,
    pub success_rate: f64,
    pub error_count: u64,
    pub memory_usage_mb: f64,
    pub cpu_usage_percent: f64,
    pub uptime_seconds: f64,
    #[serde(skip)]
    last_seen: Instant,
    #[serde(skip)]
    samples: VecDeque<PerformanceSample>,
}

impl AgentRecord {
    fn new(agent_id: &str, agent_type: &str, capabilities: Vec<String>, priority_level: u8) -> Self {
        let now = Utc::now();
        Self {
            agent_id: agent_id.to_string(),
            agent_type: agent_type.to_string(),
            capabilities,
            priority_level,
            status: AgentStatus::Healthy,
            registered_at: now,
            last_heartbeat: now,
            response_time_ms: 0.0,
            success_rate: 1.0,
            error_count: 0,
            memory_usage_mb: 0.0,
            cpu_usage_percent: 0.0,
            uptime_seconds: 0.0,
            last_seen: Instant::now(),
            samples: VecDeque::new(),
        }
    }

    /// Time since the last heartbeat on the monotonic clock
    pub fn silence(&self) -> Duration {
        self.last_seen.elapsed()
    }

    pub fn samples(&self) -> impl Iterator<Item = &PerformanceSample> {
        self.samples.iter()
    }

    fn record_sample(&mut self) {
        if self.samples.len() >= PERFORMANCE_SAMPLES_PER_AGENT {
            self.samples.pop_front();
        }
        self.samples.push_back(PerformanceSample {
            timestamp: Utc::now(),
            response_time_ms: self.response_time_ms,
            success_rate: self.success_rate,
            error_count: self.error_count,
        });
    }
}

/// Counts of agents per status
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatusCounts {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub offline: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.healthy + self.degraded + self.unhealthy + self.offline
    }
}

#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentRecord>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent. Returns true for a new agent.
    ///
    /// Re-registration replaces type, capabilities and priority but keeps
    /// accumulated metrics and performance history.
    pub async fn register(
        &self,
        agent_id: &str,
        agent_type: &str,
        capabilities: Vec<String>,
        priority_level: u8,
    ) -> bool {
        let priority_level = priority_level.clamp(1, 5);
        let mut agents = self.agents.write().await;
        match agents.get_mut(agent_id) {
            Some(existing) => {
                existing.agent_type = agent_type.to_string();
                existing.capabilities = capabilities;
                existing.priority_level = priority_level;
                debug!(agent_id, "Agent re-registered");
                false
            }
            None => {
                agents.insert(
                    agent_id.to_string(),
                    AgentRecord::new(agent_id, agent_type, capabilities, priority_level),
                );
                info!(agent_id, agent_type, "Agent registered");
                true
            }
        }
    }

    /// Record a heartbeat. Returns false for unknown agents.
    pub async fn heartbeat(
        &self,
        agent_id: &str,
        status: Option<AgentStatus>,
        reported_at: Option<DateTime<Utc>>,
    ) -> bool {
        let mut agents = self.agents.write().await;
        let Some(agent) = agents.get_mut(agent_id) else {
            return false;
        };

        let at = reported_at.unwrap_or_else(Utc::now);
        if at > agent.last_heartbeat {
            agent.last_heartbeat = at;
        }
        agent.last_seen = Instant::now();

        match status {
            Some(status) if status != AgentStatus::Offline => agent.status = status,
            _ if agent.status == AgentStatus::Offline => {
                info!(agent_id, "Agent back online");
                agent.status = AgentStatus::Healthy;
            }
            _ => {}
        }
        true
    }

    /// Apply a status update. Returns false for unknown agents.
    pub async fn update_status(&self, agent_id: &str, update: &StatusUpdate) -> bool {
        let mut agents = self.agents.write().await;
        let Some(agent) = agents.get_mut(agent_id) else {
            return false;
        };

        if let Some(status) = &update.status {
            agent.status = AgentStatus::parse(status).unwrap_or_else(|| {
                warn!(agent_id, status = %status, "Unknown agent status, assuming healthy");
                AgentStatus::Healthy
            });
        }
        if let Some(v) = update.response_time_ms {
            agent.response_time_ms = v;
        }
        if let Some(v) = update.success_rate {
            agent.success_rate = v;
        }
        if let Some(v) = update.error_count {
            agent.error_count = v;
        }
        agent.record_sample();
        true
    }

    /// Apply resource figures. Returns false for unknown agents.
    pub async fn record_metrics(&self, agent_id: &str, update: &MetricUpdate) -> bool {
        let mut agents = self.agents.write().await;
        let Some(agent) = agents.get_mut(agent_id) else {
            return false;
        };

        if let Some(v) = update.memory_usage_mb {
            agent.memory_usage_mb = v;
        }
        if let Some(v) = update.cpu_usage_percent {
            agent.cpu_usage_percent = v;
        }
        if let Some(v) = update.uptime_seconds {
            agent.uptime_seconds = v;
        }
        let touches_performance = update.response_time_ms.is_some() || update.success_rate.is_some();
        if let Some(v) = update.response_time_ms {
            agent.response_time_ms = v;
        }
        if let Some(v) = update.success_rate {
            agent.success_rate = v;
        }
        if touches_performance {
            agent.record_sample();
        }
        true
    }

    /// Mark agents silent for longer than `timeout` as offline.
    ///
    /// Only agents that changed state in this pass are returned, so each
    /// online-to-offline transition is reported once.
    pub async fn sweep_offline(&self, timeout: Duration) -> Vec<AgentRecord> {
        let mut agents = self.agents.write().await;
        let mut newly_offline = Vec::new();
        for agent in agents.values_mut() {
            if agent.status != AgentStatus::Offline && agent.silence() > timeout {
                agent.status = AgentStatus::Offline;
                newly_offline.push(agent.clone());
            }
        }
        newly_offline
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }

    pub async fn status_counts(&self) -> StatusCounts {
        let agents = self.agents.read().await;
        let mut counts = StatusCounts::default();
        for agent in agents.values() {
            match agent.status {
                AgentStatus::Healthy => counts.healthy += 1,
                AgentStatus::Degraded => counts.degraded += 1,
                AgentStatus::Unhealthy => counts.unhealthy += 1,
                AgentStatus::Offline => counts.offline += 1,
            }
        }
        counts
    }

    /// Last `n` performance samples of an agent, oldest first
    pub async fn recent_samples(&self, agent_id: &str, n: usize) -> Vec<PerformanceSample> {
        let agents = self.agents.read().await;
        agents
            .get(agent_id)
            .map(|a| {
                let skip = a.samples.len().saturating_sub(n);
                a.samples.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registration_is_idempotent() {
        let registry = AgentRegistry::new();
        assert!(registry.register("roxy", "call_handler", vec!["voice".into()], 2).await);
        registry
            .update_status(
                "roxy",
                &StatusUpdate {
                    response_time_ms: Some(420.0),
                    ..Default::default()
                },
            )
            .await;

        assert!(!registry.register("roxy", "call_handler", vec!["voice".into(), "sms".into()], 1).await);

        let agent = registry.get("roxy").await.unwrap();
        assert_eq!(agent.capabilities.len(), 2);
        assert_eq!(agent.priority_level, 1);
        assert_eq!(agent.response_time_ms, 420.0);
        assert_eq!(registry.recent_samples("roxy", 10).await.len(), 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_last_heartbeat_never_moves_backwards() {
        let registry = AgentRegistry::new();
        registry.register("a", "probe", vec![], DEFAULT_PRIORITY_LEVEL).await;

        let later = Utc::now() + chrono::Duration::seconds(60);
        let earlier = Utc::now() - chrono::Duration::seconds(60);
        registry.heartbeat("a", None, Some(later)).await;
        registry.heartbeat("a", None, Some(earlier)).await;

        assert_eq!(registry.get("a").await.unwrap().last_heartbeat, later);
        assert!(!registry.heartbeat("ghost", None, None).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_sweep_reports_transition_once() {
        let registry = AgentRegistry::new();
        registry.register("a", "call_handler", vec![], 3).await;
        registry.register("b", "call_handler", vec![], 3).await;

        tokio::time::advance(Duration::from_secs(20)).await;
        registry.heartbeat("b", Some(AgentStatus::Healthy), None).await;
        tokio::time::advance(Duration::from_secs(15)).await;

        let offline = registry.sweep_offline(Duration::from_secs(30)).await;
        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0].agent_id, "a");
        assert!(registry.sweep_offline(Duration::from_secs(30)).await.is_empty());

        // A heartbeat brings the agent back
        registry.heartbeat("a", None, None).await;
        assert_eq!(registry.get("a").await.unwrap().status, AgentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_unknown_status_defaults_to_healthy() {
        let registry = AgentRegistry::new();
        registry.register("a", "x", vec![], 3).await;
        registry
            .update_status(
                "a",
                &StatusUpdate {
                    status: Some("unhealthy".into()),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(registry.get("a").await.unwrap().status, AgentStatus::Unhealthy);

        registry
            .update_status(
                "a",
                &StatusUpdate {
                    status: Some("confused".into()),
                    ..Default::default()
                },
            )
            .await;
        assert_eq!(registry.get("a").await.unwrap().status, AgentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_sample_history_bounded() {
        let registry = AgentRegistry::new();
        registry.register("a", "x", vec![], 3).await;
        for i in 0..(PERFORMANCE_SAMPLES_PER_AGENT + 20) {
            registry
                .record_metrics(
                    "a",
                    &MetricUpdate {
                        response_time_ms: Some(i as f64),
                        ..Default::default()
                    },
                )
                .await;
        }
        let samples = registry.recent_samples("a", usize::MAX).await;
        assert_eq!(samples.len(), PERFORMANCE_SAMPLES_PER_AGENT);
        assert_eq!(samples[0].response_time_ms, 20.0);
    }
}
