//! Monitoring probe
//!
//! Consumes agent heartbeats, status updates and metrics from the bus and
//! runs a fixed-interval loop:
//!
//! 1. mark silent agents offline and alert once per transition
//! 2. compute a `SystemMetrics` snapshot over the registry and the host
//! 3. evaluate the static alert rules (rate limited per rule)
//! 4. publish the snapshot as a `system_overview` performance metric
//!
//! Each step is guarded on its own; a failing step never skips the others.

use super::host::{HostProbe, HostSample};
use super::registry::{
    AgentRecord, AgentRegistry, AgentStatus, MetricUpdate, StatusUpdate, DEFAULT_PRIORITY_LEVEL,
};
use crate::bus::{Message, MessageBus, MessageHandler, MessagePriority, MessageType};
use crate::coordination::{run_step, ShutdownToken};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Subscriber and sender id of the probe
pub const PROBE_ID: &str = "monitoring_probe";

/// `metric_type` of the published snapshot
pub const SYSTEM_OVERVIEW: &str = "system_overview";

/// Static alert limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub max_avg_response_time_ms: f64,
    pub min_success_rate: f64,
    pub max_cpu_usage_percent: f64,
    pub max_memory_usage_percent: f64,
    /// Alert when at least this many agents are offline
    pub max_offline_agents: usize,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_avg_response_time_ms: 5000.0,
            min_success_rate: 0.95,
            max_cpu_usage_percent: 80.0,
            max_memory_usage_percent: 90.0,
            max_offline_agents: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub monitoring_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub metrics_history_size: usize,
    /// Minimum spacing between two alerts of the same rule
    pub alert_cooldown_secs: u64,
    pub host_sample_timeout_ms: u64,
    pub thresholds: AlertThresholds,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            monitoring_interval_secs: 5,
            heartbeat_timeout_secs: 30,
            metrics_history_size: 1000,
            alert_cooldown_secs: 300,
            host_sample_timeout_ms: 1000,
            thresholds: AlertThresholds::default(),
        }
    }
}

impl MonitoringConfig {
    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

/// Aggregate snapshot of the fleet and the host
#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub timestamp: DateTime<Utc>,
    pub total_agents: usize,
    pub healthy_agents: usize,
    pub degraded_agents: usize,
    pub unhealthy_agents: usize,
    pub offline_agents: usize,
    /// Averages cover agents that are not offline
    pub avg_response_time_ms: f64,
    pub overall_success_rate: f64,
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub active_emergencies: usize,
    /// Longest silence among offline agents
    pub max_offline_seconds: f64,
}

impl SystemMetrics {
    pub fn from_agents(agents: &[AgentRecord], host: HostSample, active_emergencies: usize) -> Self {
        let mut metrics = SystemMetrics {
            timestamp: Utc::now(),
            total_agents: agents.len(),
            healthy_agents: 0,
            degraded_agents: 0,
            unhealthy_agents: 0,
            offline_agents: 0,
            avg_response_time_ms: 0.0,
            overall_success_rate: 1.0,
            cpu_usage_percent: host.cpu_usage_percent,
            memory_usage_percent: host.memory_usage_percent,
            active_emergencies,
            max_offline_seconds: 0.0,
        };

        let mut response_total = 0.0;
        let mut success_total = 0.0;
        let mut online = 0usize;
        for agent in agents {
            match agent.status {
                AgentStatus::Healthy => metrics.healthy_agents += 1,
                AgentStatus::Degraded => metrics.degraded_agents += 1,
                AgentStatus::Unhealthy => metrics.unhealthy_agents += 1,
                AgentStatus::Offline => {
                    metrics.offline_agents += 1;
                    metrics.max_offline_seconds =
                        metrics.max_offline_seconds.max(agent.silence().as_secs_f64());
                    continue;
                }
            }
            response_total += agent.response_time_ms;
            success_total += agent.success_rate;
            online += 1;
        }

        if online > 0 {
            metrics.avg_response_time_ms = response_total / online as f64;
            metrics.overall_success_rate = success_total / online as f64;
        }
        metrics
    }

    /// Named values fed to the emergency detector
    pub fn metric_map(&self) -> HashMap<String, f64> {
        HashMap::from([
            ("avg_response_time_ms".to_string(), self.avg_response_time_ms),
            ("success_rate".to_string(), self.overall_success_rate),
            ("call_failure_rate".to_string(), 1.0 - self.overall_success_rate),
            ("cpu_usage_percent".to_string(), self.cpu_usage_percent),
            ("memory_usage_percent".to_string(), self.memory_usage_percent),
            ("offline_agents".to_string(), self.offline_agents as f64),
            ("agent_downtime_seconds".to_string(), self.max_offline_seconds),
            ("active_emergencies".to_string(), self.active_emergencies as f64),
        ])
    }
}

/// Alert for one online-to-offline transition
pub fn offline_alert(agent: &AgentRecord, timeout: Duration, sender_id: &str) -> Message {
    Message::new(
        MessageType::EmergencyAlert,
        sender_id,
        json!({
            "alert_type": "agent_offline",
            "agent_id": agent.agent_id,
            "last_heartbeat": agent.last_heartbeat.to_rfc3339(),
            "timeout_seconds": timeout.as_secs(),
            "severity": "high",
        }),
    )
    .with_priority(MessagePriority::High)
}

/// Per-rule rate limiter
struct AlertGate {
    cooldown: Duration,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl AlertGate {
    fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    async fn allow(&self, key: &str) -> bool {
        let mut last_sent = self.last_sent.lock().await;
        let now = Instant::now();
        match last_sent.get(key) {
            Some(at) if now.duration_since(*at) < self.cooldown => false,
            _ => {
                last_sent.insert(key.to_string(), now);
                true
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringStatistics {
    pub registered_agents: usize,
    pub metrics_history_size: usize,
    pub monitoring_interval_seconds: u64,
    pub heartbeat_timeout_seconds: u64,
    pub alerts_published: u64,
    pub offline_transitions: u64,
    pub thresholds: AlertThresholds,
}

pub struct MonitoringProbe {
    config: MonitoringConfig,
    bus: MessageBus,
    registry: Arc<AgentRegistry>,
    host: Arc<dyn HostProbe>,
    last_host_sample: Mutex<HostSample>,
    metrics_history: RwLock<VecDeque<SystemMetrics>>,
    alert_gate: AlertGate,
    active_emergencies: Arc<AtomicUsize>,
    alerts_published: AtomicU64,
    offline_transitions: AtomicU64,
}

impl MonitoringProbe {
    pub fn new(
        config: MonitoringConfig,
        bus: MessageBus,
        registry: Arc<AgentRegistry>,
        host: Arc<dyn HostProbe>,
    ) -> Self {
        let alert_gate = AlertGate::new(Duration::from_secs(config.alert_cooldown_secs));
        Self {
            config,
            bus,
            registry,
            host,
            last_host_sample: Mutex::new(HostSample::default()),
            metrics_history: RwLock::new(VecDeque::new()),
            alert_gate,
            active_emergencies: Arc::new(AtomicUsize::new(0)),
            alerts_published: AtomicU64::new(0),
            offline_transitions: AtomicU64::new(0),
        }
    }

    /// Share the emergency detector's active-emergency gauge
    pub fn with_emergency_gauge(mut self, gauge: Arc<AtomicUsize>) -> Self {
        self.active_emergencies = gauge;
        self
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub async fn register_agent(&self, agent_id: &str, agent_type: &str, capabilities: Vec<String>) -> bool {
        self.registry
            .register(agent_id, agent_type, capabilities, DEFAULT_PRIORITY_LEVEL)
            .await
    }

    /// Subscribe the probe to agent traffic on the bus
    pub async fn attach(self: &Arc<Self>) -> Result<String> {
        self.bus
            .subscribe(
                PROBE_ID,
                &[
                    MessageType::AgentHeartbeat,
                    MessageType::AgentStatusUpdate,
                    MessageType::PerformanceMetric,
                ],
                Arc::new(ProbeHandler {
                    probe: Arc::clone(self),
                }),
                None,
            )
            .await
    }

    /// Apply one agent message to the registry
    pub async fn ingest(&self, message: &Message) -> Result<()> {
        if message.payload_str("metric_type") == Some(SYSTEM_OVERVIEW) {
            return Ok(());
        }
        let Some(agent_id) = message.payload_str("agent_id") else {
            debug!(message_id = %message.id, "Agent message without agent_id ignored");
            return Ok(());
        };

        let known = match message.message_type {
            MessageType::AgentHeartbeat => {
                let status = message.payload_str("status").and_then(AgentStatus::parse);
                let reported_at = message
                    .payload_str("timestamp")
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&Utc));
                self.registry.heartbeat(agent_id, status, reported_at).await
            }
            MessageType::AgentStatusUpdate => {
                let update: StatusUpdate = serde_json::from_value(message.payload.clone())?;
                self.registry.update_status(agent_id, &update).await
            }
            MessageType::PerformanceMetric => {
                let update: MetricUpdate = serde_json::from_value(message.payload.clone())?;
                self.registry.record_metrics(agent_id, &update).await
            }
            _ => true,
        };

        if !known {
            debug!(agent_id, message_type = %message.message_type, "Message from unregistered agent ignored");
        }
        Ok(())
    }

    /// One monitoring pass
    pub async fn tick(&self) {
        run_step(PROBE_ID, "offline_sweep", self.sweep_offline()).await;

        let mut snapshot = None;
        run_step(PROBE_ID, "collect_metrics", async {
            snapshot = Some(self.collect_metrics().await);
            Ok(())
        })
        .await;

        if let Some(metrics) = snapshot {
            run_step(PROBE_ID, "alert_rules", self.evaluate_alerts(&metrics)).await;
            run_step(PROBE_ID, "publish_snapshot", self.publish_snapshot(&metrics)).await;
        }
    }

    async fn sweep_offline(&self) -> Result<()> {
        let timeout = self.config.heartbeat_timeout();
        for agent in self.registry.sweep_offline(timeout).await {
            self.offline_transitions.fetch_add(1, Ordering::Relaxed);
            warn!(
                agent_id = %agent.agent_id,
                last_heartbeat = %agent.last_heartbeat,
                "Agent is offline"
            );
            self.bus.publish(offline_alert(&agent, timeout, PROBE_ID))?;
            self.alerts_published.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn collect_metrics(&self) -> SystemMetrics {
        let host = self.sample_host().await;
        let agents = self.registry.snapshot().await;
        let metrics = SystemMetrics::from_agents(
            &agents,
            host,
            self.active_emergencies.load(Ordering::Relaxed),
        );

        let mut history = self.metrics_history.write().await;
        history.push_back(metrics.clone());
        while history.len() > self.config.metrics_history_size.max(1) {
            history.pop_front();
        }
        metrics
    }

    async fn sample_host(&self) -> HostSample {
        let timeout = Duration::from_millis(self.config.host_sample_timeout_ms);
        let mut last = self.last_host_sample.lock().await;
        match tokio::time::timeout(timeout, self.host.sample()).await {
            Ok(Ok(sample)) => {
                *last = sample;
                sample
            }
            Ok(Err(e)) => {
                warn!("Host sampling failed, reusing last sample: {}", e);
                *last
            }
            Err(_) => {
                warn!(timeout_ms = self.config.host_sample_timeout_ms, "Host sampling timed out");
                *last
            }
        }
    }

    async fn evaluate_alerts(&self, metrics: &SystemMetrics) -> Result<()> {
        let t = &self.config.thresholds;
        let mut alerts = Vec::new();

        if metrics.avg_response_time_ms > t.max_avg_response_time_ms {
            alerts.push(("high_response_time", metrics.avg_response_time_ms, t.max_avg_response_time_ms));
        }
        if metrics.overall_success_rate < t.min_success_rate {
            alerts.push(("low_success_rate", metrics.overall_success_rate, t.min_success_rate));
        }
        if metrics.cpu_usage_percent > t.max_cpu_usage_percent {
            alerts.push(("high_cpu_usage", metrics.cpu_usage_percent, t.max_cpu_usage_percent));
        }
        if metrics.memory_usage_percent > t.max_memory_usage_percent {
            alerts.push(("high_memory_usage", metrics.memory_usage_percent, t.max_memory_usage_percent));
        }
        if metrics.offline_agents >= t.max_offline_agents {
            alerts.push(("agents_offline", metrics.offline_agents as f64, t.max_offline_agents as f64));
        }

        for (alert_type, value, threshold) in alerts {
            if !self.alert_gate.allow(alert_type).await {
                debug!(alert_type, "Alert suppressed by cooldown");
                continue;
            }
            info!(alert_type, value, threshold, "Publishing system alert");
            self.bus.publish(
                Message::new(
                    MessageType::EmergencyAlert,
                    PROBE_ID,
                    json!({
                        "alert_type": alert_type,
                        "value": value,
                        "threshold": threshold,
                    }),
                )
                .with_priority(MessagePriority::High),
            )?;
            self.alerts_published.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn publish_snapshot(&self, metrics: &SystemMetrics) -> Result<()> {
        self.bus.publish(Message::new(
            MessageType::PerformanceMetric,
            PROBE_ID,
            json!({
                "metric_type": SYSTEM_OVERVIEW,
                "metrics": metrics,
            }),
        ))?;
        Ok(())
    }

    pub async fn latest_metrics(&self) -> Option<SystemMetrics> {
        self.metrics_history.read().await.back().cloned()
    }

    /// Most recent snapshots, oldest first
    pub async fn get_system_metrics(&self, limit: usize) -> Vec<SystemMetrics> {
        let history = self.metrics_history.read().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub async fn get_monitoring_statistics(&self) -> MonitoringStatistics {
        MonitoringStatistics {
            registered_agents: self.registry.len().await,
            metrics_history_size: self.metrics_history.read().await.len(),
            monitoring_interval_seconds: self.config.monitoring_interval_secs,
            heartbeat_timeout_seconds: self.config.heartbeat_timeout_secs,
            alerts_published: self.alerts_published.load(Ordering::Relaxed),
            offline_transitions: self.offline_transitions.load(Ordering::Relaxed),
            thresholds: self.config.thresholds.clone(),
        }
    }

    /// Spawn the monitoring loop
    pub fn start(self: &Arc<Self>, mut token: ShutdownToken) -> JoinHandle<()> {
        let probe = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(probe.config.monitoring_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = probe.config.monitoring_interval_secs,
                heartbeat_timeout_secs = probe.config.heartbeat_timeout_secs,
                "Monitoring probe started"
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => probe.tick().await,
                }
            }
            info!("Monitoring probe stopped");
        })
    }
}

struct ProbeHandler {
    probe: Arc<MonitoringProbe>,
}

#[async_trait]
impl MessageHandler for ProbeHandler {
    async fn handle(&self, message: &Message) -> Result<()> {
        self.probe.ingest(message).await
    }
}
