//! Supervisor coordination loop
//!
//! Every tick runs five guarded steps in order:
//!
//! 1. Health monitor: heartbeat timeouts, load balancing away from offline agents
//! 2. Urgent decisions: provider consultation with a local fallback
//! 3. Conflict resolution: priority-based, escalated after repeated failures
//! 4. Emergency check: metric snapshot (optionally anomaly-enriched) into the detector
//! 5. Improvement triggers: sustained per-agent degradation forwarded downstream
//!
//! A failing or panicking step is logged and the next one still runs.

use super::analysis::AnomalyDetector;
use super::conflict::{resolve_by_priority, AgentConflict, ConflictResolution, ConflictType};
use super::decision::{
    consult, local_fallback, DecisionContext, DecisionOutcome, DecisionProvider, DecisionSource,
    DecisionStatus, DecisionType, OperationalDecision, ProviderDecision,
};
use crate::bridge::BRIDGE_ID;
use crate::bus::{Message, MessageBus, MessageHandler, MessagePriority, MessageType, BUS_SENDER_ID};
use crate::coordination::{run_step, ShutdownToken};
use crate::emergency::{Emergency, EmergencyDetector, Severity, DETECTOR_ID};
use crate::error::Result;
use crate::monitoring::{
    offline_alert, AgentRecord, AgentRegistry, AgentStatus, HostSample, MonitoringProbe,
    StatusCounts, SystemMetrics, PROBE_ID,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Subscriber and sender id of the supervisor
pub const SUPERVISOR_ID: &str = "operational_supervisor";

const EXTERNAL_ALERT_CONFIDENCE: f64 = 0.95;
const FAILED_DEPLOYMENT_CONFIDENCE: f64 = 0.9;
const OFFLINE_REBALANCE_CONFIDENCE: f64 = 0.85;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub coordination_interval_ms: u64,
    pub heartbeat_timeout_secs: u64,
    /// Decisions above this confidence are executed on the next tick
    pub urgent_confidence_threshold: f64,
    /// Non-urgent decisions expire after this long
    pub decision_ttl_secs: u64,
    pub decision_timeout_ms: u64,
    pub analysis_timeout_ms: u64,
    pub max_conflict_attempts: u32,
    /// Samples averaged per agent for improvement triggers
    pub improvement_window: usize,
    pub improvement_cooldown_secs: u64,
    pub response_time_limit_ms: f64,
    pub success_rate_limit: f64,
    pub history_size: usize,
    /// Install the built-in rolling z-score detector
    pub anomaly_detection: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            coordination_interval_ms: 1000,
            heartbeat_timeout_secs: 30,
            urgent_confidence_threshold: 0.8,
            decision_ttl_secs: 300,
            decision_timeout_ms: 2000,
            analysis_timeout_ms: 1000,
            max_conflict_attempts: 3,
            improvement_window: 10,
            improvement_cooldown_secs: 600,
            response_time_limit_ms: 5000.0,
            success_rate_limit: 0.9,
            history_size: 1000,
            anomaly_detection: false,
        }
    }
}

impl SupervisorConfig {
    pub fn coordination_interval(&self) -> Duration {
        Duration::from_millis(self.coordination_interval_ms.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorMetrics {
    pub decisions_per_minute: f64,
    pub conflicts_resolved: u64,
    pub emergencies_handled: u64,
    pub avg_decision_time_ms: f64,
    pub agent_uptime_percent: f64,
    pub decisions_executed: u64,
    pub decisions_via_fallback: u64,
    pub decisions_rejected: u64,
    pub decisions_expired: u64,
    pub decisions_failed: u64,
    pub pending_decisions: usize,
    pub active_conflicts: usize,
    pub conflicts_escalated: u64,
    pub improvement_triggers_sent: u64,
    pub coordination_ticks: u64,
    pub step_failures: u64,
}

/// Point-in-time view for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub agents: Vec<AgentRecord>,
    pub status_counts: StatusCounts,
    pub active_emergencies: Vec<Emergency>,
    pub metrics: SupervisorMetrics,
}

#[derive(Default)]
struct Counters {
    decisions_executed: AtomicU64,
    decisions_via_fallback: AtomicU64,
    decisions_rejected: AtomicU64,
    decisions_expired: AtomicU64,
    decisions_failed: AtomicU64,
    decision_time_us: AtomicU64,
    conflicts_resolved: AtomicU64,
    conflicts_escalated: AtomicU64,
    emergencies_handled: AtomicU64,
    improvement_triggers: AtomicU64,
    ticks: AtomicU64,
    step_failures: AtomicU64,
}

pub struct Supervisor {
    config: SupervisorConfig,
    bus: MessageBus,
    registry: Arc<AgentRegistry>,
    probe: Arc<MonitoringProbe>,
    detector: Arc<EmergencyDetector>,
    provider: Option<Arc<dyn DecisionProvider>>,
    anomaly: Option<Arc<dyn AnomalyDetector>>,
    pending: RwLock<VecDeque<OperationalDecision>>,
    decision_history: RwLock<VecDeque<OperationalDecision>>,
    conflicts: RwLock<Vec<AgentConflict>>,
    conflict_history: RwLock<VecDeque<AgentConflict>>,
    /// Resource name to the agent currently holding it
    resource_holders: Mutex<HashMap<String, String>>,
    /// Named metrics reported by agents, consumed by the next emergency check
    external_metrics: Mutex<HashMap<String, f64>>,
    deployments: RwLock<VecDeque<Value>>,
    improvement_cooldowns: Mutex<HashMap<String, Instant>>,
    executions: Mutex<VecDeque<Instant>>,
    counters: Counters,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        bus: MessageBus,
        registry: Arc<AgentRegistry>,
        probe: Arc<MonitoringProbe>,
        detector: Arc<EmergencyDetector>,
    ) -> Self {
        Self {
            config,
            bus,
            registry,
            probe,
            detector,
            provider: None,
            anomaly: None,
            pending: RwLock::new(VecDeque::new()),
            decision_history: RwLock::new(VecDeque::new()),
            conflicts: RwLock::new(Vec::new()),
            conflict_history: RwLock::new(VecDeque::new()),
            resource_holders: Mutex::new(HashMap::new()),
            external_metrics: Mutex::new(HashMap::new()),
            deployments: RwLock::new(VecDeque::new()),
            improvement_cooldowns: Mutex::new(HashMap::new()),
            executions: Mutex::new(VecDeque::new()),
            counters: Counters::default(),
        }
    }

    pub fn with_decision_provider(mut self, provider: Arc<dyn DecisionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_anomaly_detector(mut self, detector: Arc<dyn AnomalyDetector>) -> Self {
        self.anomaly = Some(detector);
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn detector(&self) -> &Arc<EmergencyDetector> {
        &self.detector
    }

    /// Idempotent per agent id; re-registration keeps performance history
    pub async fn register_agent(
        &self,
        agent_id: &str,
        agent_type: &str,
        capabilities: Vec<String>,
        priority_level: u8,
    ) -> bool {
        self.registry
            .register(agent_id, agent_type, capabilities, priority_level)
            .await
    }

    /// Queue a decision for the urgent-decision step
    pub async fn submit_decision(&self, decision: OperationalDecision) -> String {
        let id = decision.id.clone();
        info!(
            decision_id = %id,
            decision_type = %decision.decision_type,
            confidence = decision.confidence_score,
            "Decision submitted"
        );
        self.pending.write().await.push_back(decision);
        id
    }

    pub async fn report_conflict(&self, conflict: AgentConflict) -> String {
        let id = conflict.id.clone();
        info!(
            conflict_id = %id,
            conflict_type = %conflict.conflict_type,
            agents = ?conflict.involved_agents,
            "Conflict reported"
        );
        self.conflicts.write().await.push(conflict);
        id
    }

    /// Subscribe the supervisor to alerts, status, metrics and deployments
    pub async fn attach(self: &Arc<Self>) -> Result<String> {
        self.bus
            .subscribe(
                SUPERVISOR_ID,
                &[
                    MessageType::EmergencyAlert,
                    MessageType::AgentStatusUpdate,
                    MessageType::PerformanceMetric,
                    MessageType::DeploymentNotification,
                ],
                Arc::new(SupervisorHandler {
                    supervisor: Arc::clone(self),
                }),
                None,
            )
            .await
    }

    pub async fn handle_message(&self, message: &Message) -> Result<()> {
        match message.message_type {
            MessageType::EmergencyAlert => self.on_external_alert(message).await,
            MessageType::AgentStatusUpdate => self.on_resource_claims(message).await,
            MessageType::PerformanceMetric => {
                if let (Some(name), Some(value)) =
                    (message.payload_str("metric_name"), message.payload_f64("value"))
                {
                    self.external_metrics
                        .lock()
                        .await
                        .insert(name.to_string(), value);
                }
            }
            MessageType::DeploymentNotification => self.on_deployment(message).await,
            _ => {}
        }
        Ok(())
    }

    async fn on_external_alert(&self, message: &Message) {
        let internal = [PROBE_ID, DETECTOR_ID, SUPERVISOR_ID, BUS_SENDER_ID, BRIDGE_ID];
        if internal.contains(&message.sender_id.as_str())
            || message.payload_str("event_type") == Some("operator_notification")
        {
            return;
        }

        let affected = string_list(&message.payload, "affected_agents")
            .or_else(|| message.payload_str("agent_id").map(|a| vec![a.to_string()]))
            .unwrap_or_default();
        let mut data = message.payload.clone();
        if let Value::Object(map) = &mut data {
            map.insert("source_message_id".to_string(), json!(message.id));
            map.insert("reported_by".to_string(), json!(message.sender_id));
        }

        warn!(sender = %message.sender_id, agents = ?affected, "External emergency alert received");
        self.submit_decision(OperationalDecision::new(
            DecisionType::EmergencyResponse,
            format!("Respond to emergency alert from {}", message.sender_id),
            affected,
            data,
            EXTERNAL_ALERT_CONFIDENCE,
        ))
        .await;
    }

    async fn on_resource_claims(&self, message: &Message) {
        let (Some(agent_id), Some(claims)) = (
            message.payload_str("agent_id"),
            string_list(&message.payload, "resource_claims"),
        ) else {
            return;
        };

        let agents = self.registry.snapshot().await;
        let online = |id: &str| {
            agents
                .iter()
                .any(|a| a.agent_id == id && a.status != AgentStatus::Offline)
        };

        let mut contested = Vec::new();
        {
            let mut holders = self.resource_holders.lock().await;
            holders.retain(|resource, holder| holder != agent_id || claims.contains(resource));
            for resource in claims {
                match holders.get(&resource) {
                    Some(holder) if holder != agent_id && online(holder) => {
                        contested.push((resource, holder.clone()));
                    }
                    _ => {
                        holders.insert(resource, agent_id.to_string());
                    }
                }
            }
        }

        let mut conflicts = self.conflicts.write().await;
        for (resource, holder) in contested {
            let already_open = conflicts
                .iter()
                .any(|c| c.resource.as_deref() == Some(resource.as_str()));
            if already_open {
                continue;
            }
            info!(resource = %resource, holder = %holder, claimant = agent_id, "Resource contention detected");
            conflicts.push(
                AgentConflict::new(
                    ConflictType::ResourceContention,
                    vec![holder, agent_id.to_string()],
                    format!("{agent_id} claims {resource}"),
                    Severity::Medium,
                )
                .over_resource(resource),
            );
        }
    }

    async fn on_deployment(&self, message: &Message) {
        // Raw notifications reach us through the bridge, which re-targets them
        if message.recipient_id.as_deref() != Some(SUPERVISOR_ID) {
            return;
        }

        {
            let mut deployments = self.deployments.write().await;
            deployments.push_back(message.payload.clone());
            while deployments.len() > self.config.history_size.max(1) {
                deployments.pop_front();
            }
        }

        let deployment_id = message.payload_str("deployment_id").unwrap_or("unknown");
        let status = message.payload_str("status").unwrap_or_default();
        info!(deployment_id, status, "Deployment notification recorded");

        if status == "failed" {
            let affected = string_list(&message.payload, "affected_agents").unwrap_or_default();
            self.submit_decision(OperationalDecision::new(
                DecisionType::AgentCoordination,
                format!("Coordinate agents after failed deployment {deployment_id}"),
                affected,
                json!({
                    "deployment_id": deployment_id,
                    "status": status,
                    "prompt_version": message.payload.get("prompt_version"),
                    "rollback_available": message.payload.get("rollback_available"),
                }),
                FAILED_DEPLOYMENT_CONFIDENCE,
            ))
            .await;
        }
    }

    /// One coordination cycle
    pub async fn tick(&self) {
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);
        let steps = [
            run_step(SUPERVISOR_ID, "health_monitor", self.health_monitor()).await,
            run_step(SUPERVISOR_ID, "urgent_decisions", self.process_urgent_decisions()).await,
            run_step(SUPERVISOR_ID, "conflict_resolution", self.resolve_conflicts()).await,
            run_step(SUPERVISOR_ID, "emergency_check", self.emergency_check()).await,
            run_step(SUPERVISOR_ID, "improvement_triggers", self.forward_improvement_triggers()).await,
        ];
        let failed = steps.iter().filter(|ok| !**ok).count() as u64;
        self.counters.step_failures.fetch_add(failed, Ordering::Relaxed);
    }

    async fn health_monitor(&self) -> Result<()> {
        let timeout = self.config.heartbeat_timeout();
        let offline = self.registry.sweep_offline(timeout).await;
        if offline.is_empty() {
            return Ok(());
        }

        for agent in &offline {
            warn!(agent_id = %agent.agent_id, "Agent missed heartbeat deadline");
            if let Err(e) = self.bus.publish(offline_alert(agent, timeout, SUPERVISOR_ID)) {
                warn!(agent_id = %agent.agent_id, "Offline alert not published: {}", e);
            }
        }

        let ids: Vec<String> = offline.iter().map(|a| a.agent_id.clone()).collect();
        self.submit_decision(OperationalDecision::new(
            DecisionType::LoadBalancing,
            format!("Redistribute work away from {} offline agent(s)", ids.len()),
            ids.clone(),
            json!({ "offline_agents": ids, "reason": "heartbeat_timeout" }),
            OFFLINE_REBALANCE_CONFIDENCE,
        ))
        .await;
        Ok(())
    }

    async fn process_urgent_decisions(&self) -> Result<()> {
        let ttl = Duration::from_secs(self.config.decision_ttl_secs);
        let mut urgent = Vec::new();
        let mut finished = Vec::new();
        {
            let mut pending = self.pending.write().await;
            let mut keep = VecDeque::with_capacity(pending.len());
            for mut decision in pending.drain(..) {
                if decision.confidence_score > self.config.urgent_confidence_threshold {
                    urgent.push(decision);
                } else if decision.age() > ttl {
                    decision.status = DecisionStatus::Expired;
                    self.counters.decisions_expired.fetch_add(1, Ordering::Relaxed);
                    debug!(decision_id = %decision.id, "Decision expired");
                    finished.push(decision);
                } else {
                    keep.push_back(decision);
                }
            }
            *pending = keep;
        }

        for mut decision in urgent {
            if !decision.constraints_hold() {
                warn!(
                    decision_id = %decision.id,
                    constraints = ?decision.constraints.as_ref().map(ToString::to_string),
                    "Decision rejected by constraints"
                );
                decision.status = DecisionStatus::Rejected;
                self.counters.decisions_rejected.fetch_add(1, Ordering::Relaxed);
            } else {
                self.execute(&mut decision).await;
            }
            finished.push(decision);
        }

        self.archive_decisions(finished).await;
        Ok(())
    }

    async fn execute(&self, decision: &mut OperationalDecision) {
        let started = Instant::now();
        let (plan, source) = self.plan_for(decision).await;

        match self.dispatch(decision, &plan) {
            Ok(commands) => {
                decision.status = DecisionStatus::Executed;
                decision.executed_by = Some(source);
                decision.execution_result = Some(json!({ "plan": plan, "commands": commands }));
                self.counters.decisions_executed.fetch_add(1, Ordering::Relaxed);
                if source == DecisionSource::LocalFallback {
                    self.counters.decisions_via_fallback.fetch_add(1, Ordering::Relaxed);
                }
                self.executions.lock().await.push_back(Instant::now());
                info!(
                    decision_id = %decision.id,
                    action = %plan.action,
                    source = ?source,
                    commands,
                    "Decision executed"
                );
            }
            Err(e) => {
                decision.status = DecisionStatus::Failed;
                decision.execution_result = Some(json!({ "error": e.to_string() }));
                self.counters.decisions_failed.fetch_add(1, Ordering::Relaxed);
                warn!(decision_id = %decision.id, "Decision dispatch failed: {}", e);
            }
        }

        self.counters
            .decision_time_us
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
    }

    async fn plan_for(&self, decision: &OperationalDecision) -> (ProviderDecision, DecisionSource) {
        let Some(provider) = &self.provider else {
            return (local_fallback(decision), DecisionSource::LocalFallback);
        };

        let context = DecisionContext::for_decision(decision, self.current_metrics().await);
        let timeout = Duration::from_millis(self.config.decision_timeout_ms);
        match consult(provider.as_ref(), &context, timeout).await {
            DecisionOutcome::Decided(plan) => (plan, DecisionSource::Provider),
            DecisionOutcome::Timeout => {
                warn!(
                    decision_id = %decision.id,
                    timeout_ms = self.config.decision_timeout_ms,
                    "Decision provider timed out, using local fallback"
                );
                (local_fallback(decision), DecisionSource::LocalFallback)
            }
            DecisionOutcome::ProviderError(e) => {
                warn!(decision_id = %decision.id, "Decision provider failed, using local fallback: {}", e);
                (local_fallback(decision), DecisionSource::LocalFallback)
            }
        }
    }

    /// Send the plan as system commands. Returns the number of commands sent.
    fn dispatch(&self, decision: &OperationalDecision, plan: &ProviderDecision) -> Result<usize> {
        let command = Message::new(
            MessageType::SystemCommand,
            SUPERVISOR_ID,
            json!({
                "command": plan.action,
                "decision_id": decision.id,
                "decision_type": decision.decision_type,
                "execution_plan": plan.execution_plan,
                "rollback_plan": plan.rollback_plan,
                "monitoring_metrics": plan.monitoring_metrics,
            }),
        )
        .with_priority(MessagePriority::High)
        .with_correlation_id(decision.id.clone());

        if decision.affected_agents.is_empty() {
            self.bus.publish(command)?;
            return Ok(1);
        }
        for agent_id in &decision.affected_agents {
            self.bus.publish(command.republish(0).to(agent_id.clone()))?;
        }
        Ok(decision.affected_agents.len())
    }

    async fn archive_decisions(&self, decisions: Vec<OperationalDecision>) {
        if decisions.is_empty() {
            return;
        }
        let mut history = self.decision_history.write().await;
        history.extend(decisions);
        while history.len() > self.config.history_size.max(1) {
            history.pop_front();
        }
    }

    async fn resolve_conflicts(&self) -> Result<()> {
        let agents = self.registry.snapshot().await;
        let mut archived = Vec::new();
        {
            let mut conflicts = self.conflicts.write().await;
            let mut remaining = Vec::with_capacity(conflicts.len());

            for mut conflict in conflicts.drain(..) {
                conflict.attempts += 1;
                match resolve_by_priority(&conflict, &agents) {
                    ConflictResolution::Resolved { winner, strategy } => {
                        info!(
                            conflict_id = %conflict.id,
                            winner = %winner,
                            strategy,
                            "Conflict resolved"
                        );
                        if let Some(resource) = &conflict.resource {
                            self.resource_holders
                                .lock()
                                .await
                                .insert(resource.clone(), winner.clone());
                        }
                        conflict.resolved = true;
                        conflict.resolution_strategy = Some(strategy.to_string());
                        conflict.winner = Some(winner);
                        self.counters.conflicts_resolved.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = self.announce_resolution(&conflict) {
                            warn!(conflict_id = %conflict.id, "Conflict resolution not announced: {}", e);
                        }
                        archived.push(conflict);
                    }
                    ConflictResolution::Unresolvable(reason)
                        if conflict.attempts >= self.config.max_conflict_attempts =>
                    {
                        warn!(
                            conflict_id = %conflict.id,
                            attempts = conflict.attempts,
                            "Conflict escalated: {}",
                            reason
                        );
                        conflict.escalated = true;
                        conflict.resolution_strategy = Some("escalated".to_string());
                        self.counters.conflicts_escalated.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = self.escalate(&conflict, &reason) {
                            warn!(conflict_id = %conflict.id, "Escalation alert not published: {}", e);
                        }
                        archived.push(conflict);
                    }
                    ConflictResolution::Unresolvable(reason) => {
                        debug!(conflict_id = %conflict.id, attempts = conflict.attempts, "Conflict unresolved: {}", reason);
                        remaining.push(conflict);
                    }
                }
            }
            *conflicts = remaining;
        }

        if !archived.is_empty() {
            let mut history = self.conflict_history.write().await;
            history.extend(archived);
            while history.len() > self.config.history_size.max(1) {
                history.pop_front();
            }
        }
        Ok(())
    }

    fn announce_resolution(&self, conflict: &AgentConflict) -> Result<()> {
        for agent_id in &conflict.involved_agents {
            self.bus.publish(
                Message::new(
                    MessageType::SystemCommand,
                    SUPERVISOR_ID,
                    json!({
                        "command": "conflict_resolved",
                        "conflict_id": conflict.id,
                        "conflict_type": conflict.conflict_type,
                        "winner": conflict.winner,
                        "resource": conflict.resource,
                    }),
                )
                .to(agent_id.clone())
                .with_correlation_id(conflict.id.clone()),
            )?;
        }
        Ok(())
    }

    fn escalate(&self, conflict: &AgentConflict, reason: &str) -> Result<()> {
        self.bus.publish(
            Message::new(
                MessageType::EmergencyAlert,
                SUPERVISOR_ID,
                json!({
                    "event_type": "conflict_escalated",
                    "conflict_id": conflict.id,
                    "conflict_type": conflict.conflict_type,
                    "involved_agents": conflict.involved_agents,
                    "attempts": conflict.attempts,
                    "reason": reason,
                    "severity": conflict.severity,
                }),
            )
            .with_priority(MessagePriority::High)
            .with_correlation_id(conflict.id.clone()),
        )?;
        Ok(())
    }

    /// Latest probe snapshot, or one computed from the registry before the
    /// probe has produced any
    async fn base_metrics(&self) -> HashMap<String, f64> {
        match self.probe.latest_metrics().await {
            Some(metrics) => metrics.metric_map(),
            None => SystemMetrics::from_agents(
                &self.registry.snapshot().await,
                HostSample::default(),
                self.detector.active_count().await,
            )
            .metric_map(),
        }
    }

    async fn current_metrics(&self) -> HashMap<String, f64> {
        let mut metrics = self.base_metrics().await;
        metrics.extend(self.external_metrics.lock().await.clone());
        metrics
    }

    async fn emergency_check(&self) -> Result<()> {
        let mut metrics = self.base_metrics().await;
        metrics.extend(std::mem::take(&mut *self.external_metrics.lock().await));

        if let Some(anomaly) = &self.anomaly {
            let timeout = Duration::from_millis(self.config.analysis_timeout_ms);
            match tokio::time::timeout(timeout, anomaly.analyze(&metrics)).await {
                Ok(Ok(report)) => report.enrich(&mut metrics),
                Ok(Err(e)) => warn!("Anomaly analysis failed: {}", e),
                Err(_) => warn!(timeout_ms = self.config.analysis_timeout_ms, "Anomaly analysis timed out"),
            }
        }

        let handled = self.detector.evaluate(&metrics).await.len() as u64;
        if handled > 0 {
            self.counters
                .emergencies_handled
                .fetch_add(handled, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn forward_improvement_triggers(&self) -> Result<()> {
        let window = self.config.improvement_window.max(1);
        let cooldown = Duration::from_secs(self.config.improvement_cooldown_secs);

        for agent in self.registry.snapshot().await {
            if agent.status == AgentStatus::Offline {
                continue;
            }
            let samples = self.registry.recent_samples(&agent.agent_id, window).await;
            if samples.len() < window {
                continue;
            }

            let n = samples.len() as f64;
            let avg_response_time = samples.iter().map(|s| s.response_time_ms).sum::<f64>() / n;
            let avg_success_rate = samples.iter().map(|s| s.success_rate).sum::<f64>() / n;
            let slow = avg_response_time > self.config.response_time_limit_ms;
            let failing = avg_success_rate < self.config.success_rate_limit;
            if !slow && !failing {
                continue;
            }

            {
                let mut cooldowns = self.improvement_cooldowns.lock().await;
                let now = Instant::now();
                if cooldowns
                    .get(&agent.agent_id)
                    .is_some_and(|last| now.duration_since(*last) < cooldown)
                {
                    continue;
                }
                cooldowns.insert(agent.agent_id.clone(), now);
            }

            let severity = if slow && failing { Severity::High } else { Severity::Medium };
            info!(
                agent_id = %agent.agent_id,
                avg_response_time,
                avg_success_rate,
                "Sustained degradation, sending improvement trigger"
            );
            let published = self.bus.publish(Message::new(
                MessageType::ImprovementTrigger,
                SUPERVISOR_ID,
                json!({
                    "trigger_type": "performance_degradation",
                    "performance_data": {
                        "agent_id": agent.agent_id,
                        "agent_type": agent.agent_type,
                        "avg_response_time_ms": avg_response_time,
                        "avg_success_rate": avg_success_rate,
                        "sample_count": samples.len(),
                        "response_time_limit_ms": self.config.response_time_limit_ms,
                        "success_rate_limit": self.config.success_rate_limit,
                    },
                    "timestamp": Utc::now().to_rfc3339(),
                    "affected_agents": [agent.agent_id],
                    "severity": severity,
                }),
            ));
            match published {
                Ok(_) => {
                    self.counters.improvement_triggers.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    // Let the next tick try again
                    self.improvement_cooldowns.lock().await.remove(&agent.agent_id);
                    warn!(agent_id = %agent.agent_id, "Improvement trigger not published: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Spawn the coordination loop
    pub fn start(self: &Arc<Self>, mut token: ShutdownToken) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(supervisor.config.coordination_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_ms = supervisor.config.coordination_interval_ms,
                provider = supervisor.provider.is_some(),
                anomaly_detection = supervisor.anomaly.is_some(),
                "Supervisor coordination loop started"
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => supervisor.tick().await,
                }
            }
            info!("Supervisor coordination loop stopped");
        })
    }

    pub async fn get_pending_decisions(&self) -> Vec<OperationalDecision> {
        self.pending.read().await.iter().cloned().collect()
    }

    /// Most recently archived decisions, oldest first
    pub async fn get_decision_history(&self, limit: usize) -> Vec<OperationalDecision> {
        let history = self.decision_history.read().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub async fn get_active_conflicts(&self) -> Vec<AgentConflict> {
        self.conflicts.read().await.clone()
    }

    pub async fn get_conflict_history(&self, limit: usize) -> Vec<AgentConflict> {
        let history = self.conflict_history.read().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub async fn get_deployments(&self, limit: usize) -> Vec<Value> {
        let deployments = self.deployments.read().await;
        let skip = deployments.len().saturating_sub(limit);
        deployments.iter().skip(skip).cloned().collect()
    }

    pub async fn get_supervisor_metrics(&self) -> SupervisorMetrics {
        let c = &self.counters;
        let executed = c.decisions_executed.load(Ordering::Relaxed);
        let failed = c.decisions_failed.load(Ordering::Relaxed);
        let attempted = executed + failed;
        let avg_decision_time_ms = if attempted == 0 {
            0.0
        } else {
            c.decision_time_us.load(Ordering::Relaxed) as f64 / attempted as f64 / 1000.0
        };

        let decisions_per_minute = {
            let mut executions = self.executions.lock().await;
            let now = Instant::now();
            while executions
                .front()
                .is_some_and(|t| now.duration_since(*t) > Duration::from_secs(60))
            {
                executions.pop_front();
            }
            executions.len() as f64
        };

        let counts = self.registry.status_counts().await;
        let agent_uptime_percent = if counts.total() == 0 {
            100.0
        } else {
            (counts.total() - counts.offline) as f64 / counts.total() as f64 * 100.0
        };

        SupervisorMetrics {
            decisions_per_minute,
            conflicts_resolved: c.conflicts_resolved.load(Ordering::Relaxed),
            emergencies_handled: c.emergencies_handled.load(Ordering::Relaxed),
            avg_decision_time_ms,
            agent_uptime_percent,
            decisions_executed: executed,
            decisions_via_fallback: c.decisions_via_fallback.load(Ordering::Relaxed),
            decisions_rejected: c.decisions_rejected.load(Ordering::Relaxed),
            decisions_expired: c.decisions_expired.load(Ordering::Relaxed),
            decisions_failed: failed,
            pending_decisions: self.pending.read().await.len(),
            active_conflicts: self.conflicts.read().await.len(),
            conflicts_escalated: c.conflicts_escalated.load(Ordering::Relaxed),
            improvement_triggers_sent: c.improvement_triggers.load(Ordering::Relaxed),
            coordination_ticks: c.ticks.load(Ordering::Relaxed),
            step_failures: c.step_failures.load(Ordering::Relaxed),
        }
    }

    pub async fn get_system_status(&self) -> SupervisorStatus {
        SupervisorStatus {
            agents: self.registry.snapshot().await,
            status_counts: self.registry.status_counts().await,
            active_emergencies: self.detector.get_active().await,
            metrics: self.get_supervisor_metrics().await,
        }
    }
}

fn string_list(payload: &Value, key: &str) -> Option<Vec<String>> {
    payload.get(key).and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
}

struct SupervisorHandler {
    supervisor: Arc<Supervisor>,
}

#[async_trait]
impl MessageHandler for SupervisorHandler {
    async fn handle(&self, message: &Message) -> Result<()> {
        self.supervisor.handle_message(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emergency::{BusInterventionExecutor, EmergencyConfig, ProtocolTable};
    use crate::error::HiveError;
    use crate::monitoring::{MonitoringConfig, StaticHostProbe, StatusUpdate};
    use crate::predicate::Predicate;
    use crate::supervisor::decision::MockDecisionProvider;

    struct Fixture {
        bus: MessageBus,
        registry: Arc<AgentRegistry>,
        detector: Arc<EmergencyDetector>,
        probe: Arc<MonitoringProbe>,
    }

    fn fixture() -> Fixture {
        let bus = MessageBus::with_defaults();
        let registry = Arc::new(AgentRegistry::new());
        let detector = Arc::new(EmergencyDetector::new(
            EmergencyConfig::default(),
            bus.clone(),
            Arc::clone(&registry),
            ProtocolTable::default(),
            Arc::new(BusInterventionExecutor::new(bus.clone())),
        ));
        let probe = Arc::new(MonitoringProbe::new(
            MonitoringConfig::default(),
            bus.clone(),
            Arc::clone(&registry),
            Arc::new(StaticHostProbe {
                sample: HostSample::default(),
            }),
        ));
        Fixture {
            bus,
            registry,
            detector,
            probe,
        }
    }

    fn supervisor(f: &Fixture) -> Supervisor {
        Supervisor::new(
            SupervisorConfig::default(),
            f.bus.clone(),
            Arc::clone(&f.registry),
            Arc::clone(&f.probe),
            Arc::clone(&f.detector),
        )
    }

    fn urgent(agents: &[&str]) -> OperationalDecision {
        OperationalDecision::new(
            DecisionType::ResourceAllocation,
            "scale up",
            agents.iter().map(|a| a.to_string()).collect(),
            json!({"risk_level": 3}),
            0.9,
        )
    }

    #[tokio::test]
    async fn test_provider_plan_is_executed() {
        let f = fixture();
        let mut provider = MockDecisionProvider::new();
        provider.expect_evaluate().times(1).returning(|ctx| {
            assert_eq!(ctx.decision_type, DecisionType::ResourceAllocation);
            Ok(ProviderDecision {
                action: "add_replica".into(),
                confidence: 0.93,
                execution_plan: vec!["provision".into()],
                rollback_plan: vec!["deprovision".into()],
                monitoring_metrics: vec![],
            })
        });
        let sup = supervisor(&f).with_decision_provider(Arc::new(provider));
        f.bus.start().await.unwrap();

        sup.submit_decision(urgent(&["roxy"])).await;
        sup.tick().await;
        assert!(f.bus.drain(Duration::from_secs(1)).await);

        let history = sup.get_decision_history(10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, DecisionStatus::Executed);
        assert_eq!(history[0].executed_by, Some(DecisionSource::Provider));

        let commands = f
            .bus
            .get_message_history(Some(MessageType::SystemCommand), Some(SUPERVISOR_ID), 10)
            .await;
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].recipient_id.as_deref(), Some("roxy"));
        assert_eq!(commands[0].payload_str("command"), Some("add_replica"));
        f.bus.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_falls_back() {
        let f = fixture();
        struct Stalled;
        #[async_trait]
        impl DecisionProvider for Stalled {
            async fn evaluate(&self, _ctx: &DecisionContext) -> Result<ProviderDecision> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(HiveError::Cancelled)
            }
        }
        let sup = supervisor(&f).with_decision_provider(Arc::new(Stalled));

        sup.submit_decision(urgent(&[])).await;
        sup.tick().await;

        let history = sup.get_decision_history(10).await;
        assert_eq!(history[0].executed_by, Some(DecisionSource::LocalFallback));
        assert_eq!(sup.get_supervisor_metrics().await.decisions_via_fallback, 1);
    }

    #[tokio::test]
    async fn test_provider_error_falls_back() {
        let f = fixture();
        let mut provider = MockDecisionProvider::new();
        provider
            .expect_evaluate()
            .returning(|_| Err(HiveError::Transient("connection reset".into())));
        let sup = supervisor(&f).with_decision_provider(Arc::new(provider));

        sup.submit_decision(urgent(&["roxy"])).await;
        sup.tick().await;
        let decision = &sup.get_decision_history(1).await[0];
        assert_eq!(decision.status, DecisionStatus::Executed);
        assert_eq!(decision.executed_by, Some(DecisionSource::LocalFallback));
    }

    #[tokio::test(start_paused = true)]
    async fn test_decision_lifecycle() {
        let f = fixture();
        let sup = supervisor(&f);

        let blocked = urgent(&[]).with_constraints(Predicate::parse("risk_level > 7").unwrap());
        let low = OperationalDecision::new(
            DecisionType::AgentCoordination,
            "sync later",
            vec![],
            json!({}),
            0.5,
        );
        sup.submit_decision(blocked).await;
        sup.submit_decision(low).await;

        sup.tick().await;
        assert_eq!(sup.get_pending_decisions().await.len(), 1);
        assert_eq!(sup.get_decision_history(10).await[0].status, DecisionStatus::Rejected);

        tokio::time::advance(Duration::from_secs(301)).await;
        sup.tick().await;
        assert!(sup.get_pending_decisions().await.is_empty());
        let history = sup.get_decision_history(10).await;
        assert_eq!(history[1].status, DecisionStatus::Expired);

        let metrics = sup.get_supervisor_metrics().await;
        assert_eq!(metrics.decisions_rejected, 1);
        assert_eq!(metrics.decisions_expired, 1);
        assert_eq!(metrics.decisions_executed, 0);
    }

    #[tokio::test]
    async fn test_resource_contention_resolves_by_priority() {
        let f = fixture();
        let sup = supervisor(&f);
        sup.register_agent("scheduler", "booking", vec![], 3).await;
        sup.register_agent("roxy", "call_handler", vec![], 1).await;

        let claim = |agent: &str| {
            Message::new(
                MessageType::AgentStatusUpdate,
                agent,
                json!({"agent_id": agent, "resource_claims": ["calendar"]}),
            )
        };
        sup.handle_message(&claim("scheduler")).await.unwrap();
        sup.handle_message(&claim("roxy")).await.unwrap();
        assert_eq!(sup.get_active_conflicts().await.len(), 1);

        sup.tick().await;
        assert!(sup.get_active_conflicts().await.is_empty());
        let resolved = &sup.get_conflict_history(1).await[0];
        assert_eq!(resolved.winner.as_deref(), Some("roxy"));
        assert_eq!(sup.get_supervisor_metrics().await.conflicts_resolved, 1);
    }

    #[tokio::test]
    async fn test_conflicts_are_archived_when_bus_is_closed() {
        let f = fixture();
        let sup = supervisor(&f);
        sup.register_agent("scheduler", "booking", vec![], 3).await;
        sup.register_agent("roxy", "call_handler", vec![], 1).await;
        f.bus.start().await.unwrap();
        f.bus.stop().await;
        assert!(f
            .bus
            .publish(Message::new(MessageType::HealthCheck, "test", json!({})))
            .is_err());

        for slot in 0..3 {
            sup.report_conflict(AgentConflict::new(
                ConflictType::ResourceContention,
                vec!["scheduler".into(), "roxy".into()],
                format!("calendar slot {slot}"),
                Severity::Medium,
            ))
            .await;
        }
        sup.tick().await;

        assert!(sup.get_active_conflicts().await.is_empty());
        let history = sup.get_conflict_history(10).await;
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|c| c.winner.as_deref() == Some("roxy")));
        assert_eq!(sup.get_supervisor_metrics().await.conflicts_resolved, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_sweep_survives_closed_bus() {
        let f = fixture();
        let sup = supervisor(&f);
        sup.register_agent("roxy", "call_handler", vec![], 1).await;
        f.bus.start().await.unwrap();
        f.bus.stop().await;

        tokio::time::advance(Duration::from_secs(31)).await;
        sup.tick().await;

        assert_eq!(
            f.registry.get("roxy").await.unwrap().status,
            AgentStatus::Offline
        );
        let history = sup.get_decision_history(10).await;
        let rebalance = history
            .iter()
            .find(|d| d.decision_type == DecisionType::LoadBalancing)
            .unwrap();
        assert_eq!(rebalance.status, DecisionStatus::Failed);
        assert_eq!(sup.get_supervisor_metrics().await.step_failures, 0);
    }

    #[tokio::test]
    async fn test_unresolvable_conflict_is_escalated() {
        let f = fixture();
        let sup = supervisor(&f);
        f.bus.start().await.unwrap();

        sup.report_conflict(AgentConflict::new(
            ConflictType::ContradictoryActions,
            vec!["ghost-1".into(), "ghost-2".into()],
            "unknown agents disagree",
            Severity::High,
        ))
        .await;

        sup.tick().await;
        sup.tick().await;
        assert_eq!(sup.get_active_conflicts().await.len(), 1);
        sup.tick().await;
        assert!(sup.get_active_conflicts().await.is_empty());
        assert!(f.bus.drain(Duration::from_secs(1)).await);

        let alerts = f
            .bus
            .get_message_history(Some(MessageType::EmergencyAlert), Some(SUPERVISOR_ID), 10)
            .await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].payload_str("event_type"), Some("conflict_escalated"));
        f.bus.stop().await;
    }

    #[tokio::test]
    async fn test_external_alert_becomes_urgent_decision() {
        let f = fixture();
        let sup = supervisor(&f);

        let internal = Message::new(MessageType::EmergencyAlert, PROBE_ID, json!({"alert_type": "high_cpu_usage"}));
        sup.handle_message(&internal).await.unwrap();
        assert!(sup.get_pending_decisions().await.is_empty());

        let external = Message::new(
            MessageType::EmergencyAlert,
            "call_handler",
            json!({"agent_id": "roxy", "reason": "caller audio dropped"}),
        );
        sup.handle_message(&external).await.unwrap();
        let pending = sup.get_pending_decisions().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].decision_type, DecisionType::EmergencyResponse);
        assert_eq!(pending[0].affected_agents, vec!["roxy".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_deployment_needs_bridge_targeting() {
        let f = fixture();
        let sup = supervisor(&f);
        let payload = json!({"deployment_id": "d-7", "status": "failed", "timestamp": "2026-01-01T00:00:00Z"});

        let raw = Message::new(MessageType::DeploymentNotification, "improvement_pipeline", payload.clone());
        sup.handle_message(&raw).await.unwrap();
        assert!(sup.get_deployments(10).await.is_empty());

        let forwarded = Message::new(MessageType::DeploymentNotification, BRIDGE_ID, payload).to(SUPERVISOR_ID);
        sup.handle_message(&forwarded).await.unwrap();
        assert_eq!(sup.get_deployments(10).await.len(), 1);
        let pending = sup.get_pending_decisions().await;
        assert_eq!(pending[0].decision_type, DecisionType::AgentCoordination);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_metrics_feed_detector() {
        let f = fixture();
        let sup = supervisor(&f);

        let rate_limited = Message::new(
            MessageType::PerformanceMetric,
            "call_handler",
            json!({"metric_name": "api_rate_limit_hit", "value": 3.0}),
        );
        sup.handle_message(&rate_limited).await.unwrap();
        sup.tick().await;

        let metrics = sup.get_supervisor_metrics().await;
        assert_eq!(metrics.emergencies_handled, 1);
        assert_eq!(f.detector.active_count().await, 1);

        // consumed by the check, so the next tick sees nothing new
        tokio::time::advance(Duration::from_secs(1000)).await;
        sup.tick().await;
        assert_eq!(sup.get_supervisor_metrics().await.emergencies_handled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_degradation_sends_one_trigger() {
        let f = fixture();
        let sup = supervisor(&f);
        f.bus.start().await.unwrap();
        sup.register_agent("roxy", "call_handler", vec![], 1).await;
        for _ in 0..10 {
            f.registry
                .update_status(
                    "roxy",
                    &StatusUpdate {
                        response_time_ms: Some(7000.0),
                        success_rate: Some(0.97),
                        ..Default::default()
                    },
                )
                .await;
        }

        sup.tick().await;
        sup.tick().await;
        assert!(f.bus.drain(Duration::from_secs(1)).await);

        let triggers = f
            .bus
            .get_message_history(Some(MessageType::ImprovementTrigger), Some(SUPERVISOR_ID), 10)
            .await;
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].payload_str("trigger_type"), Some("performance_degradation"));
        assert_eq!(triggers[0].payload_str("severity"), Some("medium"));
        f.bus.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_agent_triggers_rebalance() {
        let f = fixture();
        let sup = supervisor(&f);
        sup.register_agent("roxy", "call_handler", vec![], 1).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        sup.tick().await;

        let history = sup.get_decision_history(10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].decision_type, DecisionType::LoadBalancing);
        assert_eq!(history[0].status, DecisionStatus::Executed);
        assert_eq!(sup.get_supervisor_metrics().await.agent_uptime_percent, 0.0);
    }
}
