//! Threshold-based emergency detection and handling
//!
//! `check_conditions` compares a metric snapshot against every threshold.
//! A breach raises an emergency unless the `(threshold, severity)` pair is
//! still cooling down from its last trigger. `handle` runs the intervention
//! steps for the emergency's type in order, recording each outcome; a failed
//! or slow step never stops the ones after it.

use super::protocols::{
    InterventionExecutor, InterventionProtocol, InterventionResult, ProtocolTable, StepResult,
    DETECTOR_ID,
};
use super::types::{Emergency, EmergencyThreshold, EmergencyType, Severity};
use crate::bus::{Message, MessageBus, MessagePriority, MessageType};
use crate::error::{HiveError, Result};
use crate::monitoring::{AgentRegistry, AgentStatus};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyConfig {
    pub thresholds: Vec<EmergencyThreshold>,
    /// Require a breach to persist for `duration_seconds` before it fires
    pub enforce_duration: bool,
    pub intervention_step_timeout_ms: u64,
    /// Resolved emergencies kept in history
    pub history_size: usize,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            thresholds: EmergencyThreshold::defaults(),
            enforce_duration: false,
            intervention_step_timeout_ms: 5000,
            history_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EmergencyStatistics {
    pub total_emergencies: usize,
    pub active_emergencies: usize,
    pub resolved_emergencies: usize,
    pub interventions_failed: u64,
    pub severity_distribution: BTreeMap<Severity, usize>,
    pub type_distribution: BTreeMap<EmergencyType, usize>,
    pub last_emergency: Option<DateTime<Utc>>,
}

pub struct EmergencyDetector {
    config: EmergencyConfig,
    bus: MessageBus,
    registry: Arc<AgentRegistry>,
    protocols: ProtocolTable,
    executor: Arc<dyn InterventionExecutor>,
    /// Cooldown expiry per (threshold name, severity)
    cooldowns: Mutex<HashMap<(String, Severity), Instant>>,
    /// When each currently breached threshold first crossed its limit
    breach_started: Mutex<HashMap<String, Instant>>,
    active: RwLock<HashMap<String, Emergency>>,
    history: RwLock<VecDeque<Emergency>>,
    active_gauge: Arc<AtomicUsize>,
    interventions_failed: AtomicU64,
}

impl EmergencyDetector {
    pub fn new(
        config: EmergencyConfig,
        bus: MessageBus,
        registry: Arc<AgentRegistry>,
        protocols: ProtocolTable,
        executor: Arc<dyn InterventionExecutor>,
    ) -> Self {
        Self {
            config,
            bus,
            registry,
            protocols,
            executor,
            cooldowns: Mutex::new(HashMap::new()),
            breach_started: Mutex::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            active_gauge: Arc::new(AtomicUsize::new(0)),
            interventions_failed: AtomicU64::new(0),
        }
    }

    pub fn thresholds(&self) -> &[EmergencyThreshold] {
        &self.config.thresholds
    }

    pub fn protocols(&self) -> &ProtocolTable {
        &self.protocols
    }

    /// Live count of active emergencies, shared with the monitoring probe
    pub fn active_gauge(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active_gauge)
    }

    /// Compare a metric snapshot against every threshold.
    ///
    /// Missing metrics never trigger. Thresholds fire independently.
    pub async fn check_conditions(&self, metrics: &HashMap<String, f64>) -> Vec<Emergency> {
        let now = Instant::now();
        let mut detected = Vec::new();

        for threshold in &self.config.thresholds {
            let breached = metrics
                .get(&threshold.metric_name)
                .copied()
                .filter(|v| threshold.is_breached(*v));
            let Some(value) = breached else {
                self.breach_started.lock().await.remove(&threshold.name);
                continue;
            };

            if self.config.enforce_duration {
                let mut started = self.breach_started.lock().await;
                let since = *started.entry(threshold.name.clone()).or_insert(now);
                if now.duration_since(since) < Duration::from_secs(threshold.duration_seconds) {
                    continue;
                }
            }

            {
                let mut cooldowns = self.cooldowns.lock().await;
                let key = (threshold.name.clone(), threshold.severity);
                if cooldowns.get(&key).is_some_and(|until| now < *until) {
                    continue;
                }
                cooldowns.insert(key, now + Duration::from_secs(threshold.cooldown_seconds));
            }

            let affected = self.affected_agents(threshold.emergency_type).await;
            let snapshot = metrics.iter().map(|(k, v)| (k.clone(), *v)).collect();
            let emergency = Emergency::new(threshold, value, affected, snapshot);
            warn!(
                emergency_id = %emergency.id,
                emergency_type = %emergency.emergency_type,
                severity = %emergency.severity,
                "Emergency detected: {}", emergency.message
            );
            detected.push(emergency);
        }
        detected
    }

    async fn affected_agents(&self, emergency_type: EmergencyType) -> Vec<String> {
        self.registry
            .snapshot()
            .await
            .into_iter()
            .filter(|agent| match emergency_type {
                EmergencyType::AgentDowntime => agent.status == AgentStatus::Offline,
                EmergencyType::MemoryExhaustion => true,
                _ => matches!(agent.status, AgentStatus::Degraded | AgentStatus::Unhealthy),
            })
            .map(|agent| agent.agent_id)
            .collect()
    }

    /// Run the intervention steps for an emergency and make it active
    pub async fn handle(&self, emergency: Emergency) -> InterventionResult {
        error!(
            emergency_id = %emergency.id,
            emergency_type = %emergency.emergency_type,
            severity = %emergency.severity,
            "Handling emergency"
        );

        let mut result = InterventionResult {
            emergency_id: emergency.id.clone(),
            actions_taken: Vec::new(),
            errors: Vec::new(),
            success: true,
        };

        match self.protocols.protocols_for(emergency.emergency_type) {
            Some(steps) => {
                for protocol in steps {
                    let step = self.run_intervention(*protocol, &emergency).await;
                    if let Some(e) = &step.error {
                        result.errors.push(format!("Failed to execute intervention '{protocol}': {e}"));
                        result.success = false;
                    }
                    result.actions_taken.push(step);
                }
            }
            None => {
                let e = HiveError::FatalConfiguration(format!(
                    "no intervention protocols for {}",
                    emergency.emergency_type
                ));
                error!(emergency_id = %emergency.id, "{}", e);
                result.errors.push(e.to_string());
                result.success = false;
            }
        }

        if !result.success {
            self.interventions_failed.fetch_add(1, Ordering::Relaxed);
        }

        self.publish_event("emergency_detected", &emergency, Some(&result));
        let mut active = self.active.write().await;
        active.insert(emergency.id.clone(), emergency);
        self.active_gauge.store(active.len(), Ordering::Relaxed);
        result
    }

    async fn run_intervention(&self, protocol: InterventionProtocol, emergency: &Emergency) -> StepResult {
        let timeout = Duration::from_millis(self.config.intervention_step_timeout_ms);
        let step = AssertUnwindSafe(self.executor.execute(protocol, emergency)).catch_unwind();

        let outcome = match tokio::time::timeout(timeout, step).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(_)) => Err("intervention panicked".to_string()),
            Err(_) => Err(HiveError::timeout(protocol.as_str(), timeout).to_string()),
        };

        match outcome {
            Ok(value) => {
                info!(emergency_id = %emergency.id, action = %protocol, "Intervention executed");
                StepResult {
                    action: protocol.as_str().to_string(),
                    success: true,
                    result: value,
                    error: None,
                    timestamp: Utc::now(),
                }
            }
            Err(e) => {
                error!(emergency_id = %emergency.id, action = %protocol, "Intervention failed: {}", e);
                StepResult {
                    action: protocol.as_str().to_string(),
                    success: false,
                    result: Value::Null,
                    error: Some(e),
                    timestamp: Utc::now(),
                }
            }
        }
    }

    /// Check a snapshot and handle everything it raises
    pub async fn evaluate(&self, metrics: &HashMap<String, f64>) -> Vec<InterventionResult> {
        let mut results = Vec::new();
        for emergency in self.check_conditions(metrics).await {
            results.push(self.handle(emergency).await);
        }
        results
    }

    /// Move an emergency from the active set to history
    pub async fn resolve(&self, emergency_id: &str, notes: &str) -> Result<Emergency> {
        let mut emergency = {
            let mut active = self.active.write().await;
            let emergency = active
                .remove(emergency_id)
                .ok_or_else(|| HiveError::Validation(format!("emergency {emergency_id} not found")))?;
            self.active_gauge.store(active.len(), Ordering::Relaxed);
            emergency
        };

        emergency.resolved = true;
        emergency.resolution_timestamp = Some(Utc::now());
        if !notes.is_empty() {
            emergency.resolution_notes = Some(notes.to_string());
        }
        info!(emergency_id, notes, "Emergency resolved");

        {
            let mut history = self.history.write().await;
            history.push_back(emergency.clone());
            while history.len() > self.config.history_size.max(1) {
                history.pop_front();
            }
        }
        self.publish_event("emergency_resolved", &emergency, None);
        Ok(emergency)
    }

    fn publish_event(&self, event_type: &str, emergency: &Emergency, result: Option<&InterventionResult>) {
        let priority = if emergency.severity == Severity::Critical && !emergency.resolved {
            MessagePriority::Critical
        } else {
            MessagePriority::High
        };
        let message = Message::new(
            MessageType::EmergencyAlert,
            DETECTOR_ID,
            json!({
                "event_type": event_type,
                "emergency_id": emergency.id,
                "emergency_type": emergency.emergency_type,
                "severity": emergency.severity,
                "message": emergency.message,
                "affected_agents": emergency.affected_agents,
                "intervention_success": result.map(|r| r.success),
                "resolution_timestamp": emergency.resolution_timestamp.map(|t| t.to_rfc3339()),
            }),
        )
        .with_priority(priority)
        .with_correlation_id(emergency.id.clone());

        if let Err(e) = self.bus.publish(message) {
            warn!(emergency_id = %emergency.id, "Could not publish {}: {}", event_type, e);
        }
    }

    /// Active emergencies, oldest first
    pub async fn get_active(&self) -> Vec<Emergency> {
        let mut active: Vec<Emergency> = self.active.read().await.values().cloned().collect();
        active.sort_by_key(|e| e.timestamp);
        active
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Most recently resolved emergencies, oldest first
    pub async fn get_history(&self, limit: usize) -> Vec<Emergency> {
        let history = self.history.read().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub async fn get_statistics(&self) -> EmergencyStatistics {
        let active = self.active.read().await;
        let history = self.history.read().await;

        let mut severity_distribution = BTreeMap::new();
        let mut type_distribution = BTreeMap::new();
        let mut last_emergency = None;
        for emergency in history.iter().chain(active.values()) {
            *severity_distribution.entry(emergency.severity).or_insert(0) += 1;
            *type_distribution.entry(emergency.emergency_type).or_insert(0) += 1;
            last_emergency = last_emergency.max(Some(emergency.timestamp));
        }

        EmergencyStatistics {
            total_emergencies: active.len() + history.len(),
            active_emergencies: active.len(),
            resolved_emergencies: history.len(),
            interventions_failed: self.interventions_failed.load(Ordering::Relaxed),
            severity_distribution,
            type_distribution,
            last_emergency,
        }
    }
}
