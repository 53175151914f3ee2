//! Intervention protocols
//!
//! Each emergency type maps to an ordered list of intervention steps. Steps
//! are executed by an `InterventionExecutor`; the default one turns them into
//! bus commands addressed to the affected agents.

use super::types::{Emergency, EmergencyType};
use crate::bus::{Message, MessageBus, MessagePriority, MessageType};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{info, warn};

/// Sender id for intervention commands
pub const DETECTOR_ID: &str = "emergency_detector";

/// Intervention steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionProtocol {
    ActivateBackupPrompts,
    ReduceAiComplexity,
    EnableFallbackResponses,
    NotifyHumanOperators,
    OptimizePromptLength,
    ReduceAiTemperature,
    EnableResponseCaching,
    ScaleProcessingResources,
    RestartFailedAgents,
    RedistributeWorkload,
    ActivateBackupAgents,
    EscalateToHumanSupport,
    ClearMemoryCaches,
    ReduceConversationHistory,
    GarbageCollectSessions,
    ScaleMemoryResources,
    ImplementRequestThrottling,
    ActivateBackupApiKeys,
    ReduceApiCallFrequency,
    CacheRecentResponses,
    RollbackPromptVersion,
    ShedNonCriticalLoad,
}

impl InterventionProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterventionProtocol::ActivateBackupPrompts => "activate_backup_prompts",
            InterventionProtocol::ReduceAiComplexity => "reduce_ai_complexity",
            InterventionProtocol::EnableFallbackResponses => "enable_fallback_responses",
            InterventionProtocol::NotifyHumanOperators => "notify_human_operators",
            InterventionProtocol::OptimizePromptLength => "optimize_prompt_length",
            InterventionProtocol::ReduceAiTemperature => "reduce_ai_temperature",
            InterventionProtocol::EnableResponseCaching => "enable_response_caching",
            InterventionProtocol::ScaleProcessingResources => "scale_processing_resources",
            InterventionProtocol::RestartFailedAgents => "restart_failed_agents",
            InterventionProtocol::RedistributeWorkload => "redistribute_workload",
            InterventionProtocol::ActivateBackupAgents => "activate_backup_agents",
            InterventionProtocol::EscalateToHumanSupport => "escalate_to_human_support",
            InterventionProtocol::ClearMemoryCaches => "clear_memory_caches",
            InterventionProtocol::ReduceConversationHistory => "reduce_conversation_history",
            InterventionProtocol::GarbageCollectSessions => "garbage_collect_sessions",
            InterventionProtocol::ScaleMemoryResources => "scale_memory_resources",
            InterventionProtocol::ImplementRequestThrottling => "implement_request_throttling",
            InterventionProtocol::ActivateBackupApiKeys => "activate_backup_api_keys",
            InterventionProtocol::ReduceApiCallFrequency => "reduce_api_call_frequency",
            InterventionProtocol::CacheRecentResponses => "cache_recent_responses",
            InterventionProtocol::RollbackPromptVersion => "rollback_prompt_version",
            InterventionProtocol::ShedNonCriticalLoad => "shed_non_critical_load",
        }
    }

    /// Steps that page a human instead of commanding agents
    pub fn is_operator_notification(&self) -> bool {
        matches!(
            self,
            InterventionProtocol::NotifyHumanOperators | InterventionProtocol::EscalateToHumanSupport
        )
    }
}

impl std::fmt::Display for InterventionProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emergency type to ordered intervention steps
#[derive(Debug, Clone)]
pub struct ProtocolTable {
    table: HashMap<EmergencyType, Vec<InterventionProtocol>>,
}

impl ProtocolTable {
    pub fn new(table: HashMap<EmergencyType, Vec<InterventionProtocol>>) -> Self {
        Self { table }
    }

    pub fn protocols_for(&self, emergency_type: EmergencyType) -> Option<&[InterventionProtocol]> {
        self.table.get(&emergency_type).map(Vec::as_slice)
    }
}

impl Default for ProtocolTable {
    fn default() -> Self {
        use InterventionProtocol::*;

        let table = EmergencyType::ALL
            .into_iter()
            .map(|t| {
                let steps = match t {
                    EmergencyType::CallFailureRate => vec![
                        ActivateBackupPrompts,
                        ReduceAiComplexity,
                        EnableFallbackResponses,
                        NotifyHumanOperators,
                    ],
                    EmergencyType::ResponseTimeDegradation => vec![
                        OptimizePromptLength,
                        ReduceAiTemperature,
                        EnableResponseCaching,
                        ScaleProcessingResources,
                    ],
                    EmergencyType::AgentDowntime => vec![
                        RestartFailedAgents,
                        RedistributeWorkload,
                        ActivateBackupAgents,
                        EscalateToHumanSupport,
                    ],
                    EmergencyType::MemoryExhaustion => vec![
                        ClearMemoryCaches,
                        ReduceConversationHistory,
                        GarbageCollectSessions,
                        ScaleMemoryResources,
                    ],
                    EmergencyType::ApiRateLimit => vec![
                        ImplementRequestThrottling,
                        ActivateBackupApiKeys,
                        ReduceApiCallFrequency,
                        CacheRecentResponses,
                    ],
                    EmergencyType::PromptValidationFailure => vec![
                        RollbackPromptVersion,
                        ActivateBackupPrompts,
                        EnableFallbackResponses,
                        NotifyHumanOperators,
                    ],
                    EmergencyType::SystemOverload => vec![
                        ImplementRequestThrottling,
                        ShedNonCriticalLoad,
                        ScaleProcessingResources,
                        NotifyHumanOperators,
                    ],
                };
                (t, steps)
            })
            .collect();
        Self { table }
    }
}

/// Outcome of one intervention step
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub action: String,
    pub success: bool,
    pub result: Value,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of handling one emergency
#[derive(Debug, Clone, Serialize)]
pub struct InterventionResult {
    pub emergency_id: String,
    pub actions_taken: Vec<StepResult>,
    pub errors: Vec<String>,
    pub success: bool,
}

/// Carries out intervention steps
#[async_trait]
pub trait InterventionExecutor: Send + Sync {
    async fn execute(&self, protocol: InterventionProtocol, emergency: &Emergency) -> Result<Value>;
}

/// Dispatches intervention steps as bus messages
pub struct BusInterventionExecutor {
    bus: MessageBus,
}

impl BusInterventionExecutor {
    pub fn new(bus: MessageBus) -> Self {
        Self { bus }
    }

    fn notify_operators(&self, protocol: InterventionProtocol, emergency: &Emergency) -> Result<Value> {
        warn!(
            emergency_id = %emergency.id,
            emergency_type = %emergency.emergency_type,
            severity = %emergency.severity,
            "Paging human operators"
        );
        self.bus.publish(
            Message::new(
                MessageType::EmergencyAlert,
                DETECTOR_ID,
                json!({
                    "event_type": "operator_notification",
                    "action": protocol.as_str(),
                    "emergency_id": emergency.id,
                    "emergency_type": emergency.emergency_type,
                    "severity": emergency.severity,
                    "message": emergency.message,
                    "affected_agents": emergency.affected_agents,
                    "timestamp": emergency.timestamp.to_rfc3339(),
                }),
            )
            .with_priority(MessagePriority::Critical)
            .with_correlation_id(emergency.id.clone()),
        )?;
        Ok(json!({ "status": "success", "notification_sent": true }))
    }
}

#[async_trait]
impl InterventionExecutor for BusInterventionExecutor {
    async fn execute(&self, protocol: InterventionProtocol, emergency: &Emergency) -> Result<Value> {
        if protocol.is_operator_notification() {
            return self.notify_operators(protocol, emergency);
        }

        let command = |recipient: Option<&String>| {
            let message = Message::new(
                MessageType::SystemCommand,
                DETECTOR_ID,
                json!({
                    "command": protocol.as_str(),
                    "emergency_id": emergency.id,
                    "emergency_type": emergency.emergency_type,
                    "severity": emergency.severity,
                }),
            )
            .with_priority(MessagePriority::High)
            .with_correlation_id(emergency.id.clone());
            match recipient {
                Some(agent_id) => message.to(agent_id.clone()),
                None => message,
            }
        };

        let mut dispatched = 0usize;
        if emergency.affected_agents.is_empty() {
            self.bus.publish(command(None))?;
            dispatched += 1;
        } else {
            for agent_id in &emergency.affected_agents {
                self.bus.publish(command(Some(agent_id)))?;
                dispatched += 1;
            }
        }

        info!(
            emergency_id = %emergency.id,
            action = protocol.as_str(),
            dispatched,
            "Intervention dispatched"
        );
        Ok(json!({ "status": "dispatched", "commands": dispatched }))
    }
}
