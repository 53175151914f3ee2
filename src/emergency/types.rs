//! Emergency model and threshold configuration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyType {
    CallFailureRate,
    ResponseTimeDegradation,
    AgentDowntime,
    MemoryExhaustion,
    ApiRateLimit,
    PromptValidationFailure,
    SystemOverload,
}

impl EmergencyType {
    pub const ALL: [EmergencyType; 7] = [
        EmergencyType::CallFailureRate,
        EmergencyType::ResponseTimeDegradation,
        EmergencyType::AgentDowntime,
        EmergencyType::MemoryExhaustion,
        EmergencyType::ApiRateLimit,
        EmergencyType::PromptValidationFailure,
        EmergencyType::SystemOverload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmergencyType::CallFailureRate => "call_failure_rate",
            EmergencyType::ResponseTimeDegradation => "response_time_degradation",
            EmergencyType::AgentDowntime => "agent_downtime",
            EmergencyType::MemoryExhaustion => "memory_exhaustion",
            EmergencyType::ApiRateLimit => "api_rate_limit",
            EmergencyType::PromptValidationFailure => "prompt_validation_failure",
            EmergencyType::SystemOverload => "system_overload",
        }
    }
}

impl std::fmt::Display for EmergencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction in which a threshold is breached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    #[default]
    Above,
    Below,
}

/// A metric limit whose breach raises an emergency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyThreshold {
    pub name: String,
    pub metric_name: String,
    pub threshold_value: f64,
    pub severity: Severity,
    pub emergency_type: EmergencyType,
    #[serde(default)]
    pub comparison: Comparison,
    /// How long the breach must persist when duration enforcement is on
    #[serde(default = "default_duration_seconds")]
    pub duration_seconds: u64,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
}

fn default_duration_seconds() -> u64 {
    60
}

fn default_cooldown_seconds() -> u64 {
    300
}

impl EmergencyThreshold {
    pub fn new(
        name: &str,
        metric_name: &str,
        threshold_value: f64,
        severity: Severity,
        emergency_type: EmergencyType,
    ) -> Self {
        Self {
            name: name.to_string(),
            metric_name: metric_name.to_string(),
            threshold_value,
            severity,
            emergency_type,
            comparison: Comparison::Above,
            duration_seconds: default_duration_seconds(),
            cooldown_seconds: default_cooldown_seconds(),
        }
    }

    pub fn below(mut self) -> Self {
        self.comparison = Comparison::Below;
        self
    }

    pub fn with_timing(mut self, duration_seconds: u64, cooldown_seconds: u64) -> Self {
        self.duration_seconds = duration_seconds;
        self.cooldown_seconds = cooldown_seconds;
        self
    }

    pub fn is_breached(&self, value: f64) -> bool {
        match self.comparison {
            Comparison::Above => value > self.threshold_value,
            Comparison::Below => value < self.threshold_value,
        }
    }

    /// Built-in thresholds
    pub fn defaults() -> Vec<EmergencyThreshold> {
        vec![
            EmergencyThreshold::new(
                "call_failure_rate",
                "call_failure_rate",
                0.3,
                Severity::High,
                EmergencyType::CallFailureRate,
            )
            .with_timing(120, 300),
            EmergencyThreshold::new(
                "response_time",
                "avg_response_time_ms",
                8000.0,
                Severity::Medium,
                EmergencyType::ResponseTimeDegradation,
            )
            .with_timing(180, 180),
            EmergencyThreshold::new(
                "agent_downtime",
                "agent_downtime_seconds",
                300.0,
                Severity::Critical,
                EmergencyType::AgentDowntime,
            )
            .with_timing(60, 600),
            EmergencyThreshold::new(
                "memory_usage",
                "memory_usage_percent",
                90.0,
                Severity::High,
                EmergencyType::MemoryExhaustion,
            )
            .with_timing(300, 300),
            EmergencyThreshold::new(
                "api_rate_limit",
                "api_rate_limit_hit",
                1.0,
                Severity::Medium,
                EmergencyType::ApiRateLimit,
            )
            .with_timing(30, 900),
        ]
    }
}

/// A raised emergency
#[derive(Debug, Clone, Serialize)]
pub struct Emergency {
    pub id: String,
    #[serde(rename = "type")]
    pub emergency_type: EmergencyType,
    pub severity: Severity,
    pub threshold_name: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub affected_agents: Vec<String>,
    pub metrics: BTreeMap<String, f64>,
    pub resolved: bool,
    pub resolution_timestamp: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
}

impl Emergency {
    pub fn new(
        threshold: &EmergencyThreshold,
        value: f64,
        affected_agents: Vec<String>,
        metrics: BTreeMap<String, f64>,
    ) -> Self {
        let relation = match threshold.comparison {
            Comparison::Above => ">",
            Comparison::Below => "<",
        };
        Self {
            id: Uuid::new_v4().to_string(),
            emergency_type: threshold.emergency_type,
            severity: threshold.severity,
            threshold_name: threshold.name.clone(),
            message: format!(
                "{} exceeded threshold: {} {} {}",
                threshold.metric_name, value, relation, threshold.threshold_value
            ),
            timestamp: Utc::now(),
            affected_agents,
            metrics,
            resolved: false,
            resolution_timestamp: None,
            resolution_notes: None,
        }
    }
}
