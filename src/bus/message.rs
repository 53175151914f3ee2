//! Message model for the in-process bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Default number of delivery rounds before a message is dead-lettered
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Message types carried by the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    AgentHeartbeat,
    AgentStatusUpdate,
    EmergencyAlert,
    ImprovementTrigger,
    DeploymentNotification,
    PerformanceMetric,
    SystemCommand,
    HealthCheck,
}

impl MessageType {
    pub const ALL: [MessageType; 8] = [
        MessageType::AgentHeartbeat,
        MessageType::AgentStatusUpdate,
        MessageType::EmergencyAlert,
        MessageType::ImprovementTrigger,
        MessageType::DeploymentNotification,
        MessageType::PerformanceMetric,
        MessageType::SystemCommand,
        MessageType::HealthCheck,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::AgentHeartbeat => "agent_heartbeat",
            MessageType::AgentStatusUpdate => "agent_status_update",
            MessageType::EmergencyAlert => "emergency_alert",
            MessageType::ImprovementTrigger => "improvement_trigger",
            MessageType::DeploymentNotification => "deployment_notification",
            MessageType::PerformanceMetric => "performance_metric",
            MessageType::SystemCommand => "system_command",
            MessageType::HealthCheck => "health_check",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageType {
    type Err = crate::error::HiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| crate::error::HiveError::Validation(format!("unknown message type '{s}'")))
    }
}

/// Message priority. Carried as an attribute, not a scheduling discipline.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl MessagePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessagePriority::Low => "low",
            MessagePriority::Normal => "normal",
            MessagePriority::High => "high",
            MessagePriority::Critical => "critical",
        }
    }
}

/// A bus message.
///
/// Immutable once published except for `retry_count`, which the bus bumps on
/// each failed delivery round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    pub payload: Value,
    #[serde(default)]
    pub priority: MessagePriority,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Monotonic expiry used by the consumer loop
    #[serde(skip)]
    deadline: Option<Instant>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Message {
    /// Create a broadcast message with normal priority
    pub fn new(message_type: MessageType, sender_id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            sender_id: sender_id.into(),
            recipient_id: None,
            payload,
            priority: MessagePriority::Normal,
            created_at: Utc::now(),
            expires_at: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            correlation_id: None,
            deadline: None,
        }
    }

    /// Target a single subscriber instead of broadcasting
    pub fn to(mut self, recipient_id: impl Into<String>) -> Self {
        self.recipient_id = Some(recipient_id.into());
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Expire the message `ttl` after now
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.deadline = Some(Instant::now() + ttl);
        self.expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .map(|ttl| Utc::now() + ttl);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Whether the message has outlived its TTL
    pub fn is_expired(&self) -> bool {
        match (self.deadline, self.expires_at) {
            (Some(deadline), _) => Instant::now() > deadline,
            (None, Some(expires_at)) => Utc::now() > expires_at,
            (None, None) => false,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_none()
    }

    /// A fresh copy for re-publishing: new id, same content, correlation kept
    pub fn republish(&self, retry_count: u32) -> Self {
        let mut copy = Message::new(self.message_type, self.sender_id.clone(), self.payload.clone())
            .with_priority(self.priority)
            .with_max_retries(self.max_retries)
            .with_retry_count(retry_count)
            .with_correlation_id(
                self.correlation_id
                    .clone()
                    .unwrap_or_else(|| self.id.clone()),
            );
        copy.recipient_id = self.recipient_id.clone();
        copy
    }

    /// String field from the payload
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Numeric field from the payload
    pub fn payload_f64(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(Value::as_f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_type_round_trip_names() {
        for t in MessageType::ALL {
            assert_eq!(t.as_str().parse::<MessageType>().unwrap(), t);
            assert_eq!(serde_json::to_value(t).unwrap(), json!(t.as_str()));
        }
        assert!("agent_reboot".parse::<MessageType>().is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(MessagePriority::Critical > MessagePriority::High);
        assert!(MessagePriority::High > MessagePriority::Normal);
        assert!(MessagePriority::Normal > MessagePriority::Low);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let message = Message::new(MessageType::HealthCheck, "probe", json!({}))
            .with_ttl(Duration::from_secs(5));
        assert!(!message.is_expired());
        assert!(message.expires_at.is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(message.is_expired());
    }

    #[test]
    fn test_republish_keeps_correlation() {
        let original = Message::new(MessageType::ImprovementTrigger, "supervisor", json!({"a": 1}))
            .to("integration_bridge")
            .with_retry_count(2);
        let copy = original.republish(0);

        assert_ne!(copy.id, original.id);
        assert_eq!(copy.correlation_id.as_deref(), Some(original.id.as_str()));
        assert_eq!(copy.retry_count, 0);
        assert_eq!(copy.recipient_id.as_deref(), Some("integration_bridge"));
        assert_eq!(copy.payload, original.payload);
    }
}
