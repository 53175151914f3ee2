//! Agent-side reporting helpers
//!
//! What an agent process calls to report liveness and performance. Every call
//! becomes a bus message picked up by the monitoring probe.

use super::registry::{AgentStatus, MetricUpdate, StatusUpdate};
use crate::bus::{Message, MessageBus, MessageType};
use crate::error::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Clone)]
pub struct AgentReporter {
    bus: MessageBus,
    agent_id: String,
}

impl AgentReporter {
    pub fn new(bus: MessageBus, agent_id: impl Into<String>) -> Self {
        Self {
            bus,
            agent_id: agent_id.into(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn heartbeat(&self, status: AgentStatus) -> Result<String> {
        self.bus.publish(Message::new(
            MessageType::AgentHeartbeat,
            self.agent_id.clone(),
            json!({
                "agent_id": self.agent_id,
                "status": status,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        ))
    }

    pub fn status_update(&self, update: &StatusUpdate) -> Result<String> {
        self.send(MessageType::AgentStatusUpdate, update)
    }

    pub fn performance_metric(&self, update: &MetricUpdate) -> Result<String> {
        self.send(MessageType::PerformanceMetric, update)
    }

    fn send<T: Serialize>(&self, message_type: MessageType, fields: &T) -> Result<String> {
        let mut payload = serde_json::to_value(fields)?;
        if let Value::Object(map) = &mut payload {
            map.insert("agent_id".to_string(), Value::String(self.agent_id.clone()));
        }
        self.bus
            .publish(Message::new(message_type, self.agent_id.clone(), payload))
    }
}
