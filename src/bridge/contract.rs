//! Versioned message contracts for cross-domain traffic

use crate::bus::MessageType;
use crate::error::ContractError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Payload key carrying the sender's contract version
pub const CONTRACT_VERSION_FIELD: &str = "contract_version";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractVersion {
    #[serde(rename = "1.0")]
    V1_0,
    #[serde(rename = "1.1")]
    V1_1,
}

impl ContractVersion {
    pub const CURRENT: ContractVersion = ContractVersion::V1_1;

    pub fn as_str(&self) -> &'static str {
        match self {
            ContractVersion::V1_0 => "1.0",
            ContractVersion::V1_1 => "1.1",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1.0" => Some(ContractVersion::V1_0),
            "1.1" => Some(ContractVersion::V1_1),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContractVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Object,
    Array,
    Boolean,
    Number,
}

impl FieldKind {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Number => value.is_number(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
            FieldKind::Boolean => "boolean",
            FieldKind::Number => "number",
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Schema of one message type
#[derive(Debug, Clone, Serialize)]
pub struct MessageContract {
    pub version: ContractVersion,
    pub required: Vec<(String, FieldKind)>,
    pub optional: Vec<(String, FieldKind)>,
    /// Older versions still accepted
    pub backward_compatible: Vec<ContractVersion>,
}

impl MessageContract {
    fn new(required: &[(&str, FieldKind)], optional: &[(&str, FieldKind)]) -> Self {
        let own = |fields: &[(&str, FieldKind)]| {
            fields
                .iter()
                .map(|(name, kind)| (name.to_string(), *kind))
                .collect()
        };
        Self {
            version: ContractVersion::CURRENT,
            required: own(required),
            optional: own(optional),
            backward_compatible: vec![ContractVersion::V1_0],
        }
    }

    pub fn accepts(&self, version: ContractVersion) -> bool {
        version == self.version || self.backward_compatible.contains(&version)
    }
}

/// Contracts by message type
#[derive(Debug, Clone)]
pub struct ContractRegistry {
    contracts: HashMap<MessageType, MessageContract>,
}

impl ContractRegistry {
    pub fn empty() -> Self {
        Self {
            contracts: HashMap::new(),
        }
    }

    pub fn register(&mut self, message_type: MessageType, contract: MessageContract) {
        self.contracts.insert(message_type, contract);
    }

    pub fn get(&self, message_type: MessageType) -> Option<&MessageContract> {
        self.contracts.get(&message_type)
    }

    /// Check a payload against its type's contract.
    ///
    /// Returns the version the payload was validated as.
    pub fn validate(
        &self,
        message_type: MessageType,
        payload: &Value,
    ) -> std::result::Result<ContractVersion, ContractError> {
        let name = message_type.as_str().to_string();
        let contract = self
            .contracts
            .get(&message_type)
            .ok_or_else(|| ContractError::UnknownType {
                message_type: name.clone(),
            })?;
        let fields = payload.as_object().ok_or_else(|| ContractError::NotAnObject {
            message_type: name.clone(),
        })?;

        let version = match fields.get(CONTRACT_VERSION_FIELD) {
            None => contract.version,
            Some(raw) => raw
                .as_str()
                .and_then(ContractVersion::parse)
                .filter(|v| contract.accepts(*v))
                .ok_or_else(|| ContractError::UnsupportedVersion {
                    message_type: name.clone(),
                    version: raw.as_str().map_or_else(|| raw.to_string(), str::to_string),
                })?,
        };

        let missing: Vec<String> = contract
            .required
            .iter()
            .filter(|(field, _)| fields.get(field).map_or(true, Value::is_null))
            .map(|(field, _)| field.clone())
            .collect();
        if !missing.is_empty() {
            return Err(ContractError::MissingFields {
                message_type: name,
                version: version.to_string(),
                fields: missing,
            });
        }

        for (field, kind) in contract.required.iter().chain(&contract.optional) {
            match fields.get(field) {
                Some(value) if !value.is_null() && !kind.matches(value) => {
                    return Err(ContractError::WrongFieldType {
                        message_type: name,
                        field: field.clone(),
                        expected: kind.as_str().to_string(),
                        actual: kind_of(value).to_string(),
                    });
                }
                _ => {}
            }
        }
        Ok(version)
    }
}

impl Default for ContractRegistry {
    fn default() -> Self {
        use FieldKind::*;

        let mut registry = Self::empty();
        registry.register(
            MessageType::ImprovementTrigger,
            MessageContract::new(
                &[
                    ("trigger_type", String),
                    ("performance_data", Object),
                    ("timestamp", String),
                ],
                &[("affected_agents", Array), ("severity", String)],
            ),
        );
        registry.register(
            MessageType::DeploymentNotification,
            MessageContract::new(
                &[
                    ("deployment_id", String),
                    ("status", String),
                    ("timestamp", String),
                ],
                &[("prompt_version", String), ("rollback_available", Boolean)],
            ),
        );
        registry
    }
}
