use thiserror::Error;

/// Main error type for the control plane
#[derive(Error, Debug)]
pub enum HiveError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Fatal configuration: {0}")]
    FatalConfiguration(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Delivery errors
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Timed out after {elapsed_ms}ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Handler failed: {0}")]
    Handler(String),

    // Contract errors
    #[error("Contract violation: {0}")]
    ContractViolation(#[from] ContractError),

    // Resilience errors
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for HiveError
pub type Result<T> = std::result::Result<T, HiveError>;

/// Failure classes that drive retry and dead-letter decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network/timeout-like, eligible for retry with backoff
    Transient,
    /// Malformed or incompatible message, dead-lettered immediately
    ContractViolation,
    /// Refused locally, does not consume retry budget
    CircuitOpen,
    /// Missing handler or mapping, the message/step is skipped
    FatalConfiguration,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::ContractViolation => write!(f, "contract_violation"),
            ErrorClass::CircuitOpen => write!(f, "circuit_open"),
            ErrorClass::FatalConfiguration => write!(f, "fatal_configuration"),
        }
    }
}

impl HiveError {
    pub fn class(&self) -> ErrorClass {
        match self {
            HiveError::ContractViolation(_) | HiveError::Json(_) | HiveError::Validation(_) => {
                ErrorClass::ContractViolation
            }
            HiveError::CircuitOpen(_) => ErrorClass::CircuitOpen,
            HiveError::Config(_) | HiveError::FatalConfiguration(_) => {
                ErrorClass::FatalConfiguration
            }
            _ => ErrorClass::Transient,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn timeout(operation: impl Into<String>, elapsed: std::time::Duration) -> Self {
        HiveError::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Specific error types for message contract validation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContractError {
    #[error("no contract registered for message type {message_type}")]
    UnknownType { message_type: String },

    #[error("{message_type} does not accept contract version {version}")]
    UnsupportedVersion { message_type: String, version: String },

    #[error("{message_type} v{version} missing required fields: {}", .fields.join(", "))]
    MissingFields {
        message_type: String,
        version: String,
        fields: Vec<String>,
    },

    #[error("{message_type} field '{field}' expected {expected}, got {actual}")]
    WrongFieldType {
        message_type: String,
        field: String,
        expected: String,
        actual: String,
    },

    #[error("{message_type} payload must be a JSON object")]
    NotAnObject { message_type: String },
}
