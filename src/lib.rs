pub mod bridge;
pub mod bus;
pub mod cli;
pub mod config;
pub mod control_plane;
pub mod coordination;
pub mod emergency;
pub mod error;
pub mod logging;
pub mod monitoring;
pub mod predicate;
pub mod services;
pub mod supervisor;

pub use bridge::{IntegrationBridge, BRIDGE_ID, GATEKEEPER_ID};
pub use bus::{Message, MessageBus, MessagePriority, MessageType};
pub use config::AppConfig;
pub use control_plane::ControlPlane;
pub use coordination::{CircuitBreaker, CircuitState, RetryPolicy, Shutdown, ShutdownSignal};
pub use emergency::{Emergency, EmergencyDetector, EmergencyType, Severity};
pub use error::{ErrorClass, HiveError, Result};
pub use monitoring::{AgentRegistry, AgentStatus, MonitoringProbe};
pub use predicate::Predicate;
pub use supervisor::{Supervisor, SUPERVISOR_ID};
