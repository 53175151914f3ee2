//! Resilient channel between the operational and gatekeeper supervisors

pub mod contract;
pub mod integration_bridge;

pub use contract::{
    ContractRegistry, ContractVersion, FieldKind, MessageContract, CONTRACT_VERSION_FIELD,
};
pub use integration_bridge::{
    BridgeConfig, BridgeHandler, BridgeHealth, BridgeMetrics, BridgeStatus, ForwardingHandler,
    IntegrationBridge, BRIDGE_ID, GATEKEEPER_ID,
};
