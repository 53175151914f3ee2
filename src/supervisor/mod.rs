//! Supervisor layer for agent coordination
//!
//! This module provides the top-level control loop:
//! - Operational decisions with an external provider and local fallback
//! - Conflict detection and priority-based resolution
//! - Optional anomaly enrichment of metric snapshots

pub mod analysis;
pub mod conflict;
pub mod coordinator;
pub mod decision;

pub use analysis::{AnomalyDetector, AnomalyReport, FlaggedMetric, RollingZScore};
pub use conflict::{resolve_by_priority, AgentConflict, ConflictResolution, ConflictType};
pub use coordinator::{
    Supervisor, SupervisorConfig, SupervisorMetrics, SupervisorStatus, SUPERVISOR_ID,
};
pub use decision::{
    consult, local_fallback, DecisionContext, DecisionOutcome, DecisionProvider, DecisionSource,
    DecisionStatus, DecisionType, OperationalDecision, ProviderDecision,
};
