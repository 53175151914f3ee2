//! Emergency detection, intervention and resolution

pub mod detector;
pub mod protocols;
pub mod types;

pub use detector::{EmergencyConfig, EmergencyDetector, EmergencyStatistics};
pub use protocols::{
    BusInterventionExecutor, InterventionExecutor, InterventionProtocol, InterventionResult,
    ProtocolTable, StepResult, DETECTOR_ID,
};
pub use types::{Comparison, Emergency, EmergencyThreshold, EmergencyType, Severity};
