//! Agent liveness and system metrics

pub mod agent_api;
pub mod host;
pub mod probe;
pub mod registry;

pub use agent_api::AgentReporter;
pub use host::{default_host_probe, HostProbe, HostSample, ProcHostProbe, StaticHostProbe};
pub use probe::{
    offline_alert, AlertThresholds, MonitoringConfig, MonitoringProbe, MonitoringStatistics,
    SystemMetrics, PROBE_ID, SYSTEM_OVERVIEW,
};
pub use registry::{
    AgentRecord, AgentRegistry, AgentStatus, MetricUpdate, PerformanceSample, StatusCounts,
    StatusUpdate, DEFAULT_PRIORITY_LEVEL,
};
