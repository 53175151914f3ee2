pub mod health;

pub use health::{
    overall_status, ComponentHealth, HealthResponse, HealthServer, HealthState, HealthStatus,
    StatusResponse,
};
