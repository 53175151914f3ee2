//! Coordination primitives shared by every component
//!
//! - Circuit breaker guarding failing boundaries
//! - Retry policy with exponential backoff
//! - Shutdown signalling for the periodic loops
//! - Panic-safe execution of loop steps

pub mod circuit_breaker;
pub mod retry;
pub mod shutdown;
pub mod step;

pub use circuit_breaker::{
    Admission, BreakerTransition, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats,
    CircuitState,
};
pub use retry::RetryPolicy;
pub use shutdown::{wait_for_signal, Shutdown, ShutdownPhase, ShutdownSignal, ShutdownToken};
pub use step::run_step;
