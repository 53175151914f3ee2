//! Three-state circuit breaker
//!
//! Guards a boundary (a bus subscriber, the integration bridge) that keeps
//! failing. `Healthy` admits every call, `Open` refuses calls until the
//! recovery window passes, `Degraded` is the half-open probe phase.

use crate::error::{HiveError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Healthy,
    /// Recovery probe period - limited calls allowed
    Degraded,
    /// Failure threshold exceeded - calls refused
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Healthy => write!(f, "healthy"),
            CircuitState::Degraded => write!(f, "degraded"),
            CircuitState::Open => write!(f, "open"),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time to wait before moving from Open to Degraded (seconds)
    pub recovery_timeout_secs: u64,
    /// Probe calls admitted while Degraded
    pub half_open_max_calls: u32,
    /// Probe successes required to return to Healthy
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 30,
            half_open_max_calls: 3,
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Defaults for per-subscriber breakers on the message bus (5 minute recovery)
    pub fn subscriber_default() -> Self {
        Self {
            recovery_timeout_secs: 300,
            ..Default::default()
        }
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    /// Collect validation problems, prefixed with the config path
    pub fn validate(&self, path: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if self.failure_threshold == 0 {
            errors.push(format!("{path}.failure_threshold must be positive"));
        }
        if self.success_threshold == 0 {
            errors.push(format!("{path}.success_threshold must be positive"));
        }
        if self.half_open_max_calls < self.success_threshold {
            errors.push(format!(
                "{path}.half_open_max_calls ({}) must be >= success_threshold ({})",
                self.half_open_max_calls, self.success_threshold
            ));
        }
        errors
    }
}

/// Trip reasons for the circuit breaker
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TripReason {
    ConsecutiveFailures(u32),
    ProbeFailed(String),
    Manual(String),
}

impl std::fmt::Display for TripReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TripReason::ConsecutiveFailures(n) => write!(f, "{} consecutive failures", n),
            TripReason::ProbeFailed(reason) => write!(f, "probe failed: {}", reason),
            TripReason::Manual(reason) => write!(f, "manual: {}", reason),
        }
    }
}

/// A state change, published so owners can surface it as an alert
#[derive(Debug, Clone, Serialize)]
pub struct BreakerTransition {
    pub breaker: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of asking the breaker for permission to call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Healthy, call freely
    Allowed,
    /// Degraded, this call is one of the probe batch
    Probe,
    /// Open (or probe batch exhausted), do not call
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    probing_since: Option<Instant>,
    half_open_calls: u32,
    consecutive_successes: u32,
    last_trip_reason: Option<TripReason>,
}

impl BreakerCore {
    fn new() -> Self {
        Self {
            state: CircuitState::Healthy,
            failure_count: 0,
            last_failure_time: None,
            last_success_time: None,
            opened_at: None,
            probing_since: None,
            half_open_calls: 0,
            consecutive_successes: 0,
            last_trip_reason: None,
        }
    }

    fn remaining_recovery(&self, recovery: Duration) -> Duration {
        match self.opened_at {
            Some(opened_at) => recovery.saturating_sub(opened_at.elapsed()),
            None => recovery,
        }
    }
}

/// Circuit breaker for one protected boundary
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    core: RwLock<BreakerCore>,
    total_trips: AtomicU64,
    rejected_calls: AtomicU64,
    events: broadcast::Sender<BreakerTransition>,
}

impl CircuitBreaker {
    /// Create a breaker with its own transition channel
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self::with_events(name, config, events)
    }

    /// Create a breaker that reports transitions on a shared channel
    pub fn with_events(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        events: broadcast::Sender<BreakerTransition>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            core: RwLock::new(BreakerCore::new()),
            total_trips: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.events.subscribe()
    }

    /// Get current state
    pub async fn state(&self) -> CircuitState {
        self.core.read().await.state
    }

    /// Ask for permission to make one call.
    ///
    /// Moves Open to Degraded once the recovery window has elapsed and counts
    /// the call against the probe batch while Degraded. Must be followed by
    /// `record_success` or `record_failure` when the result is `Allowed`/`Probe`.
    /// A probe batch that never reports back within another recovery window
    /// re-opens the circuit, so an abandoned probe cannot hold it Degraded.
    pub async fn acquire(&self) -> Admission {
        let recovery = self.config.recovery_timeout();
        let mut core = self.core.write().await;

        if core.state == CircuitState::Open {
            let remaining = core.remaining_recovery(recovery);
            if !remaining.is_zero() {
                drop(core);
                self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                return Admission::Rejected {
                    retry_after: remaining,
                };
            }
            core.state = CircuitState::Degraded;
            core.probing_since = Some(Instant::now());
            core.half_open_calls = 0;
            core.consecutive_successes = 0;
            info!(breaker = %self.name, "Circuit breaker transitioning to DEGRADED (half-open)");
            self.emit(CircuitState::Open, CircuitState::Degraded, "recovery timeout elapsed");
        }

        let state = core.state;
        match state {
            CircuitState::Healthy => Admission::Allowed,
            CircuitState::Degraded => {
                if core.half_open_calls >= self.config.half_open_max_calls {
                    let waited = core.probing_since.map(|t| t.elapsed()).unwrap_or_default();
                    let retry_after = if waited >= recovery {
                        self.open(
                            &mut core,
                            TripReason::ProbeFailed("half-open batch did not complete".to_string()),
                        );
                        recovery
                    } else {
                        recovery - waited
                    };
                    drop(core);
                    self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                    Admission::Rejected { retry_after }
                } else {
                    core.half_open_calls += 1;
                    Admission::Probe
                }
            }
            CircuitState::Open => Admission::Rejected {
                retry_after: core.remaining_recovery(recovery),
            },
        }
    }

    /// Record a successful call
    pub async fn record_success(&self) {
        let mut core = self.core.write().await;
        core.failure_count = 0;
        core.last_success_time = Some(Utc::now());

        if core.state == CircuitState::Degraded {
            core.consecutive_successes += 1;
            if core.consecutive_successes >= self.config.success_threshold {
                core.state = CircuitState::Healthy;
                core.opened_at = None;
                core.probing_since = None;
                core.half_open_calls = 0;
                core.consecutive_successes = 0;
                info!(breaker = %self.name, "Circuit breaker HEALTHY - normal operation resumed");
                self.emit(CircuitState::Degraded, CircuitState::Healthy, "probe batch succeeded");
            }
        }
    }

    /// Record a failed call
    pub async fn record_failure(&self, reason: &str) {
        let mut core = self.core.write().await;
        core.failure_count += 1;
        core.last_failure_time = Some(Utc::now());
        let failures = core.failure_count;

        debug!(breaker = %self.name, failures, "Failure recorded: {}", reason);

        let trip = match core.state {
            CircuitState::Degraded => Some(TripReason::ProbeFailed(reason.to_string())),
            CircuitState::Healthy if failures >= self.config.failure_threshold => {
                Some(TripReason::ConsecutiveFailures(failures))
            }
            _ => None,
        };

        if let Some(trip) = trip {
            self.open(&mut core, trip);
        }
    }

    /// Manually trip the circuit
    pub async fn trip(&self, reason: &str) {
        let mut core = self.core.write().await;
        self.open(&mut core, TripReason::Manual(reason.to_string()));
    }

    fn open(&self, core: &mut BreakerCore, reason: TripReason) {
        if core.state == CircuitState::Open {
            return;
        }
        let from = core.state;
        core.state = CircuitState::Open;
        core.opened_at = Some(Instant::now());
        core.probing_since = None;
        core.half_open_calls = 0;
        core.consecutive_successes = 0;
        core.last_trip_reason = Some(reason.clone());
        self.total_trips.fetch_add(1, Ordering::SeqCst);

        warn!(breaker = %self.name, "Circuit breaker TRIPPED: {}", reason);
        self.emit(from, CircuitState::Open, &reason.to_string());
    }

    /// Force the circuit back to Healthy (operator reset)
    pub async fn force_close(&self) {
        let mut core = self.core.write().await;
        let from = core.state;
        *core = BreakerCore::new();
        if from != CircuitState::Healthy {
            warn!(breaker = %self.name, "Circuit breaker force-closed");
            self.emit(from, CircuitState::Healthy, "forced");
        }
    }

    /// Time left until an Open breaker will admit probes
    pub async fn time_until_recovery(&self) -> Duration {
        let core = self.core.read().await;
        match core.state {
            CircuitState::Open => core.remaining_recovery(self.config.recovery_timeout()),
            _ => Duration::ZERO,
        }
    }

    /// Run `call` under breaker protection.
    ///
    /// Refused calls return `HiveError::CircuitOpen` without invoking `call`.
    pub async fn call<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if let Admission::Rejected { retry_after } = self.acquire().await {
            return Err(HiveError::CircuitOpen(format!(
                "{} refused call, {}s until recovery",
                self.name,
                retry_after.as_secs()
            )));
        }

        match call.await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure(&e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Get circuit breaker statistics
    pub async fn stats(&self) -> CircuitBreakerStats {
        let core = self.core.read().await;
        CircuitBreakerStats {
            name: self.name.clone(),
            state: core.state,
            failure_count: core.failure_count,
            last_failure_time: core.last_failure_time,
            last_success_time: core.last_success_time,
            last_trip_reason: core.last_trip_reason.as_ref().map(|r| r.to_string()),
            half_open_calls: core.half_open_calls,
            consecutive_successes: core.consecutive_successes,
            total_trips: self.total_trips.load(Ordering::SeqCst),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
        }
    }

    fn emit(&self, from: CircuitState, to: CircuitState, reason: &str) {
        // No receivers is fine
        let _ = self.events.send(BreakerTransition {
            breaker: self.name.clone(),
            from,
            to,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
    }
}

/// Statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_trip_reason: Option<String>,
    pub half_open_calls: u32,
    pub consecutive_successes: u32,
    pub total_trips: u64,
    pub rejected_calls: u64,
}
