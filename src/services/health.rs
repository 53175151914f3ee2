//! Health check and status HTTP server
//!
//! Liveness and readiness probes for process supervision, a Prometheus
//! metrics endpoint, combined JSON statistics and dead-letter operations on
//! the integration bridge.

use crate::bridge::{BridgeHealth, BridgeStatus, IntegrationBridge};
use crate::bus::{BusStatistics, DeadLetterEntry, MessageBus, ReplayReport};
use crate::coordination::CircuitState;
use crate::emergency::{EmergencyDetector, EmergencyStatistics, Severity};
use crate::monitoring::{MonitoringProbe, MonitoringStatistics};
use crate::supervisor::{Supervisor, SupervisorStatus};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

const DEFAULT_DEAD_LETTER_LIMIT: usize = 100;

/// Health status for a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    fn gauge(&self) -> i8 {
        match self {
            HealthStatus::Healthy => 1,
            HealthStatus::Degraded => 0,
            HealthStatus::Unhealthy => -1,
        }
    }
}

/// Component health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    /// A failing critical component makes the whole system unhealthy
    pub critical: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check: DateTime<Utc>,
}

/// Overall system health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub components: Vec<ComponentHealth>,
    pub bus_dead_letters: usize,
    pub bridge_dead_letters: usize,
    pub circuit_breakers: BTreeMap<String, CircuitState>,
}

/// Combined statistics for `/status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub bus: BusStatistics,
    pub bridge: BridgeHealth,
    pub emergencies: EmergencyStatistics,
    pub monitoring: MonitoringStatistics,
    pub supervisor: SupervisorStatus,
}

/// Overall status: unhealthy when a critical component is unhealthy,
/// degraded when anything is not healthy
pub fn overall_status(components: &[ComponentHealth]) -> HealthStatus {
    if components
        .iter()
        .any(|c| c.critical && c.status == HealthStatus::Unhealthy)
    {
        HealthStatus::Unhealthy
    } else if components.iter().any(|c| !c.status.is_healthy()) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Shared state for health server
pub struct HealthState {
    /// When the server state was created
    pub started_at: DateTime<Utc>,
    bus: MessageBus,
    probe: Arc<MonitoringProbe>,
    detector: Arc<EmergencyDetector>,
    supervisor: Arc<Supervisor>,
    bridge: Arc<IntegrationBridge>,
}

impl HealthState {
    pub fn new(
        bus: MessageBus,
        probe: Arc<MonitoringProbe>,
        detector: Arc<EmergencyDetector>,
        supervisor: Arc<Supervisor>,
        bridge: Arc<IntegrationBridge>,
    ) -> Self {
        Self {
            started_at: Utc::now(),
            bus,
            probe,
            detector,
            supervisor,
            bridge,
        }
    }

    fn uptime_seconds(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    /// Get overall health status
    pub async fn get_health(&self) -> HealthResponse {
        let now = Utc::now();
        let bus_stats = self.bus.get_bus_statistics().await;
        let bridge_health = self.bridge.get_bridge_health().await;
        let mut components = Vec::with_capacity(4);

        // Message bus: stopped is fatal, open subscriber breakers degrade it
        let open_subscribers: Vec<&str> = bus_stats
            .subscriber_breakers
            .iter()
            .filter(|(_, state)| **state != CircuitState::Healthy)
            .map(|(id, _)| id.as_str())
            .collect();
        let (status, message) = if !bus_stats.running {
            (HealthStatus::Unhealthy, Some("Not running".to_string()))
        } else if !open_subscribers.is_empty() {
            (
                HealthStatus::Degraded,
                Some(format!("Subscriber breakers tripped: {}", open_subscribers.join(", "))),
            )
        } else {
            (HealthStatus::Healthy, None)
        };
        components.push(ComponentHealth {
            name: "message_bus".to_string(),
            status,
            critical: true,
            message,
            last_check: now,
        });

        // Integration bridge
        let status = match bridge_health.status {
            BridgeStatus::Healthy => HealthStatus::Healthy,
            BridgeStatus::Degraded | BridgeStatus::CircuitOpen => HealthStatus::Degraded,
            BridgeStatus::Failed => HealthStatus::Unhealthy,
        };
        components.push(ComponentHealth {
            name: "integration_bridge".to_string(),
            status,
            critical: true,
            message: (!status.is_healthy()).then(|| bridge_health.status.to_string()),
            last_check: now,
        });

        // Emergencies
        let active = self.detector.get_active().await;
        let status = if active.iter().any(|e| e.severity == Severity::Critical) {
            HealthStatus::Unhealthy
        } else if !active.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        components.push(ComponentHealth {
            name: "emergency_detector".to_string(),
            status,
            critical: false,
            message: (!active.is_empty()).then(|| format!("{} active emergencies", active.len())),
            last_check: now,
        });

        // Agent fleet
        let counts = self.probe.registry().status_counts().await;
        let status = if counts.total() > 0 && counts.offline == counts.total() {
            HealthStatus::Unhealthy
        } else if counts.offline > 0 || counts.unhealthy > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        components.push(ComponentHealth {
            name: "agents".to_string(),
            status,
            critical: false,
            message: Some(format!(
                "{} registered, {} offline, {} unhealthy",
                counts.total(),
                counts.offline,
                counts.unhealthy
            )),
            last_check: now,
        });

        let mut circuit_breakers: BTreeMap<String, CircuitState> = bus_stats
            .subscriber_breakers
            .iter()
            .map(|(id, state)| (format!("subscriber:{id}"), *state))
            .collect();
        circuit_breakers.insert(
            "integration_bridge".to_string(),
            bridge_health.circuit_breaker_state,
        );

        HealthResponse {
            status: overall_status(&components),
            timestamp: now,
            uptime_seconds: self.uptime_seconds(),
            components,
            bus_dead_letters: bus_stats.dead_letter_queue_size,
            bridge_dead_letters: bridge_health.dead_letter_queue_size,
            circuit_breakers,
        }
    }

    pub async fn get_status(&self) -> StatusResponse {
        StatusResponse {
            timestamp: Utc::now(),
            uptime_seconds: self.uptime_seconds(),
            bus: self.bus.get_bus_statistics().await,
            bridge: self.bridge.get_bridge_health().await,
            emergencies: self.detector.get_statistics().await,
            monitoring: self.probe.get_monitoring_statistics().await,
            supervisor: self.supervisor.get_system_status().await,
        }
    }

    /// Prometheus text exposition
    pub async fn render_metrics(&self) -> String {
        let health = self.get_health().await;
        let bus = self.bus.get_bus_statistics().await;
        let bridge = self.bridge.metrics().await;
        let emergencies = self.detector.get_statistics().await;
        let supervisor = self.supervisor.get_supervisor_metrics().await;
        let agents = self.probe.registry().status_counts().await;

        let mut out = String::new();
        let mut metric = |name: &str, kind: &str, help: &str, value: String| {
            let _ = writeln!(out, "# HELP hivectl_{name} {help}");
            let _ = writeln!(out, "# TYPE hivectl_{name} {kind}");
            let _ = writeln!(out, "hivectl_{name} {value}\n");
        };

        metric("up", "gauge", "Health status (1=healthy, 0=degraded, -1=unhealthy)", health.status.gauge().to_string());
        metric("uptime_seconds", "counter", "Uptime in seconds", health.uptime_seconds.to_string());

        metric("bus_messages_published_total", "counter", "Messages accepted by the bus", bus.messages_published.to_string());
        metric("bus_deliveries_succeeded_total", "counter", "Successful handler deliveries", bus.deliveries_succeeded.to_string());
        metric("bus_delivery_failures_total", "counter", "Failed handler deliveries", bus.delivery_failures.to_string());
        metric("bus_messages_retried_total", "counter", "Messages re-enqueued for retry", bus.messages_retried.to_string());
        metric("bus_messages_dead_lettered_total", "counter", "Messages moved to the dead-letter queue", bus.messages_dead_lettered.to_string());
        metric("bus_messages_expired_total", "counter", "Messages dropped after expiry", bus.messages_expired.to_string());
        metric("bus_circuit_rejections_total", "counter", "Deliveries refused by an open subscriber breaker", bus.circuit_rejections.to_string());
        metric("bus_in_flight", "gauge", "Messages queued or being delivered", bus.in_flight.to_string());
        metric("bus_dead_letter_queue_size", "gauge", "Current bus dead-letter queue size", bus.dead_letter_queue_size.to_string());

        metric("bridge_messages_processed_total", "counter", "Bridge messages handled successfully", bridge.messages_processed.to_string());
        metric("bridge_messages_failed_total", "counter", "Bridge messages dead-lettered", bridge.messages_failed.to_string());
        metric("bridge_messages_retried_total", "counter", "Bridge retries scheduled", bridge.messages_retried.to_string());
        metric("bridge_circuit_breaker_trips_total", "counter", "Bridge circuit breaker trips", bridge.circuit_breaker_trips.to_string());
        metric("bridge_avg_processing_time_ms", "gauge", "Mean bridge handler time", format!("{:.3}", bridge.avg_processing_time_ms));
        metric("bridge_dead_letter_queue_size", "gauge", "Current bridge dead-letter queue size", bridge.dead_letter_queue_size.to_string());

        metric("emergencies_active", "gauge", "Unresolved emergencies", emergencies.active_emergencies.to_string());
        metric("emergencies_total", "counter", "Emergencies raised", emergencies.total_emergencies.to_string());
        metric("interventions_failed_total", "counter", "Intervention steps that failed", emergencies.interventions_failed.to_string());

        metric("agents_registered", "gauge", "Registered agents", agents.total().to_string());
        metric("agents_offline", "gauge", "Agents past the heartbeat timeout", agents.offline.to_string());

        metric("supervisor_decisions_executed_total", "counter", "Operational decisions executed", supervisor.decisions_executed.to_string());
        metric("supervisor_decisions_pending", "gauge", "Decisions awaiting execution", supervisor.pending_decisions.to_string());
        metric("supervisor_conflicts_resolved_total", "counter", "Agent conflicts resolved", supervisor.conflicts_resolved.to_string());
        metric("supervisor_conflicts_active", "gauge", "Open agent conflicts", supervisor.active_conflicts.to_string());
        metric("supervisor_emergencies_handled_total", "counter", "Emergencies handled by the coordination loop", supervisor.emergencies_handled.to_string());
        metric("supervisor_step_failures_total", "counter", "Coordination steps that failed", supervisor.step_failures.to_string());

        out
    }
}

/// Health check server
pub struct HealthServer {
    state: Arc<HealthState>,
    port: u16,
}

impl HealthServer {
    pub fn new(state: Arc<HealthState>, port: u16) -> Self {
        Self { state, port }
    }

    /// All routes over the shared state
    pub fn router(state: Arc<HealthState>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .route("/status", get(status_handler))
            .route("/bridge/dead-letters", get(dead_letters_handler))
            .route("/bridge/replay", post(replay_handler))
            .with_state(state)
    }

    /// Start the health server
    pub async fn run(&self) -> crate::Result<()> {
        let app = Self::router(Arc::clone(&self.state));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting health server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .await
            .map_err(|e| crate::HiveError::Internal(format!("Health server error: {}", e)))?;

        Ok(())
    }

    pub fn state(&self) -> Arc<HealthState> {
        Arc::clone(&self.state)
    }
}

/// Full health check endpoint
async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    let status_code = match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

/// Liveness probe - is the process alive?
async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Readiness probe - can the control plane route traffic?
async fn readiness_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Prometheus metrics endpoint
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.render_metrics().await,
    )
}

async fn status_handler(State(state): State<Arc<HealthState>>) -> Json<StatusResponse> {
    Json(state.get_status().await)
}

#[derive(Debug, Deserialize)]
struct DeadLetterQuery {
    limit: Option<usize>,
}

async fn dead_letters_handler(
    State(state): State<Arc<HealthState>>,
    Query(query): Query<DeadLetterQuery>,
) -> Json<Vec<DeadLetterEntry>> {
    let limit = query.limit.unwrap_or(DEFAULT_DEAD_LETTER_LIMIT);
    Json(state.bridge.get_dead_letter_messages(limit).await)
}

#[derive(Debug, Default, Deserialize)]
struct ReplayRequest {
    ids: Option<Vec<String>>,
}

/// Replay bridge dead letters; no body (or no `ids`) replays everything
async fn replay_handler(
    State(state): State<Arc<HealthState>>,
    body: Option<Json<ReplayRequest>>,
) -> Json<ReplayReport> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let report = state.bridge.replay(request.ids.as_deref()).await;
    info!(
        replayed = report.replayed_count,
        failed = report.failed_count,
        "Bridge dead letters replayed via HTTP"
    );
    Json(report)
}
