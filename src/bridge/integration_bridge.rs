//! Integration bridge between the operational and gatekeeper domains
//!
//! Inbound improvement triggers and deployment notifications go through:
//!
//! 1. Contract validation (violations are dead-lettered at once)
//! 2. Route lookup (missing routes are dead-lettered as fatal configuration)
//! 3. The bridge circuit breaker (an open circuit defers the message without
//!    spending retry budget)
//! 4. The routed handler, time-bounded and panic-isolated
//!
//! Transient failures are retried with jittered exponential backoff by
//! re-publishing the message to the bus, targeted at the bridge. Exhausted
//! messages land in the bridge's dead-letter queue for inspection and replay.

use super::contract::{ContractRegistry, ContractVersion};
use crate::bus::{
    DeadLetterEntry, DeadLetterQueue, Message, MessageBus, MessageHandler, MessageType,
    ReplayReport,
};
use crate::coordination::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
    RetryPolicy, Shutdown,
};
use crate::error::{HiveError, Result};
use crate::supervisor::SUPERVISOR_ID;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Subscriber and sender id of the bridge
pub const BRIDGE_ID: &str = "integration_bridge";

/// Recipient of forwarded improvement triggers
pub const GATEKEEPER_ID: &str = "gatekeeper_supervisor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStatus {
    Healthy,
    Degraded,
    CircuitOpen,
    Failed,
}

impl BridgeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeStatus::Healthy => "healthy",
            BridgeStatus::Degraded => "degraded",
            BridgeStatus::CircuitOpen => "circuit_open",
            BridgeStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for BridgeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    pub dead_letter_max_size: usize,
    /// Must stay below `bus.delivery_timeout_ms`, otherwise the bus aborts a
    /// hung handler before the bridge can count the failure
    pub handler_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            dead_letter_max_size: 1000,
            handler_timeout_ms: 4000,
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = self.circuit_breaker.validate("bridge.circuit_breaker");
        errors.extend(self.retry.validate("bridge.retry"));
        if self.dead_letter_max_size == 0 {
            errors.push("bridge.dead_letter_max_size must be positive".to_string());
        }
        if self.handler_timeout_ms == 0 {
            errors.push("bridge.handler_timeout_ms must be positive".to_string());
        }
        errors
    }
}

/// Type-specific processing of a validated bridge message
#[async_trait]
pub trait BridgeHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<Value>;
}

/// Forwards a message to the other domain's supervisor
pub struct ForwardingHandler {
    bus: MessageBus,
    target: String,
    status: &'static str,
    key_field: &'static str,
}

impl ForwardingHandler {
    pub fn new(bus: MessageBus, target: impl Into<String>, status: &'static str, key_field: &'static str) -> Self {
        Self {
            bus,
            target: target.into(),
            status,
            key_field,
        }
    }

    /// Improvement triggers from operations to the gatekeeper
    pub fn to_gatekeeper(bus: MessageBus) -> Self {
        Self::new(bus, GATEKEEPER_ID, "forwarded_to_gatekeeper", "trigger_id")
    }

    /// Deployment notifications from the gatekeeper to operations
    pub fn to_operational(bus: MessageBus) -> Self {
        Self::new(bus, SUPERVISOR_ID, "forwarded_to_operational", "deployment_id")
    }
}

#[async_trait]
impl BridgeHandler for ForwardingHandler {
    async fn handle(&self, message: &Message) -> Result<Value> {
        let mut payload = message.payload.clone();
        if let Value::Object(map) = &mut payload {
            map.insert("forwarded_by".to_string(), json!(BRIDGE_ID));
            map.insert("original_sender".to_string(), json!(message.sender_id));
        }
        let forwarded = Message::new(message.message_type, BRIDGE_ID, payload)
            .to(self.target.clone())
            .with_priority(message.priority)
            .with_correlation_id(
                message
                    .correlation_id
                    .clone()
                    .unwrap_or_else(|| message.id.clone()),
            );
        let forwarded_id = self.bus.publish(forwarded)?;

        info!(
            message_type = %message.message_type,
            target = %self.target,
            forwarded_id = %forwarded_id,
            "Bridge message forwarded"
        );
        let mut result = json!({
            "status": self.status,
            "forwarded_message_id": forwarded_id,
            "timestamp": Utc::now().to_rfc3339(),
        });
        result[self.key_field] = message.payload.get(self.key_field).cloned().unwrap_or(Value::Null);
        Ok(result)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeMetrics {
    pub messages_processed: u64,
    pub messages_failed: u64,
    pub circuit_breaker_trips: u64,
    pub avg_processing_time_ms: f64,
    pub dead_letter_queue_size: usize,
    pub messages_retried: u64,
    pub messages_deferred: u64,
    pub messages_replayed: u64,
    pub pending_retries: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeHealth {
    pub bridge_id: &'static str,
    pub status: BridgeStatus,
    pub circuit_breaker_state: CircuitState,
    pub circuit_breaker: CircuitBreakerStats,
    pub is_running: bool,
    pub metrics: BridgeMetrics,
    pub dead_letter_queue_size: usize,
    pub last_health_check: DateTime<Utc>,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    deferred: AtomicU64,
    replayed: AtomicU64,
    processing_us: AtomicU64,
}

pub struct IntegrationBridge {
    config: BridgeConfig,
    bus: MessageBus,
    contracts: ContractRegistry,
    routes: HashMap<MessageType, Arc<dyn BridgeHandler>>,
    breaker: Arc<CircuitBreaker>,
    dead_letters: Arc<DeadLetterQueue>,
    counters: Arc<Counters>,
    pending_retries: Arc<AtomicUsize>,
    running: AtomicBool,
    subscription: Mutex<Option<String>>,
    /// Cancels scheduled retries; replaced on every start
    retries: std::sync::Mutex<Shutdown>,
}

impl IntegrationBridge {
    /// Bridge with the default contracts and forwarding routes
    pub fn new(config: BridgeConfig, bus: MessageBus) -> Self {
        let breaker = Arc::new(CircuitBreaker::with_events(
            BRIDGE_ID,
            config.circuit_breaker.clone(),
            bus.breaker_event_sender(),
        ));
        let routes: HashMap<MessageType, Arc<dyn BridgeHandler>> = HashMap::from([
            (
                MessageType::ImprovementTrigger,
                Arc::new(ForwardingHandler::to_gatekeeper(bus.clone())) as Arc<dyn BridgeHandler>,
            ),
            (
                MessageType::DeploymentNotification,
                Arc::new(ForwardingHandler::to_operational(bus.clone())) as Arc<dyn BridgeHandler>,
            ),
        ]);

        Self {
            dead_letters: Arc::new(DeadLetterQueue::new(config.dead_letter_max_size)),
            config,
            bus,
            contracts: ContractRegistry::default(),
            routes,
            breaker,
            counters: Arc::new(Counters::default()),
            pending_retries: Arc::new(AtomicUsize::new(0)),
            running: AtomicBool::new(false),
            subscription: Mutex::new(None),
            retries: std::sync::Mutex::new(Shutdown::new()),
        }
    }

    /// Replace (or add) the handler for a message type
    pub fn with_route(mut self, message_type: MessageType, handler: Arc<dyn BridgeHandler>) -> Self {
        self.routes.insert(message_type, handler);
        self
    }

    pub fn without_route(mut self, message_type: MessageType) -> Self {
        self.routes.remove(&message_type);
        self
    }

    pub fn with_contracts(mut self, contracts: ContractRegistry) -> Self {
        self.contracts = contracts;
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn contracts(&self) -> &ContractRegistry {
        &self.contracts
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribe to bridge traffic. Starting twice is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_some() {
            warn!("Integration bridge is already running");
            return Ok(());
        }

        let types: Vec<MessageType> = self.routes.keys().copied().collect();
        if types.is_empty() {
            return Err(HiveError::FatalConfiguration(
                "integration bridge has no routes".to_string(),
            ));
        }
        let delivery_timeout_ms = self.bus.config().delivery_timeout_ms;
        if self.config.handler_timeout_ms >= delivery_timeout_ms {
            return Err(HiveError::FatalConfiguration(format!(
                "bridge handler timeout ({}ms) must be shorter than bus delivery timeout ({}ms)",
                self.config.handler_timeout_ms, delivery_timeout_ms
            )));
        }
        let id = self
            .bus
            .subscribe(
                BRIDGE_ID,
                &types,
                Arc::new(BridgeSubscriber {
                    bridge: Arc::clone(self),
                }),
                None,
            )
            .await?;
        *subscription = Some(id);

        if let Ok(mut retries) = self.retries.lock() {
            *retries = Shutdown::new();
        }
        self.running.store(true, Ordering::SeqCst);
        info!(routes = ?types, "Integration bridge started");
        Ok(())
    }

    /// Unsubscribe and cancel scheduled retries. Cancelled retries are
    /// dead-lettered so nothing is lost.
    pub async fn stop(&self) {
        let Some(id) = self.subscription.lock().await.take() else {
            return;
        };
        self.bus.unsubscribe(&id).await;
        self.running.store(false, Ordering::SeqCst);
        if let Ok(retries) = self.retries.lock() {
            retries.request();
        }
        info!("Integration bridge stopped");
    }

    /// Process one inbound bridge message
    pub async fn handle(&self, message: &Message) -> Result<Value> {
        let started = Instant::now();

        let version = match self.contracts.validate(message.message_type, &message.payload) {
            Ok(version) => version,
            Err(violation) => {
                let err = HiveError::from(violation);
                self.dead_letter(message, &err).await;
                return Err(err);
            }
        };

        let Some(handler) = self.routes.get(&message.message_type).cloned() else {
            let err = HiveError::FatalConfiguration(format!(
                "no bridge route for {}",
                message.message_type
            ));
            self.dead_letter(message, &err).await;
            return Err(err);
        };

        if let Admission::Rejected { retry_after } = self.breaker.acquire().await {
            let err = HiveError::CircuitOpen(format!(
                "bridge circuit open, retry in {}s",
                retry_after.as_secs()
            ));
            self.defer(message, retry_after);
            return Err(err);
        }

        match self.invoke(handler.as_ref(), message).await {
            Ok(result) => {
                self.breaker.record_success().await;
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .processing_us
                    .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
                debug!(
                    message_id = %message.id,
                    message_type = %message.message_type,
                    contract_version = %version,
                    "Bridge message processed"
                );
                Ok(result)
            }
            Err(e) => {
                self.breaker.record_failure(&e.to_string()).await;
                self.on_failure(message, &e).await;
                Err(e)
            }
        }
    }

    async fn invoke(&self, handler: &dyn BridgeHandler, message: &Message) -> Result<Value> {
        let timeout = Duration::from_millis(self.config.handler_timeout_ms);
        match tokio::time::timeout(timeout, AssertUnwindSafe(handler.handle(message)).catch_unwind()).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                error!(message_id = %message.id, "Bridge handler panicked");
                Err(HiveError::Handler(format!(
                    "bridge handler for {} panicked",
                    message.message_type
                )))
            }
            Err(_) => Err(HiveError::timeout(
                format!("bridge handler for {}", message.message_type),
                timeout,
            )),
        }
    }

    async fn on_failure(&self, message: &Message, err: &HiveError) {
        let retry = &self.config.retry;
        if !err.is_retryable() || !retry.should_retry(message.retry_count) {
            self.dead_letter(message, err).await;
            return;
        }

        let attempt = message.retry_count + 1;
        let delay = retry.delay_for(attempt);
        warn!(
            message_id = %message.id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Bridge message failed, retrying: {}", err
        );
        self.counters.retried.fetch_add(1, Ordering::Relaxed);
        self.schedule(message.republish(attempt), delay);
    }

    /// Re-queue a message refused by the open circuit, keeping its retry count
    fn defer(&self, message: &Message, retry_after: Duration) {
        let delay = if retry_after.is_zero() {
            self.config.retry.base_delay(1)
        } else {
            retry_after
        };
        info!(
            message_id = %message.id,
            delay_ms = delay.as_millis() as u64,
            "Bridge circuit open, deferring message"
        );
        self.counters.deferred.fetch_add(1, Ordering::Relaxed);
        self.schedule(message.republish(message.retry_count), delay);
    }

    fn schedule(&self, message: Message, delay: Duration) {
        let message = message.to(BRIDGE_ID);
        let bus = self.bus.clone();
        let dead_letters = Arc::clone(&self.dead_letters);
        let counters = Arc::clone(&self.counters);
        let pending = Arc::clone(&self.pending_retries);
        let mut token = match self.retries.lock() {
            Ok(retries) => retries.token(),
            Err(poisoned) => poisoned.into_inner().token(),
        };

        pending.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => Err(HiveError::Cancelled),
                _ = tokio::time::sleep(delay) => bus.publish(message.clone()).map(|_| ()),
            };
            if let Err(e) = outcome {
                warn!(message_id = %message.id, "Bridge retry not delivered: {}", e);
                dead_letters
                    .push(DeadLetterEntry::new(message, e.to_string(), e.class()))
                    .await;
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            pending.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn dead_letter(&self, message: &Message, err: &HiveError) {
        warn!(
            message_id = %message.id,
            message_type = %message.message_type,
            error_class = %err.class(),
            retry_count = message.retry_count,
            "Bridge message dead-lettered: {}", err
        );
        self.dead_letters
            .push(DeadLetterEntry::new(message.clone(), err.to_string(), err.class()))
            .await;
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Re-publish dead letters (all when `ids` is `None`) with their retry
    /// count reset. Replayed entries are removed; failed ones stay.
    pub async fn replay(&self, ids: Option<&[String]>) -> ReplayReport {
        let bus = self.bus.clone();
        let report = self
            .dead_letters
            .replay_with(ids, |message| {
                let bus = bus.clone();
                async move { bus.publish(message.to(BRIDGE_ID)).map(|_| ()) }
            })
            .await;
        self.counters
            .replayed
            .fetch_add(report.replayed_count as u64, Ordering::Relaxed);
        info!(
            replayed = report.replayed_count,
            failed = report.failed_count,
            "Bridge dead letters replayed"
        );
        report
    }

    /// Most recent dead letters, oldest first
    pub async fn get_dead_letter_messages(&self, limit: usize) -> Vec<DeadLetterEntry> {
        self.dead_letters.recent(limit).await
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    pub async fn status(&self) -> BridgeStatus {
        if !self.is_running() {
            return BridgeStatus::Failed;
        }
        match self.breaker.state().await {
            CircuitState::Healthy => BridgeStatus::Healthy,
            CircuitState::Degraded => BridgeStatus::Degraded,
            CircuitState::Open => BridgeStatus::CircuitOpen,
        }
    }

    pub async fn metrics(&self) -> BridgeMetrics {
        let c = &self.counters;
        let processed = c.processed.load(Ordering::Relaxed);
        let avg_processing_time_ms = if processed == 0 {
            0.0
        } else {
            c.processing_us.load(Ordering::Relaxed) as f64 / processed as f64 / 1000.0
        };
        BridgeMetrics {
            messages_processed: processed,
            messages_failed: c.failed.load(Ordering::Relaxed),
            circuit_breaker_trips: self.breaker.stats().await.total_trips,
            avg_processing_time_ms,
            dead_letter_queue_size: self.dead_letters.len().await,
            messages_retried: c.retried.load(Ordering::Relaxed),
            messages_deferred: c.deferred.load(Ordering::Relaxed),
            messages_replayed: c.replayed.load(Ordering::Relaxed),
            pending_retries: self.pending_retries.load(Ordering::SeqCst),
        }
    }

    pub async fn get_bridge_health(&self) -> BridgeHealth {
        let circuit_breaker = self.breaker.stats().await;
        let metrics = self.metrics().await;
        BridgeHealth {
            bridge_id: BRIDGE_ID,
            status: self.status().await,
            circuit_breaker_state: circuit_breaker.state,
            circuit_breaker,
            is_running: self.is_running(),
            dead_letter_queue_size: metrics.dead_letter_queue_size,
            metrics,
            last_health_check: Utc::now(),
        }
    }

    /// Contract version a payload would be accepted as
    pub fn validate(&self, message_type: MessageType, payload: &Value) -> Result<ContractVersion> {
        Ok(self.contracts.validate(message_type, payload)?)
    }
}

/// Bus-facing adapter. The bridge owns retries and dead letters for its
/// traffic, so the bus always sees a successful delivery.
struct BridgeSubscriber {
    bridge: Arc<IntegrationBridge>,
}

#[async_trait]
impl MessageHandler for BridgeSubscriber {
    async fn handle(&self, message: &Message) -> Result<()> {
        if let Err(e) = self.bridge.handle(message).await {
            debug!(message_id = %message.id, error_class = %e.class(), "Bridge handling failed: {}", e);
        }
        Ok(())
    }
}
