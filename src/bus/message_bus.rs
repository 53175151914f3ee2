//! In-process publish/subscribe bus
//!
//! A single consumer loop drains the queue. For each message it dead-letters
//! expired ones, resolves the subscribers for the message type, skips those
//! whose breaker refuses the call and fans delivery out concurrently to the
//! rest. Failed subscribers get the message again after backoff until the
//! message's retry budget is spent; then it is dead-lettered and the failing
//! subscribers' breakers are charged.
//!
//! Every message is in exactly one place at a time: the in-flight queue
//! (including retry timers), the delivered history, or the dead-letter queue.

use super::dead_letter::{DeadLetterEntry, DeadLetterQueue, ReplayReport};
use super::history::MessageHistory;
use super::message::{Message, MessagePriority, MessageType};
use super::subscription::{MessageFilter, MessageHandler, Subscription};
use crate::coordination::{
    Admission, BreakerTransition, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    RetryPolicy, Shutdown, ShutdownToken,
};
use crate::error::{ErrorClass, HiveError, Result};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Sender id used for messages the bus emits itself
pub const BUS_SENDER_ID: &str = "message_bus";

/// Configuration for the message bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageBusConfig {
    /// Delivered messages kept for inspection
    pub history_max_size: usize,
    /// Age after which history entries are dropped (seconds)
    pub history_ttl_secs: u64,
    /// Dead-letter ring buffer capacity
    pub dead_letter_max_size: usize,
    /// Upper bound on a single handler invocation (milliseconds)
    pub delivery_timeout_ms: u64,
    /// Redelivery backoff; the retry budget comes from each message
    pub retry: RetryPolicy,
    /// Per-subscriber circuit breaker
    pub subscriber_breaker: CircuitBreakerConfig,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            history_max_size: 1000,
            history_ttl_secs: 24 * 60 * 60,
            dead_letter_max_size: 1000,
            delivery_timeout_ms: 5000,
            retry: RetryPolicy::bus_default(),
            subscriber_breaker: CircuitBreakerConfig::subscriber_default(),
        }
    }
}

impl MessageBusConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

/// Queue item: the message plus, for retries, the subscriptions still owed a delivery
struct Envelope {
    message: Message,
    targets: Option<HashSet<String>>,
}

#[derive(Default)]
struct Registry {
    subscriptions: HashMap<String, Subscription>,
    index: HashMap<MessageType, BTreeSet<String>>,
}

#[derive(Default)]
struct BusCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    delivery_failures: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    expired: AtomicU64,
    circuit_rejections: AtomicU64,
}

struct BusInner {
    config: MessageBusConfig,
    registry: RwLock<Registry>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    breaker_events: broadcast::Sender<BreakerTransition>,
    queue_tx: mpsc::UnboundedSender<Envelope>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    history: RwLock<MessageHistory>,
    dead_letters: DeadLetterQueue,
    counters: BusCounters,
    in_flight: AtomicU64,
    running: AtomicBool,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct BusStatistics {
    pub running: bool,
    pub messages_published: u64,
    pub deliveries_succeeded: u64,
    pub delivery_failures: u64,
    pub messages_retried: u64,
    pub messages_dead_lettered: u64,
    pub messages_expired: u64,
    pub circuit_rejections: u64,
    pub in_flight: u64,
    pub active_subscriptions: usize,
    pub subscriptions_by_type: BTreeMap<String, usize>,
    pub history_size: usize,
    pub dead_letter_queue_size: usize,
    pub dead_letters_evicted: u64,
    pub subscriber_breakers: BTreeMap<String, CircuitState>,
}

/// Cloneable handle to the bus. All clones share one queue and registry.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new(config: MessageBusConfig) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (breaker_events, _) = broadcast::channel(256);
        let history = MessageHistory::new(
            config.history_max_size,
            Duration::from_secs(config.history_ttl_secs),
        );
        let dead_letters = DeadLetterQueue::new(config.dead_letter_max_size);

        Self {
            inner: Arc::new(BusInner {
                config,
                registry: RwLock::new(Registry::default()),
                breakers: DashMap::new(),
                breaker_events,
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                history: RwLock::new(history),
                dead_letters,
                counters: BusCounters::default(),
                in_flight: AtomicU64::new(0),
                running: AtomicBool::new(false),
                shutdown: Shutdown::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(MessageBusConfig::default())
    }

    pub fn config(&self) -> &MessageBusConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Enqueue a message and return its id. Never waits on delivery.
    pub fn publish(&self, message: Message) -> Result<String> {
        let id = message.id.clone();
        let message_type = message.message_type;

        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope {
            message,
            targets: None,
        };
        if self.inner.queue_tx.send(envelope).is_err() {
            self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(HiveError::Internal("message bus queue closed".to_string()));
        }

        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        debug!(message_id = %id, message_type = %message_type, "Message published");
        Ok(id)
    }

    /// Register a handler for one or more message types
    pub async fn subscribe(
        &self,
        subscriber_id: &str,
        message_types: &[MessageType],
        handler: Arc<dyn MessageHandler>,
        filter: Option<MessageFilter>,
    ) -> Result<String> {
        if subscriber_id.is_empty() {
            return Err(HiveError::Validation("subscriber id must not be empty".into()));
        }
        if message_types.is_empty() {
            return Err(HiveError::Validation(format!(
                "subscriber {subscriber_id} must subscribe to at least one message type"
            )));
        }

        let types: HashSet<MessageType> = message_types.iter().copied().collect();
        let subscription = Subscription::new(subscriber_id, types.clone(), handler, filter);
        let id = subscription.id.clone();

        let mut registry = self.inner.registry.write().await;
        for t in &types {
            registry.index.entry(*t).or_default().insert(id.clone());
        }
        registry.subscriptions.insert(id.clone(), subscription);

        info!(
            subscriber_id,
            subscription_id = %id,
            types = ?types,
            "Subscription registered"
        );
        Ok(id)
    }

    /// Remove a subscription. Returns false if it did not exist.
    pub async fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut registry = self.inner.registry.write().await;
        let Some(subscription) = registry.subscriptions.remove(subscription_id) else {
            return false;
        };
        for t in &subscription.message_types {
            if let Some(ids) = registry.index.get_mut(t) {
                ids.remove(subscription_id);
                if ids.is_empty() {
                    registry.index.remove(t);
                }
            }
        }
        info!(subscription_id, "Subscription removed");
        true
    }

    /// Start the consumer loop and the breaker alert forwarder
    pub async fn start(&self) -> Result<()> {
        let rx = self
            .inner
            .queue_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| HiveError::Internal("message bus already started".to_string()))?;

        self.inner.running.store(true, Ordering::SeqCst);

        let consumer = tokio::spawn(run_consumer(
            Arc::clone(&self.inner),
            rx,
            self.inner.shutdown.token(),
        ));
        let forwarder = tokio::spawn(forward_breaker_transitions(
            self.clone(),
            self.inner.breaker_events.subscribe(),
            self.inner.shutdown.token(),
        ));
        self.inner.tasks.lock().await.extend([consumer, forwarder]);

        info!("Message bus started");
        Ok(())
    }

    /// Stop the loops. In-flight deliveries and pending retries are abandoned.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.request();

        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("Message bus task did not stop within 5s");
            }
        }
        info!("Message bus stopped");
    }

    /// Wait until nothing is in flight. Returns false on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let poll = async {
            while self.inner.in_flight.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }

    /// Delivered history, most recent matches, oldest first
    pub async fn get_message_history(
        &self,
        message_type: Option<MessageType>,
        sender_id: Option<&str>,
        limit: usize,
    ) -> Vec<Message> {
        self.inner
            .history
            .read()
            .await
            .query(message_type, sender_id, limit)
    }

    pub async fn get_dead_letter_messages(&self, limit: usize) -> Vec<DeadLetterEntry> {
        self.inner.dead_letters.recent(limit).await
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.inner.dead_letters
    }

    /// Re-publish dead letters (all, or the given entry/message ids)
    pub async fn replay_dead_letters(&self, ids: Option<&[String]>) -> ReplayReport {
        let report = self
            .inner
            .dead_letters
            .replay_with(ids, |message| {
                let published = self.publish(message).map(|_| ());
                async move { published }
            })
            .await;
        info!(
            replayed = report.replayed_count,
            failed = report.failed_count,
            "Bus dead letters replayed"
        );
        report
    }

    /// Breaker guarding a subscriber, if one has been created
    pub fn subscriber_breaker(&self, subscriber_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.inner
            .breakers
            .get(subscriber_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Subscribe to breaker transitions of every subscriber
    pub fn breaker_transitions(&self) -> broadcast::Receiver<BreakerTransition> {
        self.inner.breaker_events.subscribe()
    }

    /// Sender for breakers outside the bus whose transitions should be
    /// surfaced as alerts too
    pub fn breaker_event_sender(&self) -> broadcast::Sender<BreakerTransition> {
        self.inner.breaker_events.clone()
    }

    pub async fn get_bus_statistics(&self) -> BusStatistics {
        let c = &self.inner.counters;

        let (active_subscriptions, subscriptions_by_type) = {
            let registry = self.inner.registry.read().await;
            let by_type = registry
                .index
                .iter()
                .map(|(t, ids)| (t.as_str().to_string(), ids.len()))
                .collect();
            (
                registry.subscriptions.values().filter(|s| s.active).count(),
                by_type,
            )
        };

        let breakers: Vec<(String, Arc<CircuitBreaker>)> = self
            .inner
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        let mut subscriber_breakers = BTreeMap::new();
        for (subscriber, breaker) in breakers {
            subscriber_breakers.insert(subscriber, breaker.state().await);
        }

        BusStatistics {
            running: self.is_running(),
            messages_published: c.published.load(Ordering::Relaxed),
            deliveries_succeeded: c.delivered.load(Ordering::Relaxed),
            delivery_failures: c.delivery_failures.load(Ordering::Relaxed),
            messages_retried: c.retried.load(Ordering::Relaxed),
            messages_dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            messages_expired: c.expired.load(Ordering::Relaxed),
            circuit_rejections: c.circuit_rejections.load(Ordering::Relaxed),
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
            active_subscriptions,
            subscriptions_by_type,
            history_size: self.inner.history.read().await.len(),
            dead_letter_queue_size: self.inner.dead_letters.len().await,
            dead_letters_evicted: self.inner.dead_letters.evicted(),
            subscriber_breakers,
        }
    }
}

impl BusInner {
    async fn process(self: &Arc<Self>, envelope: Envelope) {
        let Envelope {
            mut message,
            targets,
        } = envelope;

        if message.is_expired() {
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            warn!(message_id = %message.id, message_type = %message.message_type, "Message expired before delivery");
            self.dead_letter(message, "message expired before delivery".to_string(), ErrorClass::Transient)
                .await;
            return;
        }

        let recipients = self.resolve_recipients(&message, targets.as_ref()).await;

        let mut admitted = Vec::with_capacity(recipients.len());
        for subscription in recipients {
            let breaker = self.breaker_for(&subscription.subscriber_id);
            match breaker.acquire().await {
                Admission::Rejected { retry_after } => {
                    self.counters.circuit_rejections.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        subscriber_id = %subscription.subscriber_id,
                        retry_after_secs = retry_after.as_secs(),
                        "Skipping subscriber with open circuit"
                    );
                }
                admission => admitted.push((subscription, breaker, admission)),
            }
        }

        let results = join_all(
            admitted
                .iter()
                .map(|(subscription, _, _)| self.deliver(subscription, &message)),
        )
        .await;

        let mut failed = Vec::new();
        for ((subscription, breaker, admission), result) in admitted.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    breaker.record_success().await;
                }
                Err(e) => {
                    self.counters.delivery_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        message_id = %message.id,
                        subscriber_id = %subscription.subscriber_id,
                        "Delivery failed: {}", e
                    );
                    // A failed probe re-opens the breaker right away
                    if admission == Admission::Probe {
                        breaker.record_failure(&e.to_string()).await;
                    }
                    failed.push((subscription, breaker, admission, e));
                }
            }
        }

        if failed.is_empty() {
            self.history.write().await.push(message);
            self.finish();
            return;
        }

        message.retry_count += 1;
        // Contract violations and other permanent errors are never redelivered
        let permanent = failed.iter().any(|(.., e)| !e.is_retryable());
        if !permanent && message.retry_count < message.max_retries {
            let delay = self.config.retry.delay_for(message.retry_count);
            let targets = failed.iter().map(|(s, ..)| s.id.clone()).collect();
            debug!(
                message_id = %message.id,
                retry_count = message.retry_count,
                delay_ms = delay.as_millis() as u64,
                "Scheduling redelivery"
            );
            self.schedule_retry(
                Envelope {
                    message,
                    targets: Some(targets),
                },
                delay,
            );
            return;
        }

        let class = failed
            .iter()
            .map(|(.., e)| e.class())
            .find(|c| *c != ErrorClass::Transient)
            .unwrap_or(ErrorClass::Transient);
        let mut errors = Vec::with_capacity(failed.len());
        for (subscription, breaker, admission, e) in &failed {
            if *admission != Admission::Probe {
                breaker.record_failure(&e.to_string()).await;
            }
            errors.push(format!("{}: {}", subscription.subscriber_id, e));
        }
        error!(
            message_id = %message.id,
            retry_count = message.retry_count,
            error_class = %class,
            "Delivery failed permanently, dead-lettering message"
        );
        self.dead_letter(message, errors.join("; "), class).await;
    }

    async fn resolve_recipients(
        &self,
        message: &Message,
        targets: Option<&HashSet<String>>,
    ) -> Vec<Subscription> {
        let registry = self.registry.read().await;
        let Some(ids) = registry.index.get(&message.message_type) else {
            return Vec::new();
        };
        ids.iter()
            .filter(|id| targets.map_or(true, |t| t.contains(*id)))
            .filter_map(|id| registry.subscriptions.get(id))
            .filter(|s| s.wants(message))
            .cloned()
            .collect()
    }

    async fn deliver(&self, subscription: &Subscription, message: &Message) -> Result<()> {
        let handler = Arc::clone(&subscription.handler);
        let owned = message.clone();
        let timeout = self.config.delivery_timeout();

        // Own task so a panicking handler only fails its own delivery
        let task = tokio::spawn(async move { handler.handle(&owned).await });
        let abort = task.abort_handle();

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(HiveError::Handler(format!(
                "handler for {} aborted: {}",
                subscription.subscriber_id, join_error
            ))),
            Err(_) => {
                abort.abort();
                Err(HiveError::timeout(
                    format!(
                        "deliver {} to {}",
                        message.message_type, subscription.subscriber_id
                    ),
                    timeout,
                ))
            }
        }
    }

    fn breaker_for(&self, subscriber_id: &str) -> Arc<CircuitBreaker> {
        let entry = self
            .breakers
            .entry(subscriber_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_events(
                    subscriber_id,
                    self.config.subscriber_breaker.clone(),
                    self.breaker_events.clone(),
                ))
            });
        Arc::clone(entry.value())
    }

    fn schedule_retry(self: &Arc<Self>, envelope: Envelope, delay: Duration) {
        self.counters.retried.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(self);
        let mut token = self.shutdown.token();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(message_id = %envelope.message.id, "Redelivery dropped by shutdown");
                    inner.finish();
                }
                _ = tokio::time::sleep(delay) => {
                    // Re-enters the tail of the queue
                    if inner.queue_tx.send(envelope).is_err() {
                        inner.finish();
                    }
                }
            }
        });
    }

    async fn dead_letter(&self, message: Message, error: String, class: ErrorClass) {
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.dead_letters
            .push(DeadLetterEntry::new(message, error, class))
            .await;
        self.finish();
    }

    fn finish(&self) {
        // Saturating: a redelivery dropped after stop() may race the counter
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
    }
}

async fn run_consumer(
    inner: Arc<BusInner>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    mut token: ShutdownToken,
) {
    info!("Message bus consumer loop started");
    loop {
        let envelope = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("In-flight fan-out cancelled by shutdown");
                break;
            }
            _ = inner.process(envelope) => {}
        }
    }
    info!("Message bus consumer loop stopped");
}

async fn forward_breaker_transitions(
    bus: MessageBus,
    mut transitions: broadcast::Receiver<BreakerTransition>,
    mut token: ShutdownToken,
) {
    loop {
        let transition = tokio::select! {
            _ = token.cancelled() => break,
            next = transitions.recv() => match next {
                Ok(transition) => transition,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Breaker transition alerts lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let alert = Message::new(
            MessageType::EmergencyAlert,
            BUS_SENDER_ID,
            json!({
                "event_type": "circuit_breaker_transition",
                "boundary": transition.breaker,
                "from": transition.from,
                "to": transition.to,
                "reason": transition.reason,
                "timestamp": transition.timestamp.to_rfc3339(),
            }),
        )
        .with_priority(MessagePriority::High);

        if let Err(e) = bus.publish(alert) {
            warn!("Could not publish breaker transition alert: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::subscription::handler_fn;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
        handler_fn(move |_m| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() {
        let bus = MessageBus::with_defaults();
        let id = bus
            .subscribe(
                "probe",
                &[MessageType::AgentHeartbeat, MessageType::PerformanceMetric],
                counting_handler(Arc::new(AtomicUsize::new(0))),
                None,
            )
            .await
            .unwrap();

        let stats = bus.get_bus_statistics().await;
        assert_eq!(stats.active_subscriptions, 1);
        assert_eq!(stats.subscriptions_by_type.get("agent_heartbeat"), Some(&1));

        assert!(bus.unsubscribe(&id).await);
        assert!(!bus.unsubscribe(&id).await);
        assert!(bus.get_bus_statistics().await.subscriptions_by_type.is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_requires_types() {
        let bus = MessageBus::with_defaults();
        let result = bus
            .subscribe("x", &[], counting_handler(Arc::new(AtomicUsize::new(0))), None)
            .await;
        assert!(matches!(result, Err(HiveError::Validation(_))));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let bus = MessageBus::with_defaults();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        bus.subscribe("a", &[MessageType::HealthCheck], counting_handler(a.clone()), None)
            .await
            .unwrap();
        bus.subscribe("b", &[MessageType::HealthCheck], counting_handler(b.clone()), None)
            .await
            .unwrap();
        bus.start().await.unwrap();

        bus.publish(Message::new(MessageType::HealthCheck, "test", json!({})))
            .unwrap();
        assert!(bus.drain(Duration::from_secs(1)).await);

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
        assert_eq!(
            bus.get_message_history(Some(MessageType::HealthCheck), None, 10)
                .await
                .len(),
            1
        );
        bus.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_only_failed_subscriber() {
        let bus = MessageBus::with_defaults();
        let ok = Arc::new(AtomicUsize::new(0));
        let flaky_calls = Arc::new(AtomicUsize::new(0));

        bus.subscribe("ok", &[MessageType::SystemCommand], counting_handler(ok.clone()), None)
            .await
            .unwrap();
        let calls = flaky_calls.clone();
        bus.subscribe(
            "flaky",
            &[MessageType::SystemCommand],
            handler_fn(move |_m| {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(HiveError::Transient("first attempt fails".into()))
                    } else {
                        Ok(())
                    }
                }
            }),
            None,
        )
        .await
        .unwrap();
        bus.start().await.unwrap();

        bus.publish(Message::new(MessageType::SystemCommand, "test", json!({})))
            .unwrap();
        assert!(bus.drain(Duration::from_secs(30)).await);

        assert_eq!(ok.load(Ordering::SeqCst), 1);
        assert_eq!(flaky_calls.load(Ordering::SeqCst), 2);
        let stats = bus.get_bus_statistics().await;
        assert_eq!(stats.messages_retried, 1);
        assert_eq!(stats.dead_letter_queue_size, 0);
        bus.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_times_out_and_dead_letters() {
        let bus = MessageBus::new(MessageBusConfig {
            delivery_timeout_ms: 100,
            ..Default::default()
        });
        bus.subscribe(
            "slow",
            &[MessageType::HealthCheck],
            handler_fn(|_m| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
            None,
        )
        .await
        .unwrap();
        bus.start().await.unwrap();

        bus.publish(
            Message::new(MessageType::HealthCheck, "test", json!({})).with_max_retries(1),
        )
        .unwrap();
        assert!(bus.drain(Duration::from_secs(5)).await);

        let dead = bus.get_dead_letter_messages(10).await;
        assert_eq!(dead.len(), 1);
        assert!(dead[0].error.contains("Timed out"));
        assert_eq!(dead[0].error_class, ErrorClass::Transient);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let bus = MessageBus::with_defaults();
        let survivor = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "panics",
            &[MessageType::HealthCheck],
            handler_fn(|_m| async {
                if true {
                    panic!("handler bug");
                }
                Ok(())
            }),
            None,
        )
        .await
        .unwrap();
        bus.subscribe("ok", &[MessageType::HealthCheck], counting_handler(survivor.clone()), None)
            .await
            .unwrap();
        bus.start().await.unwrap();

        bus.publish(Message::new(MessageType::HealthCheck, "t", json!({})).with_max_retries(0))
            .unwrap();
        assert!(bus.drain(Duration::from_secs(1)).await);

        assert_eq!(survivor.load(Ordering::SeqCst), 1);
        assert_eq!(bus.get_dead_letter_messages(10).await.len(), 1);
        assert!(bus.is_running());
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_contract_violation_is_not_redelivered() {
        let bus = MessageBus::with_defaults();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        bus.subscribe(
            "strict",
            &[MessageType::AgentStatusUpdate],
            handler_fn(move |m| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    let _: u64 = serde_json::from_value(m.payload["count"].clone())?;
                    Ok::<(), HiveError>(())
                }
            }),
            None,
        )
        .await
        .unwrap();
        bus.start().await.unwrap();

        bus.publish(Message::new(
            MessageType::AgentStatusUpdate,
            "t",
            json!({"count": "many"}),
        ))
        .unwrap();
        assert!(bus.drain(Duration::from_secs(1)).await);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let dead = bus.get_dead_letter_messages(10).await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].error_class, ErrorClass::ContractViolation);
        bus.stop().await;
    }

    #[tokio::test]
    async fn test_publish_after_stop_fails() {
        let bus = MessageBus::with_defaults();
        bus.start().await.unwrap();
        bus.stop().await;
        // Give the consumer a moment to drop the receiver
        tokio::task::yield_now().await;

        let result = bus.publish(Message::new(MessageType::HealthCheck, "t", json!({})));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let bus = MessageBus::with_defaults();
        bus.start().await.unwrap();
        assert!(bus.start().await.is_err());
        bus.stop().await;
    }
}
