use hivectl::bus::{handler_fn, Message, MessageBus, MessageBusConfig, MessageHandler, MessageType};
use hivectl::coordination::{CircuitBreakerConfig, CircuitState};
use hivectl::error::{ErrorClass, HiveError};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn counter(calls: Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
    handler_fn(move |_m| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

/// Counts calls and fails until `healthy` is set
fn switchable(calls: Arc<AtomicUsize>, healthy: Arc<AtomicBool>) -> Arc<dyn MessageHandler> {
    handler_fn(move |_m| {
        let calls = Arc::clone(&calls);
        let healthy = Arc::clone(&healthy);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(HiveError::Transient("agent unreachable".into()))
            }
        }
    })
}

#[tokio::test]
async fn every_active_subscriber_sees_every_message() {
    let bus = MessageBus::with_defaults();
    let counters: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    for (i, calls) in counters.iter().enumerate() {
        bus.subscribe(
            &format!("agent-{i}"),
            &[MessageType::SystemCommand],
            counter(Arc::clone(calls)),
            None,
        )
        .await
        .unwrap();
    }
    bus.start().await.unwrap();

    for n in 0..5 {
        bus.publish(Message::new(
            MessageType::SystemCommand,
            "operator",
            json!({"command": "noop", "n": n}),
        ))
        .unwrap();
    }
    // Targeted delivery reaches only its recipient
    bus.publish(
        Message::new(MessageType::SystemCommand, "operator", json!({"command": "restart"}))
            .to("agent-1"),
    )
    .unwrap();
    assert!(bus.drain(Duration::from_secs(5)).await);

    assert_eq!(counters[0].load(Ordering::SeqCst), 5);
    assert_eq!(counters[1].load(Ordering::SeqCst), 6);
    assert_eq!(counters[2].load(Ordering::SeqCst), 5);

    let stats = bus.get_bus_statistics().await;
    assert_eq!(stats.deliveries_succeeded, 16);
    assert_eq!(stats.dead_letter_queue_size, 0);
    bus.stop().await;
}

#[tokio::test(start_paused = true)]
async fn expired_message_is_dead_lettered_instead_of_delivered() {
    let bus = MessageBus::with_defaults();
    let calls = Arc::new(AtomicUsize::new(0));
    bus.subscribe("agent-a", &[MessageType::SystemCommand], counter(calls.clone()), None)
        .await
        .unwrap();

    // Enqueued before the consumer runs, processed after the TTL has passed
    let id = bus
        .publish(
            Message::new(MessageType::SystemCommand, "operator", json!({"command": "reload"}))
                .with_ttl(Duration::from_secs(1)),
        )
        .unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;
    bus.start().await.unwrap();
    assert!(bus.drain(Duration::from_secs(5)).await);

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let dead = bus.get_dead_letter_messages(10).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].original_message.id, id);
    assert_eq!(dead[0].error_class, ErrorClass::Transient);
    assert_eq!(bus.get_bus_statistics().await.messages_expired, 1);
    bus.stop().await;
}

#[tokio::test(start_paused = true)]
async fn failing_subscriber_is_cut_off_then_probed_once() {
    let bus = MessageBus::new(MessageBusConfig {
        subscriber_breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout_secs: 60,
            half_open_max_calls: 1,
            success_threshold: 1,
        },
        ..Default::default()
    });
    let calls = Arc::new(AtomicUsize::new(0));
    let healthy = Arc::new(AtomicBool::new(false));
    bus.subscribe(
        "agent-b",
        &[MessageType::SystemCommand],
        switchable(calls.clone(), healthy.clone()),
        None,
    )
    .await
    .unwrap();
    bus.start().await.unwrap();

    let command = || {
        Message::new(MessageType::SystemCommand, "operator", json!({"command": "ping"}))
            .with_max_retries(1)
    };

    // Three permanent failures open the breaker
    for _ in 0..3 {
        bus.publish(command()).unwrap();
    }
    assert!(bus.drain(Duration::from_secs(5)).await);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let breaker = bus.subscriber_breaker("agent-b").unwrap();
    assert_eq!(breaker.state().await, CircuitState::Open);

    // Nothing reaches the subscriber while open
    for _ in 0..4 {
        bus.publish(command()).unwrap();
    }
    assert!(bus.drain(Duration::from_secs(5)).await);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(bus.get_bus_statistics().await.circuit_rejections, 4);

    // After the recovery window a single probe goes through and fails
    tokio::time::advance(Duration::from_secs(61)).await;
    for _ in 0..3 {
        bus.publish(command()).unwrap();
    }
    assert!(bus.drain(Duration::from_secs(5)).await);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(breaker.state().await, CircuitState::Open);

    // A successful probe closes it again
    healthy.store(true, Ordering::SeqCst);
    tokio::time::advance(Duration::from_secs(61)).await;
    bus.publish(command()).unwrap();
    assert!(bus.drain(Duration::from_secs(5)).await);
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(breaker.state().await, CircuitState::Healthy);

    // Transitions are surfaced as alerts
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bus.drain(Duration::from_secs(5)).await);
    let alerts = bus
        .get_message_history(Some(MessageType::EmergencyAlert), None, 50)
        .await;
    assert!(alerts
        .iter()
        .any(|m| m.payload_str("event_type") == Some("circuit_breaker_transition")));
    bus.stop().await;
}

#[tokio::test]
async fn dead_letter_queue_keeps_most_recent_entries() {
    let bus = MessageBus::new(MessageBusConfig {
        dead_letter_max_size: 3,
        subscriber_breaker: CircuitBreakerConfig {
            failure_threshold: 100,
            ..CircuitBreakerConfig::subscriber_default()
        },
        ..Default::default()
    });
    bus.subscribe(
        "strict",
        &[MessageType::PerformanceMetric],
        handler_fn(|_m| async { Err(HiveError::Validation("bad metric payload".into())) }),
        None,
    )
    .await
    .unwrap();
    bus.start().await.unwrap();

    for seq in 0..7 {
        bus.publish(Message::new(
            MessageType::PerformanceMetric,
            "agent-c",
            json!({"seq": seq}),
        ))
        .unwrap();
        assert!(bus.drain(Duration::from_secs(5)).await);
    }

    let dead = bus.get_dead_letter_messages(10).await;
    let seqs: Vec<i64> = dead
        .iter()
        .map(|e| e.original_message.payload["seq"].as_i64().unwrap())
        .collect();
    assert_eq!(seqs, vec![4, 5, 6]);
    assert!(dead.iter().all(|e| e.error_class == ErrorClass::ContractViolation));

    let stats = bus.get_bus_statistics().await;
    assert_eq!(stats.dead_letter_queue_size, 3);
    assert_eq!(stats.dead_letters_evicted, 4);
    assert_eq!(stats.messages_retried, 0);
    bus.stop().await;
}

#[tokio::test]
async fn bus_replay_republishes_once() {
    let bus = MessageBus::with_defaults();
    let calls = Arc::new(AtomicUsize::new(0));
    let healthy = Arc::new(AtomicBool::new(false));
    bus.subscribe(
        "agent-d",
        &[MessageType::SystemCommand],
        switchable(calls.clone(), healthy.clone()),
        None,
    )
    .await
    .unwrap();
    bus.start().await.unwrap();

    bus.publish(
        Message::new(MessageType::SystemCommand, "operator", json!({"command": "sync"}))
            .with_max_retries(1),
    )
    .unwrap();
    assert!(bus.drain(Duration::from_secs(5)).await);
    assert_eq!(bus.dead_letters().len().await, 1);

    healthy.store(true, Ordering::SeqCst);
    let first = bus.replay_dead_letters(None).await;
    assert_eq!(first.replayed_count, 1);
    assert!(bus.drain(Duration::from_secs(5)).await);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(bus.dead_letters().is_empty().await);

    let second = bus.replay_dead_letters(None).await;
    assert_eq!(second.replayed_count, 0);
    assert_eq!(second.failed_count, 0);
    assert!(bus.drain(Duration::from_secs(5)).await);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    bus.stop().await;
}
