use hivectl::bridge::{BridgeStatus, BRIDGE_ID};
use hivectl::bus::{Message, MessageType};
use hivectl::config::AppConfig;
use hivectl::control_plane::ControlPlane;
use hivectl::coordination::ShutdownSignal;
use hivectl::error::ErrorClass;
use hivectl::monitoring::{AgentReporter, AgentStatus, HostSample, StaticHostProbe};
use hivectl::supervisor::SUPERVISOR_ID;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn plane() -> ControlPlane {
    let host = Arc::new(StaticHostProbe {
        sample: HostSample {
            cpu_usage_percent: 12.0,
            memory_usage_percent: 40.0,
        },
    });
    ControlPlane::build_with(&AppConfig::default(), host, None).unwrap()
}

async fn offline_alerts_for(plane: &ControlPlane, agent_id: &str) -> usize {
    plane
        .bus()
        .get_message_history(Some(MessageType::EmergencyAlert), None, 1000)
        .await
        .iter()
        .filter(|m| {
            m.payload_str("alert_type") == Some("agent_offline")
                && m.payload_str("agent_id") == Some(agent_id)
        })
        .count()
}

async fn triggers_seen(plane: &ControlPlane) -> usize {
    plane
        .bus()
        .get_message_history(Some(MessageType::ImprovementTrigger), Some(SUPERVISOR_ID), 100)
        .await
        .len()
}

#[tokio::test(start_paused = true)]
async fn silent_agent_goes_offline_and_is_alerted_once() {
    let plane = plane();
    plane.start().await.unwrap();
    assert!(
        plane
            .probe()
            .register_agent("agent-a", "voice", vec!["outbound_calls".into()])
            .await
    );

    let reporter = AgentReporter::new(plane.bus().clone(), "agent-a");
    for _ in 0..3 {
        reporter.heartbeat(AgentStatus::Healthy).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
    }
    assert_eq!(
        plane.registry().get("agent-a").await.unwrap().status,
        AgentStatus::Healthy
    );

    // Silence past the 30s heartbeat deadline
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert!(plane.bus().drain(Duration::from_secs(5)).await);
    assert_eq!(
        plane.registry().get("agent-a").await.unwrap().status,
        AgentStatus::Offline
    );
    assert_eq!(offline_alerts_for(&plane, "agent-a").await, 1);

    // Further sweeps do not repeat the alert
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(plane.bus().drain(Duration::from_secs(5)).await);
    assert_eq!(offline_alerts_for(&plane, "agent-a").await, 1);

    // A heartbeat brings the agent back
    reporter.heartbeat(AgentStatus::Healthy).unwrap();
    assert!(plane.bus().drain(Duration::from_secs(5)).await);
    assert_eq!(
        plane.registry().get("agent-a").await.unwrap().status,
        AgentStatus::Healthy
    );

    plane.shutdown(ShutdownSignal::Graceful).await;
    assert!(!plane.bus().is_running());
}

#[tokio::test(start_paused = true)]
async fn emergency_is_not_raised_twice_within_cooldown() {
    let plane = plane();
    let metrics = HashMap::from([("call_failure_rate".to_string(), 0.45)]);

    let first = plane.detector().evaluate(&metrics).await;
    assert_eq!(first.len(), 1);
    assert_eq!(plane.detector().get_active().await.len(), 1);

    let second = plane.detector().evaluate(&metrics).await;
    assert!(second.is_empty());
    assert_eq!(plane.detector().get_statistics().await.total_emergencies, 1);

    // call_failure_rate cools down for 300s
    tokio::time::advance(Duration::from_secs(301)).await;
    let third = plane.detector().evaluate(&metrics).await;
    assert_eq!(third.len(), 1);
    assert_eq!(plane.detector().get_statistics().await.total_emergencies, 2);
}

#[tokio::test]
async fn malformed_deployment_notice_is_dead_lettered_not_forwarded() {
    let plane = plane();
    plane.start().await.unwrap();

    // No deployment_id
    plane
        .bus()
        .publish(
            Message::new(
                MessageType::DeploymentNotification,
                "gatekeeper_supervisor",
                json!({"status": "succeeded", "timestamp": "2026-03-01T12:00:00Z"}),
            )
            .to(BRIDGE_ID),
        )
        .unwrap();
    assert!(plane.bus().drain(Duration::from_secs(5)).await);

    let dead = plane.bridge().get_dead_letter_messages(10).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].error_class, ErrorClass::ContractViolation);

    let forwarded = plane
        .bus()
        .get_message_history(Some(MessageType::DeploymentNotification), Some(BRIDGE_ID), 10)
        .await;
    assert!(forwarded.is_empty());
    assert_eq!(plane.bridge().metrics().await.messages_processed, 0);

    plane.shutdown(ShutdownSignal::Graceful).await;
}

#[tokio::test]
async fn valid_deployment_notice_reaches_the_supervisor() {
    let plane = plane();
    plane.start().await.unwrap();

    plane
        .bus()
        .publish(
            Message::new(
                MessageType::DeploymentNotification,
                "gatekeeper_supervisor",
                json!({
                    "deployment_id": "dep-42",
                    "status": "succeeded",
                    "timestamp": "2026-03-01T12:00:00Z",
                }),
            )
            .to(BRIDGE_ID),
        )
        .unwrap();
    assert!(plane.bus().drain(Duration::from_secs(5)).await);

    let forwarded = plane
        .bus()
        .get_message_history(Some(MessageType::DeploymentNotification), Some(BRIDGE_ID), 10)
        .await;
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].recipient_id.as_deref(), Some(SUPERVISOR_ID));
    assert_eq!(forwarded[0].payload_str("deployment_id"), Some("dep-42"));
    assert_eq!(plane.bridge().metrics().await.messages_processed, 1);
    assert_eq!(plane.bridge().status().await, BridgeStatus::Healthy);

    plane.shutdown(ShutdownSignal::Graceful).await;
}

#[tokio::test]
async fn bridge_replay_resubmits_each_dead_letter_once() {
    let plane = plane();
    plane.start().await.unwrap();

    for n in 0..2 {
        plane
            .bus()
            .publish(
                Message::new(
                    MessageType::ImprovementTrigger,
                    SUPERVISOR_ID,
                    json!({"trigger_type": "performance_degradation", "n": n}),
                )
                .to(BRIDGE_ID),
            )
            .unwrap();
    }
    assert!(plane.bus().drain(Duration::from_secs(5)).await);
    assert_eq!(plane.bridge().dead_letters().len().await, 2);
    assert_eq!(triggers_seen(&plane).await, 2);

    let first = plane.bridge().replay(None).await;
    assert_eq!(first.replayed_count, 2);
    assert_eq!(first.failed_count, 0);
    assert!(plane.bus().drain(Duration::from_secs(5)).await);

    // The replayed copies are still malformed and land back in the queue
    assert_eq!(plane.bridge().dead_letters().len().await, 2);
    assert_eq!(triggers_seen(&plane).await, 4);

    let only: Vec<String> = plane
        .bridge()
        .get_dead_letter_messages(10)
        .await
        .into_iter()
        .take(1)
        .map(|e| e.id)
        .collect();
    let partial = plane.bridge().replay(Some(only.as_slice())).await;
    assert_eq!(partial.replayed_count, 1);
    let repeat = plane.bridge().replay(Some(only.as_slice())).await;
    assert_eq!(repeat.replayed_count, 0);

    plane.shutdown(ShutdownSignal::Graceful).await;
}
