use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use hivectl::bridge::BRIDGE_ID;
use hivectl::bus::{Message, MessageType};
use hivectl::config::AppConfig;
use hivectl::control_plane::ControlPlane;
use hivectl::coordination::ShutdownSignal;
use hivectl::monitoring::{HostSample, StaticHostProbe};
use hivectl::services::HealthServer;
use hivectl::supervisor::SUPERVISOR_ID;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn plane() -> ControlPlane {
    let host = Arc::new(StaticHostProbe {
        sample: HostSample::default(),
    });
    ControlPlane::build_with(&AppConfig::default(), host, None).unwrap()
}

fn app(plane: &ControlPlane) -> Router {
    HealthServer::router(plane.health_state())
}

async fn get(router: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn post_replay(router: Router, body: Option<Value>) -> Value {
    let request = Request::builder().method(Method::POST).uri("/bridge/replay");
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = router.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Two malformed improvement triggers, dead-lettered by the bridge
async fn seed_bridge_dead_letters(plane: &ControlPlane) {
    for n in 0..2 {
        plane
            .bus()
            .publish(
                Message::new(MessageType::ImprovementTrigger, SUPERVISOR_ID, json!({"n": n}))
                    .to(BRIDGE_ID),
            )
            .unwrap();
    }
    assert!(plane.bus().drain(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn liveness_does_not_depend_on_components() {
    let plane = plane();
    let (status, _) = get(app(&plane), "/healthz").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn health_reflects_running_state() {
    let plane = plane();
    let (status, body) = get(app(&plane), "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "unhealthy");

    plane.start().await.unwrap();
    let (status, body) = get(app(&plane), "/health").await;
    assert_eq!(status, StatusCode::OK);
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["components"].as_array().unwrap().len(), 4);

    let (status, _) = get(app(&plane), "/readyz").await;
    assert_eq!(status, StatusCode::OK);

    plane.shutdown(ShutdownSignal::Urgent).await;
    let (status, _) = get(app(&plane), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn metrics_use_prometheus_text_format() {
    let plane = plane();
    plane.start().await.unwrap();

    let response = app(&plane)
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));

    let text = String::from_utf8(
        to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec(),
    )
    .unwrap();
    assert!(text.contains("hivectl_up 1"));
    assert!(text.contains("hivectl_bus_messages_published"));

    plane.shutdown(ShutdownSignal::Urgent).await;
}

#[tokio::test]
async fn status_reports_every_subsystem() {
    let plane = plane();
    let (status, body) = get(app(&plane), "/status").await;
    assert_eq!(status, StatusCode::OK);

    let report: Value = serde_json::from_slice(&body).unwrap();
    for key in ["bus", "bridge", "emergencies", "monitoring", "supervisor"] {
        assert!(report.get(key).is_some(), "missing {key}");
    }
}

#[tokio::test]
async fn dead_letters_can_be_listed_and_replayed() {
    let plane = plane();
    plane.start().await.unwrap();
    seed_bridge_dead_letters(&plane).await;

    let (status, body) = get(app(&plane), "/bridge/dead-letters?limit=1").await;
    assert_eq!(status, StatusCode::OK);
    let listed: Vec<Value> = serde_json::from_slice(&body).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["error_class"], "contract_violation");
    let id = listed[0]["id"].as_str().unwrap().to_string();

    let report = post_replay(app(&plane), Some(json!({"ids": [id]}))).await;
    assert_eq!(report["replayed_count"], 1);
    // The replayed copy is still malformed and comes back under a new id
    assert!(plane.bus().drain(Duration::from_secs(5)).await);
    let report = post_replay(app(&plane), Some(json!({"ids": [id]}))).await;
    assert_eq!(report["replayed_count"], 0);

    // Without a body everything queued is replayed
    let report = post_replay(app(&plane), None).await;
    assert_eq!(report["replayed_count"], 2);
    assert_eq!(report["failed_count"], 0);

    plane.shutdown(ShutdownSignal::Urgent).await;
}
