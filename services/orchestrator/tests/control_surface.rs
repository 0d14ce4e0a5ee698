//! Router-level tests for the HTTP control surface.
//!
//! Each test builds the full router over mock clients and drives it with
//! `tower::ServiceExt::oneshot`, the same way a load balancer or operator
//! would hit the running service.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use hmac::{Hmac, Mac};
use kiln_orchestrator::api;
use kiln_orchestrator::config::Config;
use kiln_orchestrator::fleet::{
    InstanceStatus, InstanceView, MockFleet, MANAGED_BY, TAG_MANAGED_BY, TAG_NAMESPACE,
};
use kiln_orchestrator::queue::{MockQueue, QueuedJob};
use kiln_orchestrator::reconciler::{JobSignal, Reconciler};
use kiln_orchestrator::selector::default_allow_list;
use kiln_orchestrator::state::AppState;
use kiln_orchestrator::store::JobStore;
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::mpsc;
use tower::ServiceExt;

struct Surface {
    app: axum::Router,
    queue: Arc<MockQueue>,
    fleet: Arc<MockFleet>,
    reconciler: Arc<Reconciler>,
    signals: mpsc::Receiver<JobSignal>,
}

fn test_config(webhook_secret: Option<&str>) -> Config {
    Config {
        github_org: "acme".to_string(),
        github_token: String::new(),
        github_repo: None,
        github_api_base: "https://api.github.com".to_string(),
        github_base_url: "https://github.com".to_string(),
        fleet_api_base: None,
        fleet_api_token: None,
        machine_image: None,
        listen_addr: "127.0.0.1:0".to_string(),
        poll_interval: Duration::from_secs(30),
        sweep_interval: Duration::from_secs(300),
        max_concurrent_instances: 10,
        idle_timeout: Duration::from_secs(300),
        provision_timeout: Duration::from_secs(300),
        max_active_age: Duration::from_secs(7200),
        orphan_grace: Duration::ZERO,
        record_retention: Duration::from_secs(3600),
        call_timeout: Duration::from_secs(30),
        max_attempts: 3,
        default_instance_type: "t3.medium".to_string(),
        default_price_ceiling: 0.10,
        instance_types: default_allow_list(),
        runner_labels: vec!["self-hosted".to_string()],
        webhook_secret: webhook_secret.map(str::to_string),
        log_level: "info".to_string(),
        dev_mode: true,
    }
}

fn surface(webhook_secret: Option<&str>) -> Surface {
    let config = test_config(webhook_secret);
    let store = Arc::new(JobStore::new());
    let queue = Arc::new(MockQueue::new());
    let fleet = Arc::new(MockFleet::new());
    let reconciler = Arc::new(Reconciler::new(
        config.reconciler(),
        store.clone(),
        queue.clone(),
        fleet.clone(),
        config.selector(),
    ));
    let (signal_tx, signals) = mpsc::channel(8);
    let state = AppState::new(config, store, reconciler.clone(), signal_tx);
    Surface {
        app: api::create_router(state),
        queue,
        fleet,
        reconciler,
        signals,
    }
}

async fn get(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[tokio::test]
async fn test_health_reports_unhealthy_before_first_tick() {
    let s = surface(None);
    let (status, body) = get(&s.app, "/health").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["service"], "kiln-orchestrator");
}

#[tokio::test]
async fn test_health_turns_healthy_once_the_loop_ticks() {
    let s = surface(None);
    s.reconciler.reconcile_once().await;

    let (status, body) = get(&s.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body["last_tick_at"].is_string());
}

#[tokio::test]
async fn test_status_snapshot_shows_tracked_records() {
    let s = surface(None);
    s.queue.push_job(QueuedJob {
        id: 31,
        run_id: 7,
        repository: "acme/widgets".to_string(),
        labels: vec!["runs-on=J1".to_string(), "cpu=8".to_string()],
    });
    s.reconciler.reconcile_once().await;

    let (status, body) = get(&s.app, "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["namespace"], "acme");
    assert_eq!(body["phases"]["instance_active"], 1);

    let records = body["records"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["job_id"], 31);
    assert_eq!(records[0]["phase"], "instance_active");
    assert_eq!(records[0]["instance_type"], "t3.2xlarge");
    // The one-time credential never leaves the process.
    assert!(records[0].get("credential").is_none());
}

#[tokio::test]
async fn test_cleanup_returns_terminated_instances() {
    let s = surface(None);
    s.fleet.insert_instance(InstanceView {
        instance_id: "i-orphan".to_string(),
        status: InstanceStatus::Running,
        instance_type: "t3.medium".to_string(),
        tags: BTreeMap::from([
            (TAG_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
            (TAG_NAMESPACE.to_string(), "acme".to_string()),
        ]),
        launched_at: Utc::now() - Duration::from_secs(60),
    });

    let response = s
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/cleanup")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["terminated_instances"], serde_json::json!(["i-orphan"]));
    assert_eq!(s.fleet.live_count(), 0);
}

#[tokio::test]
async fn test_webhook_absent_without_secret() {
    let s = surface(None);
    let response = s
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_signed_workflow_job_event_feeds_the_loop() {
    let mut s = surface(Some("hook-secret"));
    let body = serde_json::to_vec(&serde_json::json!({
        "action": "queued",
        "workflow_job": {
            "id": 31,
            "run_id": 7,
            "labels": ["runs-on=J1", "cpu=8"]
        },
        "repository": {"full_name": "acme/widgets"}
    }))
    .unwrap();

    let response = s
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook")
                .header("x-github-event", "workflow_job")
                .header("x-hub-signature-256", sign(b"hook-secret", &body))
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let signal = s.signals.recv().await.unwrap();
    match signal {
        JobSignal::Queued(job) => {
            assert_eq!(job.id, 31);
            assert_eq!(job.repository, "acme/widgets");
        }
        other => panic!("unexpected signal {other:?}"),
    }
}

#[tokio::test]
async fn test_webhook_rejects_bad_signature() {
    let s = surface(Some("hook-secret"));
    let body = br#"{"action":"queued"}"#.to_vec();

    let response = s
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook")
                .header("x-github-event", "workflow_job")
                .header("x-hub-signature-256", sign(b"wrong-secret", &body))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()["content-type"],
        "application/problem+json"
    );
}

#[tokio::test]
async fn test_webhook_ignores_other_events() {
    let s = surface(Some("hook-secret"));
    let body = br#"{"zen":"Design for failure."}"#.to_vec();

    let response = s
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook")
                .header("x-github-event", "ping")
                .header("x-hub-signature-256", sign(b"hook-secret", &body))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
