//! HTTP contract tests for the fleet provider client.

use std::collections::BTreeMap;
use std::time::Duration;

use kiln_orchestrator::fleet::{Fleet, FleetError, HttpFleet, InstanceStatus, RequestInstance};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fleet(server: &MockServer) -> HttpFleet {
    HttpFleet::new(&server.uri(), Some("fleet-secret"), Duration::from_secs(5)).unwrap()
}

fn request() -> RequestInstance {
    RequestInstance {
        instance_type: "c5.2xlarge".to_string(),
        price_ceiling: 0.10,
        machine_image: Some("ami-runner-2026".to_string()),
        user_data: "IyEvYmluL2Jhc2g=".to_string(),
        tags: BTreeMap::from([
            ("managed-by".to_string(), "kiln".to_string()),
            ("job-id".to_string(), "31".to_string()),
        ]),
    }
}

#[tokio::test]
async fn test_request_instance_posts_full_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/instances"))
        .and(header("authorization", "Bearer fleet-secret"))
        .and(body_partial_json(json!({
            "instance_type": "c5.2xlarge",
            "price_ceiling": 0.10,
            "image": "ami-runner-2026",
            "tags": {"managed-by": "kiln", "job-id": "31"}
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "instance_id": "i-0abc123"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let id = fleet(&server).request_instance(&request()).await.unwrap();
    assert_eq!(id, "i-0abc123");
}

#[tokio::test]
async fn test_capacity_conflict_maps_to_insufficient_capacity() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/instances"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "code": "insufficient_capacity",
            "message": "no c5.2xlarge capacity in any zone"
        })))
        .mount(&server)
        .await;

    let err = fleet(&server).request_instance(&request()).await.unwrap_err();
    assert!(matches!(
        err,
        FleetError::InsufficientCapacity(msg) if msg.contains("c5.2xlarge")
    ));
}

#[tokio::test]
async fn test_price_conflict_maps_to_price_exceeded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/instances"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "code": "price_exceeded",
            "message": "spot floor is 0.12"
        })))
        .mount(&server)
        .await;

    let err = fleet(&server).request_instance(&request()).await.unwrap_err();
    assert!(matches!(err, FleetError::PriceExceeded(_)));
}

#[tokio::test]
async fn test_describe_unknown_instance_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/instances/i-gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let view = fleet(&server).describe_instance("i-gone").await.unwrap();
    assert!(view.is_none());
}

#[tokio::test]
async fn test_describe_running_instance() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/instances/i-0abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "instance_id": "i-0abc123",
            "status": "running",
            "instance_type": "c5.2xlarge",
            "tags": {"job-id": "31"},
            "launched_at": "2026-08-25T09:30:00Z"
        })))
        .mount(&server)
        .await;

    let view = fleet(&server).describe_instance("i-0abc123").await.unwrap().unwrap();
    assert_eq!(view.status, InstanceStatus::Running);
    assert_eq!(view.tag("job-id"), Some("31"));
}

#[tokio::test]
async fn test_terminate_unknown_instance_is_success() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v1/instances/i-gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    assert!(fleet(&server).terminate_instance("i-gone").await.is_ok());
}

#[tokio::test]
async fn test_terminate_is_repeatable() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/v1/instances/i-0abc123"))
        .respond_with(ResponseTemplate::new(202))
        .expect(2)
        .mount(&server)
        .await;

    let fleet = fleet(&server);
    assert!(fleet.terminate_instance("i-0abc123").await.is_ok());
    assert!(fleet.terminate_instance("i-0abc123").await.is_ok());
}

#[tokio::test]
async fn test_list_passes_tag_filters_as_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/instances"))
        .and(query_param("tag:managed-by", "kiln"))
        .and(query_param("tag:namespace", "acme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "instances": [
                {
                    "instance_id": "i-1",
                    "status": "running",
                    "instance_type": "t3.medium",
                    "tags": {"managed-by": "kiln", "namespace": "acme"},
                    "launched_at": "2026-08-25T09:30:00Z"
                }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let filter = BTreeMap::from([
        ("managed-by".to_string(), "kiln".to_string()),
        ("namespace".to_string(), "acme".to_string()),
    ]);
    let views = fleet(&server).list_instances(&filter).await.unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].instance_id, "i-1");
}

#[tokio::test]
async fn test_rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/instances"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
        .mount(&server)
        .await;

    let err = fleet(&server).request_instance(&request()).await.unwrap_err();
    assert!(matches!(
        err,
        FleetError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(7)
    ));
}
