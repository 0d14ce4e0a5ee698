//! GitHub webhook ingress.
//!
//! Push events are a fast-path hint; the poll and the sweep remain the
//! correctness backstop. The signature is checked before the body is
//! parsed at all.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::api::error::ApiError;
use crate::queue::QueuedJob;
use crate::reconciler::JobSignal;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/webhook", post(webhook))
}

async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let Some(secret) = state.webhook_secret() else {
        // Unreachable through the router; the route is only mounted when
        // a secret is configured.
        return Err(ApiError::internal("webhook_unconfigured", "no webhook secret"));
    };
    verify_signature(secret.as_bytes(), &headers, &body)?;

    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if event != "workflow_job" {
        debug!(event, "Ignoring webhook event");
        return Ok(StatusCode::OK);
    }

    let payload: WorkflowJobEvent = serde_json::from_slice(&body)
        .map_err(|err| ApiError::bad_request("malformed_payload", err.to_string()))?;

    let signal = match payload.action.as_str() {
        "queued" => {
            let repository = payload
                .repository
                .ok_or_else(|| ApiError::bad_request("malformed_payload", "repository missing"))?;
            JobSignal::Queued(QueuedJob {
                id: payload.workflow_job.id,
                run_id: payload.workflow_job.run_id,
                repository: repository.full_name,
                labels: payload.workflow_job.labels,
            })
        }
        "completed" | "cancelled" => JobSignal::Completed {
            job_id: payload.workflow_job.id,
        },
        other => {
            debug!(action = other, "Ignoring workflow_job action");
            return Ok(StatusCode::OK);
        }
    };

    if let Err(err) = state.signals().try_send(signal) {
        // The poll will pick the job up anyway; a full channel only
        // delays it.
        warn!(error = %err, "Dropping webhook signal");
    }
    Ok(StatusCode::ACCEPTED)
}

/// Constant-time HMAC-SHA-256 check of `X-Hub-Signature-256`.
fn verify_signature(secret: &[u8], headers: &HeaderMap, body: &[u8]) -> Result<(), ApiError> {
    let header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ApiError::unauthorized("missing_signature", "X-Hub-Signature-256 required")
        })?;
    let hex_digest = header
        .strip_prefix("sha256=")
        .ok_or_else(|| ApiError::unauthorized("invalid_signature", "unexpected signature format"))?;
    let digest = hex::decode(hex_digest)
        .map_err(|_| ApiError::unauthorized("invalid_signature", "signature is not hex"))?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|_| ApiError::internal("webhook_secret", "unusable webhook secret"))?;
    mac.update(body);
    mac.verify_slice(&digest)
        .map_err(|_| ApiError::unauthorized("invalid_signature", "signature mismatch"))
}

#[derive(Debug, Deserialize)]
struct WorkflowJobEvent {
    action: String,
    workflow_job: WorkflowJobPayload,
    repository: Option<RepositoryPayload>,
}

#[derive(Debug, Deserialize)]
struct WorkflowJobPayload {
    id: u64,
    run_id: u64,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RepositoryPayload {
    full_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &[u8], body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn headers_with(signature: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature-256", signature.parse().unwrap());
        headers
    }

    #[test]
    fn test_valid_signature_accepted() {
        let secret = b"hook-secret";
        let body = br#"{"action":"queued"}"#;
        let headers = headers_with(&sign(secret, body));

        assert!(verify_signature(secret, &headers, body).is_ok());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = br#"{"action":"queued"}"#;
        let headers = headers_with(&sign(b"other-secret", body));

        let err = verify_signature(b"hook-secret", &headers, body).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_tampered_body_rejected() {
        let secret = b"hook-secret";
        let headers = headers_with(&sign(secret, br#"{"action":"queued"}"#));

        let err = verify_signature(secret, &headers, br#"{"action":"completed"}"#).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_missing_header_rejected() {
        let err = verify_signature(b"hook-secret", &HeaderMap::new(), b"{}").unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_workflow_job_event_deserializes() {
        let json = r#"{
            "action": "queued",
            "workflow_job": {
                "id": 31,
                "run_id": 7,
                "labels": ["runs-on=J1", "cpu=8"],
                "status": "queued"
            },
            "repository": {"full_name": "acme/widgets"}
        }"#;

        let event: WorkflowJobEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.action, "queued");
        assert_eq!(event.workflow_job.id, 31);
        assert_eq!(event.repository.unwrap().full_name, "acme/widgets");
    }
}
