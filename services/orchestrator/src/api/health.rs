//! Liveness endpoint.
//!
//! Used by load balancers and process supervisors. It reports on the
//! process and the reconciliation loop only and never makes remote calls.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::AppState;
use crate::store::age;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "healthy" or "unhealthy".
    pub status: String,

    /// Service name.
    pub service: String,

    /// Service version.
    pub version: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,

    /// When the reconciliation loop last ticked.
    pub last_tick_at: Option<DateTime<Utc>>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

/// 200 while the reconciliation loop has ticked recently, 503 otherwise.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.reconciler().health_snapshot().await;
    let stale_after = state.config().poll_interval * 3;
    let alive = snapshot
        .last_tick_at
        .is_some_and(|at| age(at, Utc::now()) <= stale_after);

    let status = if alive {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        status: if alive { "healthy" } else { "unhealthy" }.to_string(),
        service: "kiln-orchestrator".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        last_tick_at: snapshot.last_tick_at,
    };
    (status, Json(body))
}
