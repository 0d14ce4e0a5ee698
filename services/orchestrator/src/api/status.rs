//! Operator-facing status snapshot and manual cleanup.

use std::collections::BTreeMap;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::reconciler::LoopHealth;
use crate::state::AppState;
use crate::store::JobRecord;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub service: String,
    pub namespace: String,
    pub started_at: DateTime<Utc>,
    pub loop_health: LoopHealth,
    pub phases: BTreeMap<&'static str, usize>,
    pub records: Vec<JobRecord>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/cleanup", post(cleanup))
}

/// Everything the loop knows: client health, phase counts, and every
/// tracked record. Terminal records stay visible until purged.
async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        service: "kiln-orchestrator".to_string(),
        namespace: state.config().github_org.clone(),
        started_at: state.started_at(),
        loop_health: state.reconciler().health_snapshot().await,
        phases: state.store().phase_counts().await,
        records: state.store().list().await,
    })
}

/// Force a sweep outside the schedule. Safe to call while the periodic
/// sweep runs; both go through the same checked transitions.
async fn cleanup(State(state): State<AppState>) -> impl IntoResponse {
    info!("Manual cleanup requested");
    Json(state.reconciler().sweep().await)
}
