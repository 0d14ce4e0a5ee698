//! HTTP control surface and routing.

pub mod error;
mod health;
mod status;
mod webhook;

use axum::{
    http::{header, Method},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Create the control-surface router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(Any);

    let mut router = Router::new().merge(health::routes()).merge(status::routes());

    // The webhook ingress only exists when a secret is configured.
    if state.webhook_secret().is_some() {
        router = router.merge(webhook::routes());
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
