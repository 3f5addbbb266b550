use std::sync::Arc;

use axum::{routing::get, Router};

use crate::handlers;
use crate::state::AppState;

/// HTTP API routes: health, status and per-variant health.
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(handlers::api::health_check))
        .route("/status", get(handlers::api::deployment_status))
        .route("/variants/{variant_id}", get(handlers::api::variant_health))
}
