//! Plain HTTP handlers: health, deployment status and variant health.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};

use crate::errors::app_error::{AppError, AppResult};
use crate::state::AppState;

/// Liveness probe.
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "voxgate",
    }))
}

/// Current policy deployment, bandit posture and feedback volume.
pub async fn deployment_status(State(state): State<Arc<AppState>>) -> AppResult<Json<Value>> {
    let status = state.deploy.status();
    let arms = state.deploy.arm_stats();
    let feedback = state.feedback.stats(0).await?;
    Ok(Json(json!({
        "deployment": status,
        "arms": arms,
        "feedback": {
            "total_events": feedback.total_events,
            "by_variant": feedback.by_variant,
            "latest_ts_hour": feedback.latest_ts_hour,
        },
        "outbox_pending": state.outbox.len(),
    })))
}

/// Health view of one policy variant.
pub async fn variant_health(
    State(state): State<Arc<AppState>>,
    Path(variant_id): Path<String>,
) -> AppResult<Json<Value>> {
    if state.catalog.get(&variant_id).is_none() {
        return Err(AppError::UnknownVariant(variant_id));
    }
    let health = state.deploy.variant_health(&variant_id);
    Ok(Json(json!({ "variant": health })))
}
