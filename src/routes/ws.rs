use std::sync::Arc;

use axum::{routing::any, Router};

use crate::handlers;
use crate::state::AppState;

/// WebSocket routes: one call per connection.
pub fn create_ws_router() -> Router<Arc<AppState>> {
    Router::new().route("/ws/call", any(handlers::ws::ws_call_handler))
}
