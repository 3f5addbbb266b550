use axum::{routing::get, Router};
use tokio::net::TcpListener;

use anyhow::anyhow;

use voxgate::{routes, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Load configuration
    let config = ServerConfig::from_env().map_err(|e| anyhow!(e))?;
    let address = config.address();
    println!("Starting voxgate on {address}");

    // Create application state (policy gate, stores, recorder, auth)
    let app_state = voxgate::AppState::new(config)
        .await
        .map_err(|e| anyhow!(e))?;

    // Public health route + API routes + WebSocket call endpoint
    let public_routes =
        Router::new().route("/", get(voxgate::handlers::api::health_check));
    let app = public_routes
        .merge(routes::api::create_api_router())
        .merge(routes::ws::create_ws_router())
        .with_state(app_state.clone());

    let listener = TcpListener::bind(&address).await?;
    println!("voxgate listening on {address}");

    // Serve until interrupted, then flush pending policy state
    let shutdown_state = app_state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            println!("shutting down");
        })
        .await?;

    shutdown_state.shutdown().await;

    Ok(())
}
