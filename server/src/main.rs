//! # Replay Server
//!
//! Binary entry point. Wires together the configuration, the backend pool
//! orchestrator, and the axum router with the two WebSocket paths (browser
//! proxy + replay) and the small REST surface, then serves until a
//! shutdown signal arrives.

mod api;
mod auth;
mod config;
mod gateway;
mod hub;
mod orchestrator;
mod proxy;
mod state;

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::Config;
use crate::orchestrator::{BackendOrchestrator, ProcessBackendLauncher};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "replay_server=info".into()),
        )
        .init();

    let config = Config::from_env();
    let state = AppState::new(config.clone());
    state.auth.log_auth_status();

    // Launch the backend browser pool and feed it to the proxy.
    let launcher = Arc::new(ProcessBackendLauncher::new(&config));
    let orchestrator = Arc::new(BackendOrchestrator::new(
        launcher,
        state.proxy.clone(),
        &config,
    ));
    orchestrator.start().await?;

    let app = Router::new()
        .route(&config.proxy_path, get(gateway::proxy_ws_handler))
        .route(&config.replay_path, get(gateway::replay_ws_handler))
        .route("/healthz", get(api::health))
        .route("/api/profiles", get(api::list_profiles))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Replay server listening on {}", addr);
    info!("Browser proxy endpoint: ws://{}{}", addr, config.proxy_path);
    info!("Replay endpoint: ws://{}{}", addr, config.replay_path);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(orchestrator))
        .await?;

    Ok(())
}

async fn shutdown_signal(orchestrator: Arc<BackendOrchestrator>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received, stopping backend servers...");
    orchestrator.shutdown();
}
