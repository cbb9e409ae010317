//! Fleetlink Gateway Binary
//!
//! Serves remote host administration over HTTP, backed by a shared pool of
//! SSH sessions.

use anyhow::{Context, Result};
use fleetlink::Gateway;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod auth;
mod config;
mod problem;
mod routes;

use auth::TokenVerifier;
use config::GatewayConfig;
use routes::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = GatewayConfig::from_env().context("Invalid configuration")?;
    info!("Starting Fleetlink gateway");

    let gateway = Arc::new(Gateway::new(config.options.clone()));
    gateway.start();

    let state = AppState {
        gateway: gateway.clone(),
        verifier: TokenVerifier::new(config.jwt_key.clone(), config.jwt_audience.clone()),
    };

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("Listening on {}", config.listen_addr);

    let served = axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    gateway.shutdown().await;
    served.context("Server error")?;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown requested");
}
