//! Callmesh Signaling Relay
//!
//! WebSocket relay that carries call lifecycle and peer negotiation events
//! between call members.
//!
//! # Servers
//!
//! - WebSocket server for clients (default: 0.0.0.0:8080, path `/ws`)
//! - HTTP server for health endpoints and `/metrics` (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing
//! 3. Initialize Prometheus metrics recorder
//! 4. Initialize actor system (`RelayControllerHandle`)
//! 5. Start health HTTP server
//! 6. Start WebSocket server and mark ready
//! 7. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use relay_service::actors::{ControllerSettings, RelayControllerHandle, RelayMetrics};
use relay_service::config::Config;
use relay_service::observability::{health_router, init_metrics_recorder, HealthState};
use relay_service::presence::PresenceRegistry;
use relay_service::ws::ws_router;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Time given to servers to finish in-flight work after cancellation.
const SERVER_DRAIN_DELAY: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration first: the log filter lives in it
    let config = Config::from_env().context("Failed to load configuration")?;

    let json_logs = config.observability.json_logs;
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_new(&config.observability.log_filter)
                .unwrap_or_else(|_| EnvFilter::new(common::config::DEFAULT_LOG_FILTER)),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    info!("Starting Signaling Relay");
    info!(
        relay_id = %config.relay_id,
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        max_calls = config.max_calls,
        max_participants_per_call = config.max_participants_per_call,
        disconnect_grace_period_seconds = config.disconnect_grace_period_seconds,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        anyhow::anyhow!(e)
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    let controller = RelayControllerHandle::new(
        ControllerSettings {
            relay_id: config.relay_id.clone(),
            max_calls: config.max_calls,
            max_participants_per_call: config.max_participants_per_call,
            disconnect_grace_period: config.disconnect_grace_period(),
        },
        PresenceRegistry::new(),
        RelayMetrics::new(),
    );
    info!("Actor system initialized");

    let shutdown_token = controller.child_token();

    // Health server: liveness, readiness and Prometheus scrape
    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listeners before spawning to fail fast on bind errors
    let health_addr = config.health_bind_address;
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .with_context(|| format!("Failed to bind health server to {health_addr}"))?;
    info!(addr = %health_addr, "Health server bound successfully");

    let ws_addr = config.bind_address;
    let ws_listener = tokio::net::TcpListener::bind(ws_addr)
        .await
        .with_context(|| format!("Failed to bind WebSocket server to {ws_addr}"))?;
    info!(addr = %ws_addr, "WebSocket server bound successfully");

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    let ws_app = ws_router(controller.clone()).layer(TraceLayer::new_for_http());
    let ws_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        let server = axum::serve(ws_listener, ws_app).with_graceful_shutdown(async move {
            ws_shutdown_token.cancelled().await;
            info!("WebSocket server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "WebSocket server failed");
        }
    });

    health_state.set_ready();
    info!("Signaling Relay running - press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown...");

    // Stop receiving traffic before tearing anything down
    health_state.set_not_ready();

    // Ends every call and closes every connection
    if let Err(e) = controller.shutdown().await {
        warn!(error = %e, "Actor system shutdown error");
    }

    shutdown_token.cancel();
    tokio::time::sleep(SERVER_DRAIN_DELAY).await;

    info!("Signaling Relay shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
