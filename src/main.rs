// =============================================================================
// pricewire — Main Entry Point
// =============================================================================
//
// Live price feed ingestion, rolling indicator computation and subscriber
// fan-out, plus a tiered cache in front of rate-limited data providers.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broadcast;
mod cache;
mod error;
mod indicators;
mod market_data;
mod runtime_config;
mod types;
mod upstream;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::runtime_config::RuntimeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        pricewire — Starting Up                           ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = RuntimeConfig::from_env();
    info!(
        symbols = ?config.symbols,
        history_capacity = config.history_capacity,
        broadcast_interval_secs = config.broadcast_interval_secs,
        "Configured symbols"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config).context("failed to build application state")?);

    // ── 3. Cold-start history ────────────────────────────────────────────
    if state.config.seed_on_start {
        let seeded = state.seed_history().await;
        info!(seeded, "Price history seeding finished");
    }

    // ── 4. Live feeds ────────────────────────────────────────────────────
    let feeds = state.start_feeds();
    info!(count = feeds, "Market data feeds launched");

    // ── 5. Background loops (indicator broadcast, cache maintenance) ────
    let background = state.spawn_background();

    // ── 6. Start the API server ──────────────────────────────────────────
    let bind_addr = state.config.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    let server_token = state.shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_token.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    state.shutdown().await;
    for handle in background {
        if let Err(e) = handle.await {
            error!(error = %e, "background task panicked");
        }
    }
    if let Err(e) = server.await {
        error!(error = %e, "API server task panicked");
    }

    info!("pricewire shut down complete.");
    Ok(())
}
