//! Server setup and initialization
//!
//! Wires together all components: store, lock service, processor and HTTP routes.
//! The host supplies the flow pack; everything else comes from [`Config`].

use crate::{
    api::{create_flow_routes, AppState},
    config::Config,
    flow::FlowPack,
    runtime::{FlowProcessor, LockService, SqliteLockService},
    store::{FlowStore, SqliteFlowStore},
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber, filtered by `RUST_LOG` (default `info`)
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .try_init();
}

/// Build a processor backed by the configured SQLite database
///
/// Store and lock table share one pool, so every processor pointed at the same
/// file coordinates through the same lock rows.
pub async fn create_processor(config: &Config, pack: Arc<FlowPack>) -> Result<FlowProcessor> {
    tracing::info!("📋 Opening flow store at {}", config.database.url);
    let store = SqliteFlowStore::connect(&config.database.url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open flow store: {}", e))?;

    tracing::info!("🔒 Initializing lock table (lease {:?})", config.database.lock_lease);
    let locks = SqliteLockService::new(store.pool().clone(), config.database.lock_lease);
    locks.init_schema().await?;

    let store: Arc<dyn FlowStore> = Arc::new(store);
    let locks: Arc<dyn LockService> = Arc::new(locks);
    Ok(FlowProcessor::new(pack, store, locks, config.processor.clone()))
}

/// Create the main Axum application around a processor
pub fn create_app(processor: FlowProcessor) -> Router {
    tracing::info!("📡 Creating HTTP router with all endpoints");
    Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        // Flow and run API routes
        .merge(create_flow_routes().with_state(AppState { processor }))
}

/// Start the scheduler and the HTTP server with the given configuration
///
/// Ctrl-C stops accepting requests, then stops the scheduler and drains
/// in-flight tasks before returning.
pub async fn start_server(config: Config, pack: Arc<FlowPack>) -> Result<()> {
    tracing::info!("Starting flowmill server...");

    let processor = create_processor(&config, pack).await?;
    let scheduler = processor.spawn();
    let app = create_app(processor);

    // Bind to the configured address
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let drained = scheduler.shutdown().await?;
    for error in &drained.errors {
        tracing::error!("❌ In-flight task ended with error during shutdown: {}", error);
    }
    tracing::info!("👋 Server stopped ({} tasks drained)", drained.joined);

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("🛑 Shutdown requested");
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
