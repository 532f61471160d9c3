//! Armada - a multi-instance management and aggregation proxy for qBittorrent
//!
//! Armada fronts any number of qBittorrent instances behind one HTTP+SSE
//! surface: cached torrent views with derived indexes, coalesced real-time
//! streams, a rule engine, and a reannounce controller that watches stalled
//! torrents.

use anyhow::Result;
use tracing::info;

mod api;
mod config;
mod db;
mod pool;
mod qbit;
mod reannounce;
mod rules;
mod stream;
mod sync;
mod utils;

use api::AppState;
use config::Settings;
use db::Database;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "armada=info,tower_http=info".into()),
        )
        .init();

    info!("Starting Armada v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!("Configuration loaded from {:?}", settings.config_path());

    // Initialize database
    let db = Database::open(&settings.database)?;
    db.migrate()?;
    info!("Database initialized at {:?}", settings.database.path);

    // Create application state and start the background loops
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let state = AppState::new(db, settings.clone(), shutdown_rx);
    state.start_background();

    // Build router
    let app = api::create_router(state.clone());

    // Start server
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
            let _ = shutdown_tx.send(true);
            // Give stream subscribers their final event before the
            // listener closes.
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        })
        .await?;

    Ok(())
}
