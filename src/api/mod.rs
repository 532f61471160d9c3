//! HTTP API layer

mod error;
pub mod handlers;

use axum::{
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::config::Settings;
use crate::db::activity::SqliteActivityLog;
use crate::db::instances::InstanceStore;
use crate::db::settings::ReannounceSettingsStore;
use crate::db::Database;
use crate::pool::ClientPool;
use crate::reannounce::ReannounceController;
use crate::stream::StreamManager;
use crate::sync::SyncManager;

pub use error::AppError;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub instances: InstanceStore,
    pub reannounce_settings: ReannounceSettingsStore,
    pub activity: SqliteActivityLog,
    pub pool: Arc<ClientPool>,
    pub sync: Arc<SyncManager>,
    pub streams: Arc<StreamManager>,
    pub reannounce: Arc<ReannounceController>,
}

impl AppState {
    pub fn new(db: Database, settings: Settings, shutdown: watch::Receiver<bool>) -> Self {
        let instances = InstanceStore::new(db.clone());
        let reannounce_settings = ReannounceSettingsStore::new(db.clone());
        let activity = SqliteActivityLog::new(db);

        let pool = ClientPool::new(instances.clone(), settings.pool.clone(), shutdown.clone());
        let sync = SyncManager::new(
            pool.clone(),
            instances.clone(),
            settings.sync.clone(),
            shutdown.clone(),
        );
        let streams = StreamManager::new(
            sync.clone(),
            Duration::from_secs(settings.stream.heartbeat_secs),
            shutdown.clone(),
        );
        let reannounce = ReannounceController::new(
            pool.clone(),
            sync.clone(),
            reannounce_settings.clone(),
            Arc::new(activity.clone()),
            shutdown,
        );

        Self {
            settings,
            instances,
            reannounce_settings,
            activity,
            pool,
            sync,
            streams,
            reannounce,
        }
    }

    /// Spawn the background loops (health probes, sync timers, stream
    /// fan-out, reannounce scans)
    pub fn start_background(&self) {
        self.pool.start();
        self.sync.start();
        self.streams.start();
        self.reannounce.start();
    }
}

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Health check
        .route("/health", get(handlers::health))

        // Instances
        .route("/instances", get(handlers::instances::list).post(handlers::instances::create))
        .route("/instances/{id}", get(handlers::instances::get_one).put(handlers::instances::update).delete(handlers::instances::remove))
        .route("/instances/{id}/activity", get(handlers::instances::activity))
        .route("/instances/{id}/reannounce-settings", get(handlers::instances::reannounce_settings).put(handlers::instances::put_reannounce_settings))

        // Torrents
        .route("/instances/{id}/torrents", get(handlers::torrents::list).post(handlers::torrents::add))
        .route("/instances/{id}/torrents/bulk", post(handlers::torrents::bulk))
        .route("/instances/{id}/torrents/{hash}/files", get(handlers::torrents::files))
        .route("/instances/{id}/torrents/{hash}/trackers", get(handlers::torrents::trackers))
        .route("/instances/{id}/counts", get(handlers::torrents::counts))
        .route("/instances/{id}/duplicates", get(handlers::torrents::duplicates))
        .route("/instances/{id}/rules/test", post(handlers::torrents::test_rule))

        // Pass-through with indexing side-effects
        .route("/instances/{id}/categories", get(handlers::torrents::categories).post(handlers::torrents::create_category).put(handlers::torrents::edit_category).delete(handlers::torrents::remove_categories))
        .route("/instances/{id}/tags", get(handlers::torrents::tags).post(handlers::torrents::create_tags).delete(handlers::torrents::delete_tags))
        .route("/instances/{id}/preferences", get(handlers::torrents::preferences).put(handlers::torrents::set_preferences))

        // Real-time updates
        .route("/stream", get(handlers::stream::stream))

        // Transparent qBittorrent proxy; reannounce is intercepted for
        // monitored instances
        .route("/v2/{*path}", any(handlers::proxy::proxy));

    Router::new()
        .nest("/api", api_routes)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
}
