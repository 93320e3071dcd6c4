//! HTTP surface of the sync server.
//!
//! # Endpoints
//!
//! - `GET /health`: Health check endpoint (no auth required)
//! - `GET /sync`: WebSocket upgrade; the client authenticates in-band with `AUTH`

pub mod ws;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::auth::TokenStore;
use crate::bus::RelayBus;
use crate::config::ServerConfig;
use crate::db::{self, DeltaStore, DeviceRegistry, OfflineQueue};
use crate::error::StoreError;
use crate::sync::{SyncEngine, SyncSession};
use ws::WsTransport;

/// How often inactive devices and delivered queue entries are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Delivered queue entries are kept this long before purging.
const DELIVERED_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Failed to bind {0}: {1}")]
    Bind(SocketAddr, std::io::Error),
    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Application state shared across handlers
#[derive(Clone)]
struct AppState {
    engine: Arc<SyncEngine>,
}

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    instance_id: String,
}

/// Health check endpoint (no auth required)
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        instance_id: state.engine.instance_id().to_string(),
    })
}

async fn sync_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| async move {
        let outcome = SyncSession::new(state.engine, WsTransport::new(socket))
            .run()
            .await;
        tracing::debug!(
            last_sent = outcome.last_sent,
            error = ?outcome.error,
            "session finished"
        );
    })
}

pub fn router(engine: Arc<SyncEngine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sync", get(sync_socket))
        .with_state(AppState { engine })
        .layer(TraceLayer::new_for_http())
}

/// Serves `engine` on `listener` until `shutdown` resolves.
pub async fn run<F>(listener: TcpListener, engine: Arc<SyncEngine>, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Opens storage, starts the relay and the sweeper, and serves until ctrl-c.
pub async fn serve(config: ServerConfig) -> Result<(), ServerError> {
    let database_path = config.database_path();
    tracing::info!("Database: {}", database_path.display());
    tracing::info!("Token file: {}", config.tokens_path().display());
    tracing::info!("Instance: {}", config.instance_id);

    let pool = db::init_db(&database_path).await?;

    let registry = DeviceRegistry::new(pool.clone()).with_lease(config.device_lease());
    let released = registry.release_instance(&config.instance_id).await?;
    if released > 0 {
        tracing::info!("Released {} stale device connection(s)", released);
    }

    let auth = Arc::new(TokenStore::load(&config.tokens_path()));
    let store = DeltaStore::new(pool.clone(), config.instance_id.clone(), config.page_size);
    let bus = Arc::new(
        RelayBus::start(store, config.bus_capacity, config.relay_poll_interval()).await?,
    );

    let engine = Arc::new(SyncEngine::from_config(
        pool.clone(),
        &config,
        bus.clone(),
        auth,
    ));

    let sweeper = tokio::spawn(sweep_loop(
        registry,
        OfflineQueue::new(pool),
        config.inactive_after_days,
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::Bind(addr, e))?;
    tracing::info!("Starting server on {}", addr);

    let result = run(listener, engine, shutdown_signal()).await;

    sweeper.abort();
    tracing::info!("Server stopped");
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

async fn sweep_loop(registry: DeviceRegistry, queue: OfflineQueue, inactive_after_days: i64) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let now = Utc::now();

        match registry.release_expired().await {
            Ok(0) => {}
            Ok(n) => tracing::info!("Released {} device(s) with a lapsed lease", n),
            Err(e) => tracing::warn!("Lease sweep failed: {}", e),
        }

        match registry
            .mark_inactive(now - chrono::Duration::days(inactive_after_days))
            .await
        {
            Ok(0) => {}
            Ok(n) => tracing::info!("Marked {} device(s) inactive", n),
            Err(e) => tracing::warn!("Inactive device sweep failed: {}", e),
        }

        match queue
            .purge_delivered(now - chrono::Duration::days(DELIVERED_RETENTION_DAYS))
            .await
        {
            Ok(0) => {}
            Ok(n) => tracing::debug!("Purged {} delivered queue entries", n),
            Err(e) => tracing::warn!("Offline queue purge failed: {}", e),
        }
    }
}
