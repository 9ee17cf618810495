//! Concierge - conversation orchestration for a document search assistant
//!
//! Sits between a chat transport and a search/indexing backend: per-user
//! conversation state, rate limiting, and tracking of long-running backend
//! jobs with completion notifications.

mod api;
mod auth;
mod backend;
mod clock;
mod config;
mod error;
mod jobs;
mod locks;
mod notify;
mod orchestrator;
mod rate_limit;
mod reply;
mod session;
mod state_machine;
mod store;
mod wire;

use api::{create_router, AppState};
use backend::HttpBackendClient;
use clock::{Clock, SystemClock};
use config::Config;
use notify::Outbox;
use orchestrator::Orchestrator;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use store::{KvStore, MemoryStore, SqliteStore};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "concierge=info,tower_http=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store: Arc<dyn KvStore> = match &config.db_path {
        Some(db_path) => {
            if let Some(parent) = PathBuf::from(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            tracing::info!(path = %db_path, "Opening database");
            Arc::new(SqliteStore::open(db_path, clock.clone())?)
        }
        None => {
            tracing::warn!("CONCIERGE_DB_PATH not set, sessions and jobs live in memory only");
            Arc::new(MemoryStore::new(clock.clone()))
        }
    };

    let backend = Arc::new(HttpBackendClient::new(config.backend.clone())?);
    tracing::info!(base_url = %config.backend.base_url, "Backend client initialized");

    let outbox = Arc::new(Outbox::new());
    let orchestrator = Arc::new(Orchestrator::new(
        &config,
        store,
        backend,
        outbox.clone(),
        clock,
    ));

    // Job poller
    let cancel = CancellationToken::new();
    let poller = tokio::spawn(orchestrator.clone().run_job_poller(cancel.clone()));

    // Create router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(AppState::new(orchestrator, outbox))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Concierge listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    poller.await?;
    tracing::info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
