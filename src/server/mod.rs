//! HTTP front-end: router assembly and the serve loop.

pub mod api;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::campaign::CampaignService;
use crate::config::{DatabaseSection, ServiceConfig};
use crate::db::{Db, DbHandle};
use crate::pipeline::{PipelineRunner, RunQueryService};

use api::AppState;

/// Build the full application router.
pub fn build_router(state: Arc<AppState>, dev_mode: bool) -> Router {
    let mut app = api::api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Open the store at the configured path, creating its directory.
pub fn open_database(config: &DatabaseSection) -> Result<Db> {
    if let Some(parent) = config.path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    Db::new(&config.path)
        .with_context(|| format!("Failed to open database at {}", config.path.display()))
}

/// Assemble the services described by `config`.
pub fn build_state(db: DbHandle, config: &ServiceConfig) -> Result<AppState> {
    let runner = PipelineRunner::new(
        db.clone(),
        config.pipeline.clone(),
        config.callback_base_url(),
    );
    Ok(AppState {
        runner: Arc::new(runner),
        runs: RunQueryService::new(db.clone(), &config.pipeline),
        campaigns: CampaignService::from_config(db, config)?,
    })
}

/// Start the service and block until Ctrl+C.
pub async fn start_server(config: ServiceConfig) -> Result<()> {
    let db = DbHandle::new(open_database(&config.database)?);
    let state = Arc::new(build_state(db, &config)?);

    match state.runner.recover_orphans().await {
        Ok(0) => {}
        Ok(n) => warn!(count = n, "Marked orphaned pipeline runs as failed"),
        Err(e) => warn!("Orphaned run recovery failed: {:#}", e),
    }
    if let Err(e) = state.campaigns.queue().resume_unfinished().await {
        warn!("Failed to resume unfinished campaigns: {:#}", e);
    }

    let app = build_router(state, config.server.dev_mode);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "placescout listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
