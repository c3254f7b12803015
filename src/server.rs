//! Server assembly: wiring, background tasks, graceful shutdown.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tower_http::cors::CorsLayer;

use crate::api::{api_router, AppState};
use crate::config::IdeaworksConfig;
use crate::events::EventHub;
use crate::generate::{Dispatcher, HttpGenerator};
use crate::reconcile::poll::{HttpRecordFetcher, Poller};
use crate::reconcile::Reconciler;
use crate::store::{DbHandle, StudioDb};
use crate::sweeper::Sweeper;

pub async fn start_server(config: IdeaworksConfig) -> Result<()> {
    let db = DbHandle::new(
        StudioDb::new(Path::new(&config.server.db_path))
            .with_context(|| format!("Failed to open database at {}", config.server.db_path))?,
    );
    let hub = Arc::new(EventHub::new());

    let transport = Arc::new(HttpGenerator::new(&config.generator)?);
    let dispatcher = Arc::new(Dispatcher::new(db.clone(), hub.clone(), transport));
    let reconciler = Arc::new(Reconciler::new(db.clone(), hub.clone()));
    let fetcher = Arc::new(HttpRecordFetcher::new(&config.records)?);
    let poller = Arc::new(Poller::new(
        db.clone(),
        fetcher,
        Reconciler::new(db.clone(), hub.clone()),
        config.reconcile.poll_dwell_secs,
    ));

    let sweeper = Sweeper::new(
        db.clone(),
        hub.clone(),
        &config.sweeper,
        config.reconcile.generation_timeout_secs,
    );
    let sweep_handle = sweeper.spawn();

    if config.webhook.secret.is_none() && config.webhook.basic_user.is_none() {
        tracing::warn!("No webhook credentials configured; webhook ingestion will reject everything");
    }

    let state = AppState {
        db,
        hub,
        dispatcher,
        poller,
        reconciler,
        webhook: config.webhook.clone(),
    };
    // Permissive CORS suits the local single-box deployment this serves;
    // anything public-facing terminates TLS and policy in front of it.
    let app = api_router(state).layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(%addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sweep_handle.abort();
    tracing::info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install shutdown handler");
    }
}
