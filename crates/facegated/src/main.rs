use anyhow::{Context, Result};
use facegate_core::{ArcFaceEmbedder, EmbeddingExtractor, IdentityStore, ScrfdDetector};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod attempts;
mod config;
mod http;
mod notify;
mod service;

use attempts::AttemptLog;
use config::Config;
use service::AccessService;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("facegated starting");

    let config = Config::from_env();

    // Fail fast: no models, no service.
    let scrfd_path = config.scrfd_model_path();
    let detector = ScrfdDetector::load(&scrfd_path)
        .with_context(|| format!("loading SCRFD detector from {}", scrfd_path.display()))?;
    tracing::info!(path = %scrfd_path.display(), "SCRFD detector loaded");

    let arcface_path = config.arcface_model_path();
    let embedder = ArcFaceEmbedder::load(&arcface_path)
        .with_context(|| format!("loading ArcFace recognizer from {}", arcface_path.display()))?;
    tracing::info!(path = %arcface_path.display(), "ArcFace recognizer loaded");

    let extractor = Arc::new(
        EmbeddingExtractor::new(Arc::new(detector), Arc::new(embedder))
            .with_confidence_floor(config.detection_confidence),
    );
    tracing::info!(
        confidence_floor = extractor.confidence_floor(),
        "embedding extractor ready"
    );

    let store = IdentityStore::open(&config.known_dir, Arc::clone(&extractor))
        .with_context(|| format!("loading known faces from {}", config.known_dir.display()))?;
    tracing::info!(
        dir = %store.dir().display(),
        known = store.snapshot().len(),
        "known faces loaded"
    );

    let attempts = AttemptLog::open(&config.log_dir)
        .with_context(|| format!("creating attempt log directory {}", config.log_dir.display()))?;
    tracing::info!(dir = %attempts.dir().display(), "attempt log ready");
    let notifier = notify::notifier_from_config(&config.notify);

    let service = Arc::new(AccessService::new(
        Arc::new(store),
        extractor,
        attempts,
        notifier,
        config.matching,
    ));
    let app = http::router(service, config.max_upload_bytes);

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!(
        addr = %config.bind,
        metric = %config.matching.metric,
        "facegated ready"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("facegated shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
