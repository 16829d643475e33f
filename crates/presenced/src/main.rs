use anyhow::{Context, Result};
use presence_core::{FaceMatcher, MatcherConfig, OnnxModelLoader, Orchestrator};
use presence_hw::V4lCamera;
use presence_store::SqliteStore;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod api;
mod auth;
mod config;
mod error;
mod reference;

use api::AppState;
use auth::JwtVerifier;
use config::Config;
use reference::HttpReferenceSource;

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Ok(path) = dotenv {
        tracing::debug!(path = %path.display(), "loaded environment file");
    }

    let config = Config::from_env()?;

    tracing::info!(
        bind = %config.bind_addr,
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        camera = %config.camera_device,
        threshold = config.match_threshold,
        "presenced starting"
    );

    if let Some(parent) = config.db_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = Arc::new(SqliteStore::open(&config.db_path).await?);

    let matcher = Arc::new(FaceMatcher::new(
        Arc::new(OnnxModelLoader::new(&config.model_dir)),
        Arc::new(V4lCamera::new(
            config.camera_device.clone(),
            config.warmup_frames,
        )),
        Arc::new(HttpReferenceSource::new()?),
        MatcherConfig {
            threshold: config.match_threshold,
            frame_attempts: config.frame_attempts,
        },
    ));

    let mut orchestrator = Orchestrator::new(store, matcher.clone());
    if config.verify_timeout_secs > 0 {
        orchestrator =
            orchestrator.with_verify_timeout(Duration::from_secs(config.verify_timeout_secs));
    }

    let state = Arc::new(AppState {
        orchestrator,
        jwt: JwtVerifier::new(&config.jwt_secret),
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "presenced ready");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal(matcher))
        .await?;

    tracing::info!("presenced stopped");
    Ok(())
}

/// Wait for Ctrl-C, then release the camera if an attempt is in flight.
async fn shutdown_signal(matcher: Arc<FaceMatcher>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("presenced shutting down");
    matcher.stop();
}
