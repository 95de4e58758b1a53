use std::sync::Arc;

use anyhow::{Context, Result};
use rollcall_embed::{Embedder, EmbeddingClient, SyntheticEmbedder};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod day;
mod error;
mod pipeline;
mod reports;
mod store;

use config::Config;
use pipeline::ScanSettings;
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        bind = %config.bind_addr,
        db = %config.db_path.display(),
        test_mode = config.test_mode,
        threshold = config.similarity_threshold,
        "rollcalld starting"
    );

    let store = Store::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database at {}", config.db_path.display()))?;

    let embedder: Arc<dyn Embedder> = if config.test_mode {
        tracing::warn!("test mode: using synthetic embeddings, face service is not contacted");
        Arc::new(SyntheticEmbedder::default())
    } else {
        Arc::new(EmbeddingClient::new(config.client_config()))
    };

    // Warm the face service without holding up startup.
    let probe = embedder.clone();
    tokio::spawn(async move {
        let healthy = probe.is_healthy().await;
        tracing::info!(healthy, "face service warm-up probe finished");
    });

    let settings = ScanSettings {
        similarity_threshold: config.similarity_threshold,
        min_variance: config.min_image_variance,
        canonical_size: config.canonical_size,
    };
    let state = api::AppState::new(store, embedder, settings);
    let app = api::router(Arc::new(state));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "rollcalld ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await
        .context("HTTP server failed")?;

    tracing::info!("rollcalld shutting down");
    Ok(())
}
