use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::{Context, Result};
use oceano_core::{DecodeLimits, EmbeddingExtractor, ModelConfig, ModelResource};
use oceano_index::{IndexConfig, QdrantIndex, VectorIndex};
use oceano_ingest::Ledger;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod admission;
mod config;
mod routes;
mod search;
mod shutdown;
mod state;

use admission::SearchAdmission;
use config::Config;
use search::{SearchPipeline, SearchSettings};
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    tracing::info!(listen = %config.listen, "oceanod starting");

    let model_config = ModelConfig::from_env();
    tracing::info!(pack = %model_config.pack_dir().display(), det_size = ?model_config.det_size, "face model configured");
    let resource = Arc::new(ModelResource::new(model_config));
    let preload = {
        let resource = resource.clone();
        tokio::task::spawn_blocking(move || resource.preload()).await?
    };
    match preload {
        Ok(elapsed) => tracing::info!(load_ms = elapsed.as_millis() as u64, "face model preloaded"),
        Err(e) => tracing::error!(error = %e, "face model preload failed; retrying on first request"),
    }

    let index: Arc<dyn VectorIndex> = Arc::new(QdrantIndex::new(IndexConfig::from_env())?);

    let ledger = if config.ledger_db.exists() {
        match Ledger::open(&config.ledger_db).await {
            Ok(ledger) => Some(ledger),
            Err(e) => {
                tracing::warn!(path = %config.ledger_db.display(), error = %e, "ledger unavailable, /status will omit it");
                None
            }
        }
    } else {
        None
    };

    let pipeline = SearchPipeline::new(
        EmbeddingExtractor::new(resource.clone()),
        index.clone(),
        SearchAdmission::new(config.model_concurrency),
        SearchSettings::from(&config),
    )
    .with_decode_limits(DecodeLimits::from_env());

    let state = Arc::new(AppState::new(
        pipeline,
        index.clone(),
        resource,
        ledger,
        config.request_timeout,
        config.model_failure_limit,
    ));

    match index.count().await {
        Ok(vectors) => {
            state.set_index_healthy(true);
            tracing::info!(collection = index.collection(), vectors, "index reachable");
        }
        Err(e) => tracing::error!(collection = index.collection(), error = %e, "index unreachable"),
    }

    let app = routes::build_router(state.clone(), &config.thumbs_dir);
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("cannot bind {}", config.listen))?;

    let readiness = state.readiness();
    tracing::info!(
        ready = readiness.ready,
        model_loaded = readiness.model_loaded,
        qdrant_healthy = readiness.qdrant_healthy,
        "oceanod listening"
    );

    let (signalled_tx, signalled_rx) = watch::channel(false);
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown::shutdown_signal(state, signalled_tx))
        .into_future();
    let drain = shutdown::drain_with_deadline(server, signalled_rx, config.shutdown_grace).await?;

    tracing::info!(?drain, "oceanod stopped");
    Ok(())
}
