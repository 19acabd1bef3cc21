use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use oceano_core::{DecodeLimits, EmbeddingExtractor, ModelConfig, ModelResource};
use oceano_index::{IndexConfig, QdrantIndex, VectorIndex};
use oceano_ingest::{AuditLog, IngestConfig, IngestionPipeline, Ledger, RunOptions, ThumbnailWriter};
use serde_json::Value;

const DEFAULT_SERVER: &str = "http://localhost:8000";

#[derive(Parser)]
#[command(name = "oceano", about = "Oceano face search: bulk ingestion and queries")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Embed a photo collection into the index
    Ingest {
        /// Image file or directory (walked recursively)
        #[arg(long)]
        path: PathBuf,
        /// Files per ledger/index batch
        #[arg(long, default_value_t = 1024)]
        batch: usize,
        /// Concurrent decode/extract tasks (default: OCEANO_INGEST_WORKERS or 32)
        #[arg(long)]
        workers: Option<usize>,
        /// Reprocess files the ledger already has as done
        #[arg(long)]
        no_resume: bool,
        /// Use the padded and centre-crop fallbacks too (slower, higher recall)
        #[arg(long)]
        full_cascade: bool,
    },
    /// Find the closest faces to the one in IMAGE
    Search {
        image: PathBuf,
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
    /// Show daemon readiness and collection size
    Status {
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest {
            path,
            batch,
            workers,
            no_resume,
            full_cascade,
        } => {
            let cfg = IngestConfig::from_env();
            let opts = RunOptions {
                batch_size: batch,
                workers: workers.unwrap_or(cfg.workers),
                resume: !no_resume,
                full_cascade,
                ..RunOptions::default()
            };
            ingest(&path, &cfg, &opts).await?;
        }
        Commands::Search { image, server } => search(&image, &server).await?,
        Commands::Status { server } => status(&server).await?,
    }

    Ok(())
}

async fn ingest(root: &std::path::Path, cfg: &IngestConfig, opts: &RunOptions) -> Result<()> {
    let resource = Arc::new(ModelResource::new(ModelConfig::from_env()));
    {
        let resource = resource.clone();
        let elapsed = tokio::task::spawn_blocking(move || resource.preload())
            .await?
            .context("cannot load face model")?;
        tracing::info!(load_ms = elapsed.as_millis() as u64, "face model ready");
    }

    let index = Arc::new(QdrantIndex::new(IndexConfig::from_env())?);
    index
        .ensure_collection()
        .await
        .context("cannot prepare index collection")?;

    let ledger = Ledger::open(&cfg.ledger_db).await?;
    let audit = AuditLog::open(&cfg.error_csv)
        .with_context(|| format!("cannot open audit log {}", cfg.error_csv.display()))?;

    let pipeline = IngestionPipeline::new(EmbeddingExtractor::new(resource), index, ledger)
        .with_audit_log(audit)
        .with_thumbnails(ThumbnailWriter::new(&cfg.thumbs_dir))
        .with_decode_limits(DecodeLimits::from_env());

    let summary = pipeline.run_path(root, opts).await?;
    println!(
        "OK: {}/{} ingested ({} skipped, {} failed, see {})",
        summary.processed,
        summary.total,
        summary.skipped,
        summary.failed,
        cfg.error_csv.display()
    );
    Ok(())
}

async fn search(image: &std::path::Path, server: &str) -> Result<()> {
    let bytes = std::fs::read(image).with_context(|| format!("cannot read {}", image.display()))?;
    let resp = reqwest::Client::new()
        .post(format!("{}/search", server.trim_end_matches('/')))
        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
        .body(bytes)
        .send()
        .await
        .with_context(|| format!("cannot reach {server}"))?;

    let status = resp.status();
    let body: Value = resp.json().await.context("malformed response")?;
    if !status.is_success() {
        let message = body["error"].as_str().unwrap_or("unknown error");
        bail!("search failed ({status}): {message}");
    }

    let items = body["items"].as_array().cloned().unwrap_or_default();
    if items.is_empty() {
        println!("No matches.");
    }
    for (rank, item) in items.iter().enumerate() {
        println!(
            "{:>2}. {:>6.2}%  {}  {}",
            rank + 1,
            item["percent"].as_f64().unwrap_or(0.0),
            item["label"].as_str().unwrap_or("-"),
            item["path"].as_str().unwrap_or("-"),
        );
    }
    if let Some(ms) = body["elapsed_ms"].as_u64() {
        println!("({ms} ms)");
    }
    Ok(())
}

async fn status(server: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let base = server.trim_end_matches('/');

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .with_context(|| format!("cannot reach {server}"))?
        .json()
        .await?;
    let status: Value = client.get(format!("{base}/status")).send().await?.json().await?;

    println!("ready:          {}", health["ready"]);
    println!("model loaded:   {}", health["model_loaded"]);
    println!("index healthy:  {}", health["qdrant_healthy"]);
    println!("shutting down:  {}", health["shutting_down"]);
    if let Some(collection) = status["collection"].as_str() {
        println!("collection:     {collection} ({} vectors)", status["vectors"]);
    }
    if status["ledger"].is_object() {
        let l = &status["ledger"];
        println!("ledger:         {} done, {} pending, {} error", l["done"], l["pending"], l["error"]);
    }
    Ok(())
}
