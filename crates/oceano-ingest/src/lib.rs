//! oceano-ingest — resumable bulk ingestion of photo collections.

pub mod audit;
pub mod ids;
pub mod ledger;
pub mod pipeline;
pub mod scan;
pub mod thumbs;

pub use audit::AuditLog;
pub use ledger::{Ledger, LedgerCounts, LedgerEntry, LedgerError, Status};
pub use pipeline::{IngestionPipeline, RunOptions, RunSummary};
pub use thumbs::ThumbnailWriter;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("cannot scan {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Where ingestion keeps its state, from `OCEANO_LEDGER_DB`,
/// `OCEANO_ERROR_CSV`, `OCEANO_THUMBS_DIR` and `OCEANO_INGEST_WORKERS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    pub ledger_db: PathBuf,
    pub error_csv: PathBuf,
    pub thumbs_dir: PathBuf,
    pub workers: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let ledger_db = PathBuf::from("/state/ingestion.db");
        Self {
            error_csv: default_error_csv(&ledger_db),
            ledger_db,
            thumbs_dir: PathBuf::from("/data/thumbs"),
            workers: 32,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ledger_db = std::env::var("OCEANO_LEDGER_DB")
            .map(PathBuf::from)
            .unwrap_or(defaults.ledger_db);
        Self {
            error_csv: std::env::var("OCEANO_ERROR_CSV")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_error_csv(&ledger_db)),
            ledger_db,
            thumbs_dir: std::env::var("OCEANO_THUMBS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.thumbs_dir),
            workers: oceano_core::env::var_or("OCEANO_INGEST_WORKERS", defaults.workers),
        }
    }
}

fn default_error_csv(ledger_db: &std::path::Path) -> PathBuf {
    ledger_db
        .parent()
        .unwrap_or_else(|| std::path::Path::new("."))
        .join("ingest_errors.csv")
}
