use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use oceano_core::env::{string_or, var_or};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid OCEANO_LISTEN address '{value}': {source}")]
    Listen {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },
}

/// Daemon configuration, loaded from `OCEANO_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    /// Neighbours requested per query.
    pub top_k: usize,
    /// Hits scoring below this cosine similarity are dropped.
    pub sim_threshold: f32,
    /// Search-time HNSW beam width.
    pub hnsw_ef: usize,
    /// Concurrent model invocations allowed on the search path.
    pub model_concurrency: usize,
    pub admission_timeout: Duration,
    /// First retry delay; doubles on each further attempt.
    pub retry_base: Duration,
    pub request_timeout: Duration,
    /// How long in-flight requests may run on after a shutdown signal.
    pub shutdown_grace: Duration,
    /// Consecutive model construction failures after which the daemon
    /// reports not ready.
    pub model_failure_limit: u32,
    pub thumbs_dir: PathBuf,
    pub ledger_db: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let listen_raw = string_or("OCEANO_LISTEN", "0.0.0.0:8000");
        let listen = listen_raw.parse().map_err(|source| ConfigError::Listen {
            value: listen_raw.clone(),
            source,
        })?;

        Ok(Self {
            listen,
            top_k: var_or("OCEANO_TOP_K", 10),
            sim_threshold: var_or("OCEANO_SIM_THRESHOLD", 0.0),
            hnsw_ef: var_or("OCEANO_HNSW_EF", 512),
            model_concurrency: var_or("OCEANO_MODEL_CONCURRENCY", 1usize).max(1),
            admission_timeout: Duration::from_millis(var_or("OCEANO_ADMISSION_TIMEOUT_MS", 5000)),
            retry_base: Duration::from_millis(var_or("OCEANO_RETRY_BASE_MS", 100)),
            request_timeout: Duration::from_secs(var_or("OCEANO_REQUEST_TIMEOUT_SECS", 30)),
            shutdown_grace: Duration::from_secs(var_or("OCEANO_SHUTDOWN_GRACE_SECS", 5)),
            model_failure_limit: var_or("OCEANO_MODEL_FAILURE_LIMIT", 3),
            thumbs_dir: PathBuf::from(string_or("OCEANO_THUMBS_DIR", "/data/thumbs")),
            ledger_db: PathBuf::from(string_or("OCEANO_LEDGER_DB", "/state/ingestion.db")),
        })
    }
}
