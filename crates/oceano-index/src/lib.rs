//! oceano-index — vector index collaborator.
//!
//! Ingestion and search only talk to the index through [`VectorIndex`]; the
//! production backend is Qdrant over its REST API ([`QdrantIndex`]).

pub mod config;
pub mod qdrant;

pub use config::{CollectionConfig, IndexConfig, Quantization};
pub use qdrant::QdrantIndex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("index returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected index response: {0}")]
    Response(String),
}

/// Metadata stored next to every vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PointPayload {
    /// Identity label, taken from the source file stem.
    #[serde(default)]
    pub label: String,
    /// Source image path as ingested.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub thumb_id: String,
}

/// A vector to be written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

/// A search hit. `score` is cosine similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: PointPayload,
}

/// Nearest-neighbour store for identity vectors.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create the collection if missing. Idempotent.
    async fn ensure_collection(&self) -> Result<(), IndexError>;

    /// Insert or overwrite points by id, returning once they are durable.
    async fn upsert(&self, points: Vec<Point>) -> Result<(), IndexError>;

    /// Top-`top_k` neighbours of `vector`, best first.
    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        hnsw_ef: usize,
        exact: bool,
    ) -> Result<Vec<ScoredPoint>, IndexError>;

    /// Approximate number of stored vectors.
    async fn count(&self) -> Result<u64, IndexError>;

    /// Collection name, for status reporting.
    fn collection(&self) -> &str;
}
