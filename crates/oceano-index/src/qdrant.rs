//! Qdrant REST backend.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::{CollectionConfig, IndexConfig, Quantization};
use crate::{IndexError, Point, PointPayload, ScoredPoint, VectorIndex};

/// `VectorIndex` backed by a Qdrant collection.
pub struct QdrantIndex {
    client: Client,
    base_url: String,
    collection: CollectionConfig,
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct RawHit {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Option<PointPayload>,
}

#[derive(Deserialize)]
struct RawCount {
    count: u64,
}

impl QdrantIndex {
    pub fn new(config: IndexConfig) -> Result<Self, IndexError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            collection: config.collection,
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, self.collection.name, suffix)
    }

    async fn exists(&self) -> Result<bool, IndexError> {
        let resp = self.client.get(self.url("")).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(resp).await?;
        Ok(true)
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn ensure_collection(&self) -> Result<(), IndexError> {
        let name = &self.collection.name;
        if !self.exists().await? {
            tracing::info!(collection = %name, quantization = ?self.collection.quantization, "creating collection");
            let resp = self
                .client
                .put(self.url(""))
                .json(&create_collection_body(&self.collection))
                .send()
                .await?;
            check(resp).await?;
            return Ok(());
        }

        tracing::info!(collection = %name, "collection exists");
        if let Some(quantization) = quantization_body(&self.collection) {
            tracing::info!(collection = %name, "updating collection quantization to scalar int8");
            let resp = self
                .client
                .patch(self.url(""))
                .json(&json!({ "quantization_config": quantization }))
                .send()
                .await?;
            check(resp).await?;
        }
        Ok(())
    }

    async fn upsert(&self, points: Vec<Point>) -> Result<(), IndexError> {
        if points.is_empty() {
            return Ok(());
        }
        let n = points.len();
        let resp = self
            .client
            .put(self.url("/points?wait=true"))
            .json(&json!({ "points": points }))
            .send()
            .await?;
        check(resp).await?;
        tracing::debug!(points = n, "upserted");
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        hnsw_ef: usize,
        exact: bool,
    ) -> Result<Vec<ScoredPoint>, IndexError> {
        let resp = self
            .client
            .post(self.url("/points/search"))
            .json(&search_body(vector, top_k, hnsw_ef, exact))
            .send()
            .await?;
        let body: Value = check(resp).await?.json().await?;
        parse_hits(body)
    }

    async fn count(&self) -> Result<u64, IndexError> {
        let resp = self
            .client
            .post(self.url("/points/count"))
            .json(&json!({ "exact": false }))
            .send()
            .await?;
        let body: Value = check(resp).await?.json().await?;
        let envelope: Envelope<RawCount> =
            serde_json::from_value(body).map_err(|e| IndexError::Response(e.to_string()))?;
        Ok(envelope.result.count)
    }

    fn collection(&self) -> &str {
        &self.collection.name
    }
}

async fn check(resp: Response) -> Result<Response, IndexError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(IndexError::Status {
        status: status.as_u16(),
        body,
    })
}

fn quantization_body(cfg: &CollectionConfig) -> Option<Value> {
    match cfg.quantization {
        Quantization::None => None,
        Quantization::Scalar => Some(json!({
            "scalar": {
                "type": "int8",
                "quantile": cfg.quantile,
                "always_ram": false,
            }
        })),
    }
}

fn create_collection_body(cfg: &CollectionConfig) -> Value {
    let mut body = json!({
        "vectors": {
            "size": cfg.dim,
            "distance": "Cosine",
            "on_disk": cfg.vectors_on_disk,
        },
        "optimizers_config": {
            "memmap_threshold": cfg.memmap_threshold,
            "indexing_threshold": cfg.indexing_threshold,
        },
        "hnsw_config": {
            "m": cfg.hnsw_m,
            "ef_construct": cfg.hnsw_ef_construct,
            "on_disk": cfg.hnsw_on_disk,
        },
        "on_disk_payload": cfg.payload_on_disk,
    });
    if let Some(q) = quantization_body(cfg) {
        body["quantization_config"] = q;
    }
    body
}

fn search_body(vector: &[f32], top_k: usize, hnsw_ef: usize, exact: bool) -> Value {
    json!({
        "vector": vector,
        "limit": top_k,
        "with_payload": true,
        "params": { "hnsw_ef": hnsw_ef, "exact": exact },
    })
}

fn parse_hits(body: Value) -> Result<Vec<ScoredPoint>, IndexError> {
    let envelope: Envelope<Vec<RawHit>> =
        serde_json::from_value(body).map_err(|e| IndexError::Response(e.to_string()))?;
    Ok(envelope
        .result
        .into_iter()
        .map(|hit| ScoredPoint {
            id: match hit.id {
                Value::String(s) => s,
                other => other.to_string(),
            },
            score: hit.score,
            payload: hit.payload.unwrap_or_default(),
        })
        .collect())
}
