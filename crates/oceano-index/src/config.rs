use std::str::FromStr;
use std::time::Duration;

const DEFAULT_URL: &str = "http://localhost:6333";
const DEFAULT_COLLECTION: &str = "faces";
const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Optional compression of stored vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quantization {
    #[default]
    None,
    /// INT8 scalar quantization.
    Scalar,
}

impl FromStr for Quantization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "scalar" => Ok(Self::Scalar),
            other => Err(format!("unknown quantization '{other}' (expected none or scalar)")),
        }
    }
}

/// Storage layout of the identity-vector collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionConfig {
    pub name: String,
    pub dim: usize,
    pub vectors_on_disk: bool,
    pub memmap_threshold: u64,
    pub indexing_threshold: u64,
    pub hnsw_m: u32,
    pub hnsw_ef_construct: u32,
    pub hnsw_on_disk: bool,
    pub payload_on_disk: bool,
    pub quantization: Quantization,
    /// Quantile used to clip outliers before INT8 scaling.
    pub quantile: f64,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_COLLECTION.to_string(),
            dim: 512,
            vectors_on_disk: true,
            memmap_threshold: 20_000,
            indexing_threshold: 20_000,
            hnsw_m: 32,
            hnsw_ef_construct: 256,
            hnsw_on_disk: false,
            payload_on_disk: true,
            quantization: Quantization::None,
            quantile: 0.99,
        }
    }
}

/// Connection settings plus collection layout.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexConfig {
    pub url: String,
    pub timeout: Duration,
    pub collection: CollectionConfig,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            collection: CollectionConfig::default(),
        }
    }
}

impl IndexConfig {
    /// Load from `OCEANO_QDRANT_URL`, `OCEANO_COLLECTION`,
    /// `OCEANO_QUANTIZATION` and `OCEANO_INDEX_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let quantization = match std::env::var("OCEANO_QUANTIZATION") {
            Ok(v) => v.parse().unwrap_or_else(|e: String| {
                tracing::warn!(error = %e, "ignoring OCEANO_QUANTIZATION");
                Quantization::None
            }),
            Err(_) => Quantization::None,
        };
        let timeout_secs = std::env::var("OCEANO_INDEX_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Self {
            url: std::env::var("OCEANO_QDRANT_URL").unwrap_or_else(|_| DEFAULT_URL.to_string()),
            timeout: Duration::from_secs(timeout_secs),
            collection: CollectionConfig {
                name: std::env::var("OCEANO_COLLECTION")
                    .unwrap_or_else(|_| DEFAULT_COLLECTION.to_string()),
                quantization,
                ..CollectionConfig::default()
            },
        }
    }
}
