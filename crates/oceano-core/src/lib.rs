//! oceano-core — Face embedding engine and model lifecycle.
//!
//! Uses SCRFD for face detection and ArcFace for identity embeddings, both
//! running via ONNX Runtime. The model is owned by a [`ModelResource`] that
//! builds it lazily, detects runtime corruption and forces a rebuild, and
//! [`EmbeddingExtractor`] layers a fallback cascade on top of it.

pub mod alignment;
pub mod analyzer;
pub mod detector;
pub mod env;
pub mod extractor;
pub mod frame;
pub mod model;
pub mod recognizer;
pub mod types;

pub use analyzer::{AnalyzerError, FaceAnalysis, FaceAnalyzer, ModelConfig};
pub use extractor::{CascadeStage, EmbeddingExtractor, ExtractError, Extraction};
pub use frame::{DecodeLimits, FrameError};
pub use model::{ModelError, ModelHandle, ModelLoader, ModelResource, ModelStats};
pub use types::{BoundingBox, IdentityVector, EMBEDDING_DIM};
