//! Per-request search orchestration.
//!
//! A request moves through admitting, extracting and querying. Admission is
//! held only while the model runs; it is released before the index is
//! queried. Transient model faults and index failures are retried with
//! exponential backoff.
//!
//! Extraction runs on a detached task that owns the admission token, so a
//! caller that stops waiting (request timeout, client gone) cannot free the
//! slot while inference is still running.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;
use oceano_core::{DecodeLimits, EmbeddingExtractor, ExtractError, FrameError};
use oceano_index::{IndexError, ScoredPoint, VectorIndex};
use serde::Serialize;
use thiserror::Error;

use crate::admission::{AdmissionToken, SearchAdmission};
use crate::config::Config;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("server busy, retry in {}s", .retry_after.as_secs().max(1))]
    Busy { retry_after: Duration },
    #[error("invalid image: {0}")]
    InvalidImage(#[from] FrameError),
    #[error("no face detected")]
    NoFace,
    #[error("extraction failed after {attempts} attempt(s): {source}")]
    Extraction {
        attempts: u32,
        #[source]
        source: ExtractError,
    },
    #[error("index query failed after {attempts} attempt(s): {source}")]
    Index {
        attempts: u32,
        #[source]
        source: IndexError,
    },
    #[error("search task failed: {0}")]
    Internal(String),
}

#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub top_k: usize,
    pub hnsw_ef: usize,
    pub sim_threshold: f32,
    pub admission_timeout: Duration,
    pub retry_base: Duration,
    pub max_attempts: u32,
    /// Where thumbnails live; hits only link thumbnails that exist.
    pub thumbs_dir: Option<PathBuf>,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            top_k: 10,
            hnsw_ef: 512,
            sim_threshold: 0.0,
            admission_timeout: Duration::from_secs(5),
            retry_base: Duration::from_millis(100),
            max_attempts: 3,
            thumbs_dir: None,
        }
    }
}

impl From<&Config> for SearchSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            top_k: cfg.top_k,
            hnsw_ef: cfg.hnsw_ef,
            sim_threshold: cfg.sim_threshold,
            admission_timeout: cfg.admission_timeout,
            retry_base: cfg.retry_base,
            max_attempts: 3,
            thumbs_dir: Some(cfg.thumbs_dir.clone()),
        }
    }
}

/// One ranked match.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    /// Cosine similarity × 100, two decimals.
    pub percent: f32,
    pub label: String,
    pub path: String,
    pub id: String,
    pub thumb: Option<String>,
}

pub struct SearchPipeline {
    extractor: EmbeddingExtractor,
    index: Arc<dyn VectorIndex>,
    admission: SearchAdmission,
    settings: SearchSettings,
    limits: DecodeLimits,
}

impl SearchPipeline {
    pub fn new(
        extractor: EmbeddingExtractor,
        index: Arc<dyn VectorIndex>,
        admission: SearchAdmission,
        settings: SearchSettings,
    ) -> Self {
        Self {
            extractor,
            index,
            admission,
            settings,
            limits: DecodeLimits::default(),
        }
    }

    pub fn with_decode_limits(mut self, limits: DecodeLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn admission(&self) -> &SearchAdmission {
        &self.admission
    }

    /// Decode an uploaded image and search with it.
    pub async fn search_bytes(&self, bytes: Vec<u8>) -> Result<Vec<SearchHit>, SearchError> {
        let limits = self.limits;
        let image = tokio::task::spawn_blocking(move || oceano_core::frame::decode_image(&bytes, limits))
            .await
            .map_err(|e| SearchError::Internal(e.to_string()))??;
        self.search(image).await
    }

    pub async fn search(&self, image: RgbImage) -> Result<Vec<SearchHit>, SearchError> {
        let start = Instant::now();

        let Some(token) = self.admission.try_acquire(self.settings.admission_timeout).await else {
            tracing::warn!(
                timeout_ms = self.settings.admission_timeout.as_millis() as u64,
                "admission timed out, rejecting search"
            );
            return Err(SearchError::Busy {
                retry_after: self.settings.admission_timeout,
            });
        };
        let extraction = tokio::spawn(extract_with_retry(
            self.extractor.clone(),
            Arc::new(image),
            self.settings.retry_base,
            self.settings.max_attempts,
            token,
        ));
        let extracted = extraction
            .await
            .map_err(|e| SearchError::Internal(e.to_string()))?;

        let vector = extracted?.ok_or(SearchError::NoFace)?;
        let hits = self.query_with_retry(&vector).await?;
        let results = self.assemble(hits);

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            hits = results.len(),
            "search complete"
        );
        Ok(results)
    }

    async fn query_with_retry(&self, vector: &[f32]) -> Result<Vec<ScoredPoint>, SearchError> {
        let max = self.settings.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .index
                .search(vector, self.settings.top_k, self.settings.hnsw_ef, false)
                .await
            {
                Ok(hits) => return Ok(hits),
                Err(e) if attempt < max => {
                    let delay = backoff(self.settings.retry_base, attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = max,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "index query failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(SearchError::Index {
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    fn assemble(&self, hits: Vec<ScoredPoint>) -> Vec<SearchHit> {
        hits.into_iter()
            .filter(|h| h.score >= self.settings.sim_threshold)
            .map(|h| {
                let thumb_id = if h.payload.thumb_id.is_empty() {
                    h.id.clone()
                } else {
                    h.payload.thumb_id.clone()
                };
                let thumb = self
                    .settings
                    .thumbs_dir
                    .as_ref()
                    .filter(|dir| dir.join(format!("{thumb_id}.jpg")).exists())
                    .map(|_| format!("/thumbs/{thumb_id}.jpg"));
                SearchHit {
                    percent: (h.score * 10_000.0).round() / 100.0,
                    label: h.payload.label,
                    path: h.payload.path,
                    id: h.id,
                    thumb,
                }
            })
            .collect()
    }
}

/// Extract with retries on transient faults. `token` is released only once
/// the last attempt has returned.
async fn extract_with_retry(
    extractor: EmbeddingExtractor,
    image: Arc<RgbImage>,
    retry_base: Duration,
    max_attempts: u32,
    token: AdmissionToken,
) -> Result<Option<Vec<f32>>, SearchError> {
    let max = max_attempts.max(1);
    let mut attempt = 1;
    let result = loop {
        let worker = extractor.clone();
        let img = image.clone();
        let result = match tokio::task::spawn_blocking(move || worker.extract_best(&img)).await {
            Ok(result) => result,
            Err(e) => break Err(SearchError::Internal(e.to_string())),
        };

        match result {
            Ok(found) => break Ok(found.map(|e| e.vector.values)),
            Err(e) if e.is_transient() && attempt < max => {
                let delay = backoff(retry_base, attempt);
                tracing::warn!(
                    attempt,
                    max_attempts = max,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient extraction fault, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(source) => {
                break Err(SearchError::Extraction {
                    attempts: attempt,
                    source,
                })
            }
        }
    };
    drop(token);
    result
}

/// `base × 2^(attempt-1)`.
fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use oceano_core::{AnalyzerError, BoundingBox, FaceAnalyzer, IdentityVector, ModelLoader, ModelResource};
    use oceano_index::{Point, PointPayload};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum Behaviour {
        Face,
        NoFace,
        FatalFault,
        BadInput,
        Slow,
    }

    struct ScriptedModel {
        behaviour: Behaviour,
        calls: Arc<AtomicUsize>,
        running: Arc<AtomicBool>,
    }

    impl FaceAnalyzer for ScriptedModel {
        fn analyze(&mut self, _image: &RgbImage) -> Result<Vec<IdentityVector>, AnalyzerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let face = || {
                vec![IdentityVector::new(
                    vec![1.0, 0.0],
                    BoundingBox {
                        x: 0.0,
                        y: 0.0,
                        width: 10.0,
                        height: 10.0,
                        confidence: 0.9,
                        landmarks: None,
                    },
                )]
            };
            match self.behaviour {
                Behaviour::Face => Ok(face()),
                Behaviour::NoFace => Ok(Vec::new()),
                Behaviour::FatalFault => Err(AnalyzerError::Runtime(
                    "CUDA failure: Failed to allocate memory".into(),
                )),
                Behaviour::BadInput => Err(AnalyzerError::Runtime("unexpected input rank".into())),
                Behaviour::Slow => {
                    self.running.store(true, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(400));
                    self.running.store(false, Ordering::SeqCst);
                    Ok(face())
                }
            }
        }
    }

    struct ScriptedLoader {
        behaviour: Behaviour,
        calls: Arc<AtomicUsize>,
        builds: Arc<AtomicUsize>,
        running: Arc<AtomicBool>,
    }

    impl ModelLoader for ScriptedLoader {
        fn load(&self) -> Result<Box<dyn FaceAnalyzer>, AnalyzerError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedModel {
                behaviour: self.behaviour,
                calls: self.calls.clone(),
                running: self.running.clone(),
            }))
        }
    }

    /// Fails the first `failures` searches, then answers with `hits`.
    struct FlakyIndex {
        failures: AtomicUsize,
        calls: AtomicUsize,
        hits: Mutex<Vec<ScoredPoint>>,
    }

    impl FlakyIndex {
        fn new(failures: usize, hits: Vec<ScoredPoint>) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
                hits: Mutex::new(hits),
            }
        }
    }

    #[async_trait]
    impl VectorIndex for FlakyIndex {
        async fn ensure_collection(&self) -> Result<(), IndexError> {
            Ok(())
        }

        async fn upsert(&self, _points: Vec<Point>) -> Result<(), IndexError> {
            Ok(())
        }

        async fn search(&self, _: &[f32], top_k: usize, _: usize, _: bool) -> Result<Vec<ScoredPoint>, IndexError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(IndexError::Status {
                    status: 503,
                    body: "overloaded".into(),
                });
            }
            Ok(self.hits.lock().unwrap().iter().take(top_k).cloned().collect())
        }

        async fn count(&self) -> Result<u64, IndexError> {
            Ok(self.hits.lock().unwrap().len() as u64)
        }

        fn collection(&self) -> &str {
            "faces"
        }
    }

    fn hit(id: &str, score: f32, label: &str) -> ScoredPoint {
        ScoredPoint {
            id: id.into(),
            score,
            payload: PointPayload {
                label: label.into(),
                path: format!("/photos/{label}.jpg"),
                thumb_id: String::new(),
            },
        }
    }

    struct Harness {
        pipeline: SearchPipeline,
        index: Arc<FlakyIndex>,
        calls: Arc<AtomicUsize>,
        builds: Arc<AtomicUsize>,
        running: Arc<AtomicBool>,
    }

    fn harness(behaviour: Behaviour, index: FlakyIndex, settings: SearchSettings) -> Harness {
        let calls = Arc::new(AtomicUsize::new(0));
        let builds = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicBool::new(false));
        let resource = Arc::new(ModelResource::new(ScriptedLoader {
            behaviour,
            calls: calls.clone(),
            builds: builds.clone(),
            running: running.clone(),
        }));
        let index = Arc::new(index);
        let pipeline = SearchPipeline::new(
            EmbeddingExtractor::new(resource),
            index.clone(),
            SearchAdmission::new(1),
            settings,
        );
        Harness {
            pipeline,
            index,
            calls,
            builds,
            running,
        }
    }

    fn fast() -> SearchSettings {
        SearchSettings {
            retry_base: Duration::from_millis(1),
            admission_timeout: Duration::from_millis(50),
            ..SearchSettings::default()
        }
    }

    fn image() -> RgbImage {
        RgbImage::new(32, 32)
    }

    #[tokio::test]
    async fn test_ranked_results_with_threshold() {
        let hits = vec![hit("a", 0.91234, "ana"), hit("b", 0.4, "bea"), hit("c", 0.1, "cal")];
        let settings = SearchSettings {
            sim_threshold: 0.3,
            ..fast()
        };
        let h = harness(Behaviour::Face, FlakyIndex::new(0, hits), settings);

        let results = h.pipeline.search(image()).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].label, "ana");
        assert!((results[0].percent - 91.23).abs() < 1e-3);
        assert_eq!(results[0].path, "/photos/ana.jpg");
        assert_eq!(results[0].thumb, None);
        assert_eq!(h.pipeline.admission().available(), 1);
    }

    #[tokio::test]
    async fn test_no_face() {
        let h = harness(Behaviour::NoFace, FlakyIndex::new(0, Vec::new()), fast());
        let err = h.pipeline.search(image()).await.unwrap_err();
        assert!(matches!(err, SearchError::NoFace));
        assert_eq!(h.index.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.pipeline.admission().available(), 1);
    }

    #[tokio::test]
    async fn test_three_transient_faults_exhaust_retries() {
        let h = harness(Behaviour::FatalFault, FlakyIndex::new(0, Vec::new()), fast());
        let err = h.pipeline.search(image()).await.unwrap_err();
        match err {
            SearchError::Extraction { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(source.is_transient());
            }
            other => panic!("unexpected error: {other}"),
        }
        // the cascade stops at the first fault, so one call per attempt
        assert_eq!(h.calls.load(Ordering::SeqCst), 3);
        // every fault marked the model corrupted; each retry got a fresh one
        assert_eq!(h.builds.load(Ordering::SeqCst), 3);
        assert_eq!(h.pipeline.admission().available(), 1);
    }

    #[tokio::test]
    async fn test_non_transient_fault_is_not_retried() {
        let h = harness(Behaviour::BadInput, FlakyIndex::new(0, Vec::new()), fast());
        let err = h.pipeline.search(image()).await.unwrap_err();
        assert!(matches!(err, SearchError::Extraction { attempts: 1, .. }));
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_index_recovers_within_retries() {
        let h = harness(Behaviour::Face, FlakyIndex::new(2, vec![hit("a", 0.8, "ana")]), fast());
        let results = h.pipeline.search(image()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(h.index.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_index_exhausted() {
        let h = harness(Behaviour::Face, FlakyIndex::new(5, Vec::new()), fast());
        let err = h.pipeline.search(image()).await.unwrap_err();
        assert!(matches!(err, SearchError::Index { attempts: 3, .. }));
        assert_eq!(h.index.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_busy_when_gate_held() {
        let h = harness(Behaviour::Face, FlakyIndex::new(0, Vec::new()), fast());
        let _held = h
            .pipeline
            .admission()
            .try_acquire(Duration::from_millis(10))
            .await
            .unwrap();
        let start = Instant::now();
        let err = h.pipeline.search(image()).await.unwrap_err();
        assert!(matches!(err, SearchError::Busy { .. }));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_upload() {
        let h = harness(Behaviour::Face, FlakyIndex::new(0, Vec::new()), fast());
        let err = h.pipeline.search_bytes(b"garbage".to_vec()).await.unwrap_err();
        assert!(matches!(err, SearchError::InvalidImage(_)));
    }

    #[tokio::test]
    async fn test_thumb_linked_only_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("t-ana.jpg"), b"jpg").unwrap();
        let mut with_thumb = hit("a", 0.9, "ana");
        with_thumb.payload.thumb_id = "t-ana".into();
        let settings = SearchSettings {
            thumbs_dir: Some(dir.path().to_path_buf()),
            ..fast()
        };
        let h = harness(
            Behaviour::Face,
            FlakyIndex::new(0, vec![with_thumb, hit("b", 0.8, "bea")]),
            settings,
        );
        let results = h.pipeline.search(image()).await.unwrap();
        assert_eq!(results[0].thumb.as_deref(), Some("/thumbs/t-ana.jpg"));
        assert_eq!(results[1].thumb, None);
    }

    #[tokio::test]
    async fn test_abandoned_search_keeps_slot_until_model_returns() {
        let h = harness(Behaviour::Slow, FlakyIndex::new(0, Vec::new()), fast());

        let abandoned = tokio::time::timeout(Duration::from_millis(50), h.pipeline.search(image())).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.running.load(Ordering::SeqCst));
        assert_eq!(h.pipeline.admission().available(), 0);

        let err = h.pipeline.search(image()).await.unwrap_err();
        assert!(matches!(err, SearchError::Busy { .. }));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!h.running.load(Ordering::SeqCst));
        assert_eq!(h.pipeline.admission().available(), 1);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff(base, 1), Duration::from_millis(100));
        assert_eq!(backoff(base, 2), Duration::from_millis(200));
        assert_eq!(backoff(base, 3), Duration::from_millis(400));
    }
}
