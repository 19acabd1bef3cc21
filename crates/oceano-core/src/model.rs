//! Lifecycle of the single shared face-model instance.
//!
//! [`ModelResource`] builds the model lazily with double-checked locking so
//! that concurrent first callers trigger exactly one construction. When an
//! inference fault shows the runtime is in a bad state, callers flag the
//! resource as corrupted and the next [`ModelResource::acquire`] throws the
//! instance away and builds a fresh one.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::types::IdentityVector;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model initialization failed: {0}")]
    Initialization(#[source] AnalyzerError),
}

/// Builds a fresh model instance. Called at most once per construction.
pub trait ModelLoader: Send + Sync {
    fn load(&self) -> Result<Box<dyn FaceAnalyzer>, AnalyzerError>;
}

/// A fully constructed model. Inference calls are serialized through an
/// internal lock because the underlying sessions are not safe to run
/// concurrently.
pub struct ModelHandle {
    model: Mutex<Box<dyn FaceAnalyzer>>,
    generation: u64,
}

impl ModelHandle {
    /// Run detection + embedding. Blocks while another caller is inferring.
    pub fn analyze(&self, image: &RgbImage) -> Result<Vec<IdentityVector>, AnalyzerError> {
        let mut model = self.model.lock().map_err(|_| AnalyzerError::Poisoned)?;
        model.analyze(image)
    }

    /// Construction counter value when this handle was built (1 = first).
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Point-in-time view of the resource, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStats {
    pub loaded: bool,
    pub corrupted: bool,
    pub constructions: u64,
    pub consecutive_failures: u32,
    pub last_load_ms: Option<u64>,
}

/// Owner of the shared model instance.
pub struct ModelResource {
    loader: Box<dyn ModelLoader>,
    instance: RwLock<Option<Arc<ModelHandle>>>,
    init_lock: Mutex<()>,
    corrupted: AtomicBool,
    constructions: AtomicU64,
    consecutive_failures: AtomicU32,
    last_load: Mutex<Option<Duration>>,
}

impl ModelResource {
    pub fn new(loader: impl ModelLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            instance: RwLock::new(None),
            init_lock: Mutex::new(()),
            corrupted: AtomicBool::new(false),
            constructions: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            last_load: Mutex::new(None),
        }
    }

    /// Return the cached model, building it first if absent or corrupted.
    ///
    /// A construction failure caches nothing; the next call tries again.
    pub fn acquire(&self) -> Result<Arc<ModelHandle>, ModelError> {
        if !self.corrupted.load(Ordering::Acquire) {
            if let Some(handle) = self.cached() {
                return Ok(handle);
            }
        }

        let _guard = self.init_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if self.corrupted.swap(false, Ordering::AcqRel) {
            tracing::warn!("model marked corrupted, discarding instance and reloading");
            *self.instance.write().unwrap_or_else(PoisonError::into_inner) = None;
        }
        if let Some(handle) = self.cached() {
            return Ok(handle);
        }

        tracing::info!("initializing face model");
        let start = Instant::now();
        let model = match self.loader.load() {
            Ok(model) => model,
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                tracing::error!(error = %e, consecutive_failures = failures, "face model construction failed");
                return Err(ModelError::Initialization(e));
            }
        };
        let elapsed = start.elapsed();

        let generation = self.constructions.fetch_add(1, Ordering::AcqRel) + 1;
        let handle = Arc::new(ModelHandle {
            model: Mutex::new(model),
            generation,
        });
        *self.instance.write().unwrap_or_else(PoisonError::into_inner) = Some(handle.clone());
        *self.last_load.lock().unwrap_or_else(PoisonError::into_inner) = Some(elapsed);
        self.consecutive_failures.store(0, Ordering::Release);

        tracing::info!(
            elapsed_ms = elapsed.as_millis() as u64,
            generation,
            "face model loaded"
        );
        Ok(handle)
    }

    /// Build the model eagerly, returning how long the load took.
    pub fn preload(&self) -> Result<Duration, ModelError> {
        let start = Instant::now();
        self.acquire()?;
        Ok(start.elapsed())
    }

    /// Flag the cached instance as untrustworthy. Idempotent.
    pub fn mark_corrupted(&self) {
        if !self.corrupted.swap(true, Ordering::AcqRel) {
            tracing::warn!("face model flagged as corrupted; it will be rebuilt on next use");
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.cached().is_some() && !self.corrupted.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ModelStats {
        ModelStats {
            loaded: self.is_loaded(),
            corrupted: self.corrupted.load(Ordering::Acquire),
            constructions: self.constructions.load(Ordering::Acquire),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            last_load_ms: self
                .last_load
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .map(|d| d.as_millis() as u64),
        }
    }

    fn cached(&self) -> Option<Arc<ModelHandle>> {
        self.instance
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    struct NoFaces;

    impl FaceAnalyzer for NoFaces {
        fn analyze(&mut self, _image: &RgbImage) -> Result<Vec<IdentityVector>, AnalyzerError> {
            Ok(Vec::new())
        }
    }

    /// Counts constructions; fails while `fail` is set.
    #[derive(Clone, Default)]
    struct CountingLoader {
        builds: Arc<AtomicUsize>,
        fail: Arc<AtomicBool>,
        delay: Duration,
    }

    impl ModelLoader for CountingLoader {
        fn load(&self) -> Result<Box<dyn FaceAnalyzer>, AnalyzerError> {
            std::thread::sleep(self.delay);
            if self.fail.load(Ordering::SeqCst) {
                return Err(AnalyzerError::ModelNotFound("/models/antelopev2".into()));
            }
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NoFaces))
        }
    }

    #[test]
    fn test_lazy_until_first_acquire() {
        let loader = CountingLoader::default();
        let resource = ModelResource::new(loader.clone());
        assert!(!resource.is_loaded());
        assert_eq!(loader.builds.load(Ordering::SeqCst), 0);

        let a = resource.acquire().unwrap();
        let b = resource.acquire().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(loader.builds.load(Ordering::SeqCst), 1);
        assert!(resource.is_loaded());
    }

    #[test]
    fn test_concurrent_first_acquire_builds_once() {
        let loader = CountingLoader {
            delay: Duration::from_millis(50),
            ..Default::default()
        };
        let resource = ModelResource::new(loader.clone());
        let callers = 8;
        let barrier = Barrier::new(callers);

        let handles: Vec<Arc<ModelHandle>> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..callers)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        resource.acquire().unwrap()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(loader.builds.load(Ordering::SeqCst), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    }

    #[test]
    fn test_corruption_forces_rebuild() {
        let loader = CountingLoader::default();
        let resource = ModelResource::new(loader.clone());
        let first = resource.acquire().unwrap();

        resource.mark_corrupted();
        resource.mark_corrupted();
        assert!(!resource.is_loaded());
        assert!(resource.stats().corrupted);

        let second = resource.acquire().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.generation(), 2);
        assert_eq!(loader.builds.load(Ordering::SeqCst), 2);
        assert!(!resource.stats().corrupted);
    }

    #[test]
    fn test_failed_construction_is_retried_next_call() {
        let loader = CountingLoader::default();
        loader.fail.store(true, Ordering::SeqCst);
        let resource = ModelResource::new(loader.clone());

        assert!(matches!(resource.acquire(), Err(ModelError::Initialization(_))));
        assert!(resource.acquire().is_err());
        let stats = resource.stats();
        assert_eq!(stats.consecutive_failures, 2);
        assert!(!stats.loaded);
        assert!(!stats.corrupted);

        loader.fail.store(false, Ordering::SeqCst);
        let handle = resource.acquire().unwrap();
        assert_eq!(handle.generation(), 1);
        assert_eq!(resource.stats().consecutive_failures, 0);
    }

    #[test]
    fn test_preload_records_load_time() {
        let resource = ModelResource::new(CountingLoader::default());
        resource.preload().unwrap();
        let stats = resource.stats();
        assert!(stats.loaded);
        assert_eq!(stats.constructions, 1);
        assert!(stats.last_load_ms.is_some());
    }
}
