//! Shared daemon state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use oceano_core::{ModelResource, ModelStats};
use oceano_index::VectorIndex;
use oceano_ingest::Ledger;
use serde::Serialize;

use crate::search::SearchPipeline;

/// Readiness snapshot reported by `/health`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Readiness {
    pub ready: bool,
    pub model_loaded: bool,
    pub qdrant_healthy: bool,
    pub model_failures: u32,
    pub shutting_down: bool,
}

impl Readiness {
    pub fn evaluate(model: &ModelStats, qdrant_healthy: bool, failure_limit: u32, shutting_down: bool) -> Self {
        let failures_ok = model.consecutive_failures < failure_limit.max(1);
        Self {
            ready: model.loaded && qdrant_healthy && failures_ok && !shutting_down,
            model_loaded: model.loaded,
            qdrant_healthy,
            model_failures: model.consecutive_failures,
            shutting_down,
        }
    }
}

/// State shared by all route handlers.
pub struct AppState {
    pub pipeline: SearchPipeline,
    pub index: Arc<dyn VectorIndex>,
    pub resource: Arc<ModelResource>,
    /// Present when the ingestion ledger exists on this host.
    pub ledger: Option<Ledger>,
    pub request_timeout: Duration,
    pub model_failure_limit: u32,
    shutting_down: AtomicBool,
    index_healthy: AtomicBool,
}

impl AppState {
    pub fn new(
        pipeline: SearchPipeline,
        index: Arc<dyn VectorIndex>,
        resource: Arc<ModelResource>,
        ledger: Option<Ledger>,
        request_timeout: Duration,
        model_failure_limit: u32,
    ) -> Self {
        Self {
            pipeline,
            index,
            resource,
            ledger,
            request_timeout,
            model_failure_limit,
            shutting_down: AtomicBool::new(false),
            index_healthy: AtomicBool::new(false),
        }
    }

    /// Stop reporting ready. In-flight requests keep running.
    pub fn begin_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            tracing::info!("shutdown requested, readiness set to not ready");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn set_index_healthy(&self, healthy: bool) {
        let was = self.index_healthy.swap(healthy, Ordering::AcqRel);
        if was != healthy {
            tracing::info!(healthy, collection = self.index.collection(), "index health changed");
        }
    }

    pub fn readiness(&self) -> Readiness {
        Readiness::evaluate(
            &self.resource.stats(),
            self.index_healthy.load(Ordering::Acquire),
            self.model_failure_limit,
            self.is_shutting_down(),
        )
    }
}
