//! Resumable, batched bulk ingestion.
//!
//! Files are processed in batches. Within a batch, decode and extraction run
//! on a bounded pool of blocking tasks; the model itself serializes inference
//! through its handle lock. Each batch ends with one ledger commit for the
//! failures, one for the successes (as `pending`), a single index upsert and
//! a final commit flipping the successes to `done`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use oceano_core::{CascadeStage, DecodeLimits, EmbeddingExtractor};
use oceano_index::{Point, PointPayload, VectorIndex};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::ids;
use crate::ledger::{Ledger, LedgerEntry};
use crate::thumbs::ThumbnailWriter;
use crate::{scan, IngestError};

pub const CAUSE_NO_FACE: &str = "no_face";
pub const CAUSE_UNREADABLE: &str = "unreadable_image";
pub const CAUSE_PANICKED: &str = "task_panicked";
pub const CAUSE_UPSERT_FAILED: &str = "index_upsert_failed";

/// Per-run knobs.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub batch_size: usize,
    pub workers: usize,
    /// Skip files already `done` with an unchanged mtime.
    pub resume: bool,
    /// Run the full fallback cascade instead of direct detection only.
    pub full_cascade: bool,
    /// Log progress every this many files.
    pub progress_every: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            batch_size: 1024,
            workers: 32,
            resume: true,
            full_cascade: false,
            progress_every: 500,
        }
    }
}

/// Totals for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    /// Files embedded and confirmed in the index.
    pub processed: usize,
    pub failed: usize,
    /// Files skipped because the ledger already had them done.
    pub skipped: usize,
    /// Points written to the index.
    pub upserted: usize,
}

impl RunSummary {
    fn absorb(&mut self, other: RunSummary) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.upserted += other.upserted;
    }
}

struct Candidate {
    path: String,
    mtime: f64,
}

enum Outcome {
    Embedded(Vec<f32>),
    Failed(&'static str),
}

struct Success {
    candidate: Candidate,
    vector: Vec<f32>,
}

/// Bulk ingestion into the ledger and the vector index.
pub struct IngestionPipeline {
    extractor: EmbeddingExtractor,
    index: Arc<dyn VectorIndex>,
    ledger: Ledger,
    audit: Option<AuditLog>,
    thumbs: Option<ThumbnailWriter>,
    limits: DecodeLimits,
}

impl IngestionPipeline {
    pub fn new(extractor: EmbeddingExtractor, index: Arc<dyn VectorIndex>, ledger: Ledger) -> Self {
        Self {
            extractor,
            index,
            ledger,
            audit: None,
            thumbs: None,
            limits: DecodeLimits::default(),
        }
    }

    pub fn with_audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_thumbnails(mut self, thumbs: ThumbnailWriter) -> Self {
        self.thumbs = Some(thumbs);
        self
    }

    pub fn with_decode_limits(mut self, limits: DecodeLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Scan `root` and ingest everything found.
    pub async fn run_path(&self, root: &Path, opts: &RunOptions) -> Result<RunSummary, IngestError> {
        let files = scan::scan(root).map_err(|source| IngestError::Scan {
            path: root.to_path_buf(),
            source,
        })?;
        tracing::info!(root = %root.display(), files = files.len(), "files discovered");
        self.run(&files, opts).await
    }

    /// Ingest `files`. Per-file failures are recorded and never abort the
    /// run; only ledger failures do.
    pub async fn run(&self, files: &[PathBuf], opts: &RunOptions) -> Result<RunSummary, IngestError> {
        let start = Instant::now();
        let batch_size = opts.batch_size.max(1);
        let workers = opts.workers.max(1);
        let progress = Arc::new(AtomicUsize::new(0));
        let mut summary = RunSummary {
            total: files.len(),
            ..RunSummary::default()
        };

        tracing::info!(
            files = files.len(),
            batch_size,
            workers,
            resume = opts.resume,
            full_cascade = opts.full_cascade,
            "ingestion started"
        );

        for (n, batch) in files.chunks(batch_size).enumerate() {
            let batch_summary = self.run_batch(batch, opts, workers, &progress).await?;
            tracing::info!(
                batch = n + 1,
                processed = batch_summary.processed,
                skipped = batch_summary.skipped,
                failed = batch_summary.failed,
                upserted = batch_summary.upserted,
                "batch committed"
            );
            summary.absorb(batch_summary);
        }

        tracing::info!(
            processed = summary.processed,
            total = summary.total,
            failed = summary.failed,
            skipped = summary.skipped,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "ingestion finished"
        );
        Ok(summary)
    }

    async fn run_batch(
        &self,
        batch: &[PathBuf],
        opts: &RunOptions,
        workers: usize,
        progress: &Arc<AtomicUsize>,
    ) -> Result<RunSummary, IngestError> {
        let mut summary = RunSummary::default();
        let mut failures: Vec<(Candidate, &'static str)> = Vec::new();
        let mut candidates = Vec::with_capacity(batch.len());

        for path in batch {
            let key = path.to_string_lossy().into_owned();
            match scan::mtime(path) {
                Ok(mtime) => candidates.push(Candidate { path: key, mtime }),
                Err(e) => {
                    tracing::warn!(path = %key, error = %e, "cannot stat file");
                    failures.push((Candidate { path: key, mtime: 0.0 }, CAUSE_UNREADABLE));
                }
            }
        }

        if opts.resume && !candidates.is_empty() {
            let known = self
                .ledger
                .get_many(candidates.iter().map(|c| c.path.clone()).collect())
                .await?;
            let before = candidates.len();
            candidates.retain(|c| !known.get(&c.path).is_some_and(|e| e.is_current(c.mtime)));
            summary.skipped = before - candidates.len();
            if summary.skipped > 0 {
                tick(progress, summary.skipped, opts.progress_every);
            }
        }

        let mut successes = Vec::new();
        for (candidate, outcome) in self.dispatch(candidates, opts, workers, progress).await {
            match outcome {
                Outcome::Embedded(vector) => successes.push(Success { candidate, vector }),
                Outcome::Failed(cause) => failures.push((candidate, cause)),
            }
        }

        summary.failed += failures.len();
        self.ledger
            .upsert_batch(
                failures
                    .iter()
                    .map(|(c, cause)| LedgerEntry::failed(c.path.clone(), c.mtime, *cause))
                    .collect(),
            )
            .await?;
        let rows = failures.iter().map(|(c, cause)| (c.path.clone(), *cause)).collect();
        self.audit(rows).await;

        if successes.is_empty() {
            return Ok(summary);
        }

        let mut entries = Vec::with_capacity(successes.len());
        let mut points = Vec::with_capacity(successes.len());
        for s in successes {
            let id = ids::external_id(&s.candidate.path, s.candidate.mtime);
            entries.push(LedgerEntry::pending(s.candidate.path.clone(), s.candidate.mtime, id));
            points.push(point(id, &s.candidate, s.vector));
        }
        self.ledger.upsert_batch(entries).await?;

        let paths: Vec<String> = points.iter().map(|p| p.payload.path.clone()).collect();
        let n = points.len();
        match self.index.upsert(points).await {
            Ok(()) => {
                self.ledger.mark_done(paths).await?;
                summary.processed += n;
                summary.upserted += n;
            }
            Err(e) => {
                tracing::error!(error = %e, points = n, "index upsert failed; batch left pending");
                summary.failed += n;
                let rows = paths.into_iter().map(|p| (p, CAUSE_UPSERT_FAILED)).collect();
                self.audit(rows).await;
            }
        }
        Ok(summary)
    }

    /// Decode and extract every candidate on a bounded pool of blocking
    /// tasks. Results come back in completion order.
    async fn dispatch(
        &self,
        candidates: Vec<Candidate>,
        opts: &RunOptions,
        workers: usize,
        progress: &Arc<AtomicUsize>,
    ) -> Vec<(Candidate, Outcome)> {
        let permits = Arc::new(Semaphore::new(workers));
        let stages: &'static [CascadeStage] = if opts.full_cascade {
            &CascadeStage::FULL
        } else {
            &CascadeStage::FAST
        };

        let mut slots: Vec<Option<Candidate>> = candidates.into_iter().map(Some).collect();
        let mut tasks = JoinSet::new();
        for (slot, candidate) in slots.iter().enumerate() {
            let Some(candidate) = candidate else { continue };
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let extractor = self.extractor.clone();
            let thumbs = self.thumbs.clone();
            let limits = self.limits;
            let path = candidate.path.clone();
            let mtime = candidate.mtime;
            tasks.spawn(async move {
                let result = tokio::task::spawn_blocking(move || {
                    process_file(&extractor, thumbs.as_ref(), limits, stages, &path, mtime)
                })
                .await;
                drop(permit);
                (slot, result)
            });
        }

        let mut outcomes = Vec::with_capacity(slots.len());
        while let Some(joined) = tasks.join_next().await {
            let Ok((slot, result)) = joined else {
                continue;
            };
            let outcome = result.unwrap_or_else(|e| {
                tracing::error!(error = %e, "ingestion task panicked");
                // a panic mid-inference poisons the model lock
                self.extractor.resource().mark_corrupted();
                Outcome::Failed(CAUSE_PANICKED)
            });
            if let Some(candidate) = slots.get_mut(slot).and_then(Option::take) {
                outcomes.push((candidate, outcome));
            }
            tick(progress, 1, opts.progress_every);
        }

        // Anything left was lost with its task.
        outcomes.extend(
            slots
                .into_iter()
                .flatten()
                .map(|c| (c, Outcome::Failed(CAUSE_PANICKED))),
        );
        outcomes
    }

    /// Append `(path, cause)` rows to the audit log off the async runtime.
    async fn audit(&self, rows: Vec<(String, &'static str)>) {
        let Some(audit) = self.audit.clone() else {
            return;
        };
        if rows.is_empty() {
            return;
        }
        let log_path = audit.path().to_path_buf();
        let written = tokio::task::spawn_blocking(move || {
            audit.record_all(rows.iter().map(|(path, cause)| (path.as_str(), *cause)))
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(path = %log_path.display(), error = %e, "cannot append to audit log"),
            Err(e) => tracing::warn!(path = %log_path.display(), error = %e, "audit log task failed"),
        }
    }
}

fn process_file(
    extractor: &EmbeddingExtractor,
    thumbs: Option<&ThumbnailWriter>,
    limits: DecodeLimits,
    stages: &[CascadeStage],
    path: &str,
    mtime: f64,
) -> Outcome {
    let image = match oceano_core::frame::read_image(Path::new(path), limits) {
        Ok(image) => image,
        Err(e) => {
            tracing::debug!(path, error = %e, "unreadable image");
            return Outcome::Failed(CAUSE_UNREADABLE);
        }
    };
    match extractor.run_cascade(&image, stages) {
        Ok(Some(extraction)) => {
            if let Some(thumbs) = thumbs {
                let thumb_id = ids::thumb_id(path, mtime);
                if let Err(e) = thumbs.write(&image, &thumb_id) {
                    tracing::warn!(path, error = %e, "thumbnail not written");
                }
            }
            Outcome::Embedded(extraction.vector.values)
        }
        Ok(None) => Outcome::Failed(CAUSE_NO_FACE),
        Err(e) => {
            tracing::warn!(path, error = %e, cause = e.cause(), "extraction failed");
            Outcome::Failed(e.cause())
        }
    }
}

fn point(id: Uuid, candidate: &Candidate, vector: Vec<f32>) -> Point {
    let label = Path::new(&candidate.path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    Point {
        id,
        vector,
        payload: PointPayload {
            label,
            path: candidate.path.clone(),
            thumb_id: ids::thumb_id(&candidate.path, candidate.mtime),
        },
    }
}

fn tick(progress: &AtomicUsize, n: usize, every: usize) {
    let before = progress.fetch_add(n, Ordering::Relaxed);
    let after = before + n;
    if every > 0 && after / every > before / every {
        tracing::info!(done = after, "ingestion progress");
    }
}
