//! Best-face extraction with a fallback cascade.
//!
//! The cascade is an ordered list of [`CascadeStage`]s. Each stage derives a
//! candidate canvas from the input image and runs the model on it; the first
//! stage that finds a face wins. Tightly cropped portraits often need the
//! padded stage, cluttered ones the centre crop.

use std::borrow::Cow;
use std::sync::Arc;

use image::RgbImage;
use thiserror::Error;

use crate::analyzer::AnalyzerError;
use crate::frame;
use crate::model::{ModelError, ModelResource};
use crate::types::IdentityVector;

/// Border added by [`CascadeStage::Padded`], as a fraction of the longer side.
pub const PAD_RATIO: f32 = 0.35;
/// Side of the [`CascadeStage::CenterCrop`] square relative to the shorter side.
pub const CROP_SCALE: f32 = 1.4;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error(transparent)]
    Unavailable(#[from] ModelError),
    /// The runtime hit a fault that invalidates the model; it has been
    /// flagged for rebuild.
    #[error("inference runtime fault: {0}")]
    RuntimeFault(#[source] AnalyzerError),
    #[error("face extraction failed: {0}")]
    Failed(#[source] AnalyzerError),
}

impl ExtractError {
    /// Whether retrying (against a rebuilt model) may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RuntimeFault(_))
    }

    /// Short machine-readable cause, used in ledgers and audit logs.
    pub fn cause(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "model_unavailable",
            Self::RuntimeFault(_) => "runtime_fault",
            Self::Failed(_) => "extraction_failed",
        }
    }
}

/// One attempt of the cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeStage {
    /// The image as given.
    Direct,
    /// Zero-padded canvas for faces cropped too tightly to be detected.
    Padded,
    /// Centred square crop for faces lost in background.
    CenterCrop,
}

impl CascadeStage {
    /// Full cascade, in order.
    pub const FULL: [CascadeStage; 3] = [Self::Direct, Self::Padded, Self::CenterCrop];
    /// Bulk-ingestion fast path: direct detection only.
    pub const FAST: [CascadeStage; 1] = [Self::Direct];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Padded => "padded",
            Self::CenterCrop => "center_crop",
        }
    }

    /// Derive this stage's canvas and the `(dx, dy)` that maps canvas
    /// coordinates back onto the original image. `None` if the stage cannot
    /// produce a usable canvas.
    pub fn prepare<'a>(&self, image: &'a RgbImage) -> Option<(Cow<'a, RgbImage>, (f32, f32))> {
        if image.width() == 0 || image.height() == 0 {
            return None;
        }
        match self {
            Self::Direct => Some((Cow::Borrowed(image), (0.0, 0.0))),
            Self::Padded => {
                let (canvas, margin) = frame::pad(image, PAD_RATIO);
                let m = margin as f32;
                Some((Cow::Owned(canvas), (-m, -m)))
            }
            Self::CenterCrop => {
                let crop = frame::center_crop(image, CROP_SCALE)?;
                Some((Cow::Owned(crop.image), (crop.x as f32, crop.y as f32)))
            }
        }
    }
}

/// A successful extraction and the stage that produced it.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub vector: IdentityVector,
    pub stage: CascadeStage,
}

/// Pick the face with the largest box; ties keep the first one seen.
pub fn select_largest(faces: Vec<IdentityVector>) -> Option<IdentityVector> {
    let mut best: Option<IdentityVector> = None;
    for face in faces {
        let larger = best
            .as_ref()
            .map_or(true, |b| face.bbox.area() > b.bbox.area());
        if larger {
            best = Some(face);
        }
    }
    best
}

/// Produces at most one identity vector per image.
#[derive(Clone)]
pub struct EmbeddingExtractor {
    resource: Arc<ModelResource>,
}

impl EmbeddingExtractor {
    pub fn new(resource: Arc<ModelResource>) -> Self {
        Self { resource }
    }

    pub fn resource(&self) -> &Arc<ModelResource> {
        &self.resource
    }

    /// Run the full cascade. `Ok(None)` means no face under any stage.
    pub fn extract_best(&self, image: &RgbImage) -> Result<Option<Extraction>, ExtractError> {
        self.run_cascade(image, &CascadeStage::FULL)
    }

    /// Direct detection only, trading recall for throughput.
    pub fn extract_fast(&self, image: &RgbImage) -> Result<Option<Extraction>, ExtractError> {
        self.run_cascade(image, &CascadeStage::FAST)
    }

    /// Try `stages` in order, stopping at the first that finds a face.
    pub fn run_cascade(
        &self,
        image: &RgbImage,
        stages: &[CascadeStage],
    ) -> Result<Option<Extraction>, ExtractError> {
        for &stage in stages {
            let Some((canvas, (dx, dy))) = stage.prepare(image) else {
                tracing::debug!(stage = stage.as_str(), "cascade stage skipped: empty canvas");
                continue;
            };
            if let Some(mut vector) = self.detect_once(&canvas)? {
                vector.bbox = vector.bbox.translated(dx, dy);
                vector.normalize();
                tracing::debug!(stage = stage.as_str(), "face found");
                return Ok(Some(Extraction { vector, stage }));
            }
        }
        Ok(None)
    }

    fn detect_once(&self, canvas: &RgbImage) -> Result<Option<IdentityVector>, ExtractError> {
        let handle = self.resource.acquire()?;
        match handle.analyze(canvas) {
            Ok(faces) => Ok(select_largest(faces)),
            Err(e) if e.is_fatal() => {
                tracing::error!(
                    error = %e,
                    signature = e.fatal_signature().unwrap_or_default(),
                    generation = handle.generation(),
                    "fatal inference runtime fault"
                );
                self.resource.mark_corrupted();
                Err(ExtractError::RuntimeFault(e))
            }
            Err(e) => Err(ExtractError::Failed(e)),
        }
    }
}
