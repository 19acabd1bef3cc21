//! The face-analysis model: detection plus embedding behind one trait.

use std::path::{Path, PathBuf};

use image::RgbImage;
use thiserror::Error;

use crate::detector::{DetectorError, FaceDetector};
use crate::env;
use crate::model::ModelLoader;
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::IdentityVector;

const DEFAULT_DET_SIZE: (u32, u32) = (640, 640);

/// Error-message fragments emitted by ONNX Runtime when the execution
/// provider is in a state only a full rebuild clears.
const FATAL_RUNTIME_SIGNATURES: [&str; 4] = [
    "Integer overflow",
    "Failed to allocate",
    "RUNTIME_EXCEPTION",
    "FusedConv",
];

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("model pack not usable: {0}")]
    ModelNotFound(String),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("model lock poisoned by a panicked inference")]
    Poisoned,
    #[error("{0}")]
    Runtime(String),
}

impl AnalyzerError {
    /// The fatal runtime signature this error carries, if any.
    pub fn fatal_signature(&self) -> Option<&'static str> {
        if matches!(self, Self::Poisoned) {
            return Some("poisoned");
        }
        let message = self.to_string();
        FATAL_RUNTIME_SIGNATURES
            .iter()
            .copied()
            .find(|sig| message.contains(sig))
    }

    /// Whether the model instance that raised this must be discarded.
    pub fn is_fatal(&self) -> bool {
        self.fatal_signature().is_some()
    }
}

/// A face-embedding model: finds every face in an image and returns one
/// normalized identity vector per face, with its bounding box.
///
/// An empty result means "no face", not an error.
pub trait FaceAnalyzer: Send {
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<IdentityVector>, AnalyzerError>;
}

/// Where and how to build the face model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    /// Root directory holding model packs.
    pub root: PathBuf,
    /// Pack directory name under `root` (e.g. "antelopev2", "buffalo_l").
    pub name: String,
    /// Detector input `(width, height)`.
    pub det_size: (u32, u32),
    pub intra_threads: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/models"),
            name: "antelopev2".to_string(),
            det_size: DEFAULT_DET_SIZE,
            intra_threads: 2,
        }
    }
}

impl ModelConfig {
    /// Load from `OCEANO_MODEL_ROOT`, `OCEANO_MODEL_NAME`, `OCEANO_DET_SIZE`
    /// and `OCEANO_INTRA_THREADS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            root: std::env::var("OCEANO_MODEL_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.root),
            name: env::string_or("OCEANO_MODEL_NAME", &defaults.name),
            det_size: std::env::var("OCEANO_DET_SIZE")
                .map(|v| parse_det_size(&v))
                .unwrap_or(DEFAULT_DET_SIZE),
            intra_threads: env::var_or("OCEANO_INTRA_THREADS", defaults.intra_threads),
        }
    }

    pub fn pack_dir(&self) -> PathBuf {
        self.root.join(&self.name)
    }
}

/// Parse `"width,height"`; anything malformed yields 640×640.
pub fn parse_det_size(value: &str) -> (u32, u32) {
    let mut parts = value.split(',').map(|p| p.trim().parse::<u32>());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(w)), Some(Ok(h)), None) if w > 0 && h > 0 => (w, h),
        _ => DEFAULT_DET_SIZE,
    }
}

/// The two ONNX files making up a model pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPack {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
}

impl ModelPack {
    /// Locate the detector and recognizer inside a pack directory.
    ///
    /// The detector is the `.onnx` file named `det_*` or `*scrfd*`. The
    /// recognizer is any other `.onnx` file, preferring known ArcFace names.
    pub fn resolve(dir: &Path) -> Result<Self, AnalyzerError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| AnalyzerError::ModelNotFound(format!("{}: {e}", dir.display())))?;

        let mut onnx: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("onnx")))
            .collect();
        onnx.sort();

        let file_name = |p: &Path| {
            p.file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
                .unwrap_or_default()
        };
        let is_detector = |p: &Path| {
            let name = file_name(p);
            name.starts_with("det_") || name.contains("scrfd")
        };

        let detector = onnx.iter().find(|p| is_detector(p.as_path())).cloned().ok_or_else(|| {
            AnalyzerError::ModelNotFound(format!("no SCRFD detector in {}", dir.display()))
        })?;

        let others: Vec<&PathBuf> = onnx.iter().filter(|p| !is_detector(p.as_path())).collect();
        let recognizer = others
            .iter()
            .find(|p| {
                let name = file_name(p.as_path());
                ["w600k", "glint", "r100", "r50", "arcface"]
                    .iter()
                    .any(|k| name.contains(k))
            })
            .or_else(|| others.first())
            .map(|p| (*p).clone())
            .ok_or_else(|| {
                AnalyzerError::ModelNotFound(format!("no ArcFace recognizer in {}", dir.display()))
            })?;

        Ok(Self { detector, recognizer })
    }
}

/// Production face model: SCRFD detection followed by ArcFace embedding of
/// every detected face.
pub struct FaceAnalysis {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl FaceAnalysis {
    pub fn load(config: &ModelConfig) -> Result<Self, AnalyzerError> {
        let pack = ModelPack::resolve(&config.pack_dir())?;
        tracing::info!(
            pack = %config.name,
            detector = %pack.detector.display(),
            recognizer = %pack.recognizer.display(),
            "resolved model pack"
        );
        Ok(Self {
            detector: FaceDetector::load(&pack.detector, config.det_size, config.intra_threads)?,
            recognizer: FaceRecognizer::load(&pack.recognizer, config.intra_threads)?,
        })
    }
}

impl FaceAnalyzer for FaceAnalysis {
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<IdentityVector>, AnalyzerError> {
        let boxes = self.detector.detect(image)?;
        let mut faces = Vec::with_capacity(boxes.len());
        for bbox in boxes.iter().filter(|b| b.landmarks.is_some()) {
            faces.push(self.recognizer.extract(image, bbox)?);
        }
        Ok(faces)
    }
}

impl ModelLoader for ModelConfig {
    fn load(&self) -> Result<Box<dyn FaceAnalyzer>, AnalyzerError> {
        Ok(Box::new(FaceAnalysis::load(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_det_size() {
        assert_eq!(parse_det_size("320, 320"), (320, 320));
        assert_eq!(parse_det_size("640"), (640, 640));
        assert_eq!(parse_det_size("a,b"), (640, 640));
        assert_eq!(parse_det_size("0,640"), (640, 640));
        assert_eq!(parse_det_size("1,2,3"), (640, 640));
    }

    #[test]
    fn test_fatal_signatures() {
        let err = AnalyzerError::Runtime(
            "Non-zero status code returned while running FusedConv node. RUNTIME_EXCEPTION".into(),
        );
        assert!(err.is_fatal());
        assert!(AnalyzerError::Runtime("Failed to allocate memory for requested buffer".into()).is_fatal());
        assert!(AnalyzerError::Poisoned.is_fatal());
        assert!(!AnalyzerError::Runtime("bad input shape".into()).is_fatal());
        assert!(!AnalyzerError::ModelNotFound("/models".into()).is_fatal());
    }

    #[test]
    fn test_resolve_pack_prefers_arcface_names() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "1k3d68.onnx",
            "2d106det.onnx",
            "glintr100.onnx",
            "scrfd_10g_bnkps.onnx",
            "readme.txt",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let pack = ModelPack::resolve(dir.path()).unwrap();
        assert!(pack.detector.ends_with("scrfd_10g_bnkps.onnx"));
        assert!(pack.recognizer.ends_with("glintr100.onnx"));
    }

    #[test]
    fn test_resolve_pack_missing_detector() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("w600k_r50.onnx"), b"").unwrap();
        assert!(matches!(
            ModelPack::resolve(dir.path()),
            Err(AnalyzerError::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_resolve_missing_dir() {
        assert!(ModelPack::resolve(Path::new("/nonexistent/pack")).is_err());
    }

    #[test]
    fn test_pack_dir() {
        let cfg = ModelConfig {
            root: PathBuf::from("/models"),
            name: "buffalo_l".into(),
            ..ModelConfig::default()
        };
        assert_eq!(cfg.pack_dir(), PathBuf::from("/models/buffalo_l"));
    }
}
