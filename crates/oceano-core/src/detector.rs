//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes an RGB image into the configured detection size, decodes the
//! three anchor-free stride heads and suppresses overlapping boxes.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use thiserror::Error;

use crate::types::BoundingBox;

const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model file not found: {0}")]
    ModelNotFound(String),
    #[error("detection size {0}x{1} must be a positive multiple of 32")]
    InvalidInputSize(u32, u32),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied when fitting the source into the model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(src_w: u32, src_h: u32, dst_w: usize, dst_h: usize) -> Self {
        let scale = (dst_w as f32 / src_w as f32).min(dst_h as f32 / src_h as f32);
        let new_w = (src_w as f32 * scale).round();
        let new_h = (src_h as f32 * scale).round();
        Self {
            scale,
            pad_x: ((dst_w as f32 - new_w) / 2.0).floor(),
            pad_y: ((dst_h as f32 - new_h) / 2.0).floor(),
        }
    }

    /// Map a point in model-input space back to source image space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideHead {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    input_width: usize,
    input_height: usize,
    heads: [StrideHead; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model with the given detection input size.
    pub fn load(model_path: &Path, det_size: (u32, u32), intra_threads: usize) -> Result<Self, DetectorError> {
        let (w, h) = det_size;
        if w == 0 || h == 0 || w % 32 != 0 || h % 32 != 0 {
            return Err(DetectorError::InvalidInputSize(w, h));
        }
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let heads = map_stride_heads(&output_names);
        tracing::info!(
            path = %model_path.display(),
            det_width = w,
            det_height = h,
            ?heads,
            "loaded SCRFD model"
        );

        Ok(Self {
            session,
            input_width: w as usize,
            input_height: h as usize,
            heads,
        })
    }

    /// Detect faces, returning boxes in source coordinates sorted by confidence.
    pub fn detect(&mut self, img: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if img.width() == 0 || img.height() == 0 {
            return Ok(Vec::new());
        }
        let (input, letterbox) = self.preprocess(img);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (head, &stride) in self.heads.iter().zip(SCRFD_STRIDES.iter()) {
            let tensor = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let grid = StrideGrid {
                stride,
                cols: self.input_width / stride,
                rows: self.input_height / stride,
            };
            candidates.extend(grid.decode(
                tensor(head.score, "scores")?,
                tensor(head.bbox, "bboxes")?,
                tensor(head.kps, "kps")?,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }

    /// Letterbox into a normalized NCHW tensor. Padding is filled with the
    /// mean so it normalizes to 0.0.
    fn preprocess(&self, img: &RgbImage) -> (Array4<f32>, Letterbox) {
        let letterbox = Letterbox::fit(img.width(), img.height(), self.input_width, self.input_height);
        let new_w = ((img.width() as f32 * letterbox.scale).round() as u32).max(1);
        let new_h = ((img.height() as f32 * letterbox.scale).round() as u32).max(1);
        let resized = imageops::resize(img, new_w, new_h, FilterType::Triangle);

        let mut tensor = Array4::<f32>::zeros((1, 3, self.input_height, self.input_width));
        let (off_x, off_y) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
        for (x, y, px) in resized.enumerate_pixels() {
            let (tx, ty) = (off_x + x as usize, off_y + y as usize);
            if tx >= self.input_width || ty >= self.input_height {
                continue;
            }
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = (px.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        (tensor, letterbox)
    }
}

/// Resolve which output tensors belong to which stride.
///
/// Exports either name their outputs `score_8`, `bbox_16`, `kps_32`, ... or
/// use opaque numeric names in the standard order
/// `[scores 8/16/32, bboxes 8/16/32, kps 8/16/32]`.
fn map_stride_heads(names: &[String]) -> [StrideHead; 3] {
    let position = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideHead>> = SCRFD_STRIDES
        .iter()
        .map(|&s| {
            Some(StrideHead {
                score: position("score", s)?,
                bbox: position("bbox", s)?,
                kps: position("kps", s)?,
            })
        })
        .collect();

    match named {
        Some(heads) => [heads[0], heads[1], heads[2]],
        None => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional mapping");
            std::array::from_fn(|i| StrideHead {
                score: i,
                bbox: i + 3,
                kps: i + 6,
            })
        }
    }
}

/// Anchor grid of one stride level.
struct StrideGrid {
    stride: usize,
    cols: usize,
    rows: usize,
}

impl StrideGrid {
    fn decode(
        &self,
        scores: &[f32],
        bboxes: &[f32],
        kps: &[f32],
        letterbox: &Letterbox,
        threshold: f32,
    ) -> Vec<BoundingBox> {
        let anchors = self.rows * self.cols * SCRFD_ANCHORS_PER_CELL;
        let s = self.stride as f32;

        (0..anchors)
            .filter_map(|idx| {
                let score = scores.get(idx).copied()?;
                if score <= threshold {
                    return None;
                }
                let cell = idx / SCRFD_ANCHORS_PER_CELL;
                let ax = (cell % self.cols) as f32 * s;
                let ay = (cell / self.cols) as f32 * s;

                let d = bboxes.get(idx * 4..idx * 4 + 4)?;
                let (x1, y1) = letterbox.unmap(ax - d[0] * s, ay - d[1] * s);
                let (x2, y2) = letterbox.unmap(ax + d[2] * s, ay + d[3] * s);

                let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
                    std::array::from_fn(|i| letterbox.unmap(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s))
                });

                Some(BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: score,
                    landmarks,
                })
            })
            .collect()
    }
}

/// Greedy non-maximum suppression; output is sorted by descending confidence.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut keep: Vec<BoundingBox> = Vec::with_capacity(detections.len());
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Intersection-over-Union between two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence: conf,
            landmarks: None,
        }
    }

    #[test]
    fn test_iou_identical() {
        let a = make_bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        let far = make_bbox(20.0, 20.0, 10.0, 10.0, 1.0);
        assert_eq!(iou(&a, &far), 0.0);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let result = nms(
            vec![
                make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
                make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
                make_bbox(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_roundtrip() {
        let lb = Letterbox::fit(320, 240, 640, 640);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 80.0);
        let (x, y) = lb.unmap(100.0 * 2.0 + lb.pad_x, 50.0 * 2.0 + lb.pad_y);
        assert!((x - 100.0).abs() < 1e-3 && (y - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_map_stride_heads_named_shuffled() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32", "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let heads = map_stride_heads(&names);
        assert_eq!(heads[0], StrideHead { score: 2, bbox: 0, kps: 1 });
        assert_eq!(heads[2], StrideHead { score: 8, bbox: 6, kps: 7 });
    }

    #[test]
    fn test_map_stride_heads_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        let heads = map_stride_heads(&names);
        assert_eq!(heads[1], StrideHead { score: 1, bbox: 4, kps: 7 });
    }

    #[test]
    fn test_decode_single_anchor() {
        // 2x2 grid at stride 8, one confident anchor in cell (1, 0)
        let grid = StrideGrid { stride: 8, cols: 2, rows: 2 };
        let mut scores = vec![0.0; 8];
        scores[2] = 0.9;
        let mut bboxes = vec![0.0; 32];
        bboxes[8..12].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);
        let kps = vec![0.0; 80];
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };

        let dets = grid.decode(&scores, &bboxes, &kps, &lb, 0.5);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!((d.x, d.y, d.width, d.height), (0.0, -8.0, 16.0, 16.0));
        assert_eq!(d.landmarks.unwrap()[0], (8.0, 0.0));
    }
}
