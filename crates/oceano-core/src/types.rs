use serde::{Deserialize, Serialize};

/// Dimensionality of ArcFace identity vectors.
pub const EMBEDDING_DIM: usize = 512;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Box area in pixels. Degenerate (negative) extents count as zero.
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Shift the box and its landmarks by `(dx, dy)`.
    ///
    /// Used to map detections on a padded or cropped canvas back into the
    /// coordinate space of the original image.
    pub fn translated(&self, dx: f32, dy: f32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(lx, ly)| (lx + dx, ly + dy))),
            ..self.clone()
        }
    }
}

/// An L2-normalized face embedding together with the box it was taken from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityVector {
    pub values: Vec<f32>,
    pub bbox: BoundingBox,
}

impl IdentityVector {
    /// Build a vector from raw model output, normalizing it to unit length.
    pub fn new(mut values: Vec<f32>, bbox: BoundingBox) -> Self {
        l2_normalize(&mut values);
        Self { values, bbox }
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Re-normalize in place. A no-op for vectors that are already unit length.
    pub fn normalize(&mut self) {
        l2_normalize(&mut self.values);
    }

    /// Cosine similarity in [-1, 1].
    pub fn similarity(&self, other: &[f32]) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;
        for (a, b) in self.values.iter().zip(other) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }
        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }
}

/// Scale `values` to unit L2 norm. Zero vectors are left untouched.
pub fn l2_normalize(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
}
