//! Decoded image handling: decode, size limiting, padding and cropping.
//!
//! All images are carried as 8-bit RGB. The pad and crop helpers return the
//! offset needed to map coordinates on the derived canvas back to the source.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

use crate::env;

const DEFAULT_MAX_SIDE: u32 = 1600;
const DEFAULT_DOWNSCALE_TO: u32 = 1280;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("cannot read image file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image has zero width or height")]
    Empty,
}

/// Decode-time downscale policy for oversized photos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    /// Images whose longer side exceeds this are downscaled.
    pub max_side: u32,
    /// Target length of the longer side after downscaling.
    pub downscale_to: u32,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_side: DEFAULT_MAX_SIDE,
            downscale_to: DEFAULT_DOWNSCALE_TO,
        }
    }
}

impl DecodeLimits {
    /// Load from `OCEANO_MAX_SIDE` / `OCEANO_DOWNSCALE_TO`.
    pub fn from_env() -> Self {
        Self {
            max_side: env::var_or("OCEANO_MAX_SIDE", DEFAULT_MAX_SIDE),
            downscale_to: env::var_or("OCEANO_DOWNSCALE_TO", DEFAULT_DOWNSCALE_TO),
        }
    }
}

/// Read and decode an image file. The format is sniffed from content, not
/// from the extension.
pub fn read_image(path: &Path, limits: DecodeLimits) -> Result<RgbImage, FrameError> {
    let bytes = std::fs::read(path)?;
    decode_image(&bytes, limits)
}

/// Decode an in-memory encoded image (JPEG, PNG, ...) into RGB.
pub fn decode_image(bytes: &[u8], limits: DecodeLimits) -> Result<RgbImage, FrameError> {
    let img = image::load_from_memory(bytes)?.to_rgb8();
    if img.width() == 0 || img.height() == 0 {
        return Err(FrameError::Empty);
    }
    Ok(limit_size(img, limits))
}

/// Downscale so the longer side equals `downscale_to` when it exceeds `max_side`.
pub fn limit_size(img: RgbImage, limits: DecodeLimits) -> RgbImage {
    let (w, h) = img.dimensions();
    let longer = w.max(h);
    if longer <= limits.max_side || longer == 0 {
        return img;
    }
    let scale = limits.downscale_to as f32 / longer as f32;
    let new_w = ((w as f32 * scale) as u32).max(1);
    let new_h = ((h as f32 * scale) as u32).max(1);
    imageops::resize(&img, new_w, new_h, FilterType::Triangle)
}

/// Surround `img` with a black border of `ratio` × its longer side on every edge.
///
/// Returns the padded canvas and the margin in pixels.
pub fn pad(img: &RgbImage, ratio: f32) -> (RgbImage, u32) {
    let (w, h) = img.dimensions();
    let margin = (w.max(h) as f32 * ratio) as u32;
    let mut canvas = RgbImage::new(w + 2 * margin, h + 2 * margin);
    imageops::replace(&mut canvas, img, i64::from(margin), i64::from(margin));
    (canvas, margin)
}

/// A rectangular region cut from a larger image.
pub struct Crop {
    pub image: RgbImage,
    /// Left edge of the crop in source coordinates.
    pub x: u32,
    /// Top edge of the crop in source coordinates.
    pub y: u32,
}

/// Cut a centred square of `scale` × the shorter side, clamped to the image.
///
/// Returns `None` if the clamped region is empty.
pub fn center_crop(img: &RgbImage, scale: f32) -> Option<Crop> {
    let (w, h) = img.dimensions();
    let half = ((w.min(h) as f32 * scale) as u32) / 2;
    let (cx, cy) = (w / 2, h / 2);

    let x1 = cx.saturating_sub(half);
    let x2 = (cx + half).min(w);
    let y1 = cy.saturating_sub(half);
    let y2 = (cy + half).min(h);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    let image = imageops::crop_imm(img, x1, y1, x2 - x1, y2 - y1).to_image();
    Some(Crop { image, x: x1, y: y1 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_pad_geometry_and_fill() {
        let img = RgbImage::from_pixel(100, 60, Rgb([200, 100, 50]));
        let (padded, margin) = pad(&img, 0.35);
        assert_eq!(margin, 35);
        assert_eq!(padded.dimensions(), (170, 130));
        assert_eq!(padded.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(padded.get_pixel(35, 35), &Rgb([200, 100, 50]));
        assert_eq!(padded.get_pixel(134, 94), &Rgb([200, 100, 50]));
        assert_eq!(padded.get_pixel(135, 95), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_center_crop_clamps_to_bounds() {
        // shorter side 100 → 140 square, clamped on the short axis
        let img = RgbImage::new(300, 100);
        let crop = center_crop(&img, 1.4).unwrap();
        assert_eq!((crop.x, crop.y), (80, 0));
        assert_eq!(crop.image.dimensions(), (140, 100));
    }

    #[test]
    fn test_center_crop_too_small_is_none() {
        let img = RgbImage::new(1, 1);
        assert!(center_crop(&img, 1.4).is_none());
    }

    #[test]
    fn test_limit_size_downscales_longer_side() {
        let img = RgbImage::new(3200, 1600);
        let out = limit_size(img, DecodeLimits::default());
        assert_eq!(out.dimensions(), (1280, 640));
    }

    #[test]
    fn test_limit_size_keeps_small_images() {
        let img = RgbImage::new(1600, 900);
        let out = limit_size(img, DecodeLimits::default());
        assert_eq!(out.dimensions(), (1600, 900));
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = decode_image(b"definitely not an image", DecodeLimits::default()).unwrap_err();
        assert!(matches!(err, FrameError::Decode(_)));
    }

    #[test]
    fn test_decode_png_roundtrip() {
        let img = RgbImage::from_pixel(8, 4, Rgb([1, 2, 3]));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        let decoded = decode_image(buf.get_ref(), DecodeLimits::default()).unwrap();
        assert_eq!(decoded.dimensions(), (8, 4));
        assert_eq!(decoded.get_pixel(7, 3), &Rgb([1, 2, 3]));
    }

    #[test]
    fn test_read_missing_file_is_io_error() {
        let err = read_image(Path::new("/nonexistent/face.jpg"), DecodeLimits::default()).unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
    }
}
