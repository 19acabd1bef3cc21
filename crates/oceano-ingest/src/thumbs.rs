//! Small JPEG previews for search results.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;

pub const THUMB_SIDE: u32 = 160;
const JPEG_QUALITY: u8 = 85;

/// Writes `<dir>/<thumb_id>.jpg`, bounded to 160×160, at most once per id.
#[derive(Debug, Clone)]
pub struct ThumbnailWriter {
    dir: PathBuf,
}

impl ThumbnailWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, thumb_id: &str) -> PathBuf {
        self.dir.join(format!("{thumb_id}.jpg"))
    }

    /// Write the thumbnail unless it already exists. Returns whether a file
    /// was written.
    pub fn write(&self, image: &RgbImage, thumb_id: &str) -> Result<bool, image::ImageError> {
        let path = self.path_for(thumb_id);
        if path.exists() {
            return Ok(false);
        }
        std::fs::create_dir_all(&self.dir)?;
        let thumb = bounded(image, THUMB_SIDE);
        let mut out = BufWriter::new(File::create(&path)?);
        JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).encode_image(&thumb)?;
        Ok(true)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Shrink to fit inside `side`×`side`, keeping aspect ratio. Never enlarges.
fn bounded(image: &RgbImage, side: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    if w <= side && h <= side {
        return image.clone();
    }
    let scale = side as f32 / w.max(h) as f32;
    let nw = ((w as f32 * scale).round() as u32).clamp(1, side);
    let nh = ((h as f32 * scale).round() as u32).clamp(1, side);
    imageops::resize(image, nw, nh, FilterType::Triangle)
}
