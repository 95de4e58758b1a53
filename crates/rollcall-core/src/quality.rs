//! Local image quality gate: canonical resize, grayscale, intensity variance.
//!
//! Variance of pixel intensity is a crude blur/contrast proxy. Frames that
//! fall below the floor are rejected before any embedding call is made.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use std::io::Cursor;
use thiserror::Error;

/// Canonical edge length the scan image is resized to.
pub const CANONICAL_SIZE: u32 = 224;
/// Minimum grayscale variance (0–255 intensity scale).
pub const MIN_VARIANCE: f64 = 500.0;
/// JPEG quality for the re-encoded scan image.
const JPEG_QUALITY: u8 = 80;

#[derive(Error, Debug)]
pub enum QualityError {
    #[error("image processing failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("image has no pixels")]
    Empty,
}

/// Outcome of preprocessing a submitted image.
#[derive(Debug, Clone)]
pub struct Assessment {
    /// Population variance of grayscale intensity.
    pub variance: f64,
    /// Resized image, re-encoded as JPEG.
    pub processed: Vec<u8>,
}

impl Assessment {
    pub fn passes(&self, floor: f64) -> bool {
        self.variance >= floor
    }
}

/// Decode, resize to `size`x`size`, measure grayscale variance and re-encode.
pub fn assess(image_bytes: &[u8], size: u32) -> Result<Assessment, QualityError> {
    let decoded = image::load_from_memory(image_bytes)?;
    let resized = decoded.resize_exact(size, size, FilterType::Triangle);

    let gray = resized.to_luma8();
    let variance = intensity_variance(gray.as_raw()).ok_or(QualityError::Empty)?;

    let rgb = resized.to_rgb8();
    let mut processed = Vec::new();
    JpegEncoder::new_with_quality(Cursor::new(&mut processed), JPEG_QUALITY).encode_image(&rgb)?;

    tracing::debug!(variance, bytes = processed.len(), "image assessed");
    Ok(Assessment { variance, processed })
}

/// Population variance of 8-bit intensities, `None` for an empty buffer.
pub fn intensity_variance(gray: &[u8]) -> Option<f64> {
    if gray.is_empty() {
        return None;
    }
    let n = gray.len() as f64;
    let (sum, sum_sq) = gray.iter().fold((0.0f64, 0.0f64), |(s, sq), &p| {
        let v = p as f64;
        (s + v, sq + v * v)
    });
    let mean = sum / n;
    Some((sum_sq / n - mean * mean).max(0.0))
}
