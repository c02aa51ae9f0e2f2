use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;

use crate::models::analysis::CompressionSummary;
use crate::services::image_validation::{ImageMime, ValidatedImage};

/// Default budget images are squeezed into before inference (5 MiB).
pub const DEFAULT_COMPRESSION_TARGET_BYTES: usize = 5 * 1024 * 1024;

const START_QUALITY: u8 = 85;
const MIN_QUALITY: u8 = 40;
const QUALITY_STEP: u8 = 15;

/// Longest edge kept before any quality stepping.
const MAX_EDGE: u32 = 2048;
/// Downscaling stops once the longest edge is at or below this.
const MIN_EDGE: u32 = 256;

#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub image: ValidatedImage,
    pub original_size: usize,
    pub compressed_size: usize,
    pub compression_ratio: f64,
    /// Encoder quality as a 0–1 factor; 1 means untouched.
    pub quality: f32,
}

impl CompressionResult {
    pub fn is_identity(&self) -> bool {
        self.quality >= 1.0 && self.original_size == self.compressed_size
    }

    pub fn summary(&self) -> CompressionSummary {
        CompressionSummary {
            original_size: self.original_size,
            compressed_size: self.compressed_size,
            compression_ratio: self.compression_ratio,
            quality: self.quality,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("Failed to decode image for compression: {0}")]
    Decode(#[source] image::ImageError),

    #[error("Failed to re-encode image: {0}")]
    Encode(#[source] image::ImageError),
}

/// Fit an image under `max_bytes`.
///
/// Images already within budget come back byte-for-byte with ratio 1 and
/// quality 1. Larger images are re-encoded as JPEG, stepping quality down to a
/// floor and then shrinking dimensions. The smallest encoding seen is returned
/// even if it is still over budget; the caller decides whether to reject it.
pub fn compress(
    image: &ValidatedImage,
    max_bytes: usize,
) -> Result<CompressionResult, CompressionError> {
    let original_size = image.size_bytes();
    if original_size <= max_bytes {
        return Ok(identity(image));
    }

    let decoded = image::load_from_memory(&image.bytes).map_err(CompressionError::Decode)?;
    let mut frame = shrink_to(decoded, MAX_EDGE);

    let mut best = (encode_jpeg(&frame, START_QUALITY)?, START_QUALITY);
    let mut quality = START_QUALITY;

    'search: loop {
        while best.0.len() > max_bytes && quality > MIN_QUALITY {
            quality = quality.saturating_sub(QUALITY_STEP).max(MIN_QUALITY);
            let encoded = encode_jpeg(&frame, quality)?;
            if encoded.len() < best.0.len() {
                best = (encoded, quality);
            }
        }

        if best.0.len() <= max_bytes {
            break 'search;
        }

        let longest = frame.width().max(frame.height());
        if longest <= MIN_EDGE {
            break 'search;
        }
        frame = shrink_to(frame, (longest * 3 / 4).max(MIN_EDGE));
        quality = START_QUALITY;
        let encoded = encode_jpeg(&frame, quality)?;
        if encoded.len() < best.0.len() {
            best = (encoded, quality);
        }
    }

    let (bytes, quality) = best;
    if bytes.len() >= original_size {
        tracing::debug!(
            original_size,
            best_encoding = bytes.len(),
            "Re-encoding did not shrink the image; keeping original bytes"
        );
        return Ok(identity(image));
    }
    let compressed_size = bytes.len();
    tracing::debug!(
        original_size,
        compressed_size,
        quality,
        within_budget = compressed_size <= max_bytes,
        "Image compressed"
    );

    Ok(CompressionResult {
        image: ValidatedImage {
            mime: ImageMime::Jpeg,
            bytes,
        },
        original_size,
        compressed_size,
        compression_ratio: compressed_size as f64 / original_size as f64,
        quality: f32::from(quality) / 100.0,
    })
}

fn identity(image: &ValidatedImage) -> CompressionResult {
    let size = image.size_bytes();
    CompressionResult {
        image: image.clone(),
        original_size: size,
        compressed_size: size,
        compression_ratio: 1.0,
        quality: 1.0,
    }
}

fn shrink_to(frame: DynamicImage, max_edge: u32) -> DynamicImage {
    if frame.width().max(frame.height()) <= max_edge {
        return frame;
    }
    frame.resize(max_edge, max_edge, FilterType::Triangle)
}

fn encode_jpeg(frame: &DynamicImage, quality: u8) -> Result<Vec<u8>, CompressionError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality)
        .encode_image(&frame.to_rgb8())
        .map_err(CompressionError::Encode)?;
    Ok(buf)
}
