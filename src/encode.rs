//! Wire encoding for processed frames.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder as ImageJpegEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder};

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Turns a transformed image into the bytes served on `/api/frame`.
pub trait FrameEncoder: Send + Sync {
    /// MIME type of the produced payload.
    fn content_type(&self) -> &'static str;

    fn encode(&self, image: &DynamicImage) -> Result<Vec<u8>>;
}

#[derive(Clone, Copy, Debug)]
pub struct JpegEncoder {
    quality: u8,
}

impl JpegEncoder {
    pub fn new(quality: u8) -> Result<Self> {
        if !(1..=100).contains(&quality) {
            return Err(anyhow!("jpeg quality must be within 1..=100, got {}", quality));
        }
        Ok(Self { quality })
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl Default for JpegEncoder {
    fn default() -> Self {
        Self {
            quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl FrameEncoder for JpegEncoder {
    fn content_type(&self) -> &'static str {
        "image/jpeg"
    }

    fn encode(&self, image: &DynamicImage) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(capacity_hint(image.width(), image.height()));
        let encoder = ImageJpegEncoder::new_with_quality(&mut out, self.quality);
        match image {
            DynamicImage::ImageLuma8(gray) => encoder.write_image(
                gray.as_raw(),
                gray.width(),
                gray.height(),
                ExtendedColorType::L8,
            ),
            other => {
                let rgb = other.to_rgb8();
                encoder.write_image(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
            }
        }
        .context("encode jpeg")?;
        Ok(out)
    }
}

/// Rough compressed size used to presize the output buffer, capped at 4 MiB.
fn capacity_hint(width: u32, height: u32) -> usize {
    const MAX_HINT: usize = 4 << 20;
    ((width as usize).saturating_mul(height as usize) / 4).min(MAX_HINT)
}
