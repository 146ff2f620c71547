//! Per-frame image transforms.
//!
//! The processing worker only sees the `FrameTransform` trait. `CpuFilter`
//! is the built-in implementation covering every `FilterKind`.

pub mod normalize;

use anyhow::Result;
use image::{imageops, DynamicImage, GrayImage, Luma};

use crate::frame::{FilterKind, RawFrame};

pub use normalize::normalize_to_rgb;

/// Gaussian blur applied before gradient estimation.
pub const EDGE_BLUR_SIGMA: f32 = 1.5;
/// Gradient magnitude below which a pixel is never an edge.
pub const EDGE_LOW_THRESHOLD: f32 = 50.0;
/// Gradient magnitude at or above which a pixel is always an edge.
pub const EDGE_HIGH_THRESHOLD: f32 = 150.0;

/// Transform stage invoked once per dequeued frame.
///
/// Implementations treat the frame as read-only. An `Err` discards only the
/// frame being processed; the worker keeps running.
pub trait FrameTransform: Send {
    /// Transform identifier for logs.
    fn name(&self) -> &'static str;

    fn apply(&mut self, kind: FilterKind, frame: &RawFrame) -> Result<DynamicImage>;
}

/// CPU implementation of all filters.
#[derive(Default)]
pub struct CpuFilter;

impl CpuFilter {
    pub fn new() -> Self {
        Self
    }
}

impl FrameTransform for CpuFilter {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn apply(&mut self, kind: FilterKind, frame: &RawFrame) -> Result<DynamicImage> {
        let rgb = normalize_to_rgb(frame.pixels(), frame.width, frame.height, frame.format)?;
        let image = match kind {
            FilterKind::Passthrough => DynamicImage::ImageRgb8(rgb),
            FilterKind::Grayscale => DynamicImage::ImageLuma8(imageops::grayscale(&rgb)),
            FilterKind::EdgeDetect => {
                DynamicImage::ImageLuma8(detect_edges(&imageops::grayscale(&rgb)))
            }
        };
        Ok(image)
    }
}

/// Binary edge map: blur, Sobel magnitude, double threshold with hysteresis.
pub fn detect_edges(gray: &GrayImage) -> GrayImage {
    let (width, height) = gray.dimensions();
    let mut edges = GrayImage::new(width, height);
    if width < 3 || height < 3 {
        return edges;
    }

    let blurred = imageops::blur(gray, EDGE_BLUR_SIGMA);
    let w = width as usize;
    let h = height as usize;
    let at = |x: usize, y: usize| blurred.get_pixel(x as u32, y as u32)[0] as f32;

    let mut magnitude = vec![0f32; w * h];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = (at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2.0 * at(x - 1, y) + at(x - 1, y + 1));
            let gy = (at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2.0 * at(x, y - 1) + at(x + 1, y - 1));
            magnitude[y * w + x] = (gx * gx + gy * gy).sqrt();
        }
    }

    let strong = |x: usize, y: usize| magnitude[y * w + x] >= EDGE_HIGH_THRESHOLD;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let m = magnitude[y * w + x];
            let is_edge = if m >= EDGE_HIGH_THRESHOLD {
                true
            } else if m >= EDGE_LOW_THRESHOLD {
                (y - 1..=y + 1).any(|ny| (x - 1..=x + 1).any(|nx| strong(nx, ny)))
            } else {
                false
            };
            if is_edge {
                edges.put_pixel(x as u32, y as u32, Luma([255]));
            }
        }
    }
    edges
}
