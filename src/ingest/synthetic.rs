//! Moving test-pattern camera.

use anyhow::{anyhow, Result};

use super::{FrameSource, SourceStats};
use crate::frame::{PixelFormat, RawFrame};

/// Emits `Rgb24` frames: a diagonal gradient with a bright bar that sweeps
/// across the image, so the edge filter always has something to find.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            frame_count: 0,
        }
    }

    fn render(&self) -> Result<Vec<u8>> {
        let len = PixelFormat::Rgb24
            .frame_len(self.width, self.height)
            .ok_or_else(|| anyhow!("{}x{} frame does not fit in memory", self.width, self.height))?;
        let (width, height) = (self.width as u64, self.height as u64);
        let bar_width = (width / 8).max(1);
        let bar_start = self.frame_count.wrapping_mul(4) % width;
        let b = (self.frame_count % 256) as u8;
        let mut pixels = Vec::with_capacity(len);
        for y in 0..height {
            let g = (y * 255 / height) as u8;
            for x in 0..width {
                if x >= bar_start && x < bar_start + bar_width {
                    pixels.extend_from_slice(&[255, 255, 255]);
                } else {
                    let r = (x * 255 / width) as u8;
                    pixels.extend_from_slice(&[r / 2, g / 2, b / 2]);
                }
            }
        }
        Ok(pixels)
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        log::info!("synthetic source ready ({}x{})", self.width, self.height);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<RawFrame> {
        let pixels = self.render()?;
        self.frame_count += 1;
        Ok(RawFrame::new(
            self.frame_count,
            pixels,
            self.width,
            self.height,
            PixelFormat::Rgb24,
        ))
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            name: "synthetic".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_start_at_one_and_increase() -> Result<()> {
        let mut source = SyntheticSource::new(8, 4);
        let ids: Vec<u64> = (0..3).map(|_| source.next_frame().map(|f| f.id)).collect::<Result<_>>()?;
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(source.stats().frames_captured, 3);
        Ok(())
    }

    #[test]
    fn frames_match_declared_format() -> Result<()> {
        let mut source = SyntheticSource::new(10, 6);
        let frame = source.next_frame()?;
        assert_eq!(frame.format, PixelFormat::Rgb24);
        assert_eq!(Some(frame.byte_len()), PixelFormat::Rgb24.frame_len(10, 6));
        Ok(())
    }

    #[test]
    fn oversized_frame_is_an_error() {
        let mut source = SyntheticSource::new(u32::MAX, u32::MAX);
        assert!(source.next_frame().is_err());
        assert_eq!(source.stats().frames_captured, 0);
    }

    #[test]
    fn pattern_moves_between_frames() -> Result<()> {
        let mut source = SyntheticSource::new(32, 4);
        let first = source.next_frame()?;
        let second = source.next_frame()?;
        assert_ne!(first.pixels(), second.pixels());
        Ok(())
    }
}
