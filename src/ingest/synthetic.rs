//! Synthetic source (stub://) for tests and demos.

use anyhow::Result;
use image::{Rgb, RgbImage};

use super::{encode_jpeg, EncodedFrame};
use crate::detect::SourceResolution;

pub(super) struct SyntheticSource {
    name: String,
    resolution: SourceResolution,
    quality: u8,
    frame_count: u64,
}

impl SyntheticSource {
    pub(super) fn new(name: &str, resolution: SourceResolution, quality: u8) -> Self {
        Self {
            name: name.to_string(),
            resolution,
            quality,
            frame_count: 0,
        }
    }

    pub(super) fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn connect(&mut self) -> Result<()> {
        log::info!(
            "FrameSource: connected to {} (synthetic {})",
            self.name,
            self.resolution
        );
        Ok(())
    }

    pub(super) fn capture(&mut self) -> Result<EncodedFrame> {
        self.frame_count += 1;
        let (width, height) = (self.resolution.width(), self.resolution.height());
        let shift = self.frame_count;
        let image = RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                ((x as u64 + shift) % 256) as u8,
                ((y as u64 + shift) % 256) as u8,
                ((shift / 10) % 256) as u8,
            ])
        });
        Ok(EncodedFrame {
            bytes: encode_jpeg(&image, self.quality)?,
            width,
            height,
        })
    }
}
