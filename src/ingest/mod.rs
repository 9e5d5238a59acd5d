//! Frame capture.
//!
//! `FrameSource` produces JPEG stills on demand for the frame scheduler. The
//! backend is selected by the capture URL:
//! - `stub://name`: synthetic moving gradient (tests, demos)
//! - `http(s)://...`: one snapshot per capture from a camera endpoint
//! - anything else: a local image file, re-read on every capture
//!
//! Frames are encoded in memory and never written to disk. Stills whose size
//! differs from the configured source resolution are resized to it, so
//! detections always come back in the coordinate space overlays assume.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{GenericImageView, ImageFormat, RgbImage};
use std::time::Duration;

use crate::detect::{FrameMessage, SourceResolution};

mod file;
mod snapshot;
mod synthetic;

use file::LocalFileSource;
use snapshot::SnapshotSource;
use synthetic::SyntheticSource;

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Capture settings.
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    pub url: String,
    /// Resolution of every emitted frame; detections are projected against it.
    pub resolution: SourceResolution,
    /// JPEG quality, 1..=100.
    pub jpeg_quality: u8,
    /// Per-request timeout for snapshot sources.
    pub request_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            url: "stub://webcam".to_string(),
            resolution: SourceResolution::default(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            request_timeout: Duration::from_secs(2),
        }
    }
}

/// One encoded still.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedFrame {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl EncodedFrame {
    /// `data:image/jpeg;base64,...`
    pub fn to_data_url(&self) -> String {
        format!("data:image/jpeg;base64,{}", BASE64_STANDARD.encode(&self.bytes))
    }

    pub fn to_message(&self) -> FrameMessage {
        FrameMessage {
            frame: self.to_data_url(),
        }
    }
}

/// Statistics for a frame source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameSourceStats {
    pub frames_captured: u64,
    pub failures: u64,
    pub source: String,
    pub healthy: bool,
}

pub struct FrameSource {
    backend: Backend,
    resolution: SourceResolution,
    jpeg_quality: u8,
    frames_captured: u64,
    failures: u64,
    geometry_warned: bool,
}

enum Backend {
    Synthetic(SyntheticSource),
    Snapshot(SnapshotSource),
    File(LocalFileSource),
}

impl FrameSource {
    pub fn new(config: CaptureConfig) -> Result<Self> {
        let url = config.url.trim();
        if url.is_empty() {
            return Err(anyhow!("capture url must not be empty"));
        }
        if config.jpeg_quality == 0 || config.jpeg_quality > 100 {
            return Err(anyhow!(
                "jpeg quality must be within 1..=100 (got {})",
                config.jpeg_quality
            ));
        }
        let backend = if url.starts_with("stub://") {
            Backend::Synthetic(SyntheticSource::new(url, config.resolution, config.jpeg_quality))
        } else if url.starts_with("http://") || url.starts_with("https://") {
            Backend::Snapshot(SnapshotSource::new(
                url,
                config.jpeg_quality,
                config.request_timeout,
            )?)
        } else if url.contains("://") {
            return Err(anyhow!("unsupported capture url '{}'", url));
        } else {
            Backend::File(LocalFileSource::new(url, config.jpeg_quality))
        };
        Ok(Self {
            backend,
            resolution: config.resolution,
            jpeg_quality: config.jpeg_quality,
            frames_captured: 0,
            failures: 0,
            geometry_warned: false,
        })
    }

    pub fn resolution(&self) -> SourceResolution {
        self.resolution
    }

    /// Check the device is reachable.
    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            Backend::Synthetic(source) => source.connect(),
            Backend::Snapshot(source) => source.connect(),
            Backend::File(source) => source.connect(),
        }
    }

    /// Grab and encode one still.
    pub fn capture(&mut self) -> Result<EncodedFrame> {
        let result = match &mut self.backend {
            Backend::Synthetic(source) => source.capture(),
            Backend::Snapshot(source) => source.capture(),
            Backend::File(source) => source.capture(),
        };
        let frame = match result.and_then(|frame| self.fit(frame)) {
            Ok(frame) => frame,
            Err(e) => {
                self.failures += 1;
                return Err(e);
            }
        };
        self.frames_captured += 1;
        Ok(frame)
    }

    fn fit(&mut self, frame: EncodedFrame) -> Result<EncodedFrame> {
        if self.resolution.matches(frame.width, frame.height) {
            return Ok(frame);
        }
        if !self.geometry_warned {
            self.geometry_warned = true;
            log::warn!(
                "captured frame is {}x{} but source resolution is {}; resizing",
                frame.width,
                frame.height,
                self.resolution
            );
        }
        resize_frame(&frame, self.resolution, self.jpeg_quality)
    }

    pub fn is_healthy(&self) -> bool {
        match &self.backend {
            Backend::Synthetic(_) => true,
            Backend::Snapshot(source) => source.is_healthy(),
            Backend::File(source) => source.is_healthy(),
        }
    }

    pub fn stats(&self) -> FrameSourceStats {
        let source = match &self.backend {
            Backend::Synthetic(source) => source.name().to_string(),
            Backend::Snapshot(source) => source.url().to_string(),
            Backend::File(source) => source.path().display().to_string(),
        };
        FrameSourceStats {
            frames_captured: self.frames_captured,
            failures: self.failures,
            source,
            healthy: self.is_healthy(),
        }
    }
}

pub(crate) fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality)
        .encode_image(image)
        .context("encode jpeg")?;
    Ok(bytes)
}

fn resize_frame(
    frame: &EncodedFrame,
    resolution: SourceResolution,
    quality: u8,
) -> Result<EncodedFrame> {
    let image = image::load_from_memory(&frame.bytes).context("decode frame for resize")?;
    let resized = image
        .resize_exact(resolution.width(), resolution.height(), FilterType::Triangle)
        .into_rgb8();
    Ok(EncodedFrame {
        bytes: encode_jpeg(&resized, quality)?,
        width: resolution.width(),
        height: resolution.height(),
    })
}

/// Accept a still from an external source. JPEG input is passed through
/// untouched; other formats are re-encoded.
pub(crate) fn normalize_still(bytes: Vec<u8>, quality: u8) -> Result<EncodedFrame> {
    if bytes.is_empty() {
        return Err(anyhow!("empty image"));
    }
    let image = image::load_from_memory(&bytes).context("decode image")?;
    let (width, height) = image.dimensions();
    let bytes = match image::guess_format(&bytes) {
        Ok(ImageFormat::Jpeg) => bytes,
        _ => encode_jpeg(&image.into_rgb8(), quality)?,
    };
    Ok(EncodedFrame {
        bytes,
        width,
        height,
    })
}
