//! Local still image, re-read on every capture.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use super::{normalize_still, EncodedFrame};

pub(super) struct LocalFileSource {
    path: PathBuf,
    quality: u8,
}

impl LocalFileSource {
    pub(super) fn new(path: &str, quality: u8) -> Self {
        Self {
            path: PathBuf::from(path),
            quality,
        }
    }

    pub(super) fn path(&self) -> &Path {
        &self.path
    }

    pub(super) fn connect(&mut self) -> Result<()> {
        if !self.path.is_file() {
            return Err(anyhow!("capture file {} not found", self.path.display()));
        }
        log::info!("FrameSource: connected to {}", self.path.display());
        Ok(())
    }

    pub(super) fn capture(&mut self) -> Result<EncodedFrame> {
        let bytes = std::fs::read(&self.path)
            .with_context(|| format!("read capture file {}", self.path.display()))?;
        normalize_still(bytes, self.quality)
            .with_context(|| format!("capture file {}", self.path.display()))
    }

    pub(super) fn is_healthy(&self) -> bool {
        self.path.is_file()
    }
}
