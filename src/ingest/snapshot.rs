//! Camera snapshot endpoint: one HTTP GET per capture.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::Duration;

use super::{normalize_still, EncodedFrame};

const MAX_SNAPSHOT_BYTES: u64 = 16 * 1024 * 1024;
const UNHEALTHY_AFTER_FAILURES: u32 = 3;

pub(super) struct SnapshotSource {
    url: String,
    quality: u8,
    agent: ureq::Agent,
    consecutive_failures: u32,
}

impl SnapshotSource {
    pub(super) fn new(url: &str, quality: u8, timeout: Duration) -> Result<Self> {
        url::Url::parse(url).map_err(|e| anyhow!("invalid snapshot url '{}': {}", url, e))?;
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout(timeout)
            .build();
        Ok(Self {
            url: url.to_string(),
            quality,
            agent,
            consecutive_failures: 0,
        })
    }

    pub(super) fn url(&self) -> &str {
        &self.url
    }

    pub(super) fn connect(&mut self) -> Result<()> {
        self.capture()?;
        log::info!("FrameSource: connected to {}", self.url);
        Ok(())
    }

    pub(super) fn capture(&mut self) -> Result<EncodedFrame> {
        match self.fetch() {
            Ok(frame) => {
                self.consecutive_failures = 0;
                Ok(frame)
            }
            Err(e) => {
                self.consecutive_failures += 1;
                Err(e)
            }
        }
    }

    pub(super) fn is_healthy(&self) -> bool {
        self.consecutive_failures < UNHEALTHY_AFTER_FAILURES
    }

    fn fetch(&self) -> Result<EncodedFrame> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("fetch snapshot from {}", self.url))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_SNAPSHOT_BYTES)
            .read_to_end(&mut bytes)
            .context("read snapshot")?;
        if bytes.is_empty() {
            return Err(anyhow!("empty snapshot from {}", self.url));
        }
        normalize_still(bytes, self.quality)
    }
}
