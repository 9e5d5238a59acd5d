//! Plain request/response transport for a bridged service.
//!
//! Each frame is a `POST {service}/api/detect` carrying the frame message; the
//! response body is the detection result for that frame. The stock service
//! has no such route; it needs an HTTP bridge in front of it.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::Duration;
use url::Url;

use super::{Connector, EventSink, ServiceEndpoint, Session, TransportEvent};
use crate::detect::{parse_detection_event, FrameMessage};

const HEALTH_PATH: &str = "/";
const DETECT_PATH: &str = "/api/detect";
const MAX_RESULT_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct HttpConnector {
    request_timeout: Duration,
}

impl HttpConnector {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl Connector for HttpConnector {
    fn name(&self) -> &'static str {
        "http"
    }

    fn connect(
        &self,
        endpoint: &ServiceEndpoint,
        timeout: Duration,
        sink: EventSink,
    ) -> Result<Box<dyn Session>> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout(self.request_timeout)
            .build();
        let health = endpoint.api_url(HEALTH_PATH)?;
        agent
            .get(health.as_str())
            .call()
            .with_context(|| format!("reach detection service at {}", health))?;
        let detect_url = endpoint.api_url(DETECT_PATH)?;
        log::debug!("http transport ready: {}", detect_url);
        Ok(Box::new(HttpSession {
            agent,
            detect_url,
            sink,
            closed: false,
        }))
    }
}

struct HttpSession {
    agent: ureq::Agent,
    detect_url: Url,
    sink: EventSink,
    closed: bool,
}

impl Session for HttpSession {
    fn transport(&self) -> &'static str {
        "http"
    }

    fn send_frame(&mut self, frame: &FrameMessage) -> Result<()> {
        if self.closed {
            return Err(anyhow!("http session closed"));
        }
        let body = frame.to_json()?;
        let response = self
            .agent
            .post(self.detect_url.as_str())
            .set("Content-Type", "application/json")
            .send_bytes(&body)
            .with_context(|| format!("post frame to {}", self.detect_url))?;
        let mut payload = Vec::new();
        response
            .into_reader()
            .take(MAX_RESULT_BYTES)
            .read_to_end(&mut payload)
            .context("read detection result")?;
        if let Some(event) = parse_detection_event(&payload)? {
            (self.sink)(TransportEvent::Detection(event));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
