//! Transports to the detection service.
//!
//! A [`Connector`] establishes one kind of [`Session`]. The connection manager
//! tries connectors in preference order (streaming first, request/response as
//! fallback) and never exposes which one won to its callers.
//!
//! The service itself speaks Socket.IO: [`WebSocketConnector`] is the
//! streaming transport and [`PollingConnector`] the long-polling fallback.
//! [`MqttConnector`] and [`HttpConnector`] reach a service bridged onto an
//! MQTT broker or a plain `POST /api/detect` endpoint.
//!
//! Inbound results are pushed through an [`EventSink`] from whatever thread the
//! session reads on. Sessions never call the sink after `close` returns.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::detect::{DetectionEvent, FrameMessage};

pub mod engineio;
pub mod http;
pub mod mqtt;
pub mod polling;
mod tls;
pub mod websocket;

pub use http::HttpConnector;
pub use mqtt::MqttConnector;
pub use polling::PollingConnector;
pub use websocket::WebSocketConnector;
pub use tls::{build_transport, parse_mqtt_endpoint, MqttEndpoint, TlsMaterials};

/// Something a session observed on the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Detection(DetectionEvent),
    /// Closure, protocol or I/O failure; the session is unusable.
    Failed(String),
}

pub type EventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Where the detection service lives.
#[derive(Clone, Debug)]
pub struct ServiceEndpoint {
    /// Base URL for request/response calls (e.g. `http://localhost:5000`).
    pub service_url: Url,
    /// Broker for the streaming transport.
    pub broker: MqttEndpoint,
}

impl ServiceEndpoint {
    pub fn new(service_url: &str, broker_addr: &str) -> Result<Self> {
        let service_url = Url::parse(service_url)
            .map_err(|e| anyhow!("invalid service url '{}': {}", service_url, e))?;
        match service_url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported service url scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        Ok(Self {
            service_url,
            broker: parse_mqtt_endpoint(broker_addr, false)?,
        })
    }

    /// Join a path onto the service URL.
    pub fn api_url(&self, path: &str) -> Result<Url> {
        self.service_url
            .join(path)
            .map_err(|e| anyhow!("invalid api path '{}': {}", path, e))
    }
}

/// Factory for one kind of session.
pub trait Connector: Send + Sync {
    /// Transport identifier used in logs.
    fn name(&self) -> &'static str;

    /// Establish a session, giving up after `timeout`.
    fn connect(
        &self,
        endpoint: &ServiceEndpoint,
        timeout: Duration,
        sink: EventSink,
    ) -> Result<Box<dyn Session>>;
}

/// An established session.
pub trait Session: Send {
    fn transport(&self) -> &'static str;

    /// Transmit one frame. An error means the session is no longer usable.
    fn send_frame(&mut self, frame: &FrameMessage) -> Result<()>;

    /// Release sockets and threads. Idempotent.
    fn close(&mut self);
}
