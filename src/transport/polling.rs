//! Socket.IO over Engine.IO long-polling: the request-based fallback.
//!
//! Each frame is a `POST` of one event packet; results arrive on a reader
//! thread that keeps one long-poll `GET` outstanding.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

use super::engineio::{self, Handshake, Inbound};
use super::{Connector, EventSink, ServiceEndpoint, Session, TransportEvent};
use crate::detect::FrameMessage;
use crate::lock_or_recover;

const MAX_PAYLOAD_BYTES: u64 = 8 * 1024 * 1024;
const POLL_MARGIN: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct PollingConnector {
    request_timeout: Duration,
}

impl PollingConnector {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Default for PollingConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl Connector for PollingConnector {
    fn name(&self) -> &'static str {
        "polling"
    }

    fn connect(
        &self,
        endpoint: &ServiceEndpoint,
        timeout: Duration,
        sink: EventSink,
    ) -> Result<Box<dyn Session>> {
        let deadline = Instant::now() + timeout;
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout(timeout)
            .build();
        let base = engineio::session_url(&endpoint.service_url, "polling")?;

        let body = fetch(&agent, &base).with_context(|| format!("engine.io open at {}", base))?;
        let handshake = match engineio::split_payload(&body).next().map(engineio::decode) {
            Some(Ok(Inbound::Open(handshake))) => handshake,
            Some(Err(e)) => return Err(e.context(format!("engine.io open at {}", base))),
            _ => return Err(anyhow!("engine.io open at {}: no handshake", base)),
        };
        let mut session_url = base.clone();
        session_url
            .query_pairs_mut()
            .append_pair("sid", &handshake.sid);

        post(&agent, &session_url, engineio::CONNECT).context("send namespace connect")?;
        await_namespace(&agent, &session_url, deadline, &sink)
            .with_context(|| format!("socket.io connect to {}", base))?;
        log::debug!(
            "polling transport ready: {} (sid {})",
            base,
            handshake.sid
        );

        let shared = Arc::new(Shared {
            session_url,
            sender: ureq::AgentBuilder::new()
                .timeout_connect(timeout)
                .timeout(self.request_timeout)
                .build(),
            closing: AtomicBool::new(false),
            delivery: std::sync::Mutex::new(()),
        });
        let poller = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout(handshake.liveness() + POLL_MARGIN)
            .build();
        let reader_shared = shared.clone();
        // Detached: the reader exits once its outstanding poll returns.
        std::thread::Builder::new()
            .name("polling-session".to_string())
            .spawn(move || run_reader(&poller, &reader_shared, &handshake, &sink))
            .map_err(|e| anyhow!("spawn polling reader: {}", e))?;
        Ok(Box::new(PollingSession { shared }))
    }
}

struct Shared {
    session_url: Url,
    sender: ureq::Agent,
    closing: AtomicBool,
    /// Held while a detection is handed to the sink, and by `close`.
    delivery: std::sync::Mutex<()>,
}

fn fetch(agent: &ureq::Agent, url: &Url) -> Result<String> {
    let response = agent.get(url.as_str()).call()?;
    let mut body = String::new();
    response
        .into_reader()
        .take(MAX_PAYLOAD_BYTES)
        .read_to_string(&mut body)
        .context("read engine.io payload")?;
    Ok(body)
}

fn post(agent: &ureq::Agent, url: &Url, packet: &str) -> Result<()> {
    agent
        .post(url.as_str())
        .set("Content-Type", "text/plain;charset=UTF-8")
        .send_string(packet)
        .with_context(|| format!("post to {}", url))?;
    Ok(())
}

fn await_namespace(
    agent: &ureq::Agent,
    url: &Url,
    deadline: Instant,
    sink: &EventSink,
) -> Result<()> {
    while Instant::now() < deadline {
        let body = fetch(agent, url)?;
        // The ack may share a batch with a heartbeat; handle the whole batch.
        let mut connected = false;
        for packet in engineio::split_payload(&body) {
            match engineio::decode(packet)? {
                Inbound::Connected => connected = true,
                Inbound::Ping => post(agent, url, engineio::PONG)?,
                Inbound::Closed(reason) => return Err(anyhow!(reason)),
                Inbound::Detection(event) => sink(TransportEvent::Detection(event)),
                Inbound::Open(_) | Inbound::Ignored => {}
            }
        }
        if connected {
            return Ok(());
        }
    }
    Err(anyhow!("timed out waiting for namespace acknowledgement"))
}

fn run_reader(poller: &ureq::Agent, shared: &Shared, handshake: &Handshake, sink: &EventSink) {
    let fail = |message: String| {
        if !shared.closing.load(Ordering::SeqCst) {
            sink(TransportEvent::Failed(message));
        }
    };
    while !shared.closing.load(Ordering::SeqCst) {
        let body = match fetch(poller, &shared.session_url) {
            Ok(body) => body,
            Err(e) => {
                fail(format!("engine.io poll (sid {}): {:#}", handshake.sid, e));
                return;
            }
        };
        for packet in engineio::split_payload(&body) {
            match engineio::decode(packet) {
                Ok(Inbound::Ping) => {
                    if let Err(e) = post(&shared.sender, &shared.session_url, engineio::PONG) {
                        fail(format!("{:#}", e));
                        return;
                    }
                }
                Ok(Inbound::Detection(event)) => {
                    let _delivery = lock_or_recover(&shared.delivery);
                    if !shared.closing.load(Ordering::SeqCst) {
                        sink(TransportEvent::Detection(event));
                    }
                }
                Ok(Inbound::Closed(reason)) => {
                    fail(reason);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    fail(e.to_string());
                    return;
                }
            }
        }
    }
}

struct PollingSession {
    shared: Arc<Shared>,
}

impl Session for PollingSession {
    fn transport(&self) -> &'static str {
        "polling"
    }

    fn send_frame(&mut self, frame: &FrameMessage) -> Result<()> {
        if self.shared.closing.load(Ordering::SeqCst) {
            return Err(anyhow!("polling session closed"));
        }
        post(
            &self.shared.sender,
            &self.shared.session_url,
            &engineio::frame_packet(frame)?,
        )
        .context("send frame event")
    }

    fn close(&mut self) {
        {
            let _delivery = lock_or_recover(&self.shared.delivery);
            if self.shared.closing.swap(true, Ordering::SeqCst) {
                return;
            }
        }
        // Ends the outstanding long-poll on the server side.
        let packets = format!("{}\u{1e}{}", engineio::DISCONNECT, engineio::CLOSE);
        if let Err(e) = post(&self.shared.sender, &self.shared.session_url, &packets) {
            log::debug!("polling close: {:#}", e);
        }
    }
}

impl Drop for PollingSession {
    fn drop(&mut self) {
        self.close();
    }
}
