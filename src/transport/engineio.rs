//! Engine.IO v4 / Socket.IO v5 packet framing for the detection service.
//!
//! The service speaks Socket.IO on the default namespace: frames go out as
//! `42["video_frame",{"frame":...}]` and results come back as
//! `42["detection_result",{...}]`. Engine.IO wraps those in one-character
//! packet types; the polling transport batches packets separated by `0x1e`.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::detect::{DetectionEvent, FrameMessage};

pub const ENGINE_IO_PATH: &str = "/socket.io/";
pub const FRAME_EVENT: &str = "video_frame";
pub const RESULT_EVENT: &str = "detection_result";

pub const CONNECT: &str = "40";
pub const DISCONNECT: &str = "41";
pub const CLOSE: &str = "1";
pub const PONG: &str = "3";

const RECORD_SEPARATOR: char = '\u{1e}';

/// Open packet payload: `0{"sid":"...","pingInterval":25000,...}`.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

impl Handshake {
    /// Longest the server may stay silent before the session counts as dead.
    pub fn liveness(&self) -> Duration {
        Duration::from_millis(self.ping_interval + self.ping_timeout)
    }
}

/// What one inbound Engine.IO packet means to a session.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Open(Handshake),
    /// Server heartbeat; answer with [`PONG`].
    Ping,
    /// Namespace connect acknowledged.
    Connected,
    Detection(DetectionEvent),
    /// Closed by the server or refused; the session is over.
    Closed(String),
    /// Noop, pong, acks and events nobody listens for.
    Ignored,
}

/// Classify one packet.
pub fn decode(packet: &str) -> Result<Inbound> {
    let mut chars = packet.chars();
    let kind = chars
        .next()
        .ok_or_else(|| anyhow!("empty engine.io packet"))?;
    let body = chars.as_str();
    match kind {
        '0' => serde_json::from_str(body)
            .map(Inbound::Open)
            .map_err(|e| anyhow!("invalid engine.io handshake: {}", e)),
        '1' => Ok(Inbound::Closed("server closed the session".to_string())),
        '2' => Ok(Inbound::Ping),
        '3' | '5' | '6' => Ok(Inbound::Ignored),
        '4' => decode_socket_packet(body),
        other => Err(anyhow!("unknown engine.io packet type '{}'", other)),
    }
}

fn decode_socket_packet(packet: &str) -> Result<Inbound> {
    let mut chars = packet.chars();
    let kind = chars
        .next()
        .ok_or_else(|| anyhow!("empty socket.io packet"))?;
    let body = chars.as_str();
    match kind {
        '0' => Ok(Inbound::Connected),
        '1' => Ok(Inbound::Closed("server disconnected the namespace".to_string())),
        '2' => decode_event(body),
        '4' => Ok(Inbound::Closed(format!("namespace connect refused: {}", body))),
        _ => Ok(Inbound::Ignored),
    }
}

fn decode_event(body: &str) -> Result<Inbound> {
    // An ack id may precede the array.
    let start = body
        .find('[')
        .ok_or_else(|| anyhow!("socket.io event without arguments"))?;
    let args: Vec<Value> = serde_json::from_str(&body[start..])
        .map_err(|e| anyhow!("invalid socket.io event: {}", e))?;
    let mut args = args.into_iter();
    let name = match args.next() {
        Some(Value::String(name)) => name,
        _ => return Err(anyhow!("socket.io event without a name")),
    };
    if name != RESULT_EVENT {
        log::debug!("ignoring socket.io event '{}'", name);
        return Ok(Inbound::Ignored);
    }
    match args.next() {
        None | Some(Value::Null) => Ok(Inbound::Ignored),
        Some(data) => serde_json::from_value(data)
            .map(Inbound::Detection)
            .map_err(|e| anyhow!("parse detection result: {}", e)),
    }
}

/// `42["video_frame",{"frame":"data:..."}]`
pub fn frame_packet(frame: &FrameMessage) -> Result<String> {
    let args = serde_json::to_string(&(FRAME_EVENT, frame))
        .map_err(|e| anyhow!("encode frame event: {}", e))?;
    Ok(format!("42{}", args))
}

/// Split a polling response body into packets.
pub fn split_payload(body: &str) -> impl Iterator<Item = &str> {
    body.split(RECORD_SEPARATOR).filter(|p| !p.is_empty())
}

/// `{service}/socket.io/?EIO=4&transport=<transport>`, with a `ws(s)` scheme
/// for the websocket transport.
pub fn session_url(service: &Url, transport: &str) -> Result<Url> {
    let mut url = service
        .join(ENGINE_IO_PATH)
        .map_err(|e| anyhow!("invalid engine.io path: {}", e))?;
    if transport == "websocket" {
        let scheme = match url.scheme() {
            "https" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot derive websocket url from {}", service))?;
    }
    url.query_pairs_mut()
        .append_pair("EIO", "4")
        .append_pair("transport", transport);
    Ok(url)
}
