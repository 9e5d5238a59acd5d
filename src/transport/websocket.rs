//! Socket.IO over a websocket: the service's streaming transport.
//!
//! One I/O thread owns the socket. It alternates between draining the
//! outbound queue and a short blocking read, answers heartbeats, and reports
//! the session dead when the server stays silent past its advertised
//! ping interval plus timeout.

use anyhow::{anyhow, Result};
use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};
use url::Url;

use super::engineio::{self, Handshake, Inbound};
use super::{Connector, EventSink, ServiceEndpoint, Session, TransportEvent};
use crate::detect::FrameMessage;

const OUTBOUND_CAPACITY: usize = 10;
const READ_SLICE: Duration = Duration::from_millis(20);

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Debug, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn connect(
        &self,
        endpoint: &ServiceEndpoint,
        timeout: Duration,
        sink: EventSink,
    ) -> Result<Box<dyn Session>> {
        let url = engineio::session_url(&endpoint.service_url, "websocket")?;
        let deadline = Instant::now() + timeout;
        let stream = open_tcp(&url, timeout)?;
        let raw = stream
            .try_clone()
            .map_err(|e| anyhow!("clone websocket stream: {}", e))?;
        let (mut socket, _) = tungstenite::client_tls_with_config(url.as_str(), stream, None, None)
            .map_err(|e| anyhow!("websocket handshake with {}: {}", url, e))?;

        let handshake = open_namespace(&mut socket, &raw, deadline)
            .map_err(|e| anyhow!("socket.io connect to {}: {}", url, e))?;
        raw.set_read_timeout(Some(READ_SLICE))
            .map_err(|e| anyhow!("set websocket read timeout: {}", e))?;
        log::debug!(
            "websocket transport ready: {} (sid {}, ping {}ms)",
            url,
            handshake.sid,
            handshake.ping_interval
        );

        let (outbound_tx, outbound_rx) = mpsc::sync_channel(OUTBOUND_CAPACITY);
        let closing = Arc::new(AtomicBool::new(false));
        let io = {
            let closing = closing.clone();
            let liveness = handshake.liveness();
            std::thread::Builder::new()
                .name("websocket-session".to_string())
                .spawn(move || run_io(socket, outbound_rx, liveness, &closing, &sink))
                .map_err(|e| anyhow!("spawn websocket reader: {}", e))?
        };
        Ok(Box::new(WebSocketSession {
            outbound: outbound_tx,
            closing,
            io: Some(io),
        }))
    }
}

fn open_tcp(url: &Url, timeout: Duration) -> Result<TcpStream> {
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("websocket url {} has no host", url))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("websocket url {} has no port", url))?;
    let addr = (host.trim_matches(|c| c == '[' || c == ']'), port)
        .to_socket_addrs()
        .map_err(|e| anyhow!("resolve {}:{}: {}", host, port, e))?
        .next()
        .ok_or_else(|| anyhow!("resolve {}:{}: no addresses", host, port))?;
    let stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| anyhow!("connect to {}: {}", addr, e))?;
    stream
        .set_read_timeout(Some(timeout))
        .and_then(|_| stream.set_write_timeout(Some(timeout)))
        .and_then(|_| stream.set_nodelay(true))
        .map_err(|e| anyhow!("configure socket: {}", e))?;
    Ok(stream)
}

/// Wait for the Engine.IO open packet, join the default namespace and wait
/// for the acknowledgement.
fn open_namespace(socket: &mut Socket, raw: &TcpStream, deadline: Instant) -> Result<Handshake> {
    let mut handshake = None;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(anyhow!("timed out waiting for the server"));
        }
        raw.set_read_timeout(Some(remaining))
            .map_err(|e| anyhow!("set read timeout: {}", e))?;
        let text = match socket.read() {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => return Err(anyhow!("server closed the websocket")),
            Ok(_) => continue,
            Err(e) if is_timeout(&e) => return Err(anyhow!("timed out waiting for the server")),
            Err(e) => return Err(anyhow!("{}", e)),
        };
        match engineio::decode(&text)? {
            Inbound::Open(open) => {
                socket
                    .send(Message::Text(engineio::CONNECT.to_string()))
                    .map_err(|e| anyhow!("send namespace connect: {}", e))?;
                handshake = Some(open);
            }
            Inbound::Ping => socket
                .send(Message::Text(engineio::PONG.to_string()))
                .map_err(|e| anyhow!("send pong: {}", e))?,
            Inbound::Connected => {
                return handshake.ok_or_else(|| anyhow!("namespace ack before handshake"))
            }
            Inbound::Closed(reason) => return Err(anyhow!(reason)),
            Inbound::Detection(_) | Inbound::Ignored => {}
        }
    }
}

fn run_io(
    mut socket: Socket,
    outbound: Receiver<String>,
    liveness: Duration,
    closing: &AtomicBool,
    sink: &EventSink,
) {
    let fail = |message: String| {
        if !closing.load(Ordering::SeqCst) {
            sink(TransportEvent::Failed(message));
        }
    };
    let mut last_heard = Instant::now();
    loop {
        if closing.load(Ordering::SeqCst) {
            let _ = socket.send(Message::Text(engineio::DISCONNECT.to_string()));
            let _ = socket.close(None);
            let _ = socket.flush();
            return;
        }
        loop {
            match outbound.try_recv() {
                Ok(packet) => {
                    if let Err(e) = socket.send(Message::Text(packet)) {
                        fail(format!("websocket send: {}", e));
                        return;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    closing.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }
        match socket.read() {
            Ok(Message::Text(text)) => {
                last_heard = Instant::now();
                match engineio::decode(&text) {
                    Ok(Inbound::Ping) => {
                        if let Err(e) = socket.send(Message::Text(engineio::PONG.to_string())) {
                            fail(format!("websocket send: {}", e));
                            return;
                        }
                    }
                    Ok(Inbound::Detection(event)) => {
                        if !closing.load(Ordering::SeqCst) {
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
            Ok(Message::Close(_)) => {
                fail("server closed the websocket".to_string());
                return;
            }
            Ok(_) => last_heard = Instant::now(),
            Err(e) if is_timeout(&e) => {
                if last_heard.elapsed() > liveness {
                    fail(format!(
                        "no heartbeat from server in {}ms",
                        liveness.as_millis()
                    ));
                    return;
                }
            }
            Err(e) => {
                fail(format!("websocket read: {}", e));
                return;
            }
        }
    }
}

fn is_timeout(e: &tungstenite::Error) -> bool {
    matches!(
        e,
        tungstenite::Error::Io(io) if matches!(io.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
    )
}

struct WebSocketSession {
    outbound: SyncSender<String>,
    closing: Arc<AtomicBool>,
    io: Option<JoinHandle<()>>,
}

impl Session for WebSocketSession {
    fn transport(&self) -> &'static str {
        "websocket"
    }

    fn send_frame(&mut self, frame: &FrameMessage) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(anyhow!("websocket session closed"));
        }
        match self.outbound.try_send(engineio::frame_packet(frame)?) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                log::debug!("websocket frame dropped: outbound queue full");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(anyhow!("websocket session ended")),
        }
    }

    fn close(&mut self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(io) = self.io.take() {
            // A failure reported by the I/O thread closes the session on that thread.
            if io.thread().id() != std::thread::current().id() {
                let _ = io.join();
            }
        }
    }
}

impl Drop for WebSocketSession {
    fn drop(&mut self) {
        self.close();
    }
}
