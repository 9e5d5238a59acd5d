//! Socket.IO transports against loopback Engine.IO servers.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tungstenite::Message;

use facewatch_client::transport::{PollingConnector, WebSocketConnector};
use facewatch_client::{
    ClientConfig, ConnectionState, Connector, EventSink, FrameMessage, ServiceEndpoint,
    StreamClient, TransportEvent, TransportKind,
};

const OPEN: &str = r#"0{"sid":"eio-1","upgrades":["websocket"],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;
const NAMESPACE_ACK: &str = r#"40{"sid":"sio-1"}"#;
const STATUS: &str = r#"42["status",{"message":"Connected to detection server"}]"#;
const RESULT: &str = r#"42["detection_result",{"detections":[{"bbox":{"x":160,"y":120,"width":64,"height":96},"age":"25-32","gender":"Female","confidence":0.8,"timestamp":"2024-05-01T10:15:00"}],"processed_frame":"data:image/jpeg;base64,/9j/4AAQ","face_count":1}]"#;
const FRAME_PACKET: &str = r#"42["video_frame",{"frame":"data:image/jpeg;base64,/9j/"}]"#;

fn frame() -> FrameMessage {
    FrameMessage {
        frame: "data:image/jpeg;base64,/9j/".to_string(),
    }
}

fn collecting_sink() -> (EventSink, Arc<Mutex<Vec<TransportEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = events.clone();
    let sink: EventSink = Arc::new(move |event| seen.lock().unwrap().push(event));
    (sink, events)
}

fn wait_for<T>(what: &str, timeout: Duration, mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn endpoint(addr: SocketAddr) -> ServiceEndpoint {
    ServiceEndpoint::new(&format!("http://{}", addr), "127.0.0.1:1883").unwrap()
}

// ----------------------------------------------------------------------------
// Long-polling server
// ----------------------------------------------------------------------------

#[derive(Default)]
struct PollingState {
    outbound: Mutex<VecDeque<String>>,
    ready: Condvar,
    /// Every packet the client posted, in order.
    received: Mutex<Vec<String>>,
}

impl PollingState {
    fn push(&self, packet: &str) {
        self.outbound.lock().unwrap().push_back(packet.to_string());
        self.ready.notify_all();
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    /// Hold a poll open until something is queued, then drain the queue.
    fn drain(&self) -> String {
        let queue = self.outbound.lock().unwrap();
        let (mut queue, _) = self
            .ready
            .wait_timeout_while(queue, Duration::from_millis(300), |q| q.is_empty())
            .unwrap();
        if queue.is_empty() {
            return "6".to_string();
        }
        queue.drain(..).collect::<Vec<_>>().join("\u{1e}")
    }
}

struct PollingServer {
    addr: SocketAddr,
    state: Arc<PollingState>,
}

impl PollingServer {
    fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind polling server");
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(PollingState::default());
        let shared = state.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let state = shared.clone();
                std::thread::spawn(move || serve_polling(stream, &state));
            }
        });
        Self { addr, state }
    }
}

fn serve_polling(stream: TcpStream, state: &PollingState) -> Option<()> {
    let (method, path, body) = read_request(&stream)?;
    let (status, response) = if path.starts_with("/api/stats") {
        (200, r#"{"total_faces":3,"current_faces":1}"#.to_string())
    } else if !path.starts_with("/socket.io/") || path.contains("transport=websocket") {
        (400, "Bad Request".to_string())
    } else if !path.contains("sid=") {
        (200, OPEN.to_string())
    } else if method == "POST" {
        for packet in body.split('\u{1e}').filter(|p| !p.is_empty()) {
            state.received.lock().unwrap().push(packet.to_string());
            if packet == "40" {
                state.push(NAMESPACE_ACK);
                state.push(STATUS);
                state.push("2");
            } else if packet.starts_with(r#"42["video_frame""#) {
                state.push(RESULT);
            }
        }
        (200, "ok".to_string())
    } else {
        (200, state.drain())
    };
    write_response(stream, status, &response)
}

fn read_request(stream: &TcpStream) -> Option<(String, String, String)> {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .ok()?;
    let mut reader = BufReader::new(stream.try_clone().ok()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).ok()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).ok()?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().ok()?;
            }
        }
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).ok()?;
    Some((method, path, String::from_utf8(body).ok()?))
}

fn write_response(mut stream: TcpStream, status: u16, body: &str) -> Option<()> {
    let reason = if status < 400 { "OK" } else { "Bad Request" };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=UTF-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).ok()?;
    stream.flush().ok()
}

#[test]
fn polling_session_exchanges_socketio_events() {
    let server = PollingServer::spawn();
    let (sink, events) = collecting_sink();
    let mut session = PollingConnector::default()
        .connect(&endpoint(server.addr), Duration::from_secs(2), sink)
        .expect("connect over polling");
    assert_eq!(session.transport(), "polling");
    assert_eq!(server.state.received()[0], "40");

    session.send_frame(&frame()).expect("send frame");
    let event = wait_for("detection result", Duration::from_secs(3), || {
        events.lock().unwrap().iter().find_map(|event| match event {
            TransportEvent::Detection(event) => Some(event.clone()),
            TransportEvent::Failed(_) => None,
        })
    });
    assert_eq!(event.face_count, 1);
    assert_eq!(event.detections[0].label(), "Female, 25-32 (80%)");
    assert!(server.state.received().contains(&FRAME_PACKET.to_string()));
    // The heartbeat queued with the namespace ack is answered.
    wait_for("pong", Duration::from_secs(3), || {
        server.state.received().contains(&"3".to_string()).then_some(())
    });

    session.close();
    assert!(session.send_frame(&frame()).is_err());
    assert!(server.state.received().contains(&"41".to_string()));
    assert!(!events
        .lock()
        .unwrap()
        .iter()
        .any(|event| matches!(event, TransportEvent::Failed(_))));
}

#[test]
fn polling_connect_fails_without_engineio() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            if read_request(&stream).is_some() {
                write_response(stream, 404, "not found");
            }
        }
    });
    let (sink, _) = collecting_sink();
    let err = PollingConnector::default()
        .connect(&endpoint(addr), Duration::from_secs(1), sink)
        .err()
        .expect("connect should fail");
    assert!(format!("{:#}", err).contains("engine.io open"));
}

#[test]
fn stream_client_falls_back_from_websocket_to_polling() {
    let server = PollingServer::spawn();
    let mut config = ClientConfig::default();
    config.service_url = format!("http://{}", server.addr);
    config.transports = vec![TransportKind::Websocket, TransportKind::Polling];
    config.capture.width = 64;
    config.capture.height = 48;
    config.frame_interval = Duration::from_millis(50);
    config.stats_interval = Duration::from_millis(50);
    config.connect_timeout = Duration::from_millis(1500);

    let client = StreamClient::from_config(&config).unwrap();
    assert_eq!(client.start().unwrap(), ConnectionState::Connected);
    assert_eq!(client.transport(), Some("polling"));

    let view = wait_for("first detection", Duration::from_secs(3), || {
        let view = client.view();
        (view.face_count == 1 && view.stats.total_faces == 3).then_some(view)
    });
    assert_eq!(view.overlays[0].rect.left, 160.0 / 64.0);
    assert_eq!(view.overlays[0].label, "Female, 25-32 (80%)");

    client.stop();
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

// ----------------------------------------------------------------------------
// Websocket server
// ----------------------------------------------------------------------------

/// Serve one websocket client. With `heartbeat` false the server goes silent
/// after acknowledging the namespace.
fn websocket_server(open: &'static str, heartbeat: bool) -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind websocket server");
    let addr = listener.local_addr().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();
    std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut ws = tungstenite::accept(stream).unwrap();
        ws.send(Message::Text(open.to_string())).unwrap();
        loop {
            let text = match ws.read() {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            log.lock().unwrap().push(text.clone());
            let replies: Vec<&str> = if text == "40" {
                if heartbeat {
                    vec![NAMESPACE_ACK, STATUS, "2"]
                } else {
                    vec![NAMESPACE_ACK]
                }
            } else if text.starts_with(r#"42["video_frame""#) {
                vec![RESULT]
            } else {
                Vec::new()
            };
            for reply in replies {
                if ws.send(Message::Text(reply.to_string())).is_err() {
                    return;
                }
            }
        }
    });
    (addr, received)
}

#[test]
fn websocket_session_exchanges_socketio_events() {
    let (addr, received) = websocket_server(OPEN, true);
    let (sink, events) = collecting_sink();
    let mut session = WebSocketConnector
        .connect(&endpoint(addr), Duration::from_secs(2), sink)
        .expect("connect over websocket");
    assert_eq!(session.transport(), "websocket");

    session.send_frame(&frame()).expect("send frame");
    let event = wait_for("detection result", Duration::from_secs(3), || {
        events.lock().unwrap().iter().find_map(|event| match event {
            TransportEvent::Detection(event) => Some(event.clone()),
            TransportEvent::Failed(_) => None,
        })
    });
    assert_eq!(event.face_count, 1);
    assert_eq!(
        event.annotated_frame.as_deref(),
        Some("data:image/jpeg;base64,/9j/4AAQ")
    );
    wait_for("pong", Duration::from_secs(3), || {
        received.lock().unwrap().contains(&"3".to_string()).then_some(())
    });

    session.close();
    assert!(session.send_frame(&frame()).is_err());
    wait_for("namespace disconnect", Duration::from_secs(3), || {
        received.lock().unwrap().contains(&"41".to_string()).then_some(())
    });
    let received = received.lock().unwrap();
    assert_eq!(received[0], "40");
    assert!(received.contains(&FRAME_PACKET.to_string()));
}

#[test]
fn silent_websocket_server_fails_the_session() {
    const SHORT_PING: &str =
        r#"0{"sid":"eio-2","upgrades":[],"pingInterval":100,"pingTimeout":100}"#;
    let (addr, _) = websocket_server(SHORT_PING, false);
    let (sink, events) = collecting_sink();
    let mut session = WebSocketConnector
        .connect(&endpoint(addr), Duration::from_secs(2), sink)
        .expect("connect over websocket");

    let message = wait_for("heartbeat failure", Duration::from_secs(3), || {
        events.lock().unwrap().iter().find_map(|event| match event {
            TransportEvent::Failed(message) => Some(message.clone()),
            TransportEvent::Detection(_) => None,
        })
    });
    assert!(message.contains("no heartbeat"), "{}", message);
    session.close();
}

#[test]
fn websocket_connect_fails_against_plain_http() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            if read_request(&stream).is_some() {
                write_response(stream, 400, "Bad Request");
            }
        }
    });
    let (sink, _) = collecting_sink();
    let err = WebSocketConnector
        .connect(&endpoint(addr), Duration::from_secs(1), sink)
        .err()
        .expect("connect should fail");
    assert!(err.to_string().contains("websocket handshake"));
}
