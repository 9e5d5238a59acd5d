//! HTTP transport and stats endpoints against a loopback server.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use facewatch_client::transport::HttpConnector;
use facewatch_client::{
    ClientConfig, ConnectionState, Connector, EventSink, FrameMessage, ServiceEndpoint,
    StatsClient, StatsFetcher, StreamClient, TransportEvent, TransportKind,
};

#[derive(Clone, Debug)]
struct Recorded {
    method: String,
    path: String,
    body: Vec<u8>,
}

type Handler = Box<dyn Fn(&str, &str) -> (u16, String) + Send>;
type RequestLog = Arc<Mutex<Vec<Recorded>>>;

struct TestServer {
    addr: SocketAddr,
    requests: RequestLog,
}

impl TestServer {
    fn spawn<F>(handler: F) -> Self
    where
        F: Fn(&str, &str) -> (u16, String) + Send + 'static,
    {
        let handler: Handler = Box::new(handler);
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = requests.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                serve_one(stream, &handler, &log);
            }
        });
        Self { addr, requests }
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn endpoint(&self) -> ServiceEndpoint {
        ServiceEndpoint::new(&self.url(), "127.0.0.1:1883").unwrap()
    }

    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

/// Answer one request; it is logged before the response is written.
fn serve_one(stream: TcpStream, handler: &Handler, log: &RequestLog) -> Option<()> {
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

    let (status, response_body) = handler(&method, &path);
    log.lock().unwrap().push(Recorded { method, path, body });
    let reason = if status < 400 { "OK" } else { "Error" };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        response_body.len(),
        response_body
    );
    let mut stream = stream;
    stream.write_all(response.as_bytes()).ok()?;
    stream.flush().ok()
}

const DETECTION_BODY: &str = r#"{
    "detections": [
        {"bbox": {"x": 160, "y": 120, "width": 64, "height": 96},
         "age": 34, "gender": "Male", "confidence": 0.91,
         "timestamp": "2024-05-01T10:15:00"}
    ],
    "processed_frame": "data:image/jpeg;base64,/9j/4AAQ",
    "face_count": 1
}"#;

const STATS_BODY: &str = r#"{
    "total_faces": 12,
    "current_faces": 1,
    "avg_detections_per_minute": 0.75,
    "age_distribution": {"30-39": 12},
    "gender_distribution": {"Male": 12},
    "last_detection": "2024-05-01T10:15:00"
}"#;

fn detection_service() -> TestServer {
    TestServer::spawn(|method, path| match (method, path) {
        ("GET", "/") => (200, r#"{"status":"ok"}"#.to_string()),
        ("POST", "/api/detect") => (200, DETECTION_BODY.to_string()),
        ("GET", "/api/stats") => (200, STATS_BODY.to_string()),
        ("POST", "/api/reset-stats") => {
            (200, r#"{"message":"Statistics reset successfully"}"#.to_string())
        }
        _ => (404, "{}".to_string()),
    })
}

fn collecting_sink() -> (EventSink, Arc<Mutex<Vec<TransportEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = events.clone();
    let sink: EventSink = Arc::new(move |event| seen.lock().unwrap().push(event));
    (sink, events)
}

fn frame() -> FrameMessage {
    FrameMessage {
        frame: "data:image/jpeg;base64,/9j/".to_string(),
    }
}

#[test]
fn http_session_posts_frames_and_delivers_results() {
    let server = detection_service();
    let (sink, events) = collecting_sink();
    let mut session = HttpConnector::default()
        .connect(&server.endpoint(), Duration::from_secs(2), sink)
        .expect("connect");
    assert_eq!(session.transport(), "http");

    session.send_frame(&frame()).expect("send frame");

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    let TransportEvent::Detection(event) = &events[0] else {
        panic!("expected detection, got {:?}", events[0]);
    };
    assert_eq!(event.face_count, 1);
    assert_eq!(event.detections[0].age, "34");
    assert_eq!(event.detections[0].label(), "Male, 34 (91%)");
    assert_eq!(
        event.annotated_frame.as_deref(),
        Some("data:image/jpeg;base64,/9j/4AAQ")
    );

    let requests = server.requests();
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/");
    let post = requests
        .iter()
        .find(|r| r.path == "/api/detect")
        .expect("detect request");
    assert_eq!(post.method, "POST");
    let sent: serde_json::Value = serde_json::from_slice(&post.body).unwrap();
    assert_eq!(sent["frame"], "data:image/jpeg;base64,/9j/");
}

#[test]
fn null_result_means_no_event() {
    let server = TestServer::spawn(|_, path| match path {
        "/api/detect" => (200, "null".to_string()),
        _ => (200, "{}".to_string()),
    });
    let (sink, events) = collecting_sink();
    let mut session = HttpConnector::default()
        .connect(&server.endpoint(), Duration::from_secs(2), sink)
        .unwrap();
    session.send_frame(&frame()).unwrap();
    assert!(events.lock().unwrap().is_empty());
}

#[test]
fn server_error_fails_the_send() {
    let server = TestServer::spawn(|_, path| match path {
        "/api/detect" => (500, r#"{"error":"model not loaded"}"#.to_string()),
        _ => (200, "{}".to_string()),
    });
    let (sink, _) = collecting_sink();
    let mut session = HttpConnector::default()
        .connect(&server.endpoint(), Duration::from_secs(2), sink)
        .unwrap();
    assert!(session.send_frame(&frame()).is_err());
}

#[test]
fn unreachable_service_fails_to_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let endpoint = ServiceEndpoint::new(&format!("http://{}", addr), "127.0.0.1:1883").unwrap();
    let (sink, _) = collecting_sink();
    let err = HttpConnector::default()
        .connect(&endpoint, Duration::from_millis(500), sink)
        .err()
        .expect("connect should fail");
    assert!(format!("{:#}", err).contains("reach detection service"));
}

#[test]
fn stats_client_fetches_and_resets() {
    let server = detection_service();
    let client = StatsClient::new(&server.endpoint(), Duration::from_secs(2)).unwrap();

    let snapshot = client.fetch().expect("fetch stats");
    assert_eq!(snapshot.total_faces, 12);
    assert_eq!(snapshot.age_shares(), vec![("30-39".to_string(), 100.0)]);
    assert_eq!(snapshot.last_detection.as_deref(), Some("2024-05-01T10:15:00"));

    client.reset().expect("reset stats");
    let requests = server.requests();
    assert!(requests
        .iter()
        .any(|r| r.method == "POST" && r.path == "/api/reset-stats"));
}

#[test]
fn stats_client_surfaces_http_errors() {
    let server = TestServer::spawn(|_, _| (503, "{}".to_string()));
    let client = StatsClient::new(&server.endpoint(), Duration::from_secs(2)).unwrap();
    assert!(client.fetch().is_err());
    assert!(client.reset().is_err());
}

#[test]
fn stream_client_falls_back_to_http() {
    let server = detection_service();
    let closed = TcpListener::bind("127.0.0.1:0").unwrap();
    let broker = closed.local_addr().unwrap();
    drop(closed);

    let mut config = ClientConfig::default();
    config.service_url = server.url();
    config.mqtt.broker_addr = broker.to_string();
    config.transports = vec![TransportKind::Mqtt, TransportKind::Http];
    config.capture.width = 64;
    config.capture.height = 48;
    config.frame_interval = Duration::from_millis(50);
    config.stats_interval = Duration::from_millis(50);
    config.connect_timeout = Duration::from_millis(1500);

    let client = StreamClient::from_config(&config).unwrap();
    assert_eq!(client.start().unwrap(), ConnectionState::Connected);
    assert_eq!(client.transport(), Some("http"));

    std::thread::sleep(Duration::from_millis(400));
    let view = client.view();
    assert_eq!(view.face_count, 1);
    assert_eq!(view.overlays[0].rect.left, 160.0 / 64.0);
    assert_eq!(view.stats.total_faces, 12);

    client.stop();
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}
