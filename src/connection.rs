//! Connection lifecycle to the detection service.
//!
//! `ConnectionManager` is the only writer of [`ConnectionState`]:
//!
//! ```text
//! Disconnected --open--> Connecting --ok--> Connected --failure--> Error
//!      ^                     |                  |                    |
//!      |                     +----failure-------|------------------->|
//!      +-----------------------close------------+--------------------+
//! ```
//!
//! There is no automatic reconnection. Leaving `Error` requires the caller to
//! `open` again (or `close`).
//!
//! State changes and inbound events are delivered to listeners under a single
//! transition lock, so listeners observe them in order and never after `close`
//! returns. Listeners must not call `open` or `close` from a callback.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::detect::{DetectionEvent, FrameMessage};
use crate::lock_or_recover;
use crate::transport::{Connector, EventSink, ServiceEndpoint, Session, TransportEvent};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Error => "Error",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Errors callers may want to match on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientError {
    /// A frame was offered while no session was live.
    NotConnected(ConnectionState),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected(state) => write!(f, "not connected (state: {})", state),
        }
    }
}

impl std::error::Error for ClientError {}

/// Subscriber to connection activity.
pub trait ConnectionListener: Send + Sync {
    fn on_state_change(&self, state: ConnectionState);

    /// Called once per inbound result, verbatim.
    fn on_detection_event(&self, event: &DetectionEvent);
}

pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    connectors: Vec<Arc<dyn Connector>>,
    connect_timeout: Duration,
    shared: Mutex<Shared>,
    transitions: Mutex<()>,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
}

#[derive(Default)]
struct Shared {
    state: ConnectionState,
    /// Bumped on every open/close/failure; events tagged with an older value are dropped.
    generation: u64,
    session: Option<Arc<Mutex<Box<dyn Session>>>>,
    transport: Option<&'static str>,
    last_error: Option<String>,
}

impl ConnectionManager {
    /// `connectors` are tried in order on each `open`.
    pub fn new(connectors: Vec<Arc<dyn Connector>>, connect_timeout: Duration) -> Result<Self> {
        if connectors.is_empty() {
            return Err(anyhow!("at least one transport connector is required"));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                connectors,
                connect_timeout,
                shared: Mutex::new(Shared::default()),
                transitions: Mutex::new(()),
                listeners: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn subscribe(&self, listener: Arc<dyn ConnectionListener>) {
        lock_or_recover(&self.inner.listeners).push(listener);
    }

    pub fn state(&self) -> ConnectionState {
        lock_or_recover(&self.inner.shared).state
    }

    /// Message of the failure that put the manager in `Error`.
    pub fn last_error(&self) -> Option<String> {
        lock_or_recover(&self.inner.shared).last_error.clone()
    }

    /// Name of the transport carrying the live session.
    pub fn transport(&self) -> Option<&'static str> {
        lock_or_recover(&self.inner.shared).transport
    }

    /// Establish a session, blocking until it is up or every transport failed.
    ///
    /// Returns the resulting state. A no-op while `Connecting` or `Connected`.
    pub fn open(&self, endpoint: &ServiceEndpoint) -> ConnectionState {
        let generation = {
            let _transition = lock_or_recover(&self.inner.transitions);
            let mut shared = lock_or_recover(&self.inner.shared);
            if matches!(
                shared.state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                log::debug!("open ignored: already {}", shared.state);
                return shared.state;
            }
            shared.generation += 1;
            shared.state = ConnectionState::Connecting;
            let generation = shared.generation;
            drop(shared);
            log::info!("connecting to detection service {}", endpoint.service_url);
            self.inner.notify_state(ConnectionState::Connecting);
            generation
        };

        let outcome = self.establish(endpoint, generation);

        let _transition = lock_or_recover(&self.inner.transitions);
        let mut shared = lock_or_recover(&self.inner.shared);
        if shared.generation != generation {
            // Closed while connecting.
            let state = shared.state;
            drop(shared);
            drop(_transition);
            if let Ok((_, mut session)) = outcome {
                session.close();
            }
            return state;
        }
        match outcome {
            Ok((transport, session)) => {
                shared.session = Some(Arc::new(Mutex::new(session)));
                shared.transport = Some(transport);
                shared.last_error = None;
                shared.state = ConnectionState::Connected;
                drop(shared);
                log::info!("connected to detection service via {}", transport);
                self.inner.notify_state(ConnectionState::Connected);
                ConnectionState::Connected
            }
            Err(e) => {
                shared.last_error = Some(format!("{:#}", e));
                shared.state = ConnectionState::Error;
                drop(shared);
                log::warn!("connection failed: {:#}", e);
                self.inner.notify_state(ConnectionState::Error);
                ConnectionState::Error
            }
        }
    }

    /// Tear down any session and return to `Disconnected`. Idempotent.
    pub fn close(&self) {
        let session = {
            let _transition = lock_or_recover(&self.inner.transitions);
            let mut shared = lock_or_recover(&self.inner.shared);
            shared.generation += 1;
            let session = shared.session.take();
            shared.transport = None;
            shared.last_error = None;
            if shared.state == ConnectionState::Disconnected {
                return;
            }
            shared.state = ConnectionState::Disconnected;
            drop(shared);
            self.inner.notify_state(ConnectionState::Disconnected);
            session
        };
        if let Some(session) = session {
            lock_or_recover(&session).close();
        }
        log::info!("connection closed");
    }

    /// Transmit one frame over the live session.
    ///
    /// Fails with [`ClientError::NotConnected`] unless `Connected`. Any other
    /// failure is a transport failure and moves the manager to `Error`.
    pub fn send_frame(&self, frame: &FrameMessage) -> Result<()> {
        let (generation, session) = {
            let shared = lock_or_recover(&self.inner.shared);
            match (&shared.session, shared.state) {
                (Some(session), ConnectionState::Connected) => {
                    (shared.generation, session.clone())
                }
                (_, state) => return Err(ClientError::NotConnected(state).into()),
            }
        };
        let result = lock_or_recover(&session).send_frame(frame);
        if let Err(e) = &result {
            self.inner
                .fail_session(generation, format!("send failed: {:#}", e));
        }
        result
    }

    fn establish(
        &self,
        endpoint: &ServiceEndpoint,
        generation: u64,
    ) -> Result<(&'static str, Box<dyn Session>)> {
        let mut failures = Vec::new();
        for connector in &self.inner.connectors {
            let sink = sink_for(Arc::downgrade(&self.inner), generation);
            match connector.connect(endpoint, self.inner.connect_timeout, sink) {
                Ok(session) => {
                    if !failures.is_empty() {
                        log::info!("falling back to {} transport", connector.name());
                    }
                    return Ok((connector.name(), session));
                }
                Err(e) => {
                    log::warn!("{} transport unavailable: {:#}", connector.name(), e);
                    failures.push(format!("{}: {:#}", connector.name(), e));
                }
            }
        }
        Err(anyhow!(
            "no transport reached the detection service ({})",
            failures.join("; ")
        ))
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

fn sink_for(inner: Weak<Inner>, generation: u64) -> EventSink {
    Arc::new(move |event| {
        if let Some(inner) = inner.upgrade() {
            inner.handle_transport_event(generation, event);
        }
    })
}

impl Inner {
    fn handle_transport_event(&self, generation: u64, event: TransportEvent) {
        match event {
            TransportEvent::Detection(result) => {
                let _transition = lock_or_recover(&self.transitions);
                let live = {
                    let shared = lock_or_recover(&self.shared);
                    shared.generation == generation && shared.state.is_connected()
                };
                if live {
                    for listener in self.listeners() {
                        listener.on_detection_event(&result);
                    }
                }
            }
            TransportEvent::Failed(message) => self.fail_session(generation, message),
        }
    }

    fn fail_session(&self, generation: u64, message: String) {
        let session = {
            let _transition = lock_or_recover(&self.transitions);
            let mut shared = lock_or_recover(&self.shared);
            if shared.generation != generation || !shared.state.is_connected() {
                return;
            }
            shared.generation += 1;
            shared.state = ConnectionState::Error;
            shared.transport = None;
            shared.last_error = Some(message.clone());
            let session = shared.session.take();
            drop(shared);
            log::warn!("transport failure: {}", message);
            self.notify_state(ConnectionState::Error);
            session
        };
        if let Some(session) = session {
            lock_or_recover(&session).close();
        }
    }

    fn notify_state(&self, state: ConnectionState) {
        for listener in self.listeners() {
            listener.on_state_change(state);
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        lock_or_recover(&self.listeners).clone()
    }
}
