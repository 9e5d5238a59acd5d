//! Streaming session composition.
//!
//! `StreamClient` owns one of everything: the frame source, the connection
//! manager, the display store and, while active, the frame scheduler and the
//! stats reconciler.

use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{ClientConfig, TransportKind};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::ingest::{EncodedFrame, FrameSource, FrameSourceStats};
use crate::lock_or_recover;
use crate::scheduler::{FrameScheduler, SchedulerHandle, SchedulerStats};
use crate::state::{DisplayStore, StreamView};
use crate::stats::{ReconcilerHandle, StatsClient, StatsFetcher, StatsReconciler};
use crate::transport::{
    Connector, HttpConnector, MqttConnector, PollingConnector, ServiceEndpoint, TlsMaterials,
    WebSocketConnector,
};

pub struct StreamClient {
    endpoint: ServiceEndpoint,
    frame_interval: Duration,
    stats_interval: Duration,
    connection: Arc<ConnectionManager>,
    display: Arc<DisplayStore>,
    frame_source: Arc<Mutex<FrameSource>>,
    stats: Arc<dyn StatsFetcher>,
    running: Mutex<Option<Running>>,
}

struct Running {
    scheduler: SchedulerHandle,
    reconciler: ReconcilerHandle,
}

impl StreamClient {
    pub fn new(
        config: &ClientConfig,
        frame_source: FrameSource,
        connectors: Vec<Arc<dyn Connector>>,
        stats: Arc<dyn StatsFetcher>,
    ) -> Result<Self> {
        let connection = Arc::new(ConnectionManager::new(connectors, config.connect_timeout)?);
        let display = Arc::new(DisplayStore::new(frame_source.resolution()));
        connection.subscribe(display.clone());
        Ok(Self {
            endpoint: config.endpoint()?,
            frame_interval: config.frame_interval,
            stats_interval: config.stats_interval,
            connection,
            display,
            frame_source: Arc::new(Mutex::new(frame_source)),
            stats,
            running: Mutex::new(None),
        })
    }

    /// Build the default frame source, transports and stats client from config.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let endpoint = config.endpoint()?;
        let frame_source = FrameSource::new(config.capture_config()?)?;
        let tls = TlsMaterials::load(config.mqtt.ca_path.as_deref())?;
        let connectors = config
            .transports
            .iter()
            .map(|kind| -> Arc<dyn Connector> {
                match kind {
                    TransportKind::Websocket => Arc::new(WebSocketConnector),
                    TransportKind::Polling => {
                        Arc::new(PollingConnector::new(config.connect_timeout))
                    }
                    TransportKind::Mqtt => Arc::new(MqttConnector::new(
                        &config.mqtt.topic_prefix,
                        &config.mqtt.client_id,
                        tls.clone(),
                    )),
                    TransportKind::Http => Arc::new(HttpConnector::new(config.connect_timeout)),
                }
            })
            .collect();
        let stats = Arc::new(StatsClient::new(&endpoint, config.connect_timeout)?);
        Self::new(config, frame_source, connectors, stats)
    }

    /// Begin streaming. Blocks until the connection attempt resolves and
    /// returns the resulting state. A no-op while already active.
    pub fn start(&self) -> Result<ConnectionState> {
        let mut running = lock_or_recover(&self.running);
        if running.is_some() {
            return Ok(self.connection.state());
        }
        self.display.reset();
        self.display.set_active(true);

        if let Err(e) = lock_or_recover(&self.frame_source).connect() {
            log::warn!("frame source not ready: {:#}", e);
        }
        let state = self.connection.open(&self.endpoint);

        let scheduler = {
            let source = self.frame_source.clone();
            let sender = self.connection.clone();
            let gate = self.connection.clone();
            FrameScheduler::start(
                move || lock_or_recover(&source).capture(),
                move |frame: EncodedFrame| sender.send_frame(&frame.to_message()),
                move || gate.state().is_connected(),
                self.frame_interval,
            )
        };
        let scheduler = match scheduler {
            Ok(scheduler) => scheduler,
            Err(e) => {
                self.abort_start();
                return Err(e);
            }
        };
        let reconciler = {
            let fetcher = self.stats.clone();
            let gate = self.connection.clone();
            let display = self.display.clone();
            let applier = self.display.clone();
            let fetch_epoch = Arc::new(AtomicU64::new(0));
            let apply_epoch = fetch_epoch.clone();
            StatsReconciler::start(
                move || {
                    fetch_epoch.store(display.stats_epoch(), Ordering::SeqCst);
                    fetcher.fetch()
                },
                self.stats_interval,
                move || gate.state().is_connected(),
                move |snapshot| {
                    if !applier.apply_stats(apply_epoch.load(Ordering::SeqCst), snapshot) {
                        log::debug!("discarding stats fetched before a reset");
                    }
                },
            )
        };
        let reconciler = match reconciler {
            Ok(reconciler) => reconciler,
            Err(e) => {
                scheduler.stop();
                self.abort_start();
                return Err(e);
            }
        };
        *running = Some(Running {
            scheduler,
            reconciler,
        });
        log::info!("streaming started ({})", state);
        Ok(state)
    }

    /// Reopen the connection after a failure. Only meaningful while active.
    pub fn retry(&self) -> ConnectionState {
        let running = lock_or_recover(&self.running);
        let state = self.connection.state();
        if running.is_none() {
            log::debug!("retry ignored: streaming not active");
            return state;
        }
        match state {
            ConnectionState::Error | ConnectionState::Disconnected => {
                log::info!("retrying connection");
                self.connection.open(&self.endpoint)
            }
            _ => state,
        }
    }

    /// Stop streaming and clear display state. Idempotent.
    pub fn stop(&self) {
        let Some(running) = lock_or_recover(&self.running).take() else {
            return;
        };
        let frames = running.scheduler.stop();
        let polls = running.reconciler.stop();
        self.connection.close();
        self.display.reset();
        log::info!(
            "streaming stopped: frames_sent={} capture_failures={} stats_polls={}",
            frames.frames_sent,
            frames.capture_failures,
            polls.successes
        );
    }

    /// Zero the service's statistics; the displayed snapshot is cleared only
    /// once the service confirms. A poll already in flight is discarded.
    pub fn reset_stats(&self) -> Result<()> {
        self.stats.reset()?;
        self.display.clear_stats();
        Ok(())
    }

    pub fn view(&self) -> StreamView {
        self.display.view()
    }

    pub fn is_active(&self) -> bool {
        lock_or_recover(&self.running).is_some()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn last_error(&self) -> Option<String> {
        self.connection.last_error()
    }

    pub fn transport(&self) -> Option<&'static str> {
        self.connection.transport()
    }

    pub fn scheduler_stats(&self) -> Option<SchedulerStats> {
        lock_or_recover(&self.running)
            .as_ref()
            .map(|running| running.scheduler.stats())
    }

    pub fn frame_source_stats(&self) -> FrameSourceStats {
        lock_or_recover(&self.frame_source).stats()
    }

    fn abort_start(&self) {
        self.connection.close();
        self.display.reset();
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.stop();
    }
}
