//! Facewatch streaming client
//!
//! Client core for a real-time face/age/gender detection service: it keeps a
//! transport session to the service, pushes webcam stills at a fixed cadence,
//! and turns what comes back into display state.
//!
//! # Architecture
//!
//! - `connection`: session lifecycle (`Disconnected`, `Connecting`, `Connected`, `Error`)
//! - `transport`: Socket.IO over websocket with a long-polling fallback, plus
//!   MQTT and plain HTTP connectors for bridged deployments
//! - `ingest`: frame capture (synthetic, camera snapshot, local file)
//! - `scheduler`: open-loop capture/send at a fixed interval, gated on `Connected`
//! - `throughput`: one-second window event rate
//! - `detect`: wire types and overlay projection
//! - `stats`: aggregate statistics polling
//! - `state`: latest-wins display store
//! - `client`: composition root
//!
//! Failures stay local: a failed capture skips a tick, a failed stats poll
//! keeps the previous snapshot, a transport failure moves the connection to
//! `Error` and waits for an explicit retry.

use std::sync::{Mutex, MutexGuard};

pub mod client;
pub mod config;
pub mod connection;
pub mod detect;
pub mod ingest;
pub mod scheduler;
pub mod state;
pub mod stats;
pub mod task;
pub mod throughput;
pub mod transport;

pub use client::StreamClient;
pub use config::{ClientConfig, TransportKind};
pub use connection::{ClientError, ConnectionListener, ConnectionManager, ConnectionState};
pub use detect::{
    parse_detection_event, project, project_all, BoundingBox, Detection, DetectionEvent,
    FrameMessage, NormalizedRect, OverlayBox, SourceResolution,
};
pub use ingest::{CaptureConfig, EncodedFrame, FrameSource, FrameSourceStats};
pub use scheduler::{FrameScheduler, SchedulerHandle, SchedulerStats};
pub use state::{DisplayStore, StreamView};
pub use stats::{
    ReconcilerHandle, ReconcilerStats, StatsClient, StatsFetcher, StatsReconciler, StatsSnapshot,
};
pub use task::{PeriodicTask, TickContext};
pub use throughput::ThroughputMeter;
pub use transport::{Connector, EventSink, ServiceEndpoint, Session, TransportEvent};

// ----------------------------------------------------------------------------
// Shared helpers
// ----------------------------------------------------------------------------

/// Lock a mutex, continuing with the inner value if a holder panicked.
pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
