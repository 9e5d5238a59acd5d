//! Display state shared between the transport, the stats poller and readers.
//!
//! Every mutation goes through the store's single mutex. Detections and
//! stats are both latest-wins and unordered relative to each other. Clearing
//! stats advances an epoch; a snapshot fetched under an older epoch is
//! discarded instead of resurrecting pre-reset totals.

use std::sync::Mutex;

use crate::connection::{ConnectionListener, ConnectionState};
use crate::detect::{project_all, Detection, DetectionEvent, OverlayBox, SourceResolution};
use crate::lock_or_recover;
use crate::stats::StatsSnapshot;
use crate::throughput::ThroughputMeter;

/// Consistent copy of everything a consumer renders.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamView {
    pub connection: ConnectionState,
    /// Streaming has been requested.
    pub active: bool,
    /// Active but no detection result received yet.
    pub initializing: bool,
    pub detections: Vec<Detection>,
    /// `detections` projected into normalized display space.
    pub overlays: Vec<OverlayBox>,
    pub annotated_frame: Option<String>,
    pub face_count: u32,
    /// Detection results per second over the last closed window.
    pub fps: f64,
    pub stats: StatsSnapshot,
}

#[derive(Default)]
struct DisplayState {
    connection: ConnectionState,
    active: bool,
    latest: Option<DetectionEvent>,
    throughput: ThroughputMeter,
    stats: StatsSnapshot,
    stats_epoch: u64,
}

pub struct DisplayStore {
    resolution: SourceResolution,
    state: Mutex<DisplayState>,
}

impl DisplayStore {
    pub fn new(resolution: SourceResolution) -> Self {
        Self {
            resolution,
            state: Mutex::new(DisplayState::default()),
        }
    }

    /// Activation opens the first throughput window.
    pub fn set_active(&self, active: bool) {
        let mut state = lock_or_recover(&self.state);
        state.active = active;
        if active {
            state.throughput.start();
        }
    }

    /// Epoch to pass back to [`apply_stats`](Self::apply_stats) for a fetch
    /// started now.
    pub fn stats_epoch(&self) -> u64 {
        lock_or_recover(&self.state).stats_epoch
    }

    /// Replace the displayed stats wholesale, unless they were cleared after
    /// the fetch began. Returns whether the snapshot was applied.
    pub fn apply_stats(&self, epoch: u64, snapshot: StatsSnapshot) -> bool {
        let mut state = lock_or_recover(&self.state);
        if state.stats_epoch != epoch {
            return false;
        }
        state.stats = snapshot;
        true
    }

    pub fn clear_stats(&self) {
        let mut state = lock_or_recover(&self.state);
        state.stats = StatsSnapshot::default();
        state.stats_epoch += 1;
    }

    /// Drop detections, throughput and stats. Connection state is left to
    /// the connection manager's notifications.
    pub fn reset(&self) {
        let mut state = lock_or_recover(&self.state);
        state.active = false;
        state.latest = None;
        state.throughput.reset();
        state.stats = StatsSnapshot::default();
        state.stats_epoch += 1;
    }

    pub fn view(&self) -> StreamView {
        let mut state = lock_or_recover(&self.state);
        let fps = state.throughput.current_rate();
        let (detections, annotated_frame, face_count) = match &state.latest {
            Some(event) => (
                event.detections.clone(),
                event.annotated_frame.clone(),
                event.face_count,
            ),
            None => (Vec::new(), None, 0),
        };
        StreamView {
            connection: state.connection,
            active: state.active,
            initializing: state.active && state.latest.is_none(),
            overlays: project_all(&detections, self.resolution),
            detections,
            annotated_frame,
            face_count,
            fps,
            stats: state.stats.clone(),
        }
    }
}

impl ConnectionListener for DisplayStore {
    fn on_state_change(&self, state: ConnectionState) {
        lock_or_recover(&self.state).connection = state;
    }

    fn on_detection_event(&self, event: &DetectionEvent) {
        let mut state = lock_or_recover(&self.state);
        state.throughput.record_event();
        state.latest = Some(event.clone());
    }
}
