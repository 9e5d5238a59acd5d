//! Observed detection throughput.
//!
//! Counts inbound detection events over one-second windows. The reported rate
//! is that of the last closed window, so it changes at most once per second.
//! The first window opens when streaming starts ([`ThroughputMeter::start`]),
//! or at the first event for a meter that was never started.

use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_millis(1000);

#[derive(Clone, Debug)]
pub struct ThroughputMeter {
    count: u64,
    window_start: Option<Instant>,
    rate: f64,
}

impl ThroughputMeter {
    pub fn new() -> Self {
        Self {
            count: 0,
            window_start: None,
            rate: 0.0,
        }
    }

    /// Open a fresh window now, discarding any count and rate.
    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    pub fn start_at(&mut self, now: Instant) {
        *self = Self {
            window_start: Some(now),
            ..Self::new()
        };
    }

    pub fn record_event(&mut self) {
        self.record_event_at(Instant::now());
    }

    /// Record one event observed at `now`.
    pub fn record_event_at(&mut self, now: Instant) {
        let start = *self.window_start.get_or_insert(now);
        self.count += 1;
        self.close_window_if_elapsed(start, now);
    }

    /// Events per second over the last closed window.
    pub fn current_rate(&mut self) -> f64 {
        self.current_rate_at(Instant::now())
    }

    /// Same as [`current_rate`](Self::current_rate), closing an elapsed window
    /// as of `now` first. An elapsed window with no events reports 0.
    pub fn current_rate_at(&mut self, now: Instant) -> f64 {
        if let Some(start) = self.window_start {
            self.close_window_if_elapsed(start, now);
        }
        self.rate
    }

    /// Last closed window's rate without advancing the window.
    pub fn last_rate(&self) -> f64 {
        self.rate
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn close_window_if_elapsed(&mut self, start: Instant, now: Instant) {
        let elapsed = now.saturating_duration_since(start);
        if elapsed <= WINDOW {
            return;
        }
        self.rate = self.count as f64 * 1000.0 / elapsed.as_millis() as f64;
        self.count = 0;
        self.window_start = Some(now);
    }
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new()
    }
}
