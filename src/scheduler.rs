//! Open-loop frame capture and transmission.
//!
//! Every tick: if the connection gate is open, capture one frame and send it.
//! The cadence is not flow-controlled by results coming back. A failed capture
//! costs one tick, never the stream.

use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::connection::ClientError;
use crate::lock_or_recover;
use crate::task::PeriodicTask;

/// Per-run counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ticks: u64,
    /// Ticks suppressed because the connection was not `Connected`.
    pub skipped: u64,
    pub frames_sent: u64,
    pub capture_failures: u64,
    pub send_failures: u64,
    /// Slots dropped because a capture/send outlived the interval.
    pub overruns: u64,
}

pub struct FrameScheduler;

impl FrameScheduler {
    /// Start the capture/send loop.
    ///
    /// `is_connected` is consulted at the start of each tick; while it returns
    /// false neither `capture` nor `send` is called.
    pub fn start<T, C, S, G>(
        mut capture: C,
        mut send: S,
        is_connected: G,
        interval: Duration,
    ) -> Result<SchedulerHandle>
    where
        T: Send + 'static,
        C: FnMut() -> Result<T> + Send + 'static,
        S: FnMut(T) -> Result<()> + Send + 'static,
        G: Fn() -> bool + Send + 'static,
    {
        let stats = Arc::new(Mutex::new(SchedulerStats::default()));
        let counters = stats.clone();
        let task = PeriodicTask::spawn("frame-scheduler", interval, move |ctx, overrun| {
            let mut stats = lock_or_recover(&counters);
            stats.ticks += 1;
            stats.overruns += overrun;
            if !is_connected() {
                stats.skipped += 1;
                return;
            }
            drop(stats);

            let frame = match capture() {
                Ok(frame) => frame,
                Err(e) => {
                    log::debug!("frame capture failed, skipping tick: {:#}", e);
                    lock_or_recover(&counters).capture_failures += 1;
                    return;
                }
            };
            if ctx.stop_requested() {
                return;
            }
            let outcome = send(frame);
            let mut stats = lock_or_recover(&counters);
            match outcome {
                Ok(()) => stats.frames_sent += 1,
                Err(e) if e.downcast_ref::<ClientError>().is_some() => {
                    log::debug!("frame not sent: {}", e);
                    stats.skipped += 1;
                }
                Err(e) => {
                    log::warn!("frame send failed: {:#}", e);
                    stats.send_failures += 1;
                }
            }
        })?;
        log::debug!("frame scheduler started every {}ms", interval.as_millis());
        Ok(SchedulerHandle { task, stats })
    }
}

/// Running scheduler. Dropping it stops the loop as well.
pub struct SchedulerHandle {
    task: PeriodicTask,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl SchedulerHandle {
    pub fn stats(&self) -> SchedulerStats {
        lock_or_recover(&self.stats).clone()
    }

    /// Stop synchronously and return the final counters.
    pub fn stop(self) -> SchedulerStats {
        let Self { task, stats } = self;
        task.stop();
        let stats = lock_or_recover(&stats).clone();
        log::debug!(
            "frame scheduler stopped: ticks={} sent={} skipped={} capture_failures={}",
            stats.ticks,
            stats.frames_sent,
            stats.skipped,
            stats.capture_failures
        );
        stats
    }
}
