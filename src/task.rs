//! Fixed-interval background tasks with synchronous cancellation.
//!
//! Each task runs on its own thread. Ticks never overlap: a tick that outlives
//! its interval causes the missed ticks to be dropped, not queued. `stop`
//! joins the thread, so no tick runs after it returns.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Tells a running tick whether it has been asked to wind down.
#[derive(Clone, Copy, Debug)]
pub struct TickContext<'a> {
    stop: &'a AtomicBool,
}

impl TickContext<'_> {
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

pub struct PeriodicTask {
    name: String,
    stop_tx: Option<Sender<()>>,
    stop_flag: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Start calling `tick` every `interval`. The first tick fires one
    /// interval after start. The second argument to `tick` is the number of
    /// slots dropped because the previous tick ran long.
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> Result<Self>
    where
        F: FnMut(TickContext<'_>, u64) + Send + 'static,
    {
        if interval.is_zero() {
            return Err(anyhow!("{}: interval must be greater than zero", name));
        }
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let thread_name = name.to_string();
        let join = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let mut deadline = Instant::now() + interval;
                loop {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if flag.load(Ordering::SeqCst) {
                        break;
                    }
                    let overrun = advance_deadline(&mut deadline, interval, Instant::now());
                    if overrun > 0 {
                        log::debug!("{}: dropped {} overrun tick(s)", thread_name, overrun);
                    }
                    tick(TickContext { stop: &flag }, overrun);
                }
            })
            .map_err(|e| anyhow!("spawn {}: {}", name, e))?;
        Ok(Self {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            stop_flag,
            join: Some(join),
        })
    }

    /// Cancel the task and wait for an in-flight tick to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("{}: task thread panicked", self.name);
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Move `deadline` to the next slot after `now`, returning how many whole
/// slots were skipped.
fn advance_deadline(deadline: &mut Instant, interval: Duration, now: Instant) -> u64 {
    *deadline += interval;
    let mut skipped = 0;
    while *deadline <= now {
        *deadline += interval;
        skipped += 1;
    }
    skipped
}
