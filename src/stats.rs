//! Aggregate statistics from the detection service.
//!
//! The service keeps running totals; the client polls them on a timer and
//! replaces its displayed copy wholesale on every successful poll.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::lock_or_recover;
use crate::task::PeriodicTask;
use crate::transport::ServiceEndpoint;

const STATS_PATH: &str = "/api/stats";
const RESET_PATH: &str = "/api/reset-stats";
const MAX_STATS_BYTES: u64 = 1024 * 1024;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    #[serde(default)]
    pub total_faces: u64,
    #[serde(default)]
    pub current_faces: u64,
    #[serde(default)]
    pub avg_detections_per_minute: f64,
    /// Age bucket label (e.g. `"20-29"`) to count.
    #[serde(default)]
    pub age_distribution: BTreeMap<String, u64>,
    #[serde(default)]
    pub gender_distribution: BTreeMap<String, u64>,
    /// ISO-8601 timestamp as sent by the service.
    #[serde(default)]
    pub last_detection: Option<String>,
}

impl StatsSnapshot {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| anyhow!("parse stats snapshot: {}", e))
    }

    /// Per-label percentage of `total_faces`, sorted by label.
    pub fn age_shares(&self) -> Vec<(String, f64)> {
        shares(&self.age_distribution, self.total_faces)
    }

    pub fn gender_shares(&self) -> Vec<(String, f64)> {
        shares(&self.gender_distribution, self.total_faces)
    }
}

fn shares(distribution: &BTreeMap<String, u64>, total: u64) -> Vec<(String, f64)> {
    distribution
        .iter()
        .map(|(label, count)| {
            let share = if total == 0 {
                0.0
            } else {
                *count as f64 * 100.0 / total as f64
            };
            (label.clone(), share)
        })
        .collect()
}

/// Access to the service's stats endpoints.
pub trait StatsFetcher: Send + Sync {
    fn fetch(&self) -> Result<StatsSnapshot>;

    /// Ask the service to zero its totals.
    fn reset(&self) -> Result<()>;
}

/// `StatsFetcher` over HTTP.
pub struct StatsClient {
    agent: ureq::Agent,
    stats_url: String,
    reset_url: String,
}

impl StatsClient {
    pub fn new(endpoint: &ServiceEndpoint, timeout: Duration) -> Result<Self> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout(timeout)
            .build();
        Ok(Self {
            agent,
            stats_url: endpoint.api_url(STATS_PATH)?.to_string(),
            reset_url: endpoint.api_url(RESET_PATH)?.to_string(),
        })
    }
}

impl StatsFetcher for StatsClient {
    fn fetch(&self) -> Result<StatsSnapshot> {
        let response = self
            .agent
            .get(&self.stats_url)
            .call()
            .with_context(|| format!("GET {}", self.stats_url))?;
        let mut body = Vec::new();
        response
            .into_reader()
            .take(MAX_STATS_BYTES)
            .read_to_end(&mut body)
            .context("read stats response")?;
        StatsSnapshot::from_json(&body)
    }

    fn reset(&self) -> Result<()> {
        self.agent
            .post(&self.reset_url)
            .call()
            .with_context(|| format!("POST {}", self.reset_url))?;
        log::info!("service statistics reset");
        Ok(())
    }
}

/// Poll outcome counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    pub successes: u64,
    pub failures: u64,
    /// Polls suppressed because the connection was not `Connected`.
    pub skipped: u64,
}

pub struct StatsReconciler;

impl StatsReconciler {
    /// Poll `fetch` every `interval` while `is_connected` holds and hand each
    /// successful snapshot to `on_update`. Failed polls are logged and
    /// skipped; the next tick is the retry.
    pub fn start<F, G, U>(
        mut fetch: F,
        interval: Duration,
        is_connected: G,
        mut on_update: U,
    ) -> Result<ReconcilerHandle>
    where
        F: FnMut() -> Result<StatsSnapshot> + Send + 'static,
        G: Fn() -> bool + Send + 'static,
        U: FnMut(StatsSnapshot) + Send + 'static,
    {
        let stats = Arc::new(Mutex::new(ReconcilerStats::default()));
        let counters = stats.clone();
        let task = PeriodicTask::spawn("stats-reconciler", interval, move |ctx, _| {
            if !is_connected() {
                lock_or_recover(&counters).skipped += 1;
                return;
            }
            match fetch() {
                Ok(snapshot) => {
                    if ctx.stop_requested() {
                        return;
                    }
                    lock_or_recover(&counters).successes += 1;
                    on_update(snapshot);
                }
                Err(e) => {
                    log::warn!("stats fetch failed: {:#}", e);
                    lock_or_recover(&counters).failures += 1;
                }
            }
        })?;
        Ok(ReconcilerHandle { task, stats })
    }
}

pub struct ReconcilerHandle {
    task: PeriodicTask,
    stats: Arc<Mutex<ReconcilerStats>>,
}

impl ReconcilerHandle {
    pub fn stats(&self) -> ReconcilerStats {
        lock_or_recover(&self.stats).clone()
    }

    pub fn stop(self) -> ReconcilerStats {
        let Self { task, stats } = self;
        task.stop();
        let stats = lock_or_recover(&stats).clone();
        stats
    }
}
