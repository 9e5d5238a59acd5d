//! facewatch - stream webcam stills to a face/age/gender detection service.
//!
//! Connects to the service (websocket, falling back to long-polling), sends
//! frames at the configured cadence and logs the latest detections,
//! throughput and service statistics until interrupted. After a transport
//! failure it reconnects every `--retry-interval-ms`.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use facewatch_client::{ClientConfig, ConnectionState, StreamClient, StreamView};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Stream frames to a face/age/gender detection service"
)]
struct Args {
    /// JSON config file. Environment overrides still apply.
    #[arg(long, env = "FACEWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Stop after this many seconds (0 = run until Ctrl-C).
    #[arg(long, default_value_t = 0)]
    duration_secs: u64,

    /// How often to log the current view.
    #[arg(long, default_value_t = 1000)]
    status_interval_ms: u64,

    /// Reset the service's statistics before streaming.
    #[arg(long)]
    reset_stats: bool,

    /// Reconnect this long after a transport failure (0 = stay in error).
    #[arg(long, env = "FACEWATCH_RETRY_INTERVAL_MS", default_value_t = 5000)]
    retry_interval_ms: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.status_interval_ms == 0 {
        return Err(anyhow!("--status-interval-ms must be greater than zero"));
    }

    let config = ClientConfig::load_from(args.config.as_deref())?;
    log::info!("facewatch starting");
    log::info!("  service: {}", config.service_url);
    log::info!("  transports: {:?}", config.transports);
    log::info!("  mqtt broker: {}", config.mqtt.broker_addr);
    log::info!(
        "  capture: {} ({}x{}, every {}ms)",
        config.capture.url,
        config.capture.width,
        config.capture.height,
        config.frame_interval.as_millis()
    );

    let client = StreamClient::from_config(&config)?;
    if args.reset_stats {
        if let Err(e) = client.reset_stats() {
            log::warn!("stats reset failed: {:#}", e);
        }
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let state = client.start()?;
    if let Some(error) = client.last_error() {
        log::warn!("streaming started in {} state: {}", state, error);
    }

    let deadline =
        (args.duration_secs > 0).then(|| Instant::now() + Duration::from_secs(args.duration_secs));
    let status_interval = Duration::from_millis(args.status_interval_ms);
    let retry_interval =
        (args.retry_interval_ms > 0).then(|| Duration::from_millis(args.retry_interval_ms));
    let mut retry = RetryTimer::default();
    loop {
        let wait = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    log::info!("run duration elapsed");
                    break;
                }
                remaining.min(status_interval)
            }
            None => status_interval,
        };
        match rx.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                log::info!("shutdown signal received, stopping stream...");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                let view = client.view();
                log_view(&client, &view);
                if retry.due(view.connection, retry_interval, Instant::now()) {
                    let state = client.retry();
                    log::info!("reconnect attempt finished: {}", state);
                }
            }
        }
    }

    client.stop();
    let stats = client.frame_source_stats();
    log::info!(
        "facewatch stopped: {} frames captured, {} capture failures",
        stats.frames_captured,
        stats.failures
    );
    Ok(())
}

fn log_view(client: &StreamClient, view: &StreamView) {
    if view.initializing {
        log::info!(
            "[{}] waiting for first detection result (transport: {})",
            view.connection,
            client.transport().unwrap_or("none")
        );
    } else {
        let labels: Vec<String> = view
            .overlays
            .iter()
            .map(|overlay| {
                format!(
                    "{} @ ({:.2}, {:.2})",
                    overlay.label, overlay.rect.left, overlay.rect.top
                )
            })
            .collect();
        log::info!(
            "[{}] {:.1} fps, {} face(s): {}",
            view.connection,
            view.fps,
            view.face_count,
            labels.join("; ")
        );
    }
    let stats = &view.stats;
    log::info!(
        "  totals: {} faces, {} current, {:.2}/min avg, last {}",
        stats.total_faces,
        stats.current_faces,
        stats.avg_detections_per_minute,
        stats.last_detection.as_deref().unwrap_or("never")
    );
    if stats.total_faces > 0 {
        log::info!("  age: {}", format_shares(&stats.age_shares()));
        log::info!("  gender: {}", format_shares(&stats.gender_shares()));
    }
    if let Some(error) = client.last_error() {
        log::warn!("  connection error: {}", error);
    }
    let capture = client.frame_source_stats();
    if !capture.healthy {
        log::warn!(
            "  capture source {} unhealthy ({} failures)",
            capture.source,
            capture.failures
        );
    }
}

fn format_shares(shares: &[(String, f64)]) -> String {
    shares
        .iter()
        .map(|(label, pct)| format!("{} {:.0}%", label, pct))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Schedules reconnects: one attempt per `interval` spent in `Error`.
#[derive(Debug, Default)]
struct RetryTimer {
    failed_since: Option<Instant>,
}

impl RetryTimer {
    fn due(&mut self, state: ConnectionState, interval: Option<Duration>, now: Instant) -> bool {
        let Some(interval) = interval else {
            return false;
        };
        if state != ConnectionState::Error {
            self.failed_since = None;
            return false;
        }
        let since = *self.failed_since.get_or_insert(now);
        if now.saturating_duration_since(since) < interval {
            return false;
        }
        self.failed_since = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_fires_once_per_interval_in_error() {
        let t0 = Instant::now();
        let interval = Some(Duration::from_secs(5));
        let mut retry = RetryTimer::default();
        assert!(!retry.due(ConnectionState::Error, interval, t0));
        assert!(!retry.due(ConnectionState::Error, interval, t0 + Duration::from_secs(4)));
        assert!(retry.due(ConnectionState::Error, interval, t0 + Duration::from_secs(5)));
        assert!(!retry.due(ConnectionState::Error, interval, t0 + Duration::from_secs(6)));
        assert!(retry.due(ConnectionState::Error, interval, t0 + Duration::from_secs(10)));
    }

    #[test]
    fn recovery_resets_the_timer() {
        let t0 = Instant::now();
        let interval = Some(Duration::from_secs(5));
        let mut retry = RetryTimer::default();
        assert!(!retry.due(ConnectionState::Error, interval, t0));
        assert!(!retry.due(ConnectionState::Connected, interval, t0 + Duration::from_secs(6)));
        assert!(!retry.due(ConnectionState::Error, interval, t0 + Duration::from_secs(7)));
        assert!(retry.due(ConnectionState::Error, interval, t0 + Duration::from_secs(12)));
    }

    #[test]
    fn disabled_retry_never_fires() {
        let t0 = Instant::now();
        let mut retry = RetryTimer::default();
        assert!(!retry.due(ConnectionState::Error, None, t0));
        assert!(!retry.due(ConnectionState::Error, None, t0 + Duration::from_secs(60)));
    }

    #[test]
    fn shares_are_formatted_as_percentages() {
        let shares = vec![("20-29".to_string(), 75.0), ("30-39".to_string(), 25.0)];
        assert_eq!(format_shares(&shares), "20-29 75%, 30-39 25%");
    }
}
