use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::SourceResolution;
use crate::ingest::CaptureConfig;
use crate::transport::ServiceEndpoint;

const DEFAULT_SERVICE_URL: &str = "http://localhost:5000";
const DEFAULT_BROKER_ADDR: &str = "127.0.0.1:1883";
const DEFAULT_TOPIC_PREFIX: &str = "facewatch";
const DEFAULT_CLIENT_ID: &str = "facewatch_client";
const DEFAULT_CAPTURE_URL: &str = "stub://webcam";
const DEFAULT_CAPTURE_WIDTH: u32 = 640;
const DEFAULT_CAPTURE_HEIGHT: u32 = 480;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_FRAME_INTERVAL_MS: u64 = 100;
const DEFAULT_STATS_INTERVAL_MS: u64 = 2000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Deserialize, Default)]
struct ClientConfigFile {
    service_url: Option<String>,
    transports: Option<Vec<String>>,
    mqtt: Option<MqttConfigFile>,
    capture: Option<CaptureConfigFile>,
    frame_interval_ms: Option<u64>,
    stats_interval_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker_addr: Option<String>,
    topic_prefix: Option<String>,
    client_id: Option<String>,
    ca_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    jpeg_quality: Option<u8>,
}

/// Transport kinds, in the order they are attempted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    /// Socket.IO over a websocket.
    Websocket,
    /// Socket.IO over Engine.IO long-polling.
    Polling,
    /// Bridged service on an MQTT broker.
    Mqtt,
    /// Bridged service with a `POST /api/detect` endpoint.
    Http,
}

impl TransportKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "websocket" => Ok(Self::Websocket),
            "polling" => Ok(Self::Polling),
            "mqtt" => Ok(Self::Mqtt),
            "http" => Ok(Self::Http),
            other => Err(anyhow!(
                "unknown transport '{}'; expected websocket, polling, mqtt or http",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub service_url: String,
    pub transports: Vec<TransportKind>,
    pub mqtt: MqttSettings,
    pub capture: CaptureSettings,
    pub frame_interval: Duration,
    pub stats_interval: Duration,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker_addr: String,
    pub topic_prefix: String,
    pub client_id: String,
    pub ca_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub jpeg_quality: u8,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service_url: DEFAULT_SERVICE_URL.to_string(),
            transports: vec![TransportKind::Websocket, TransportKind::Polling],
            mqtt: MqttSettings {
                broker_addr: DEFAULT_BROKER_ADDR.to_string(),
                topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
                client_id: DEFAULT_CLIENT_ID.to_string(),
                ca_path: None,
            },
            capture: CaptureSettings {
                url: DEFAULT_CAPTURE_URL.to_string(),
                width: DEFAULT_CAPTURE_WIDTH,
                height: DEFAULT_CAPTURE_HEIGHT,
                jpeg_quality: DEFAULT_JPEG_QUALITY,
            },
            frame_interval: Duration::from_millis(DEFAULT_FRAME_INTERVAL_MS),
            stats_interval: Duration::from_millis(DEFAULT_STATS_INTERVAL_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }
}

impl ClientConfig {
    /// Defaults, then the JSON file named by `FACEWATCH_CONFIG`, then
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FACEWATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like [`load`](Self::load) with an explicit file path.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ClientConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let transports = match file.transports {
            Some(names) => names
                .iter()
                .map(|name| TransportKind::parse(name))
                .collect::<Result<Vec<_>>>()?,
            None => defaults.transports,
        };
        let mqtt = file.mqtt.unwrap_or_default();
        let capture = file.capture.unwrap_or_default();
        Ok(Self {
            service_url: file.service_url.unwrap_or(defaults.service_url),
            transports,
            mqtt: MqttSettings {
                broker_addr: mqtt.broker_addr.unwrap_or(defaults.mqtt.broker_addr),
                topic_prefix: mqtt.topic_prefix.unwrap_or(defaults.mqtt.topic_prefix),
                client_id: mqtt.client_id.unwrap_or(defaults.mqtt.client_id),
                ca_path: mqtt.ca_path,
            },
            capture: CaptureSettings {
                url: capture.url.unwrap_or(defaults.capture.url),
                width: capture.width.unwrap_or(DEFAULT_CAPTURE_WIDTH),
                height: capture.height.unwrap_or(DEFAULT_CAPTURE_HEIGHT),
                jpeg_quality: capture.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            },
            frame_interval: Duration::from_millis(
                file.frame_interval_ms.unwrap_or(DEFAULT_FRAME_INTERVAL_MS),
            ),
            stats_interval: Duration::from_millis(
                file.stats_interval_ms.unwrap_or(DEFAULT_STATS_INTERVAL_MS),
            ),
            connect_timeout: Duration::from_millis(
                file.connect_timeout_ms
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            ),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("FACEWATCH_SERVICE_URL") {
            if !url.trim().is_empty() {
                self.service_url = url.trim().to_string();
            }
        }
        if let Ok(transports) = std::env::var("FACEWATCH_TRANSPORTS") {
            let parsed = split_csv(&transports)
                .iter()
                .map(|name| TransportKind::parse(name))
                .collect::<Result<Vec<_>>>()?;
            if !parsed.is_empty() {
                self.transports = parsed;
            }
        }
        if let Ok(addr) = std::env::var("FACEWATCH_MQTT_BROKER") {
            if !addr.trim().is_empty() {
                self.mqtt.broker_addr = addr.trim().to_string();
            }
        }
        if let Ok(url) = std::env::var("FACEWATCH_CAPTURE_URL") {
            if !url.trim().is_empty() {
                self.capture.url = url.trim().to_string();
            }
        }
        if let Ok(interval) = std::env::var("FACEWATCH_FRAME_INTERVAL_MS") {
            let millis: u64 = interval.trim().parse().map_err(|_| {
                anyhow!("FACEWATCH_FRAME_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.frame_interval = Duration::from_millis(millis);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.transports.is_empty() {
            return Err(anyhow!("at least one transport must be configured"));
        }
        if self.frame_interval.is_zero() {
            return Err(anyhow!("frame_interval_ms must be greater than zero"));
        }
        if self.stats_interval.is_zero() {
            return Err(anyhow!("stats_interval_ms must be greater than zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(anyhow!("connect_timeout_ms must be greater than zero"));
        }
        if self.capture.jpeg_quality == 0 || self.capture.jpeg_quality > 100 {
            return Err(anyhow!(
                "capture.jpeg_quality must be within 1..=100 (got {})",
                self.capture.jpeg_quality
            ));
        }
        if self.mqtt.topic_prefix.trim_matches('/').is_empty() {
            return Err(anyhow!("mqtt.topic_prefix must not be empty"));
        }
        if self.mqtt.client_id.trim().is_empty() {
            return Err(anyhow!("mqtt.client_id must not be empty"));
        }
        if let Some(path) = &self.mqtt.ca_path {
            if !path.is_file() {
                return Err(anyhow!("mqtt.ca_path {} not found", path.display()));
            }
        }
        self.resolution()?;
        self.endpoint()?;
        Ok(())
    }

    pub fn resolution(&self) -> Result<SourceResolution> {
        SourceResolution::new(self.capture.width, self.capture.height)
            .map_err(|e| anyhow!("capture resolution: {}", e))
    }

    pub fn endpoint(&self) -> Result<ServiceEndpoint> {
        ServiceEndpoint::new(&self.service_url, &self.mqtt.broker_addr)
    }

    pub fn capture_config(&self) -> Result<CaptureConfig> {
        Ok(CaptureConfig {
            url: self.capture.url.clone(),
            resolution: self.resolution()?,
            jpeg_quality: self.capture.jpeg_quality,
            request_timeout: self.connect_timeout,
        })
    }
}

fn read_config_file(path: &Path) -> Result<ClientConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
