//! Broker addressing and TLS material for the MQTT streaming transport.
//!
//! Broker addresses accept:
//! - `host:port` (plain TCP unless TLS is forced)
//! - `mqtt://host:port` / `tcp://host:port` (plain TCP)
//! - `mqtts://host:port` / `ssl://host:port` (TLS)
//! - `[ipv6]:port`

use anyhow::{anyhow, Context, Result};
use rumqttc::Transport;
use std::path::Path;

/// MQTT broker location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl std::fmt::Display for MqttEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.use_tls { "mqtts" } else { "mqtt" };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

/// Certificate material for TLS broker connections.
///
/// Without a CA the webpki roots are trusted.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    /// PEM-encoded CA certificate bytes.
    pub ca: Option<Vec<u8>>,
}

impl TlsMaterials {
    pub fn load(ca_path: Option<&Path>) -> Result<Self> {
        let ca = match ca_path {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("failed to read MQTT TLS CA '{}'", path.display()))?,
            ),
            None => None,
        };
        Ok(Self { ca })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some()
    }
}

/// Build the rumqttc transport for an endpoint.
pub fn build_transport(endpoint: &MqttEndpoint, materials: &TlsMaterials) -> Result<Transport> {
    if !endpoint.use_tls {
        if materials.is_configured() {
            return Err(anyhow!(
                "MQTT TLS CA provided but broker {} is not a TLS endpoint (use mqtts://)",
                endpoint
            ));
        }
        return Ok(Transport::tcp());
    }
    match &materials.ca {
        Some(ca) => Ok(Transport::tls(ca.clone(), None, None)),
        None => Ok(Transport::tls_with_default_config()),
    }
}

pub fn parse_mqtt_endpoint(addr: &str, force_tls: bool) -> Result<MqttEndpoint> {
    let mut use_tls = force_tls;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid MQTT port in {}", addr))?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("invalid MQTT port in {}", addr))?;
    Ok((host.to_string(), port))
}
