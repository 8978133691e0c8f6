use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::TransportError;

const DEFAULT_TCP_PORT: u16 = 1883;
const DEFAULT_WS_PATH: &str = "/mqtt";

/// Broker connection settings for the shared transport
///
/// Values mirror what the dashboard needs from a long-lived browser-style
/// client: clean sessions, a last will and a fixed reconnect period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// `mqtt://host:port`, `ws://host:port/path` or `wss://host:port/path`
    pub url: String,
    /// Client identifier; a random `cpo-web-<hex>` id is generated when empty
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub reconnect_period_ms: u64,
    /// Upper bound for deferred operations waiting on the first connection
    pub connect_timeout_ms: u64,
    /// Capacity of the rumqttc request channel
    pub request_capacity: usize,
    /// Capacity of the inbound fan-out channel shared by all listeners
    pub inbound_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            url: "mqtt://localhost:1883".to_string(),
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive_secs: 60,
            reconnect_period_ms: 3_000,
            connect_timeout_ms: 20_000,
            request_capacity: 64,
            inbound_capacity: 256,
        }
    }
}

/// Broker address parsed from [`MqttConfig::url`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerAddress {
    Tcp { host: String, port: u16 },
    WebSocket { url: String, port: u16, secure: bool },
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_period(&self) -> Duration {
        Duration::from_millis(self.reconnect_period_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Returns the configured client id or a fresh random one
    pub fn resolved_client_id(&self) -> String {
        if self.client_id.is_empty() {
            let nanos = chrono::Utc::now().timestamp_subsec_nanos();
            let pid = std::process::id();
            format!("cpo-web-{:x}{:x}", nanos, pid)
        } else {
            self.client_id.clone()
        }
    }

    pub fn broker_address(&self) -> Result<BrokerAddress, TransportError> {
        parse_broker_url(&self.url)
    }
}

/// Splits a broker URL into the form rumqttc expects
///
/// WebSocket URLs keep their full text (rumqttc takes the URL as host) and
/// get the `/mqtt` path when none is present.
pub fn parse_broker_url(raw: &str) -> Result<BrokerAddress, TransportError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(TransportError::InvalidConfig(
            "broker URL not provided".to_string(),
        ));
    }

    if let Some(rest) = raw.strip_prefix("ws://") {
        return websocket_address(rest, false);
    }
    if let Some(rest) = raw.strip_prefix("wss://") {
        return websocket_address(rest, true);
    }

    let rest = raw
        .strip_prefix("mqtt://")
        .or_else(|| raw.strip_prefix("tcp://"))
        .unwrap_or(raw);
    let authority = rest.split('/').next().unwrap_or(rest);
    let (host, port) = split_host_port(authority, DEFAULT_TCP_PORT)?;
    Ok(BrokerAddress::Tcp { host, port })
}

fn websocket_address(rest: &str, secure: bool) -> Result<BrokerAddress, TransportError> {
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    let default_port = if secure { 443 } else { 80 };
    let (host, port) = split_host_port(authority, default_port)?;

    let mut path = path.trim_end_matches('/').to_string();
    if path.is_empty() {
        path = DEFAULT_WS_PATH.to_string();
    }

    let scheme = if secure { "wss" } else { "ws" };
    Ok(BrokerAddress::WebSocket {
        url: format!("{}://{}:{}{}", scheme, host, port, path),
        port,
        secure,
    })
}

fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16), TransportError> {
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|e| {
                TransportError::InvalidConfig(format!("invalid port '{}': {}", port, e))
            })?;
            (host, port)
        }
        None => (authority, default_port),
    };
    if host.is_empty() {
        return Err(TransportError::InvalidConfig(format!(
            "missing host in '{}'",
            authority
        )));
    }
    Ok((host.to_string(), port))
}
