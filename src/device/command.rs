//! Fire-and-forget device commands
//!
//! A successful [`CommandPublisher::send`] only means the local client
//! accepted the message. Whether the device acted on it is inferred later
//! from its status topic.

use chrono::Utc;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::device::error::BridgeError;
use crate::device::identity::DeviceId;
use crate::mqtt::topics::{TopicKind, TopicNamer};
use crate::mqtt::transport::{wait_until_connected, TransportClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    StartMeasurement,
    StopMeasurement,
    Connect,
    Disconnect,
    Ping,
}

impl Command {
    /// The connect/disconnect command that requests `target` connectivity
    pub fn for_target(target: bool) -> Self {
        if target {
            Command::Connect
        } else {
            Command::Disconnect
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Command::StartMeasurement => "start_measurement",
            Command::StopMeasurement => "stop_measurement",
            Command::Connect => "connect",
            Command::Disconnect => "disconnect",
            Command::Ping => "ping",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire form published on the command topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub cmd: Command,
    /// Unix millis at issue time
    pub ts: i64,
}

impl CommandEnvelope {
    pub fn now(cmd: Command) -> Self {
        Self {
            cmd,
            ts: Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Clone)]
pub struct CommandPublisher {
    transport: Arc<dyn TransportClient>,
    namer: TopicNamer,
    connect_timeout: Duration,
}

impl CommandPublisher {
    pub fn new(transport: Arc<dyn TransportClient>, namer: TopicNamer, connect_timeout: Duration) -> Self {
        Self {
            transport,
            namer,
            connect_timeout,
        }
    }

    /// Publishes `command` to the device's command topic at most once
    ///
    /// When the link is down the publish waits for the next connection, up
    /// to the connect timeout, and is then attempted exactly once.
    pub async fn send(&self, device: &DeviceId, command: Command) -> Result<(), BridgeError> {
        let topic = self.namer.topic_for(TopicKind::Command, device.as_str());
        let payload = serde_json::to_vec(&CommandEnvelope::now(command))?;

        if let Err(e) = wait_until_connected(self.transport.link_state(), self.connect_timeout).await {
            error!("Cannot send {} to {}: {}", command, device, e);
            return Err(e.into());
        }

        debug!("Publishing {} on {}", command, topic);
        match self.transport.publish(&topic, payload, QoS::AtMostOnce).await {
            Ok(()) => {
                info!("Sent {} to {}", command, device);
                Ok(())
            }
            Err(e) => {
                error!("Failed to send {} to {}: {}", command, device, e);
                Err(e.into())
            }
        }
    }

    pub async fn start_measurement(&self, device: &DeviceId) -> Result<(), BridgeError> {
        self.send(device, Command::StartMeasurement).await
    }

    pub async fn stop_measurement(&self, device: &DeviceId) -> Result<(), BridgeError> {
        self.send(device, Command::StopMeasurement).await
    }

    pub async fn connect(&self, device: &DeviceId) -> Result<(), BridgeError> {
        self.send(device, Command::Connect).await
    }

    pub async fn disconnect(&self, device: &DeviceId) -> Result<(), BridgeError> {
        self.send(device, Command::Disconnect).await
    }

    pub async fn ping(&self, device: &DeviceId) -> Result<(), BridgeError> {
        self.send(device, Command::Ping).await
    }
}

/// Measurement commands for one device
///
/// Connect and disconnect are not reachable from here; they belong to the
/// bridge's tracker.
#[derive(Clone)]
pub struct MeasurementControl {
    publisher: CommandPublisher,
    device: DeviceId,
}

impl MeasurementControl {
    pub fn new(publisher: CommandPublisher, device: DeviceId) -> Self {
        Self { publisher, device }
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub async fn start(&self) -> Result<(), BridgeError> {
        self.publisher.start_measurement(&self.device).await
    }

    pub async fn stop(&self) -> Result<(), BridgeError> {
        self.publisher.stop_measurement(&self.device).await
    }
}
