//! Contract between the device bridge and the broker connection
//!
//! The bridge never talks to rumqttc directly. Everything it needs from the
//! broker is expressed by [`TransportClient`], so the real connection
//! ([`MqttTransport`](super::mqtt_handler::MqttTransport)) and the in-process
//! test double are interchangeable.

use async_trait::async_trait;
use rumqttc::QoS;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

use super::error::TransportError;
use super::message_manager::MqttMessage;

/// Health of the shared broker link
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum LinkState {
    #[default]
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// Capability the bridge needs from a pub/sub client
///
/// One instance is shared by every device view; all subscriptions and
/// publishes multiplex over it.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Hands `payload` to the local client for transmission on `topic`
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS)
        -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// A fresh receiver for every inbound message, across all topics
    fn messages(&self) -> broadcast::Receiver<MqttMessage>;

    fn link_state(&self) -> watch::Receiver<LinkState>;
}

/// Resolves once the link reports [`LinkState::Connected`]
///
/// Returns immediately when already connected; otherwise waits at most
/// `timeout` for the next successful connection.
pub async fn wait_until_connected(
    mut link: watch::Receiver<LinkState>,
    timeout: Duration,
) -> Result<(), TransportError> {
    if *link.borrow() == LinkState::Connected {
        return Ok(());
    }
    match tokio::time::timeout(timeout, link.wait_for(|state| *state == LinkState::Connected))
        .await
    {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(TransportError::Closed),
        Err(_) => Err(TransportError::NotConnected(timeout)),
    }
}

#[cfg(test)]
pub use mock::MockTransport;


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_immediately_when_connected() {
        let (_tx, rx) = watch::channel(LinkState::Connected);
        assert!(wait_until_connected(rx, Duration::from_millis(1)).await.is_ok());
    }

    #[tokio::test]
    async fn wait_resolves_on_next_connection() {
        let (tx, rx) = watch::channel(LinkState::Connecting);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(LinkState::Connected);
        });
        assert!(wait_until_connected(rx, Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn wait_times_out_without_connection() {
        let (_tx, rx) = watch::channel(LinkState::Reconnecting);
        let result = wait_until_connected(rx, Duration::from_millis(20)).await;
        assert_eq!(
            result,
            Err(TransportError::NotConnected(Duration::from_millis(20)))
        );
    }
}
