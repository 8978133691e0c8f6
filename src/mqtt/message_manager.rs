use chrono::{DateTime, Local};
use std::fmt;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const PREVIEW_CHARS: usize = 32;

/// A message delivered by the broker on one topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl fmt::Display for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = String::from_utf8_lossy(&self.payload);
        let preview: String = text.chars().take(PREVIEW_CHARS).collect();
        write!(
            f,
            "{} - {}: {}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            preview
        )
    }
}

impl MqttMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        MqttMessage {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Local::now(),
        }
    }

    pub fn is_for(&self, topic: &str) -> bool {
        self.topic == topic
    }
}

/// Fans inbound broker messages out to every registered listener
///
/// Listeners get their own receiver and filter by topic themselves. A slow
/// listener lags and loses the oldest messages instead of stalling the
/// broker loop.
#[derive(Debug, Clone)]
pub struct MsgManager {
    distribution: broadcast::Sender<MqttMessage>,
}

impl MsgManager {
    pub fn new(capacity: usize) -> Self {
        let (distribution, _) = broadcast::channel(capacity.max(1));
        Self { distribution }
    }

    pub fn listen(&self) -> broadcast::Receiver<MqttMessage> {
        self.distribution.subscribe()
    }

    pub fn deliver(&self, message: MqttMessage) {
        debug!("Delivering {}", message);
        if self.distribution.send(message).is_err() {
            debug!("No listeners registered, message dropped");
        }
    }
}

/// Waits for the next message on `topic`, skipping everything else
///
/// Returns `None` once the channel is closed. Lagged receivers log the gap
/// and keep reading.
pub async fn next_on_topic(
    rx: &mut broadcast::Receiver<MqttMessage>,
    topic: &str,
) -> Option<MqttMessage> {
    loop {
        match rx.recv().await {
            Ok(message) if message.is_for(topic) => return Some(message),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Listener on {} lagged, {} messages skipped", topic, skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_listener_sees_every_message() {
        let manager = MsgManager::new(8);
        let mut first = manager.listen();
        let mut second = manager.listen();

        manager.deliver(MqttMessage::from_topic("a", "1"));

        assert_eq!(first.recv().await.unwrap().payload, b"1");
        assert_eq!(second.recv().await.unwrap().payload, b"1");
    }

    #[tokio::test]
    async fn next_on_topic_skips_other_topics() {
        let manager = MsgManager::new(8);
        let mut rx = manager.listen();

        manager.deliver(MqttMessage::from_topic("other", "x"));
        manager.deliver(MqttMessage::from_topic("wanted", "y"));

        let message = next_on_topic(&mut rx, "wanted").await.unwrap();
        assert_eq!(message.payload, b"y");
    }

    #[test]
    fn display_truncates_long_payloads() {
        let message = MqttMessage::from_topic("t", "x".repeat(100));
        let rendered = message.to_string();
        assert!(rendered.ends_with(&"x".repeat(PREVIEW_CHARS)));
        assert!(!rendered.contains(&"x".repeat(PREVIEW_CHARS + 1)));
    }
}
