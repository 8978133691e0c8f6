//! Live telemetry decoding and the latest-sample observable

use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::mqtt::message_manager::{next_on_topic, MqttMessage};

/// Sensor channels across both product variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    Turbidity,
    R,
    G,
    B,
    Ffa,
    Carotine,
    Moisture,
}

impl Channel {
    pub const ALL: [Channel; 7] = [
        Channel::Turbidity,
        Channel::R,
        Channel::G,
        Channel::B,
        Channel::Ffa,
        Channel::Carotine,
        Channel::Moisture,
    ];

    /// Accepted payload keys, checked in order
    pub fn spellings(self) -> [&'static str; 2] {
        match self {
            Channel::Turbidity => ["turbidity", "Turbidity"],
            Channel::R => ["r", "R"],
            Channel::G => ["g", "G"],
            Channel::B => ["b", "B"],
            Channel::Ffa => ["ffa", "FFA"],
            Channel::Carotine => ["carotine", "Carotine"],
            Channel::Moisture => ["moisture", "Moisture"],
        }
    }

    fn read(self, fields: &Map<String, Value>) -> Option<f64> {
        self.spellings()
            .iter()
            .find_map(|key| fields.get(*key).and_then(Value::as_f64))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.spellings()[1])
    }
}

/// The most recent reading reported by a device
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub channels: BTreeMap<Channel, f64>,
    /// Device-side classification, when the firmware reports one
    pub result: Option<bool>,
    /// Unix millis; arrival time when the device sent none
    pub ts: i64,
}

impl TelemetrySample {
    pub fn get(&self, channel: Channel) -> Option<f64> {
        self.channels.get(&channel).copied()
    }
}

impl fmt::Display for TelemetrySample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (channel, value) in &self.channels {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", channel, value)?;
            first = false;
        }
        if let Some(result) = self.result {
            write!(f, " result={}", result)?;
        }
        Ok(())
    }
}

/// Decodes one telemetry payload
///
/// Returns `None` when the payload is not a JSON object. Fields that are
/// missing or not numeric are left out of the sample.
pub fn decode_telemetry(payload: &[u8]) -> Option<TelemetrySample> {
    let Value::Object(fields) = serde_json::from_slice::<Value>(payload).ok()? else {
        return None;
    };

    let channels = Channel::ALL
        .iter()
        .filter_map(|channel| channel.read(&fields).map(|value| (*channel, value)))
        .collect();

    let ts = fields
        .get("ts")
        .and_then(|ts| ts.as_i64().or_else(|| ts.as_f64().and_then(whole_millis)))
        .unwrap_or_else(|| Utc::now().timestamp_millis());

    Some(TelemetrySample {
        channels,
        result: fields.get("result").and_then(Value::as_bool),
        ts,
    })
}

/// Fractional timestamps are truncated; values outside `i64` are rejected
fn whole_millis(ms: f64) -> Option<i64> {
    const LIMIT: f64 = i64::MAX as f64;
    (ms.is_finite() && ms.abs() < LIMIT).then(|| ms.trunc() as i64)
}

/// Republishes the latest decoded sample on a telemetry topic
pub struct TelemetryListener {
    topic: String,
    latest: Arc<watch::Sender<Option<TelemetrySample>>>,
}

impl TelemetryListener {
    pub fn new(
        topic: impl Into<String>,
        latest: Arc<watch::Sender<Option<TelemetrySample>>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            latest,
        }
    }

    /// Replaces the observable with one decoded message
    ///
    /// Undecodable payloads leave the previous sample in place.
    pub fn handle(&self, message: &MqttMessage) -> bool {
        match decode_telemetry(&message.payload) {
            Some(sample) => {
                debug!("Telemetry on {}: {}", self.topic, sample);
                self.latest.send_replace(Some(sample));
                true
            }
            None => {
                debug!("Dropped undecodable telemetry on {}", self.topic);
                false
            }
        }
    }

    pub async fn run(self, mut inbound: broadcast::Receiver<MqttMessage>, cancel: CancellationToken) {
        info!("Telemetry listener started on {}", self.topic);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = next_on_topic(&mut inbound, &self.topic) => match message {
                    Some(message) => {
                        self.handle(&message);
                    }
                    None => break,
                },
            }
        }
        info!("Telemetry listener stopped on {}", self.topic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "ns/devices/D1/telemetry";

    fn listener() -> (TelemetryListener, watch::Receiver<Option<TelemetrySample>>) {
        let (tx, rx) = watch::channel(None);
        (TelemetryListener::new(TOPIC, Arc::new(tx)), rx)
    }

    #[test]
    fn accepts_both_spellings_and_skips_non_numeric() {
        let sample = decode_telemetry(
            br#"{"Turbidity":1.2,"r":10,"G":"bright","B":4,"FFA":3.5,"moisture":0.1,"result":true,"ts":1700000000000}"#,
        )
        .unwrap();

        assert_eq!(sample.get(Channel::Turbidity), Some(1.2));
        assert_eq!(sample.get(Channel::R), Some(10.0));
        assert_eq!(sample.get(Channel::G), None);
        assert_eq!(sample.get(Channel::B), Some(4.0));
        assert_eq!(sample.get(Channel::Ffa), Some(3.5));
        assert_eq!(sample.get(Channel::Moisture), Some(0.1));
        assert_eq!(sample.get(Channel::Carotine), None);
        assert_eq!(sample.result, Some(true));
        assert_eq!(sample.ts, 1_700_000_000_000);
    }

    #[test]
    fn missing_ts_falls_back_to_arrival_time() {
        let before = Utc::now().timestamp_millis();
        let sample = decode_telemetry(br#"{"ffa":1}"#).unwrap();
        assert!(sample.ts >= before);
        assert_eq!(sample.result, None);
    }

    #[test]
    fn out_of_range_ts_falls_back_to_arrival_time() {
        let before = Utc::now().timestamp_millis();
        let sample = decode_telemetry(br#"{"ffa":1,"ts":1e300}"#).unwrap();
        assert!(sample.ts >= before);
        assert!(sample.ts < before + 60_000);

        let sample = decode_telemetry(br#"{"ts":1700000000000.9}"#).unwrap();
        assert_eq!(sample.ts, 1_700_000_000_000);
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(decode_telemetry(b"not json").is_none());
        assert!(decode_telemetry(b"[1,2]").is_none());
        assert!(decode_telemetry(b"3.5").is_none());
    }

    #[test]
    fn latest_sample_wins_without_merging() {
        let (listener, rx) = listener();

        listener.handle(&MqttMessage::from_topic(TOPIC, r#"{"turbidity":1,"r":5}"#));
        listener.handle(&MqttMessage::from_topic(TOPIC, r#"{"turbidity":2}"#));

        let latest = rx.borrow().clone().unwrap();
        assert_eq!(latest.get(Channel::Turbidity), Some(2.0));
        assert_eq!(latest.get(Channel::R), None);
        assert_eq!(latest.channels.len(), 1);
    }

    #[test]
    fn garbage_keeps_previous_sample() {
        let (listener, rx) = listener();

        listener.handle(&MqttMessage::from_topic(TOPIC, r#"{"turbidity":1}"#));
        assert!(!listener.handle(&MqttMessage::from_topic(TOPIC, "{garbage")));

        assert_eq!(rx.borrow().as_ref().unwrap().get(Channel::Turbidity), Some(1.0));
    }

    #[tokio::test]
    async fn run_ignores_other_topics_and_stops_on_cancel() {
        let (listener, mut rx) = listener();
        let (tx, inbound) = broadcast::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listener.run(inbound, cancel.clone()));

        tx.send(MqttMessage::from_topic("ns/devices/D2/telemetry", r#"{"r":9}"#))
            .unwrap();
        tx.send(MqttMessage::from_topic(TOPIC, r#"{"r":3}"#)).unwrap();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref().unwrap().get(Channel::R), Some(3.0));

        cancel.cancel();
        task.await.unwrap();
    }
}
