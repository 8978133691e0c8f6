//! Status reconciler
//!
//! Turns the device's status topic into one observable [`Connectivity`]
//! value. It is the only writer of that value.
//!
//! ```text
//!   Unknown ──── online ────► Connected
//!      │                       │     ▲
//!      │ offline /       offline   online
//!      │ record absent         ▼     │
//!      └────────────────────► Disconnected
//! ```
//!
//! Undecodable payloads never change the state. Accepted transitions are
//! mirrored into the device record of the document store. With a tracker
//! attached, every accepted transition reaches it as well, in order and
//! before the observable changes.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::identity::DeviceId;
use crate::device::status::{decode_status, Connectivity, StatusDecode};
use crate::device::tracker::TrackerHandle;
use crate::mqtt::message_manager::{next_on_topic, MqttMessage};
use crate::persistence::store::DocumentStore;

pub struct StatusReconciler {
    device: DeviceId,
    topic: String,
    store: Arc<dyn DocumentStore>,
    connectivity: Arc<watch::Sender<Connectivity>>,
    tracker: Option<TrackerHandle>,
}

impl StatusReconciler {
    pub fn new(
        device: DeviceId,
        topic: impl Into<String>,
        store: Arc<dyn DocumentStore>,
        connectivity: Arc<watch::Sender<Connectivity>>,
    ) -> Self {
        Self {
            device,
            topic: topic.into(),
            store,
            connectivity,
            tracker: None,
        }
    }

    pub fn with_tracker(mut self, tracker: TrackerHandle) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Writes `next` and hands it to the tracker; returns the previous value
    async fn publish(&self, next: Connectivity) -> Connectivity {
        let send = || self.connectivity.send_replace(next);
        match &self.tracker {
            Some(tracker) => tracker.observe(next, send).await,
            None => send(),
        }
    }

    /// Forces `Disconnected` when the device was never provisioned
    pub async fn check_record(&self) {
        match self.store.get_device(&self.device).await {
            Ok(Some(_)) => debug!("Device record for {} exists", self.device),
            Ok(None) => {
                info!("No record for device {}, treating as disconnected", self.device);
                self.publish(Connectivity::Disconnected).await;
            }
            Err(e) => warn!("Device lookup for {} failed: {}", self.device, e),
        }
    }

    /// Decodes one status payload and applies it
    ///
    /// Returns the new connectivity, or `None` when the payload was discarded.
    pub async fn apply_payload(&self, payload: &[u8]) -> Option<Connectivity> {
        let decoded = decode_status(payload);
        let Some(next) = decoded.connectivity() else {
            debug!("Discarded undecodable status for {}", self.device);
            return None;
        };
        if let StatusDecode::Structured(_) = decoded {
            debug!("Structured status for {}: {}", self.device, next);
        }

        let previous = self.publish(next).await;
        if previous != next {
            info!("Device {} is now {} (was {})", self.device, next, previous);
        }

        if let Some(connected) = next.as_bool() {
            if let Err(e) = self
                .store
                .update_device_status(&self.device, connected, Utc::now())
                .await
            {
                warn!("Could not store status of {}: {}", self.device, e);
            }
        }
        Some(next)
    }

    /// Processes status messages in delivery order until cancelled
    pub async fn run(self, mut inbound: broadcast::Receiver<MqttMessage>, cancel: CancellationToken) {
        info!("Status reconciler started on {}", self.topic);
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Status reconciler cancelled on {}", self.topic);
                return;
            }
            _ = self.check_record() => {}
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = next_on_topic(&mut inbound, &self.topic) => match message {
                    Some(message) => {
                        self.apply_payload(&message.payload).await;
                    }
                    None => break,
                },
            }
        }
        info!("Status reconciler stopped on {}", self.topic);
    }
}
