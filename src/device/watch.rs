//! Per-device subscription lifecycle with statum
//!
//! A watch owns every resource tied to observing one device: the status and
//! telemetry subscriptions plus the tasks consuming them. Releasing it is
//! the only way to move on to another device, so listeners for a device
//! that is no longer displayed cannot outlive it.
//!
//! # State Machine
//!
//! ```text
//! Idle ──start()──► Watching ──release()──► Released
//! ```
//!
//! Dropping a `Watching` watch without releasing it cancels its tasks; the
//! broker subscriptions are only given back by `release()`.

use statum::{machine, state};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{error, info, warn};

use crate::device::identity::DeviceId;
use crate::device::reconciler::StatusReconciler;
use crate::device::status::Connectivity;
use crate::device::telemetry::{TelemetryListener, TelemetrySample};
use crate::device::tracker::TrackerHandle;
use crate::mqtt::error::TransportError;
use crate::mqtt::topics::DeviceTopics;
use crate::mqtt::transport::TransportClient;
use crate::persistence::store::DocumentStore;

#[state]
#[derive(Debug, Clone)]
pub enum WatchState {
    Idle,     // Topics resolved, nothing subscribed
    Watching, // Subscribed, listener tasks running
    Released, // Unsubscribed, tasks joined
}

#[machine]
pub struct DeviceWatch<S: WatchState> {
    device: DeviceId,
    topics: DeviceTopics,
    transport: Arc<dyn TransportClient>,
    store: Arc<dyn DocumentStore>,
    connectivity: Arc<watch::Sender<Connectivity>>,
    telemetry: Arc<watch::Sender<Option<TelemetrySample>>>,
    tracker: Option<TrackerHandle>,
    cancel: CancellationToken,
    guard: Option<DropGuard>,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: WatchState> DeviceWatch<S> {
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn topics(&self) -> &DeviceTopics {
        &self.topics
    }
}

impl DeviceWatch<Idle> {
    pub fn create(
        device: DeviceId,
        topics: DeviceTopics,
        transport: Arc<dyn TransportClient>,
        store: Arc<dyn DocumentStore>,
        connectivity: Arc<watch::Sender<Connectivity>>,
        telemetry: Arc<watch::Sender<Option<TelemetrySample>>>,
    ) -> Self {
        Self::new(
            device,
            topics,
            transport,
            store,
            connectivity,
            telemetry,
            None, // tracker
            CancellationToken::new(),
            None,       // guard
            Vec::new(), // tasks
        )
    }

    /// Feeds every accepted status of this device into `tracker`
    pub fn with_tracker(mut self, tracker: TrackerHandle) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Subscribes both device topics and starts the reconciler and telemetry listener
    ///
    /// Receivers are taken before subscribing so a retained status delivered
    /// right after the SUBSCRIBE is not missed.
    pub async fn start(mut self) -> Result<DeviceWatch<Watching>, TransportError> {
        info!("Starting watch for device {}", self.device);

        let status_rx = self.transport.messages();
        let telemetry_rx = self.transport.messages();

        self.transport.subscribe(&self.topics.status).await?;
        if let Err(e) = self.transport.subscribe(&self.topics.telemetry).await {
            error!("Telemetry subscribe for {} failed: {}", self.device, e);
            if let Err(e) = self.transport.unsubscribe(&self.topics.status).await {
                warn!("Rollback unsubscribe of {} failed: {}", self.topics.status, e);
            }
            return Err(e);
        }

        self.connectivity.send_replace(Connectivity::Unknown);
        self.telemetry.send_replace(None);

        let mut reconciler = StatusReconciler::new(
            self.device.clone(),
            self.topics.status.clone(),
            self.store.clone(),
            self.connectivity.clone(),
        );
        if let Some(tracker) = self.tracker.clone() {
            reconciler = reconciler.with_tracker(tracker);
        }
        let listener = TelemetryListener::new(self.topics.telemetry.clone(), self.telemetry.clone());

        self.tasks = vec![
            tokio::spawn(reconciler.run(status_rx, self.cancel.child_token())),
            tokio::spawn(listener.run(telemetry_rx, self.cancel.child_token())),
        ];
        self.guard = Some(self.cancel.clone().drop_guard());

        info!("Watching device {}", self.device);
        Ok(self.transition())
    }
}

impl DeviceWatch<Watching> {
    /// Token cancelled when this watch is released or dropped
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }

    /// Stops the listener tasks and gives both subscriptions back
    pub async fn release(mut self) -> DeviceWatch<Released> {
        info!("Releasing watch for device {}", self.device);

        if let Some(guard) = self.guard.take() {
            guard.disarm();
        }
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!("Watch task for {} failed: {}", self.device, e);
            }
        }

        for topic in [&self.topics.status, &self.topics.telemetry] {
            if let Err(e) = self.transport.unsubscribe(topic).await {
                warn!("Unsubscribe from {} failed: {}", topic, e);
            }
        }

        info!("Released device {}", self.device);
        self.transition()
    }
}

impl DeviceWatch<Released> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::topics::TopicNamer;
    use crate::mqtt::transport::MockTransport;
    use crate::persistence::store::MemoryStore;

    struct Fixture {
        transport: Arc<MockTransport>,
        connectivity: watch::Receiver<Connectivity>,
        watch: DeviceWatch<Idle>,
    }

    fn fixture() -> Fixture {
        let device = DeviceId::parse("D1").unwrap();
        let transport = Arc::new(MockTransport::connected());
        let store = Arc::new(MemoryStore::new().with_device(device.clone()));
        let (connectivity_tx, connectivity) = watch::channel(Connectivity::Unknown);
        let (telemetry_tx, _) = watch::channel(None);
        let watch = DeviceWatch::create(
            device.clone(),
            TopicNamer::new("ns").device_topics(device.as_str()),
            transport.clone(),
            store,
            Arc::new(connectivity_tx),
            Arc::new(telemetry_tx),
        );
        Fixture {
            transport,
            connectivity,
            watch,
        }
    }

    #[tokio::test]
    async fn start_subscribes_and_release_unsubscribes() {
        let Fixture {
            transport,
            mut connectivity,
            watch,
        } = fixture();

        let watching = watch.start().await.unwrap();
        assert_eq!(transport.subscription_count("ns/devices/D1/status"), 1);
        assert_eq!(transport.subscription_count("ns/devices/D1/telemetry"), 1);
        assert!(watching.is_running());

        transport.inject("ns/devices/D1/status", "online");
        connectivity
            .wait_for(|state| *state == Connectivity::Connected)
            .await
            .unwrap();

        let released = watching.release().await;
        assert_eq!(released.device().as_str(), "D1");
        assert_eq!(transport.subscription_count("ns/devices/D1/status"), 0);
        assert_eq!(transport.subscription_count("ns/devices/D1/telemetry"), 0);
    }

    #[tokio::test]
    async fn released_watch_stops_updating_state() {
        let Fixture {
            transport,
            connectivity,
            watch,
        } = fixture();

        let watching = watch.start().await.unwrap();
        watching.release().await;

        transport.inject("ns/devices/D1/status", "online");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(*connectivity.borrow(), Connectivity::Unknown);
    }

    #[tokio::test]
    async fn dropping_a_watch_cancels_its_tasks() {
        let Fixture { watch, .. } = fixture();
        let watching = watch.start().await.unwrap();
        let token = watching.child_token();

        drop(watching);
        assert!(token.is_cancelled());
    }
}
