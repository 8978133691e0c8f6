//! Device bridge facade
//!
//! Owns the observables every surface reads and the binding to the device
//! currently displayed. Rebinding always releases the previous device's
//! watch before the next one starts.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use crate::device::command::{Command, CommandPublisher, MeasurementControl};
use crate::device::error::BridgeError;
use crate::device::identity::{normalize, DeviceId};
use crate::device::status::Connectivity;
use crate::device::telemetry::TelemetrySample;
use crate::device::tracker::{CommandState, Decision, TrackerEvent, TrackerHandle};
use crate::device::watch::{DeviceWatch, Watching};
use crate::mqtt::topics::TopicNamer;
use crate::mqtt::transport::TransportClient;
use crate::persistence::store::DocumentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeSettings {
    /// Longest a command waits for the broker link before failing
    pub connect_timeout: Duration,
    /// `None` keeps unconfirmed commands pending indefinitely
    pub confirm_timeout: Option<Duration>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            confirm_timeout: Some(Duration::from_secs(30)),
        }
    }
}

struct Binding {
    watch: DeviceWatch<Watching>,
    handle: TrackerHandle,
}

pub struct DeviceBridge {
    transport: Arc<dyn TransportClient>,
    store: Arc<dyn DocumentStore>,
    namer: TopicNamer,
    publisher: CommandPublisher,
    confirm_timeout: Option<Duration>,
    connectivity: Arc<watch::Sender<Connectivity>>,
    telemetry: Arc<watch::Sender<Option<TelemetrySample>>>,
    command_state: Arc<watch::Sender<CommandState>>,
    binding: Mutex<Option<Binding>>,
}

impl DeviceBridge {
    pub fn new(
        transport: Arc<dyn TransportClient>,
        store: Arc<dyn DocumentStore>,
        namer: TopicNamer,
        settings: BridgeSettings,
    ) -> Self {
        let publisher = CommandPublisher::new(transport.clone(), namer.clone(), settings.connect_timeout);
        let (connectivity, _) = watch::channel(Connectivity::Unknown);
        let (telemetry, _) = watch::channel(None);
        let (command_state, _) = watch::channel(CommandState::default());

        Self {
            transport,
            store,
            namer,
            publisher,
            confirm_timeout: settings.confirm_timeout,
            connectivity: Arc::new(connectivity),
            telemetry: Arc::new(telemetry),
            command_state: Arc::new(command_state),
            binding: Mutex::new(None),
        }
    }

    pub fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.subscribe()
    }

    pub fn telemetry(&self) -> watch::Receiver<Option<TelemetrySample>> {
        self.telemetry.subscribe()
    }

    pub fn command_state(&self) -> watch::Receiver<CommandState> {
        self.command_state.subscribe()
    }

    /// Start/stop handle for the bound device
    pub async fn measurement_control(&self) -> Option<MeasurementControl> {
        let device = self.device_id().await?;
        Some(MeasurementControl::new(self.publisher.clone(), device))
    }

    pub async fn device_id(&self) -> Option<DeviceId> {
        self.binding
            .lock()
            .await
            .as_ref()
            .map(|binding| binding.watch.device().clone())
    }

    /// Binds whatever device a stored identity refers to
    ///
    /// Identities that do not normalize leave the bridge unbound.
    pub async fn bind(&self, identity: &Value) -> Result<Option<DeviceId>, BridgeError> {
        let device = normalize(identity);
        self.bind_device(device.clone()).await?;
        Ok(device)
    }

    /// Switches the observed device
    ///
    /// Binding the current device again is a no-op; `None` only releases.
    pub async fn bind_device(&self, device: Option<DeviceId>) -> Result<(), BridgeError> {
        let mut binding = self.binding.lock().await;

        if binding.as_ref().map(|b| b.watch.device()) == device.as_ref() {
            debug!("Device binding unchanged");
            return Ok(());
        }

        if let Some(previous) = binding.take() {
            Self::teardown(previous).await;
        }
        self.reset_observables();

        let Some(device) = device else {
            info!("Bridge unbound");
            return Ok(());
        };

        let handle = TrackerHandle::new(self.command_state.clone());
        let topics = self.namer.device_topics(device.as_str());
        let watch = DeviceWatch::create(
            device.clone(),
            topics,
            self.transport.clone(),
            self.store.clone(),
            self.connectivity.clone(),
            self.telemetry.clone(),
        )
        .with_tracker(handle.clone())
        .start()
        .await?;

        info!("Bridge bound to device {}", device);
        *binding = Some(Binding { watch, handle });
        Ok(())
    }

    pub async fn unbind(&self) -> Result<(), BridgeError> {
        self.bind_device(None).await
    }

    /// Requests connect (`true`) or disconnect (`false`)
    ///
    /// Rejected without publishing while another request is pending, while
    /// connectivity is unknown, or with no device bound. A failed publish
    /// clears the pending marker before this returns.
    pub async fn request_connection(&self, target: bool) -> Result<(), BridgeError> {
        let Some((device, handle)) = self.bound().await else {
            return Err(BridgeError::NoDevice);
        };

        let seq = match handle
            .apply(TrackerEvent::UserIntent {
                target,
                device_bound: true,
            })
            .await
        {
            Decision::Publish { seq, .. } => seq,
            Decision::Rejected(rejection) => return Err(rejection.into()),
            _ => return Ok(()),
        };

        let result = self.publisher.send(&device, Command::for_target(target)).await;
        let outcome = result.as_ref().map(|_| ()).map_err(ToString::to_string);

        if let Decision::AwaitConfirmation { seq } =
            handle.apply(TrackerEvent::PublishResult { seq, outcome }).await
        {
            if let Some(after) = self.confirm_timeout {
                Self::arm_confirmation_timer(handle, seq, after);
            }
        }
        result
    }

    pub async fn start_measurement(&self) -> Result<(), BridgeError> {
        self.send_to_bound(Command::StartMeasurement).await
    }

    pub async fn stop_measurement(&self) -> Result<(), BridgeError> {
        self.send_to_bound(Command::StopMeasurement).await
    }

    pub async fn ping(&self) -> Result<(), BridgeError> {
        self.send_to_bound(Command::Ping).await
    }

    async fn send_to_bound(&self, command: Command) -> Result<(), BridgeError> {
        let device = self.device_id().await.ok_or(BridgeError::NoDevice)?;
        self.publisher.send(&device, command).await
    }

    async fn bound(&self) -> Option<(DeviceId, TrackerHandle)> {
        self.binding
            .lock()
            .await
            .as_ref()
            .map(|binding| (binding.watch.device().clone(), binding.handle.clone()))
    }

    fn reset_observables(&self) {
        self.connectivity.send_replace(Connectivity::Unknown);
        self.telemetry.send_replace(None);
        self.command_state.send_replace(CommandState::default());
    }

    async fn teardown(binding: Binding) {
        let Binding { watch, handle } = binding;
        watch.release().await;
        handle.close().await;
    }

    fn arm_confirmation_timer(handle: TrackerHandle, seq: u64, after: Duration) {
        let cancel = handle.token();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    handle.apply(TrackerEvent::ConfirmationTimeout { seq, after }).await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tracker::LinkPhase;
    use crate::mqtt::transport::MockTransport;
    use crate::mqtt::TransportError;
    use crate::persistence::store::MemoryStore;
    use serde_json::json;

    const D1_STATUS: &str = "ns/devices/D1/status";

    fn bridge_with(settings: BridgeSettings) -> (DeviceBridge, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::connected());
        let store = Arc::new(
            MemoryStore::new()
                .with_device(DeviceId::parse("D1").unwrap())
                .with_device(DeviceId::parse("D2").unwrap()),
        );
        let bridge = DeviceBridge::new(transport.clone(), store, TopicNamer::new("ns"), settings);
        (bridge, transport)
    }

    fn bridge() -> (DeviceBridge, Arc<MockTransport>) {
        bridge_with(BridgeSettings {
            connect_timeout: Duration::from_millis(100),
            confirm_timeout: None,
        })
    }

    async fn bound_at(status: &str) -> (DeviceBridge, Arc<MockTransport>) {
        let (bridge, transport) = bridge();
        bridge.bind(&json!("/devices/D1")).await.unwrap();
        transport.inject(D1_STATUS, status);
        let expected = if status == "online" {
            LinkPhase::Connected
        } else {
            LinkPhase::Disconnected
        };
        bridge
            .command_state()
            .wait_for(|state| state.phase == expected)
            .await
            .unwrap();
        (bridge, transport)
    }

    #[tokio::test]
    async fn connect_waits_for_device_confirmation() {
        let (bridge, transport) = bound_at("offline").await;

        bridge.request_connection(true).await.unwrap();
        {
            let state = bridge.command_state().borrow().clone();
            assert_eq!(state.pending, Some(true));
            assert_eq!(state.phase, LinkPhase::Connecting);
            assert!(state.waiting());
        }
        let sent = transport.published();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "ns/devices/D1/cmd");

        transport.inject(D1_STATUS, "online");
        let state = bridge
            .command_state()
            .wait_for(|state| state.pending.is_none())
            .await
            .unwrap()
            .clone();
        assert_eq!(state.phase, LinkPhase::Connected);
        assert!(!state.waiting());
        assert_eq!(*bridge.connectivity().borrow(), Connectivity::Connected);
    }

    #[tokio::test]
    async fn brief_confirmation_clears_pending() {
        let (bridge, transport) = bound_at("offline").await;
        bridge.request_connection(true).await.unwrap();

        transport.inject(D1_STATUS, "online");
        transport.inject(D1_STATUS, "offline");

        let state = tokio::time::timeout(
            Duration::from_secs(1),
            bridge
                .command_state()
                .wait_for(|state| state.pending.is_none()),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(state.phase, LinkPhase::Disconnected);
        assert_eq!(state.confirmed, Connectivity::Disconnected);
        assert_eq!(state.last_error, None);

        // the next request starts from the observed state
        bridge.request_connection(true).await.unwrap();
        assert_eq!(bridge.command_state().borrow().phase, LinkPhase::Connecting);
        assert_eq!(transport.published().len(), 2);
    }

    #[tokio::test]
    async fn tracker_matches_connectivity_whenever_it_changes() {
        let (bridge, transport) = bound_at("offline").await;
        let mut connectivity = bridge.connectivity();
        let state = bridge.command_state();

        transport.inject(D1_STATUS, "online");
        connectivity
            .wait_for(|c| *c == Connectivity::Connected)
            .await
            .unwrap();
        assert_eq!(state.borrow().confirmed, Connectivity::Connected);

        // request right after the observable moved: no resync needed
        bridge.request_connection(false).await.unwrap();
        assert_eq!(bridge.command_state().borrow().phase, LinkPhase::Disconnecting);
    }

    #[tokio::test]
    async fn unprovisioned_device_reads_disconnected() {
        let (bridge, _transport) = bridge();
        bridge.bind(&json!("D9")).await.unwrap();
        bridge
            .command_state()
            .wait_for(|state| state.phase == LinkPhase::Disconnected)
            .await
            .unwrap();
        assert_eq!(*bridge.connectivity().borrow(), Connectivity::Disconnected);
    }

    #[tokio::test]
    async fn measurement_control_targets_the_bound_device() {
        let (bridge, transport) = bridge();
        assert!(bridge.measurement_control().await.is_none());

        bridge.bind(&json!("D2")).await.unwrap();
        let control = bridge.measurement_control().await.unwrap();
        assert_eq!(control.device().as_str(), "D2");
        control.stop().await.unwrap();
        assert_eq!(transport.published()[0].topic, "ns/devices/D2/cmd");
    }

    #[tokio::test]
    async fn failed_publish_clears_pending_before_returning() {
        let (bridge, transport) = bound_at("offline").await;
        transport.fail_publishes_with(Some("broker refused"));

        let result = bridge.request_connection(true).await;
        assert!(matches!(
            result,
            Err(BridgeError::Transport(TransportError::Publish { .. }))
        ));

        let state = bridge.command_state().borrow().clone();
        assert_eq!(state.pending, None);
        assert_eq!(state.phase, LinkPhase::Disconnected);
        assert!(state.last_error.unwrap().contains("broker refused"));
    }

    #[tokio::test]
    async fn overlapping_requests_publish_once() {
        let (bridge, transport) = bound_at("online").await;

        bridge.request_connection(false).await.unwrap();
        assert!(matches!(
            bridge.request_connection(false).await,
            Err(BridgeError::CommandInFlight)
        ));
        assert!(matches!(
            bridge.request_connection(true).await,
            Err(BridgeError::CommandInFlight)
        ));
        assert_eq!(transport.published().len(), 1);
    }

    #[tokio::test]
    async fn requests_need_known_connectivity_and_a_device() {
        let (bridge, transport) = bridge();
        assert!(matches!(
            bridge.request_connection(true).await,
            Err(BridgeError::NoDevice)
        ));

        bridge.bind(&json!({ "id": "D1" })).await.unwrap();
        assert!(matches!(
            bridge.request_connection(true).await,
            Err(BridgeError::ConnectivityUnknown)
        ));
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn unconfirmed_command_times_out() {
        let (bridge, transport) = bridge_with(BridgeSettings {
            connect_timeout: Duration::from_millis(100),
            confirm_timeout: Some(Duration::from_millis(30)),
        });
        bridge.bind(&json!("D1")).await.unwrap();
        transport.inject(D1_STATUS, "offline");
        bridge
            .command_state()
            .wait_for(|state| state.phase == LinkPhase::Disconnected)
            .await
            .unwrap();

        bridge.request_connection(true).await.unwrap();
        let state = bridge
            .command_state()
            .wait_for(|state| state.last_error.is_some())
            .await
            .unwrap()
            .clone();
        assert_eq!(state.pending, None);
        assert_eq!(state.phase, LinkPhase::Disconnected);
    }

    #[tokio::test]
    async fn rebinding_releases_the_previous_device() {
        let (bridge, transport) = bound_at("online").await;

        bridge.bind(&json!("/devices/D2")).await.unwrap();
        assert_eq!(bridge.device_id().await.unwrap().as_str(), "D2");
        assert_eq!(transport.subscription_count(D1_STATUS), 0);
        assert_eq!(transport.subscription_count("ns/devices/D1/telemetry"), 0);
        assert_eq!(transport.subscription_count("ns/devices/D2/status"), 1);
        assert_eq!(*bridge.connectivity().borrow(), Connectivity::Unknown);

        // the old device's status no longer reaches shared state
        transport.inject(D1_STATUS, "online");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*bridge.connectivity().borrow(), Connectivity::Unknown);
    }

    #[tokio::test]
    async fn binding_the_same_device_twice_is_a_no_op() {
        let (bridge, transport) = bridge();
        bridge.bind(&json!("D1")).await.unwrap();
        bridge.bind(&json!("/devices/D1")).await.unwrap();
        assert_eq!(transport.subscription_count(D1_STATUS), 1);

        bridge.unbind().await.unwrap();
        assert_eq!(transport.subscription_count(D1_STATUS), 0);
        assert!(bridge.device_id().await.is_none());
    }

    #[tokio::test]
    async fn unnormalizable_identity_leaves_bridge_unbound() {
        let (bridge, _transport) = bridge();
        assert_eq!(bridge.bind(&json!(42)).await.unwrap(), None);
        assert!(matches!(bridge.ping().await, Err(BridgeError::NoDevice)));
    }

    #[tokio::test]
    async fn measurement_commands_go_to_the_bound_device() {
        let (bridge, transport) = bridge();
        bridge.bind(&json!("D1")).await.unwrap();

        bridge.start_measurement().await.unwrap();
        bridge.stop_measurement().await.unwrap();

        let commands: Vec<Value> = transport
            .published()
            .iter()
            .map(|p| serde_json::from_slice(&p.payload).unwrap())
            .collect();
        assert_eq!(commands[0]["cmd"], "start_measurement");
        assert_eq!(commands[1]["cmd"], "stop_measurement");
    }

    #[tokio::test]
    async fn telemetry_reaches_the_observable() {
        let (bridge, transport) = bridge();
        bridge.bind(&json!("D1")).await.unwrap();
        let mut telemetry = bridge.telemetry();

        transport.inject("ns/devices/D1/telemetry", r#"{"Turbidity":1.5}"#);
        let sample = telemetry
            .wait_for(|sample| sample.is_some())
            .await
            .unwrap()
            .clone()
            .unwrap();
        assert_eq!(
            sample.get(crate::device::telemetry::Channel::Turbidity),
            Some(1.5)
        );
    }
}
