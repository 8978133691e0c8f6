use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::{broadcast, watch, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{BrokerAddress, MqttConfig};
use super::error::TransportError;
use super::message_manager::{MqttMessage, MsgManager};
use super::topics::TopicNamer;
use super::transport::{LinkState, TransportClient};

const MAX_ERROR_MESSAGES: usize = 20;
/// Longest `shutdown` waits for the event loop to finish
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Counters describing the shared connection
#[derive(Clone, Debug, Default)]
pub struct MqttStatus {
    pub link_state: LinkState,
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub reconnects: usize,
    pub last_activity: Option<DateTime<Local>>,
}

impl MqttStatus {
    fn record_error(&mut self, message: String) {
        if self.error_messages.len() >= MAX_ERROR_MESSAGES {
            self.error_messages.remove(0);
        }
        self.error_messages.push(message);
    }
}

type Subscriptions = Arc<Mutex<HashMap<String, usize>>>;

/// rumqttc-backed broker connection shared by all device views
///
/// The event loop runs in its own tokio task. It publishes the link state,
/// fans inbound publishes out to listeners and re-subscribes every live
/// topic after each ConnAck, since clean sessions drop subscriptions on
/// reconnect. Topic subscriptions are reference counted so independent
/// views can watch the same device.
pub struct MqttTransport {
    client: AsyncClient,
    inbound: MsgManager,
    link_tx: Arc<watch::Sender<LinkState>>,
    subscriptions: Subscriptions,
    status: Arc<Mutex<MqttStatus>>,
    shutdown: CancellationToken,
    event_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Creates the client and starts its event loop
    ///
    /// Returns as soon as the loop is spawned; the connection itself is
    /// reported through [`TransportClient::link_state`].
    pub fn connect(config: &MqttConfig, namer: &TopicNamer) -> Result<Self, TransportError> {
        let client_id = config.resolved_client_id();
        let options = build_options(config, namer, &client_id)?;

        info!("Creating MQTT client {} for {}", client_id, config.url);
        let (client, eventloop) = AsyncClient::new(options, config.request_capacity.max(1));

        let inbound = MsgManager::new(config.inbound_capacity);
        let (link_tx, _) = watch::channel(LinkState::Connecting);
        let link_tx = Arc::new(link_tx);
        let subscriptions: Subscriptions = Arc::new(Mutex::new(HashMap::new()));
        let status = Arc::new(Mutex::new(MqttStatus::default()));
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_event_loop(
            eventloop,
            EventLoopContext {
                client: client.clone(),
                inbound: inbound.clone(),
                link_tx: link_tx.clone(),
                subscriptions: subscriptions.clone(),
                status: status.clone(),
                shutdown: shutdown.clone(),
                reconnect_period: config.reconnect_period(),
            },
        ));

        Ok(Self {
            client,
            inbound,
            link_tx,
            subscriptions,
            status,
            shutdown,
            event_task: std::sync::Mutex::new(Some(task)),
        })
    }

    pub async fn status(&self) -> MqttStatus {
        self.status.lock().await.clone()
    }

    /// Stops the event loop and asks the broker for a clean disconnect
    ///
    /// Returns within [`SHUTDOWN_GRACE`] even if the loop is stuck in a
    /// connection attempt; the task is aborted then.
    pub async fn shutdown(&self) {
        info!("Shutting down MQTT transport");
        self.shutdown.cancel();
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not queued: {}", e);
        }

        let task = match self.event_task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut task) = task {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
                Ok(Err(e)) if e.is_panic() => error!("MQTT event loop task panicked: {}", e),
                Ok(_) => {}
                Err(_) => {
                    warn!("MQTT event loop did not stop in time, aborting");
                    task.abort();
                }
            }
        }
        self.link_tx.send_replace(LinkState::Disconnected);
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl TransportClient for MqttTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
    ) -> Result<(), TransportError> {
        self.client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|e| {
                error!("Failed to publish to {}: {}", topic, e);
                TransportError::Publish {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                }
            })?;

        let mut status = self.status.lock().await;
        status.messages_sent += 1;
        status.last_activity = Some(Local::now());
        debug!("Publish to {} handed to client", topic);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let holders = {
            let mut subscriptions = self.subscriptions.lock().await;
            let count = subscriptions.entry(topic.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if holders > 1 {
            debug!("Topic {} already subscribed ({} holders)", topic, holders);
            return Ok(());
        }

        // The lock is released before awaiting: the event loop takes it on ConnAck.
        if let Err(e) = self.client.subscribe(topic, QoS::AtMostOnce).await {
            error!("Failed to subscribe to {}: {}", topic, e);
            let mut subscriptions = self.subscriptions.lock().await;
            if let Some(count) = subscriptions.get_mut(topic) {
                *count -= 1;
                if *count == 0 {
                    subscriptions.remove(topic);
                }
            }
            return Err(TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            });
        }
        info!("Subscribed to {}", topic);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let remaining = {
            let mut subscriptions = self.subscriptions.lock().await;
            match subscriptions.get(topic).copied() {
                Some(count) if count > 1 => {
                    subscriptions.insert(topic.to_string(), count - 1);
                    Some(count - 1)
                }
                Some(_) => {
                    subscriptions.remove(topic);
                    Some(0)
                }
                None => None,
            }
        };

        match remaining {
            Some(0) => {
                self.client.unsubscribe(topic).await.map_err(|e| {
                    error!("Failed to unsubscribe from {}: {}", topic, e);
                    TransportError::Unsubscribe {
                        topic: topic.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                info!("Unsubscribed from {}", topic);
                Ok(())
            }
            Some(holders) => {
                debug!("Topic {} still held by {} views", topic, holders);
                Ok(())
            }
            None => {
                warn!("Unsubscribe for {} without matching subscribe", topic);
                Ok(())
            }
        }
    }

    fn messages(&self) -> broadcast::Receiver<MqttMessage> {
        self.inbound.listen()
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link_tx.subscribe()
    }
}

fn build_options(
    config: &MqttConfig,
    namer: &TopicNamer,
    client_id: &str,
) -> Result<MqttOptions, TransportError> {
    let mut options = match config.broker_address()? {
        BrokerAddress::Tcp { host, port } => MqttOptions::new(client_id, host, port),
        BrokerAddress::WebSocket { url, port, secure } => {
            let mut options = MqttOptions::new(client_id, url, port);
            if secure {
                options.set_transport(rumqttc::Transport::wss_with_default_config());
            } else {
                options.set_transport(rumqttc::Transport::Ws);
            }
            options
        }
    };

    options
        .set_keep_alive(config.keep_alive())
        .set_clean_session(true);

    if let Some(username) = &config.username {
        options.set_credentials(
            username.clone(),
            config.password.clone().unwrap_or_default(),
        );
    }

    let will = serde_json::json!({
        "clientId": client_id,
        "ts": chrono::Utc::now().timestamp_millis(),
    });
    options.set_last_will(LastWill::new(
        namer.last_will(),
        will.to_string().into_bytes(),
        QoS::AtMostOnce,
        false,
    ));

    Ok(options)
}

struct EventLoopContext {
    client: AsyncClient,
    inbound: MsgManager,
    link_tx: Arc<watch::Sender<LinkState>>,
    subscriptions: Subscriptions,
    status: Arc<Mutex<MqttStatus>>,
    shutdown: CancellationToken,
    reconnect_period: Duration,
}

impl EventLoopContext {
    async fn set_link(&self, state: LinkState) {
        self.link_tx.send_replace(state);
        self.status.lock().await.link_state = state;
    }

    /// Replays every live subscription after a (re)connect
    ///
    /// Uses the non-blocking client calls: awaiting here would wait on the
    /// request channel this very loop drains.
    async fn resubscribe(&self) {
        let subscriptions = self.subscriptions.lock().await;
        for topic in subscriptions.keys() {
            match self.client.try_subscribe(topic.clone(), QoS::AtMostOnce) {
                Ok(_) => debug!("Re-subscribed to {}", topic),
                Err(e) => warn!("Could not re-subscribe to {}: {}", topic, e),
            }
        }
    }
}

async fn run_event_loop(mut eventloop: EventLoop, ctx: EventLoopContext) {
    info!("MQTT event loop started");
    let mut connected_once = false;

    loop {
        let event = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("MQTT connected ({:?})", ack.code);
                if connected_once {
                    ctx.status.lock().await.reconnects += 1;
                }
                connected_once = true;
                ctx.set_link(LinkState::Connected).await;
                ctx.resubscribe().await;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                {
                    let mut status = ctx.status.lock().await;
                    status.messages_received += 1;
                    status.last_activity = Some(Local::now());
                }
                ctx.inbound
                    .deliver(MqttMessage::from_topic(publish.topic, publish.payload.to_vec()));
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker closed the session");
                ctx.set_link(LinkState::Reconnecting).await;
            }
            Ok(Event::Incoming(packet)) => {
                debug!("MQTT packet {:?}", packet);
            }
            Ok(Event::Outgoing(_)) => {}
            Err(e) => {
                error!("MQTT connection error: {}", e);
                ctx.status.lock().await.record_error(e.to_string());
                ctx.set_link(LinkState::Reconnecting).await;

                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ctx.reconnect_period) => {
                        info!("MQTT reconnecting...");
                    }
                }
            }
        }
    }

    ctx.set_link(LinkState::Disconnected).await;
    info!("MQTT event loop stopped");
}

/// Lazily creates the one [`MqttTransport`] shared by everything it serves
///
/// Concurrent first callers all wait on the same initialization, so only a
/// single client is ever built per provider.
pub struct TransportProvider {
    config: MqttConfig,
    namer: TopicNamer,
    transport: OnceCell<Arc<MqttTransport>>,
}

impl TransportProvider {
    pub fn new(config: MqttConfig, namer: TopicNamer) -> Self {
        Self {
            config,
            namer,
            transport: OnceCell::new(),
        }
    }

    pub async fn get(&self) -> Result<Arc<MqttTransport>, TransportError> {
        self.transport
            .get_or_try_init(|| async {
                MqttTransport::connect(&self.config, &self.namer).map(Arc::new)
            })
            .await
            .cloned()
    }

    pub fn is_initialized(&self) -> bool {
        self.transport.initialized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> MqttConfig {
        MqttConfig {
            url: "mqtt://127.0.0.1:1".to_string(),
            reconnect_period_ms: 50,
            ..MqttConfig::default()
        }
    }

    #[tokio::test]
    async fn provider_creates_a_single_transport() {
        let provider = Arc::new(TransportProvider::new(
            unreachable_config(),
            TopicNamer::default(),
        ));
        assert!(!provider.is_initialized());

        let (first, second) = tokio::join!(provider.get(), provider.get());
        let first = first.unwrap();
        let second = second.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        first.shutdown().await;
        assert_eq!(*first.link_state().borrow(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn provider_reports_invalid_url() {
        let provider = TransportProvider::new(
            MqttConfig {
                url: "mqtt://:1883".to_string(),
                ..MqttConfig::default()
            },
            TopicNamer::default(),
        );
        assert!(matches!(
            provider.get().await,
            Err(TransportError::InvalidConfig(_))
        ));
        assert!(!provider.is_initialized());
    }

    #[tokio::test]
    async fn subscriptions_are_reference_counted() {
        let transport = MqttTransport::connect(&unreachable_config(), &TopicNamer::default())
            .unwrap();

        transport.subscribe("a/status").await.unwrap();
        transport.subscribe("a/status").await.unwrap();
        assert_eq!(transport.subscriptions.lock().await.get("a/status"), Some(&2));

        transport.unsubscribe("a/status").await.unwrap();
        assert_eq!(transport.subscriptions.lock().await.get("a/status"), Some(&1));

        transport.unsubscribe("a/status").await.unwrap();
        assert!(transport.subscriptions.lock().await.is_empty());

        transport.shutdown().await;
    }

    #[tokio::test]
    async fn failed_connection_marks_link_reconnecting() {
        let transport = MqttTransport::connect(&unreachable_config(), &TopicNamer::default())
            .unwrap();
        let mut link = transport.link_state();

        let reached = tokio::time::timeout(
            Duration::from_secs(5),
            link.wait_for(|state| *state == LinkState::Reconnecting),
        )
        .await
        .map(|state| state.is_ok());
        assert_eq!(reached, Ok(true));
        assert!(!transport.status().await.error_messages.is_empty());

        transport.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_returns_while_reconnecting() {
        let transport = MqttTransport::connect(&unreachable_config(), &TopicNamer::default())
            .unwrap();
        let mut link = transport.link_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            link.wait_for(|state| *state == LinkState::Reconnecting),
        )
        .await
        .unwrap()
        .unwrap();

        // a live watch::Ref here would block the shutdown send
        let stopped = tokio::time::timeout(
            SHUTDOWN_GRACE + Duration::from_secs(1),
            transport.shutdown(),
        )
        .await;
        assert!(stopped.is_ok());
        assert_eq!(*link.borrow(), LinkState::Disconnected);
        assert!(transport.event_task.lock().unwrap().is_none());
    }
}
