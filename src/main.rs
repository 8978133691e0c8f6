use chrono::Local;
use color_eyre::{eyre::eyre, Result};
use cpo_dashboard::config::AppConfig;
use cpo_dashboard::device::{BridgeError, DeviceBridge, DeviceId, TelemetrySample};
use cpo_dashboard::measurement::history::measurements_on;
use cpo_dashboard::measurement::{MeasurementSession, Thresholds};
use cpo_dashboard::mqtt::TransportProvider;
use cpo_dashboard::persistence::{sign_in, AppUser, DocumentStore, MemoryStore, SessionFile};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const LOCAL_OWNER: &str = "local";

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = AppConfig::load_or_default(&AppConfig::default_path()).await?;
    info!(
        "Using broker {} with namespace {}",
        config.mqtt.url, config.bridge.namespace
    );

    let store = Arc::new(MemoryStore::new());
    for user in &config.users {
        store.insert_user(user.clone()).await;
    }
    for device in &config.devices {
        store.provision_device(device.clone()).await;
    }

    let namer = config.topic_namer();
    let provider = TransportProvider::new(config.mqtt.clone(), namer.clone());
    let transport = provider
        .get()
        .await
        .map_err(|e| eyre!("Failed to start MQTT transport: {}", e))?;

    let bridge = Arc::new(DeviceBridge::new(
        transport.clone(),
        store.clone(),
        namer,
        config.bridge_settings(),
    ));
    let _state_logger = spawn_state_logger(bridge.clone());

    let session_file = SessionFile::default();
    let user = session_file.load_stored_user().await;
    if let Some(user) = &user {
        info!("Restored session of {}", user.name);
    }

    let device = std::env::args()
        .nth(1)
        .and_then(|raw| DeviceId::parse(&raw))
        .or_else(|| user.as_ref().and_then(|u| u.device_id.clone()));

    let mut console = Console {
        bridge: bridge.clone(),
        store: store.clone(),
        session_file,
        user,
        thresholds: config.thresholds,
        measurement: None,
    };
    console.switch_device(device).await;
    console.run().await;

    if let Err(e) = bridge.unbind().await {
        warn!("Unbind failed: {}", e);
    }
    transport.shutdown().await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

/// Logs every change of the command state
fn spawn_state_logger(bridge: Arc<DeviceBridge>) -> tokio::task::JoinHandle<()> {
    let mut state = bridge.command_state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let snapshot = state.borrow_and_update().clone();
            if snapshot.waiting() {
                info!("{} (waiting for device confirmation)", snapshot.phase);
            } else {
                info!("{}", snapshot.phase);
            }
            if let Some(e) = snapshot.last_error {
                warn!("Last command error: {}", e);
            }
        }
    })
}

struct Console {
    bridge: Arc<DeviceBridge>,
    store: Arc<MemoryStore>,
    session_file: SessionFile,
    user: Option<AppUser>,
    thresholds: Thresholds,
    measurement: Option<MeasurementSession>,
}

impl Console {
    async fn run(&mut self) {
        info!("Commands: connect, disconnect, start, stop, ping, analyze, save, cancel, device <id>, login <phone> <password>, logout, history, quit");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut telemetry = self.bridge.telemetry();

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if !self.handle(line.trim()).await {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("Failed to read console input: {}", e);
                        break;
                    }
                },
                changed = telemetry.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let sample = telemetry.borrow_and_update().clone();
                    if let Some(sample) = sample {
                        self.on_telemetry(&sample);
                    }
                }
            }
        }
    }

    fn on_telemetry(&mut self, sample: &TelemetrySample) {
        info!("Telemetry: {}", sample);
        if let Some(measurement) = self.measurement.as_mut() {
            measurement.observe(sample);
        }
    }

    /// Returns `false` once the console should exit
    async fn handle(&mut self, line: &str) -> bool {
        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            return true;
        };

        match command {
            "connect" => report("connect", self.bridge.request_connection(true).await),
            "disconnect" => report("disconnect", self.bridge.request_connection(false).await),
            "ping" => report("ping", self.bridge.ping().await),
            "stop" => report("stop", self.bridge.stop_measurement().await),
            "start" => self.start_measurement().await,
            "analyze" => self.analyze().await,
            "save" => self.save().await,
            "cancel" => self.cancel().await,
            "device" => match parts.next().and_then(DeviceId::parse) {
                Some(device) => self.switch_device(Some(device)).await,
                None => warn!("Usage: device <id>"),
            },
            "login" => match (parts.next(), parts.next()) {
                (Some(phone), Some(password)) => self.login(phone, password).await,
                _ => warn!("Usage: login <phone> <password>"),
            },
            "logout" => self.logout().await,
            "history" => self.history().await,
            "quit" | "exit" => return false,
            other => warn!("Unknown command: {}", other),
        }
        true
    }

    async fn switch_device(&mut self, device: Option<DeviceId>) {
        if let Some(measurement) = self.measurement.take() {
            measurement.cancel().await;
        }
        match self.bridge.bind_device(device).await {
            Ok(()) => match self.bridge.device_id().await {
                Some(device) => info!("Watching device {}", device),
                None => info!("No device bound"),
            },
            Err(e) => error!("Failed to bind device: {}", e),
        }
    }

    async fn start_measurement(&mut self) {
        let Some(control) = self.bridge.measurement_control().await else {
            warn!("No device bound");
            return;
        };
        if let Err(e) = control.start().await {
            error!("start failed: {}", e);
            return;
        }

        let owner = self
            .user
            .as_ref()
            .map_or(LOCAL_OWNER.to_string(), |user| user.id.clone());
        let mut measurement =
            MeasurementSession::new(owner, control, self.store.clone(), self.thresholds);
        if let Some(sample) = self.bridge.telemetry().borrow().as_ref() {
            measurement.observe(sample);
        }
        self.measurement = Some(measurement);
        info!("Measurement started");
    }

    async fn analyze(&mut self) {
        let Some(measurement) = self.measurement.as_mut() else {
            warn!("No measurement running, use start first");
            return;
        };
        let result = measurement.analyze().await;
        info!(
            "Result: {} (label {}, r_ratio {:.3})",
            result.quality,
            result.quality.label(),
            result.r_ratio
        );
    }

    async fn save(&mut self) {
        let Some(measurement) = self.measurement.take() else {
            warn!("No measurement running");
            return;
        };
        match measurement.save().await {
            Ok(record) => info!(
                "Saved measurement {} ({})",
                record.measurement_id,
                if record.result_analyze { "Good" } else { "Bad" }
            ),
            Err(e) => error!("Save failed: {}", e),
        }
    }

    async fn cancel(&mut self) {
        match self.measurement.take() {
            Some(measurement) => measurement.cancel().await,
            None => report("stop", self.bridge.stop_measurement().await),
        }
    }

    async fn login(&mut self, phone: &str, password: &str) {
        let user = match sign_in(self.store.as_ref(), phone, password).await {
            Ok(user) => user,
            Err(e) => {
                error!("Sign-in failed: {}", e);
                return;
            }
        };
        if let Err(e) = self.session_file.store_user(&user).await {
            warn!("Session not stored: {}", e);
        }
        let device = user.device_id.clone();
        self.user = Some(user);
        self.switch_device(device).await;
    }

    async fn logout(&mut self) {
        if let Err(e) = self.session_file.sign_out().await {
            warn!("Sign-out failed: {}", e);
        }
        self.user = None;
        self.switch_device(None).await;
    }

    async fn history(&self) {
        let owner = self
            .user
            .as_ref()
            .map_or(LOCAL_OWNER, |user| user.id.as_str());
        let store: &dyn DocumentStore = self.store.as_ref();
        match measurements_on(store, owner, Local::now().date_naive()).await {
            Ok(records) if records.is_empty() => info!("No measurements today"),
            Ok(records) => {
                for record in records {
                    info!(
                        "#{} {} {} r_ratio {:.3}",
                        record.measurement_id,
                        record.created_at.with_timezone(&Local).format("%H:%M:%S"),
                        if record.result_analyze { "Good" } else { "Bad" },
                        record.r_ratio
                    );
                }
            }
            Err(e) => error!("History query failed: {}", e),
        }
    }
}

fn report(command: &str, result: Result<(), BridgeError>) {
    match result {
        Ok(()) => info!("{} sent", command),
        Err(e) => error!("{} failed: {}", command, e),
    }
}
