//! Dashboard configuration file
//!
//! Lives at `<config dir>/cpo-dashboard/config.toml`. A default file is
//! written on first start; `MQTT_URL`, `MQTT_USERNAME`, `MQTT_PASSWORD` and
//! `CPO_NAMESPACE` override the file.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::device::bridge::BridgeSettings;
use crate::device::identity::DeviceId;
use crate::measurement::thresholds::Thresholds;
use crate::mqtt::config::MqttConfig;
use crate::mqtt::topics::{TopicNamer, DEFAULT_NAMESPACE};
use crate::persistence::store::UserRecord;

const APP_DIR: &str = "cpo-dashboard";
const CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Topic prefix shared by all devices
    pub namespace: String,
    /// Seconds before an unconfirmed connect/disconnect gives up; 0 waits forever
    pub confirm_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            confirm_timeout_secs: 30,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub bridge: BridgeConfig,
    /// Fallback when the store holds no threshold document
    pub thresholds: Thresholds,
    /// Accounts provisioned into the in-memory store at startup
    pub users: Vec<UserRecord>,
    /// Device records provisioned at startup; other ids read as disconnected
    pub devices: Vec<DeviceId>,
}

impl AppConfig {
    pub fn default_path() -> PathBuf {
        config_dir().join(CONFIG_FILE)
    }

    pub fn topic_namer(&self) -> TopicNamer {
        TopicNamer::new(self.bridge.namespace.clone())
    }

    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            connect_timeout: self.mqtt.connect_timeout(),
            confirm_timeout: match self.bridge.confirm_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    /// Writes the default config when no file exists yet
    pub async fn ensure_default_config(path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            return Ok(());
        }

        info!("Creating default configuration at {}", path.display());
        AppConfig::default().save(path).await
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file: {}", e))?;
        toml::from_str(&content).map_err(|e| eyre!("Failed to parse config file: {}", e))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))?;
        debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Ensures, loads and applies environment overrides
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        Self::ensure_default_config(path).await?;
        let mut config = match Self::load(path).await {
            Ok(config) => config,
            Err(e) => {
                warn!("{}, using defaults", e);
                AppConfig::default()
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = lookup("MQTT_URL") {
            debug!("MQTT_URL overrides configured broker");
            self.mqtt.url = url;
        }
        if let Some(username) = lookup("MQTT_USERNAME") {
            self.mqtt.username = Some(username);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(namespace) = lookup("CPO_NAMESPACE") {
            self.bridge.namespace = namespace;
        }
    }
}

/// `<config dir>/cpo-dashboard`, falling back to the working directory
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        })
        .join(APP_DIR)
}
