//! Hub configuration - `$MOKKI_HOME/config.json` plus environment overrides

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::KeyHandle;

pub const HOME_ENV: &str = "MOKKI_HOME";
pub const CONFIG_FILE: &str = "config.json";
pub const CREDENTIALS_FILE: &str = "credentials.json";
pub const DEVICES_FILE: &str = "devices.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine home directory, set {HOME_ENV}")]
    NoHome,
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Network and broker parameters handed to every provisioned device.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub wifi_ssid: String,
    pub wifi_password: String,
    pub mqtt_broker_url: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_password: String::new(),
            mqtt_broker_url: "mqtts://localhost:8883".to_string(),
        }
    }
}

impl std::fmt::Debug for NetworkSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkSettings")
            .field("wifi_ssid", &self.wifi_ssid)
            .field("wifi_password", &"<redacted>")
            .field("mqtt_broker_url", &self.mqtt_broker_url)
            .finish()
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ProvisionSettings {
    /// Bytes per credential write.
    pub chunk_size: usize,
    pub discovery_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub key_handle: KeyHandle,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            chunk_size: mokki_proto::ble::DEFAULT_CHUNK_SIZE,
            discovery_timeout_secs: 10,
            handshake_timeout_secs: 10,
            key_handle: KeyHandle::DEFAULT,
        }
    }
}

impl ProvisionSettings {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be at least 1".into()));
        }
        if self.discovery_timeout_secs == 0 || self.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be at least 1 second".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub network: NetworkSettings,
    pub provision: ProvisionSettings,
    pub listen: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            network: NetworkSettings::default(),
            provision: ProvisionSettings::default(),
            listen: "127.0.0.1:9000".to_string(),
        }
    }
}

impl HubConfig {
    /// Loads `home/config.json` (defaults when absent) and applies the
    /// `MOKKI_*` environment overrides.
    pub fn load(home: &Path) -> Result<Self, ConfigError> {
        let path = home.join(CONFIG_FILE);
        let mut config = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|source| ConfigError::Parse { path, source })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HubConfig::default(),
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.provision.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MOKKI_WIFI_SSID") {
            self.network.wifi_ssid = v;
        }
        if let Some(v) = lookup("MOKKI_WIFI_PASSWORD") {
            self.network.wifi_password = v;
        }
        if let Some(v) = lookup("MOKKI_MQTT_BROKER_URL") {
            self.network.mqtt_broker_url = v;
        }
    }
}

/// `$MOKKI_HOME`, or `~/.mokki`.
pub fn mokki_home() -> Result<PathBuf, ConfigError> {
    if let Ok(home) = std::env::var(HOME_ENV) {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir()
        .map(|home| home.join(".mokki"))
        .ok_or(ConfigError::NoHome)
}
