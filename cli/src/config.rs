//! Configuration management for the pubsub command.
//!
//! Configuration is stored in ~/.pubsub/config.yaml. Environment variables
//! override the file, and command line flags override both.

use std::path::{Path, PathBuf};
use std::time::Duration;

use pubsub_mqtt::{BrokerAddr, ConnectionConfig, QoS, ReconnectPolicy, WorkflowConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Default base configuration directory name.
pub const DEFAULT_BASE_DIR: &str = ".pubsub";
/// Default configuration filename.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Environment variable holding the full broker URL.
pub const ENV_BROKER: &str = "MQTT_BROKER";
/// Environment variable overriding the broker host.
pub const ENV_HOST: &str = "MQTT_HOST";
/// Environment variable overriding the broker port.
pub const ENV_PORT: &str = "MQTT_PORT";
/// Environment variable overriding the client ID.
pub const ENV_CLIENT_ID: &str = "MQTT_CLIENT_ID";
/// Environment variable overriding the username.
pub const ENV_USERNAME: &str = "MQTT_USERNAME";
/// Environment variable overriding the password.
pub const ENV_PASSWORD: &str = "MQTT_PASSWORD";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot determine config path")]
    NoConfigDir,

    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: String, value: String },

    #[error(transparent)]
    Broker(#[from] pubsub_mqtt::Error),
}

/// Configuration file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Broker connection settings.
    #[serde(default)]
    pub broker: BrokerSection,

    /// Workflow settings.
    #[serde(default)]
    pub workflow: WorkflowSection,

    /// Path the config was loaded from (not serialized).
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

/// Broker connection settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    /// Broker URL, e.g. `tls://broker.example.com:8883`.
    pub url: String,

    /// Client ID; empty picks a random one.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_id: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,

    pub keep_alive_secs: u64,
    pub connect_timeout_ms: u64,
    pub ack_timeout_ms: u64,

    /// Delay before redialing a lost connection; 0 disables reconnection.
    pub reconnect_delay_ms: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            url: "tls://localhost:8883".to_string(),
            client_id: String::new(),
            username: String::new(),
            password: String::new(),
            keep_alive_secs: 20,
            connect_timeout_ms: 10_000,
            ack_timeout_ms: 10_000,
            reconnect_delay_ms: 0,
        }
    }
}

impl std::fmt::Debug for BrokerSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSection")
            .field("url", &self.url)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &mask_secret(&self.password))
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("ack_timeout_ms", &self.ack_timeout_ms)
            .field("reconnect_delay_ms", &self.reconnect_delay_ms)
            .finish()
    }
}

/// Workflow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSection {
    pub topic: String,
    pub count: usize,
    pub interval_ms: u64,
    pub subscribe_qos: u8,
    pub publish_qos: u8,
    pub retain: bool,
    pub disconnect_grace_ms: u64,
    pub payload_prefix: String,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        let defaults = WorkflowConfig::default();
        Self {
            topic: defaults.topic,
            count: defaults.count,
            interval_ms: defaults.interval.as_millis() as u64,
            subscribe_qos: defaults.subscribe_qos as u8,
            publish_qos: defaults.publish_qos as u8,
            retain: defaults.retain,
            disconnect_grace_ms: defaults.disconnect_grace.as_millis() as u64,
            payload_prefix: defaults.payload_prefix,
        }
    }
}

impl Config {
    /// Gets the default config directory.
    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(DEFAULT_BASE_DIR))
    }

    /// Gets the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        Self::default_config_dir().map(|dir| dir.join(DEFAULT_CONFIG_FILE))
    }

    /// Returns the file this config was loaded from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Applies overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides looked up by variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some(url) = lookup(ENV_BROKER) {
            debug!(var = ENV_BROKER, "broker url overridden");
            self.broker.url = url;
        }

        let host = lookup(ENV_HOST);
        let port = lookup(ENV_PORT)
            .map(|v| {
                v.parse::<u16>().map_err(|_| ConfigError::InvalidValue {
                    name: ENV_PORT.to_string(),
                    value: v,
                })
            })
            .transpose()?;

        if host.is_some() || port.is_some() {
            let mut addr = BrokerAddr::parse(&self.broker.url)?;
            if let Some(host) = host {
                addr.host = host;
            }
            if let Some(port) = port {
                addr.port = port;
            }
            self.broker.url = addr.to_string();
        }

        if let Some(id) = lookup(ENV_CLIENT_ID) {
            self.broker.client_id = id;
        }
        if let Some(username) = lookup(ENV_USERNAME) {
            self.broker.username = username;
        }
        if let Some(password) = lookup(ENV_PASSWORD) {
            self.broker.password = password;
        }

        Ok(())
    }

    /// Builds the session configuration.
    pub fn connection_config(&self) -> Result<ConnectionConfig, ConfigError> {
        let b = &self.broker;
        let broker = BrokerAddr::parse(&b.url)?;

        let mut config = ConnectionConfig::new(broker, b.client_id.clone())
            .with_connect_timeout(Duration::from_millis(b.connect_timeout_ms))
            .with_ack_timeout(Duration::from_millis(b.ack_timeout_ms));
        config.keep_alive = Duration::from_secs(b.keep_alive_secs);

        if !b.username.is_empty() {
            config = config.with_credentials(b.username.clone(), b.password.clone());
        }

        if b.reconnect_delay_ms > 0 {
            config = config.with_reconnect(ReconnectPolicy::FixedDelay(Duration::from_millis(
                b.reconnect_delay_ms,
            )));
        }

        Ok(config)
    }

    /// Builds the workflow configuration.
    pub fn workflow_config(&self) -> WorkflowConfig {
        let w = &self.workflow;
        WorkflowConfig {
            topic: w.topic.clone(),
            subscribe_qos: QoS::from(w.subscribe_qos),
            publish_qos: QoS::from(w.publish_qos),
            retain: w.retain,
            count: w.count,
            interval: Duration::from_millis(w.interval_ms),
            disconnect_grace: Duration::from_millis(w.disconnect_grace_ms),
            payload_prefix: w.payload_prefix.clone(),
        }
    }
}

/// Loads configuration from `custom_path`, or from the default path.
///
/// A custom path must exist. A missing default file yields the defaults.
pub fn load_config(custom_path: Option<&str>) -> Result<Config, ConfigError> {
    match custom_path {
        Some(p) => load_from(Path::new(p), true),
        None => {
            let path = Config::default_config_path().ok_or(ConfigError::NoConfigDir)?;
            load_from(&path, false)
        }
    }
}

/// Loads configuration from a file.
pub fn load_from(path: &Path, must_exist: bool) -> Result<Config, ConfigError> {
    if !must_exist && !path.exists() {
        debug!(path = %path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut cfg: Config = if content.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(&content)?
    };
    cfg.config_path = Some(path.to_path_buf());

    Ok(cfg)
}

/// Masks a secret for display.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        "*".repeat(chars.len())
    } else {
        let head: String = chars[..2].iter().collect();
        let tail: String = chars[chars.len() - 2..].iter().collect();
        format!("{}{}{}", head, "*".repeat(chars.len() - 4), tail)
    }
}
