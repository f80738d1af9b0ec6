//! # Server Configuration
//!
//! Configuration for the broker link, the ledger database and rental timing.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     FBOX_BROKER_URL=mqtt://10.0.0.5:1883                               │
//! │     FBOX_DISPENSE_TIMEOUT_SECS=15                                      │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/fbox-server/fbox.toml (Linux)                            │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # fbox.toml
//! [broker]
//! url = "mqtt://localhost:1883"
//! client_id = "fbox-server"
//! keep_alive_secs = 60
//!
//! [database]
//! path = "/var/lib/fbox/fbox.db"
//! max_connections = 5
//!
//! [rental]
//! dispense_timeout_secs = 10
//! liveness_window_secs = 120
//! stock_low_threshold = 5
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{LinkError, LinkResult};
use fbox_core::{DEFAULT_DISPENSE_TIMEOUT_SECS, DEFAULT_LIVENESS_WINDOW_SECS, STOCK_LOW_THRESHOLD};

// =============================================================================
// Broker Settings
// =============================================================================

/// MQTT broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// `mqtt://host:port` (or `tcp://`).
    #[serde(default = "default_broker_url")]
    pub url: String,

    /// MQTT client identifier.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Keep-alive interval (seconds).
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Initial backoff duration (milliseconds) for reconnection.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration (seconds) for reconnection.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}
fn default_client_id() -> String {
    "fbox-server".to_string()
}
fn default_keep_alive() -> u64 {
    60
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    60
}

impl Default for BrokerSettings {
    fn default() -> Self {
        BrokerSettings {
            url: default_broker_url(),
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive(),
            username: None,
            password: None,
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

impl BrokerSettings {
    /// Splits the broker URL into host and port (default port 1883).
    pub fn host_port(&self) -> LinkResult<(String, u16)> {
        let url = Url::parse(&self.url)?;

        if !matches!(url.scheme(), "mqtt" | "tcp") {
            return Err(LinkError::InvalidUrl(format!(
                "Broker URL must start with mqtt:// or tcp://, got: {}",
                self.url
            )));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| LinkError::InvalidUrl(format!("Broker URL has no host: {}", self.url)))?;

        Ok((host.to_string(), url.port().unwrap_or(1883)))
    }
}

// =============================================================================
// Database Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file path.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> PathBuf {
    directories::ProjectDirs::from("com", "fbox", "fbox-server")
        .map(|dirs| dirs.data_dir().join("fbox.db"))
        .unwrap_or_else(|| PathBuf::from("fbox.db"))
}
fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

// =============================================================================
// Rental Settings
// =============================================================================

/// Timing and threshold settings for rentals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RentalSettings {
    /// Per-unit wait for a dispense confirmation (seconds).
    #[serde(default = "default_dispense_timeout")]
    pub dispense_timeout_secs: u64,

    /// Heartbeat age beyond which a device is offline (seconds).
    #[serde(default = "default_liveness_window")]
    pub liveness_window_secs: i64,

    /// Stock at or below this raises `stock_low`.
    #[serde(default = "default_stock_low_threshold")]
    pub stock_low_threshold: i64,
}

fn default_dispense_timeout() -> u64 {
    DEFAULT_DISPENSE_TIMEOUT_SECS
}
fn default_liveness_window() -> i64 {
    DEFAULT_LIVENESS_WINDOW_SECS
}
fn default_stock_low_threshold() -> i64 {
    STOCK_LOW_THRESHOLD
}

impl Default for RentalSettings {
    fn default() -> Self {
        RentalSettings {
            dispense_timeout_secs: default_dispense_timeout(),
            liveness_window_secs: default_liveness_window(),
            stock_low_threshold: default_stock_low_threshold(),
        }
    }
}

impl RentalSettings {
    pub fn dispense_timeout(&self) -> Duration {
        Duration::from_secs(self.dispense_timeout_secs)
    }

    pub fn liveness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.liveness_window_secs)
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FboxConfig {
    #[serde(default)]
    pub broker: BrokerSettings,

    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub rental: RentalSettings,
}

impl FboxConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (fbox.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> LinkResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> LinkResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| LinkError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> LinkResult<()> {
        self.broker.host_port()?;

        if self.broker.client_id.trim().is_empty() {
            return Err(LinkError::InvalidConfig("client_id must not be empty".into()));
        }

        if self.database.max_connections == 0 {
            return Err(LinkError::InvalidConfig(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.rental.dispense_timeout_secs == 0 {
            return Err(LinkError::InvalidConfig(
                "dispense_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.rental.liveness_window_secs <= 0 {
            return Err(LinkError::InvalidConfig(
                "liveness_window_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("FBOX_BROKER_URL") {
            debug!(url = %url, "Overriding broker URL from environment");
            self.broker.url = url;
        }

        if let Ok(id) = std::env::var("FBOX_CLIENT_ID") {
            self.broker.client_id = id;
        }

        if let Ok(user) = std::env::var("FBOX_BROKER_USERNAME") {
            self.broker.username = Some(user);
        }

        if let Ok(pass) = std::env::var("FBOX_BROKER_PASSWORD") {
            self.broker.password = Some(pass);
        }

        if let Ok(path) = std::env::var("FBOX_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Ok(secs) = std::env::var("FBOX_DISPENSE_TIMEOUT_SECS") {
            match secs.parse::<u64>() {
                Ok(s) => self.rental.dispense_timeout_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid FBOX_DISPENSE_TIMEOUT_SECS"),
            }
        }

        if let Ok(secs) = std::env::var("FBOX_LIVENESS_WINDOW_SECS") {
            match secs.parse::<i64>() {
                Ok(s) => self.rental.liveness_window_secs = s,
                Err(_) => warn!(value = %secs, "Ignoring invalid FBOX_LIVENESS_WINDOW_SECS"),
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "fbox", "fbox-server")
            .map(|dirs| dirs.config_dir().join("fbox.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FboxConfig::default();
        assert_eq!(config.broker.client_id, "fbox-server");
        assert_eq!(config.broker.keep_alive_secs, 60);
        assert_eq!(config.rental.dispense_timeout(), Duration::from_secs(10));
        assert_eq!(config.rental.liveness_window(), chrono::Duration::seconds(120));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_broker_url_parsing() {
        let mut broker = BrokerSettings::default();
        assert_eq!(broker.host_port().unwrap(), ("localhost".to_string(), 1883));

        broker.url = "tcp://10.0.0.5:2883".into();
        assert_eq!(broker.host_port().unwrap(), ("10.0.0.5".to_string(), 2883));

        broker.url = "ws://10.0.0.5:8080".into();
        assert!(broker.host_port().unwrap_err().is_config_error());

        broker.url = "not a url".into();
        assert!(broker.host_port().is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = FboxConfig::default();
        config.rental.dispense_timeout_secs = 0;
        assert!(config.validate().is_err());

        config.rental.dispense_timeout_secs = 10;
        config.broker.client_id = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: FboxConfig = toml::from_str(
            r#"
            [broker]
            url = "mqtt://broker.local:1884"

            [rental]
            dispense_timeout_secs = 15
            "#,
        )
        .unwrap();

        assert_eq!(config.broker.host_port().unwrap().1, 1884);
        assert_eq!(config.broker.client_id, "fbox-server");
        assert_eq!(config.rental.dispense_timeout_secs, 15);
        assert_eq!(config.rental.liveness_window_secs, 120);
        assert_eq!(config.database.max_connections, 5);
    }

    #[test]
    fn test_toml_serialization() {
        let config = FboxConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[broker]"));
        assert!(toml_str.contains("[rental]"));
    }
}
