//! Configuration file parsing and structures.
//!
//! dali2mqtt uses a single TOML file with three sections: `[logging]`,
//! `[dali]` for the bus and bridge behaviour, and `[mqtt]` for the broker.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;

use crate::dali::address::MAX_SHORT_ADDRESS;
use crate::mqtt::MqttConfig;

/// Top-level configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub dali: DaliConfig,
    pub mqtt: MqttConfig,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `rumqttc = "warn"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    /// Build the filter for the subscriber. `debug` raises the default level.
    pub fn targets(&self, debug: bool) -> Targets {
        let level = if debug {
            self.level.min(LogLevel::Debug)
        } else {
            self.level
        };
        self.overrides
            .iter()
            .fold(Targets::new().with_default(level), |targets, (target, level)| {
                targets.with_target(target.clone(), *level)
            })
    }
}

/// How member levels combine into a group's published state
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupMode {
    /// Groups are not exposed at all
    #[default]
    Off,
    Min,
    Average,
    Max,
}

/// Bus gateway selection
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum BusConfig {
    Daliserver {
        #[serde(default = "default_daliserver_hostname")]
        hostname: String,
        #[serde(default = "default_daliserver_port")]
        port: u16,
        #[serde(default = "default_bus_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_daliserver_hostname() -> String {
    "localhost".to_string()
}

fn default_daliserver_port() -> u16 {
    crate::bus::daliserver::DEFAULT_PORT
}

fn default_bus_timeout_ms() -> u64 {
    2000
}

/// Per-device overrides, keyed by short address
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct GearConfig {
    /// Force brightness support on or off
    pub brightness: Option<bool>,
}

fn default_mqtt_prefix() -> String {
    "dali2mqtt".to_string()
}

fn default_poll_interval() -> f64 {
    60.0
}

/// Longest accepted poll interval
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

fn default_max_address() -> u8 {
    MAX_SHORT_ADDRESS
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaliConfig {
    /// First component of every state and command topic
    #[serde(default = "default_mqtt_prefix")]
    pub mqtt_prefix: String,

    /// Identifies this bus in topics and unique IDs
    pub bus_id: String,

    /// Human-readable name for the bridge device
    pub bus_name: String,

    /// Seconds between polls of each light
    #[serde(default = "default_poll_interval")]
    pub poll_interval: f64,

    #[serde(default)]
    pub groups: GroupMode,

    /// Highest short address to scan
    #[serde(default = "default_max_address")]
    pub max_address: u8,

    pub bus: BusConfig,

    #[serde(default)]
    pub gear: HashMap<String, GearConfig>,
}

impl DaliConfig {
    /// Clamped to `MAX_POLL_INTERVAL`; `validate` rejects anything outside it.
    pub fn poll_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.poll_interval)
            .map_or(MAX_POLL_INTERVAL, |interval| interval.min(MAX_POLL_INTERVAL))
    }

    /// Overrides for the gear at `address`, if any
    pub fn gear(&self, address: u8) -> Option<&GearConfig> {
        self.gear
            .iter()
            .find(|(key, _)| key.trim().parse::<u8>() == Ok(address))
            .map(|(_, gear)| gear)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check constraints serde can't express
    pub fn validate(&self) -> Result<(), ConfigError> {
        let dali = &self.dali;
        match Duration::try_from_secs_f64(dali.poll_interval) {
            Ok(interval) if !interval.is_zero() && interval <= MAX_POLL_INTERVAL => {}
            _ => {
                return Err(ConfigError::Validation(format!(
                    "dali.poll_interval must be positive and at most {} seconds, got {}",
                    MAX_POLL_INTERVAL.as_secs(),
                    dali.poll_interval
                )));
            }
        }
        if dali.max_address > MAX_SHORT_ADDRESS {
            return Err(ConfigError::Validation(format!(
                "dali.max_address must be at most {}, got {}",
                MAX_SHORT_ADDRESS, dali.max_address
            )));
        }
        if dali.bus_id.is_empty() || dali.bus_id.contains(['/', '+', '#']) {
            return Err(ConfigError::Validation(format!(
                "dali.bus_id {:?} can't be used in an MQTT topic",
                dali.bus_id
            )));
        }
        for key in dali.gear.keys() {
            match key.trim().parse::<u8>() {
                Ok(address) if address <= dali.max_address => {}
                _ => {
                    return Err(ConfigError::Validation(format!(
                        "dali.gear.{} is not a short address between 0 and {}",
                        key, dali.max_address
                    )));
                }
            }
        }
        Ok(())
    }
}

impl BusConfig {
    pub fn timeout(&self) -> Duration {
        match self {
            Self::Daliserver { timeout_ms, .. } => Duration::from_millis(*timeout_ms),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}
