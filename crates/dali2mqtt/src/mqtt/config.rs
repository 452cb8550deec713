use std::time::Duration;

use serde::Deserialize;

fn default_port() -> u16 {
    1883
}

/// `dali2mqtt-<hostname>`; client ids must be unique per broker.
fn default_client_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| format!("dali2mqtt-{}", h))
        .unwrap_or_else(|| "dali2mqtt".to_string())
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_state_debounce_ms() -> u64 {
    1000
}

/// Configuration for the MQTT connection to Home Assistant
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// MQTT broker hostname or IP address
    pub broker: String,

    /// MQTT broker port
    #[serde(default = "default_port")]
    pub port: u16,

    /// MQTT client ID
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Home Assistant discovery prefix (default: "homeassistant")
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,

    /// Optional username for authentication
    pub username: Option<String>,

    /// Optional password for authentication
    pub password: Option<String>,

    /// Delay between an entity's discovery message and its first state
    #[serde(default = "default_state_debounce_ms")]
    pub state_debounce_ms: u64,
}

impl Config {
    pub fn state_debounce(&self) -> Duration {
        Duration::from_millis(self.state_debounce_ms)
    }

    /// Credentials are only used when both halves are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }
}
