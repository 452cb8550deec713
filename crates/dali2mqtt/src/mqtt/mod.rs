//! Home Assistant integration over MQTT.

mod client;
pub mod config;
pub mod discovery;
pub mod entity;
pub mod light;
mod sync;

#[cfg(test)]
pub use client::MockMqttClient;
pub use client::MqttClient;
pub use client::MqttError;
pub use client::MqttEvent;
pub use client::MqttMessage;
pub use client::RECONNECT_INTERVAL;
pub use client::RumqttcClient;
pub use config::Config as MqttConfig;
pub use sync::HomeAssistant;
