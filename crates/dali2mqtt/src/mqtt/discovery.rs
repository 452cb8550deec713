use serde::Serialize;

/// Device information attached to discovery messages
///
/// Entities sharing a device are grouped together by Home Assistant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// List of identifiers for this device
    pub identifiers: Vec<String>,

    /// Device name
    pub name: String,

    /// Manufacturer name
    pub manufacturer: String,

    /// Model name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub hw_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,

    /// Identifier of the device this one is reached through
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via_device: Option<String>,
}

/// Discovery message published for each entity
///
/// Based on Home Assistant's MQTT discovery protocol. Fields that don't apply
/// to an entity's component are left out of the JSON entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveryMessage {
    /// Human-readable name of the entity
    pub name: String,

    /// Unique identifier for this entity
    pub unique_id: String,

    /// Preferred entity ID; we always use the unique ID
    pub object_id: String,

    /// Device information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceInfo>,

    /// Schema type; "json" for lights
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Device class (e.g., "problem", "restart")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled_by_default: Option<bool>,

    /// Topic to send commands
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,

    /// Topic to receive state updates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_topic: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_category: Option<String>,

    /// Payload to send when activating a scene
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<String>,

    /// Whether brightness is supported
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<bool>,

    /// Brightness value corresponding to 100%
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness_scale: Option<u8>,
}

/// Build a discovery topic
///
/// Topic format: {prefix}/{component}/{unique_id}/config
pub fn discovery_topic(prefix: &str, component: &str, unique_id: &str) -> String {
    format!("{}/{}/{}/config", prefix, component, unique_id)
}
