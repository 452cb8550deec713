//! Entities exposed to Home Assistant.

use super::discovery::DeviceInfo;
use super::discovery::DiscoveryMessage;

/// Handle to an entity registered with [`super::HomeAssistant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub(crate) usize);

/// Home Assistant component types used by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Component {
    Sensor,
    BinarySensor,
    Button,
    Scene,
    Light,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum EntityCategory {
    Config,
    Diagnostic,
}

/// What to do when a command arrives for an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Rescan,
    Inhibit,
    ResetInhibit,
    Scene(u8),
    /// Light command for the gear at this short address
    Light(u8),
    /// Light command for this group
    Group(u8),
}

/// The closed set of entity kinds. Kinds that accept commands carry the
/// action to dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityKind {
    Sensor {
        device_class: Option<&'static str>,
        category: Option<EntityCategory>,
    },
    BinarySensor {
        device_class: Option<&'static str>,
        category: Option<EntityCategory>,
    },
    Button {
        device_class: Option<&'static str>,
        category: Option<EntityCategory>,
        action: Action,
    },
    Scene {
        action: Action,
    },
    Light {
        /// `None` for on/off-only lights
        brightness_scale: Option<u8>,
        action: Action,
    },
}

impl EntityKind {
    pub fn component(&self) -> Component {
        match self {
            Self::Sensor { .. } => Component::Sensor,
            Self::BinarySensor { .. } => Component::BinarySensor,
            Self::Button { .. } => Component::Button,
            Self::Scene { .. } => Component::Scene,
            Self::Light { .. } => Component::Light,
        }
    }

    pub fn action(&self) -> Option<Action> {
        match self {
            Self::Button { action, .. } | Self::Scene { action } | Self::Light { action, .. } => {
                Some(*action)
            }
            Self::Sensor { .. } | Self::BinarySensor { .. } => None,
        }
    }

    fn has_state(&self) -> bool {
        matches!(
            self,
            Self::Sensor { .. } | Self::BinarySensor { .. } | Self::Light { .. }
        )
    }
}

/// Topic naming for one bus
#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
    bus_id: String,
}

impl Topics {
    pub fn new(prefix: impl Into<String>, bus_id: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            bus_id: bus_id.into(),
        }
    }

    pub fn bus_id(&self) -> &str {
        &self.bus_id
    }

    pub fn unique_id(&self, uid: &str) -> String {
        format!("{}_{}", self.bus_id, uid)
    }

    pub fn state(&self, uid: &str) -> String {
        format!("{}/{}/{}/state", self.prefix, self.bus_id, uid)
    }

    pub fn command(&self, uid: &str) -> String {
        format!("{}/{}/{}/command", self.prefix, self.bus_id, uid)
    }

    /// Wildcard matching every command topic on this bus
    pub fn command_pattern(&self) -> String {
        format!("{}/{}/+/command", self.prefix, self.bus_id)
    }
}

/// State payload for a binary sensor
pub fn on_off(value: bool) -> &'static str {
    if value { "ON" } else { "OFF" }
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub unique_id: String,
    pub name: String,
    pub device: Option<DeviceInfo>,
    pub kind: EntityKind,
    pub state_topic: Option<String>,
    pub command_topic: Option<String>,
    pub(crate) state: Option<String>,
}

impl Entity {
    /// Create an entity; `uid` is unique within the bus and picks its topics.
    pub fn new(
        topics: &Topics,
        uid: &str,
        name: impl Into<String>,
        device: Option<DeviceInfo>,
        kind: EntityKind,
    ) -> Self {
        Self {
            unique_id: topics.unique_id(uid),
            name: name.into(),
            device,
            state_topic: kind.has_state().then(|| topics.state(uid)),
            command_topic: kind.action().map(|_| topics.command(uid)),
            kind,
            state: None,
        }
    }

    pub fn component(&self) -> Component {
        self.kind.component()
    }

    pub fn action(&self) -> Option<Action> {
        self.kind.action()
    }

    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }

    pub fn discovery(&self) -> DiscoveryMessage {
        let mut msg = DiscoveryMessage {
            name: self.name.clone(),
            unique_id: self.unique_id.clone(),
            object_id: self.unique_id.clone(),
            device: self.device.clone(),
            command_topic: self.command_topic.clone(),
            state_topic: self.state_topic.clone(),
            ..Default::default()
        };
        match &self.kind {
            EntityKind::Sensor {
                device_class,
                category,
            }
            | EntityKind::BinarySensor {
                device_class,
                category,
            }
            | EntityKind::Button {
                device_class,
                category,
                ..
            } => {
                msg.device_class = device_class.map(str::to_string);
                msg.enabled_by_default = Some(true);
                msg.entity_category = category.map(|c| c.to_string());
            }
            EntityKind::Scene { .. } => {
                msg.enabled_by_default = Some(true);
                msg.payload_on = Some("ON".to_string());
            }
            EntityKind::Light {
                brightness_scale, ..
            } => {
                msg.schema = Some("json".to_string());
                msg.brightness = Some(brightness_scale.is_some());
                msg.brightness_scale = *brightness_scale;
            }
        }
        msg
    }
}
