use serde::Deserialize;
use serde::Serialize;

/// On/off value used in light payloads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Power {
    On,
    #[default]
    Off,
}

/// State published for a light entity using the JSON schema, e.g.
/// `{"state": "ON", "brightness": 128}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LightState {
    pub state: Power,

    /// Only present when the light is on and supports brightness
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,
}

impl LightState {
    pub fn new(level: u8, supports_brightness: bool) -> Self {
        if level == 0 {
            return Self {
                state: Power::Off,
                brightness: None,
            };
        }
        Self {
            state: Power::On,
            brightness: supports_brightness.then_some(level),
        }
    }

    pub fn to_payload(&self) -> String {
        // Serializing a struct of plain fields can't fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Command received on a light's command topic
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LightCommand {
    /// Missing state means off
    #[serde(default)]
    pub state: Power,

    /// Requested brightness on the light's own scale
    pub brightness: Option<u16>,

    /// Transition time in seconds
    pub transition: Option<f64>,
}

impl LightCommand {
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// A transition of zero counts as no transition at all.
    pub fn has_transition(&self) -> bool {
        self.transition.is_some_and(|t| t > 0.0)
    }

    /// Level to aim for, given the level to return to when switched on
    /// without a brightness.
    pub fn target_level(&self, previous_active_level: u8) -> u8 {
        match self.state {
            Power::Off => 0,
            Power::On => match self.brightness {
                Some(brightness) => brightness.min(254) as u8,
                None => previous_active_level,
            },
        }
    }
}
