//! The subset of the DALI command catalogue the bridge speaks.
//!
//! Each constructor produces a [`Command`] carrying its forward frame, the
//! send-twice flag and the device type that must be enabled before it.

use std::fmt;

use super::address::Address;

/// Number of scenes a control gear can store.
pub const SCENE_COUNT: u8 = 16;

/// Device type of emergency control gear (IEC 62386-202).
pub const DEVICE_TYPE_EMERGENCY: u8 = 1;

/// Device type of switching (relay) control gear (IEC 62386-208).
pub const DEVICE_TYPE_RELAY: u8 = 7;

/// A forward frame as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardFrame {
    bits: u8,
    data: u32,
}

impl ForwardFrame {
    pub fn new(bits: u8, data: u32) -> Self {
        Self { bits, data }
    }

    /// A 16-bit control gear frame: address byte, then opcode byte.
    pub fn gear(address_byte: u8, opcode: u8) -> Self {
        Self::new(16, u32::from(u16::from_be_bytes([address_byte, opcode])))
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn data(&self) -> u32 {
        self.data
    }
}

/// One bus command: what to put on the wire and how to put it there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: &'static str,
    frame: ForwardFrame,
    send_twice: bool,
    device_type: u8,
}

impl Command {
    pub fn new(name: &'static str, frame: ForwardFrame) -> Self {
        Self {
            name,
            frame,
            send_twice: false,
            device_type: 0,
        }
    }

    /// Mark the command as one that must be transmitted twice to take effect.
    pub fn twice(mut self) -> Self {
        self.send_twice = true;
        self
    }

    /// Require `device_type` to be enabled before this command is sent.
    pub fn for_device_type(mut self, device_type: u8) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn frame(&self) -> ForwardFrame {
        self.frame
    }

    pub fn send_twice(&self) -> bool {
        self.send_twice
    }

    /// Zero means no device type needs enabling.
    pub fn device_type(&self) -> u8 {
        self.device_type
    }

    fn gear(name: &'static str, address: Address, opcode: u8) -> Self {
        Self::new(name, ForwardFrame::gear(address.command_byte(), opcode))
    }

    pub fn direct_arc_power(address: Address, level: u8) -> Self {
        Self::new(
            "DirectArcPower",
            ForwardFrame::gear(address.arc_power_byte(), level),
        )
    }

    pub fn off(address: Address) -> Self {
        Self::gear("Off", address, 0x00)
    }

    pub fn recall_max_level(address: Address) -> Self {
        Self::gear("RecallMaxLevel", address, 0x05)
    }

    pub fn recall_min_level(address: Address) -> Self {
        Self::gear("RecallMinLevel", address, 0x06)
    }

    /// Scene numbers are taken modulo [`SCENE_COUNT`].
    pub fn go_to_scene(address: Address, scene: u8) -> Self {
        Self::gear("GoToScene", address, 0x10 | (scene & 0x0f))
    }

    pub fn query_control_gear_present(address: Address) -> Self {
        Self::gear("QueryControlGearPresent", address, 0x91)
    }

    pub fn query_lamp_failure(address: Address) -> Self {
        Self::gear("QueryLampFailure", address, 0x92)
    }

    pub fn query_device_type(address: Address) -> Self {
        Self::gear("QueryDeviceType", address, 0x99)
    }

    pub fn query_physical_minimum(address: Address) -> Self {
        Self::gear("QueryPhysicalMinimum", address, 0x9a)
    }

    pub fn query_actual_level(address: Address) -> Self {
        Self::gear("QueryActualLevel", address, 0xa0)
    }

    pub fn query_max_level(address: Address) -> Self {
        Self::gear("QueryMaxLevel", address, 0xa1)
    }

    pub fn query_min_level(address: Address) -> Self {
        Self::gear("QueryMinLevel", address, 0xa2)
    }

    pub fn query_next_device_type(address: Address) -> Self {
        Self::gear("QueryNextDeviceType", address, 0xa7)
    }

    /// Scene numbers are taken modulo [`SCENE_COUNT`].
    pub fn query_scene_level(address: Address, scene: u8) -> Self {
        Self::gear("QuerySceneLevel", address, 0xb0 | (scene & 0x0f))
    }

    pub fn query_groups_zero_to_seven(address: Address) -> Self {
        Self::gear("QueryGroupsZeroToSeven", address, 0xc0)
    }

    pub fn query_groups_eight_to_fifteen(address: Address) -> Self {
        Self::gear("QueryGroupsEightToFifteen", address, 0xc1)
    }

    /// Special command; applies to whichever command follows it.
    pub fn enable_device_type(device_type: u8) -> Self {
        Self::new("EnableDeviceType", ForwardFrame::gear(0xc1, device_type))
    }

    pub fn emergency_inhibit(address: Address) -> Self {
        Self::gear("Inhibit", address, 0xe1).for_device_type(DEVICE_TYPE_EMERGENCY)
    }

    pub fn emergency_relight_reset_inhibit(address: Address) -> Self {
        Self::gear("ReLightResetInhibit", address, 0xe2).for_device_type(DEVICE_TYPE_EMERGENCY)
    }

    pub fn query_emergency_features(address: Address) -> Self {
        Self::gear("QueryEmergencyFeatures", address, 0xfb).for_device_type(DEVICE_TYPE_EMERGENCY)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#06x})", self.name, self.frame.data)
    }
}

/// Emergency feature flags (QueryEmergencyFeatures reply).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmergencyFeatures(pub u8);

impl EmergencyFeatures {
    pub fn integral(self) -> bool {
        self.0 & 0x01 != 0
    }

    pub fn maintained(self) -> bool {
        self.0 & 0x02 != 0
    }

    pub fn switched_maintained(self) -> bool {
        self.0 & 0x04 != 0
    }
}
