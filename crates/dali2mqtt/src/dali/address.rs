use std::fmt;

/// Highest short address a control gear can hold.
pub const MAX_SHORT_ADDRESS: u8 = 63;

/// Number of group addresses on a bus.
pub const GROUP_COUNT: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("short address {0} out of range (0-63)")]
    Short(u8),

    #[error("group address {0} out of range (0-15)")]
    Group(u8),
}

/// Destination of a forward frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Address {
    Short(u8),
    Group(u8),
    Broadcast,
}

impl Address {
    pub fn short(address: u8) -> Result<Self, AddressError> {
        if address > MAX_SHORT_ADDRESS {
            return Err(AddressError::Short(address));
        }
        Ok(Self::Short(address))
    }

    pub fn group(group: u8) -> Result<Self, AddressError> {
        if group >= GROUP_COUNT {
            return Err(AddressError::Group(group));
        }
        Ok(Self::Group(group))
    }

    /// Address byte for an ordinary command (selector bit set).
    pub fn command_byte(self) -> u8 {
        match self {
            Self::Short(a) => (a << 1) | 0x01,
            Self::Group(g) => 0x80 | (g << 1) | 0x01,
            Self::Broadcast => 0xff,
        }
    }

    /// Address byte for a direct arc power level (selector bit clear).
    pub fn arc_power_byte(self) -> u8 {
        self.command_byte() & !0x01
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Short(a) => write!(f, "A{}", a),
            Self::Group(g) => write!(f, "G{}", g),
            Self::Broadcast => f.write_str("broadcast"),
        }
    }
}
