/// Backward frame value meaning "not applicable" for numeric queries.
pub const MASK: u8 = 0xff;

/// What came back from the bus for a single forward frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Nobody answered.
    NoAnswer,
    /// A backward frame was received.
    Frame(u8),
}

/// A numeric reading decoded from a [`Reply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Value(u8),
    Mask,
    Missing,
}

impl Reply {
    /// Yes/no queries: any backward frame, even a collision, means yes.
    pub fn is_yes(self) -> bool {
        matches!(self, Self::Frame(_))
    }

    pub fn value(self) -> Option<u8> {
        match self {
            Self::Frame(v) => Some(v),
            Self::NoAnswer => None,
        }
    }

    pub fn level(self) -> Level {
        match self {
            Self::Frame(MASK) => Level::Mask,
            Self::Frame(v) => Level::Value(v),
            Self::NoAnswer => Level::Missing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yes_no() {
        assert!(Reply::Frame(0).is_yes());
        assert!(Reply::Frame(MASK).is_yes());
        assert!(!Reply::NoAnswer.is_yes());
    }

    #[test]
    fn test_level() {
        assert_eq!(Reply::Frame(254).level(), Level::Value(254));
        assert_eq!(Reply::Frame(MASK).level(), Level::Mask);
        assert_eq!(Reply::NoAnswer.level(), Level::Missing);
    }
}
