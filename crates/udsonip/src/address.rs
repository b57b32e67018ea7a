//! DoIP logical addresses

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical address of a DoIP entity or ECU behind a gateway (ISO 13400-2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalAddress(u16);

impl LogicalAddress {
    /// Reserved by ISO 13400, never a valid target
    pub const RESERVED: LogicalAddress = LogicalAddress(0x0000);

    /// Default tester (external test equipment) address
    pub const DEFAULT_TESTER: LogicalAddress = LogicalAddress(0x0E00);

    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u16 {
        self.0
    }

    pub fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_be_bytes(bytes))
    }

    /// Functional (group) addresses, used for one-to-many requests only
    pub fn is_functional(self) -> bool {
        (0xE400..=0xEFFF).contains(&self.0)
    }
}

impl From<u16> for LogicalAddress {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<LogicalAddress> for u16 {
    fn from(address: LogicalAddress) -> Self {
        address.0
    }
}

impl fmt::Display for LogicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}
