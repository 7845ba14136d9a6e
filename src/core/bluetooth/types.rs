//! Defines shared data structures for the Bluetooth module.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Connection handle assigned by the radio to an established link
pub type ConnHandle = u16;

/// GATT attribute handle
pub type AttrHandle = u16;

/// 6-byte peer address, displayed as colon-separated uppercase hex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Returned when a string is not a colon-separated 6-byte address
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid device address: {0:?}")]
pub struct AddressParseError(String);

impl FromStr for DeviceAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AddressParseError(s.to_string());

        let mut bytes = [0u8; 6];
        let mut parts = s.trim().split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self(bytes))
    }
}

impl TryFrom<String> for DeviceAddress {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceAddress> for String {
    fn from(address: DeviceAddress) -> Self {
        address.to_string()
    }
}

/// Inclusive range of attribute handles covered by a GATT service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleRange {
    pub start: AttrHandle,
    pub end: AttrHandle,
}

impl HandleRange {
    pub const fn new(start: AttrHandle, end: AttrHandle) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, handle: AttrHandle) -> bool {
        (self.start..=self.end).contains(&handle)
    }
}

impl fmt::Display for HandleRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}..=0x{:04X}", self.start, self.end)
    }
}

/// Session state of the [`BluetoothManager`](super::BluetoothManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No link and no scan in progress
    #[default]
    Disconnected,
    /// A scan window is open
    Scanning,
    /// Nothing in flight; the last scan or exchange finished
    Idle,
    /// Connect request issued, waiting for the link
    Connecting,
    /// Link established
    Connected,
    /// Walking services, characteristics and descriptors
    Discovering,
    /// Notify, write and CCCD handles are resolved
    Ready,
    /// Command frames sent, waiting for the status report
    Communicating,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Scanning => write!(f, "scanning"),
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Discovering => write!(f, "discovering"),
            ConnectionState::Ready => write!(f, "ready"),
            ConnectionState::Communicating => write!(f, "communicating"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display_round_trip() {
        let address: DeviceAddress = "a5:c2:37:2d:d9:e4".parse().unwrap();
        assert_eq!(address.as_bytes(), &[0xA5, 0xC2, 0x37, 0x2D, 0xD9, 0xE4]);
        assert_eq!(address.to_string(), "A5:C2:37:2D:D9:E4");
    }

    #[test]
    fn test_address_rejects_malformed_strings() {
        for bad in ["", "A5:C2:37:2D:D9", "A5:C2:37:2D:D9:E4:00", "A5:C2:37:2D:D9:G4", "A5C2:37:2D:D9:E4:0"] {
            assert!(bad.parse::<DeviceAddress>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_address_serializes_as_string() {
        let address = DeviceAddress::new([0xA5, 0xC2, 0x37, 0x2D, 0xC6, 0x18]);
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, "\"A5:C2:37:2D:C6:18\"");
        assert!(serde_json::from_str::<DeviceAddress>("\"nope\"").is_err());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Communicating.to_string(), "communicating");
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
