//! Error types for the BMS bridge
//!
//! Radio failures, BMS protocol violations and delivery failures are kept apart
//! so a caller can tell an ordinary timeout or radio hiccup from a peer that
//! does not speak the expected protocol.

use std::fmt;

use thiserror::Error;

use crate::core::bluetooth::types::DeviceAddress;

/// Platform error code reported when disconnecting a link that is already gone.
pub const ERR_ALREADY_DISCONNECTED: i32 = -128;

/// Failure reported by a [`RadioAdapter`](crate::core::bluetooth::RadioAdapter) command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    /// The link was already torn down
    #[error("peer is already disconnected")]
    AlreadyDisconnected,

    /// The radio has not been activated
    #[error("radio is not active")]
    NotActive,

    /// The peer was never seen by a scan
    #[error("unknown peer {0}")]
    UnknownPeer(DeviceAddress),

    /// No attribute is known under this handle
    #[error("unknown attribute handle 0x{0:04X}")]
    UnknownHandle(u16),

    /// Raw platform error code
    #[error("radio operation failed with code {0}")]
    Code(i32),

    /// Platform error without a numeric code
    #[error("radio operation failed: {0}")]
    Platform(String),
}

impl RadioError {
    /// Maps a numeric platform error code onto a typed error.
    pub fn from_code(code: i32) -> Self {
        match code {
            ERR_ALREADY_DISCONNECTED => RadioError::AlreadyDisconnected,
            other => RadioError::Code(other),
        }
    }
}

/// A GATT handle the BMS session could not resolve during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingHandle {
    Notify,
    Write,
    Cccd,
}

impl fmt::Display for MissingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingHandle::Notify => write!(f, "notify"),
            MissingHandle::Write => write!(f, "write"),
            MissingHandle::Cccd => write!(f, "CCCD"),
        }
    }
}

fn join_handles(missing: &[MissingHandle]) -> String {
    missing
        .iter()
        .map(|handle| handle.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Conditions that end the current peer session.
///
/// These point at a firmware or peer mismatch rather than a flaky link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// Discovery finished without every required handle
    #[error("discovery for {address} finished without {} handle(s)", join_handles(.missing))]
    MissingHandles {
        /// The peer being discovered
        address: DeviceAddress,
        /// Which handles are still unresolved
        missing: Vec<MissingHandle>,
    },

    /// A status frame terminator arrived with no frame open
    #[error("status frame terminator received with no open frame")]
    UnexpectedTerminator,
}

/// Main error type for the bridge
#[derive(Error, Debug)]
pub enum BmsError {
    /// The peer violated the BMS protocol; the session has been aborted
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// A radio command failed
    #[error("radio error: {0}")]
    Radio(#[from] RadioError),

    /// The reading sink rejected a reading
    #[error("failed to deliver reading for {address}: {message}")]
    Delivery {
        /// The peer the reading belongs to
        address: DeviceAddress,
        /// Sink error message
        message: String,
    },
}

impl BmsError {
    /// Returns true if this error ends the session because of a protocol mismatch.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, BmsError::Protocol(_))
    }
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BmsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_code_maps_already_disconnected() {
        assert_eq!(RadioError::from_code(-128), RadioError::AlreadyDisconnected);
        assert_eq!(RadioError::from_code(-114), RadioError::Code(-114));
    }

    #[test]
    fn test_missing_handles_display() {
        let address: DeviceAddress = "A5:C2:37:2D:D9:E4".parse().unwrap();
        let err = ProtocolViolation::MissingHandles {
            address,
            missing: vec![MissingHandle::Write, MissingHandle::Cccd],
        };
        assert_eq!(
            err.to_string(),
            "discovery for A5:C2:37:2D:D9:E4 finished without write, CCCD handle(s)"
        );
    }

    #[test]
    fn test_protocol_violation_is_distinguishable() {
        let err: BmsError = ProtocolViolation::UnexpectedTerminator.into();
        assert!(err.is_protocol_violation());

        let err: BmsError = RadioError::NotActive.into();
        assert!(!err.is_protocol_violation());
    }
}
