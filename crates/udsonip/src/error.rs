//! Errors surfaced by the bridge, the registry and discovery

use std::time::Duration;

use thiserror::Error;

use crate::address::LogicalAddress;
use crate::codec::{CodecError, NegativeResponseCode};
use crate::transport::TransportError;

pub type Result<T, E = UdsOnIpError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum UdsOnIpError {
    /// Operation attempted on a closed or failed connection
    #[error("Not connected")]
    NotConnected,

    /// Retarget refused by the address policy
    #[error("Target address {address} rejected: {reason}")]
    AddressRejected {
        address: LogicalAddress,
        reason: String,
    },

    /// No reply within the caller's deadline
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// Underlying link failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The ECU explicitly rejected the request
    #[error("Negative response: {nrc} (0x{nrc:02X}) for service 0x{service_id:02X}")]
    NegativeResponse {
        service_id: u8,
        nrc: NegativeResponseCode,
    },

    /// Frame could not be decoded
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Peer name '{name}' is empty or invalid")]
    InvalidPeerName { name: String },

    /// Another name already maps to this address
    #[error("Address {address} is already registered as '{existing}' (requested '{name}')")]
    DuplicateName {
        name: String,
        existing: String,
        address: LogicalAddress,
    },

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// The calling task already holds a scope on this bridge
    #[error("Reentrant acquisition of '{requested}' while holding '{held}'")]
    ReentrantAcquisition { requested: String, held: String },

    /// Waited too long for another scope to release the bridge
    #[error("Timed out after {timeout:?} waiting for exclusive access to '{name}'")]
    AcquireTimeout { name: String, timeout: Duration },

    /// The current target is owned by an active scope
    #[error("Target is locked by active scope '{0}'")]
    TargetLocked(String),

    #[error("No target address bound")]
    NoTarget,

    /// Scope exit could not rebind the previous target
    #[error("Failed to restore target {address}: {source}")]
    RestoreFailed {
        address: LogicalAddress,
        #[source]
        source: Box<UdsOnIpError>,
    },

    #[error("Discovery already in progress")]
    DiscoveryInProgress,

    /// Request arguments the service cannot encode; nothing was sent
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl UdsOnIpError {
    /// NRC carried by a negative response, if any
    pub fn nrc(&self) -> Option<NegativeResponseCode> {
        match self {
            Self::NegativeResponse { nrc, .. } => Some(*nrc),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<CodecError> for UdsOnIpError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Malformed(msg) => UdsOnIpError::Malformed(msg),
            CodecError::Unexpected { expected, actual } => UdsOnIpError::Malformed(format!(
                "expected response SID 0x{:02X}, got 0x{:02X}",
                expected, actual
            )),
        }
    }
}
