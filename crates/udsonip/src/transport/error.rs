//! Transport layer errors

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection to {host} failed: {reason}")]
    ConnectionFailed { host: String, reason: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Nothing arrived within the wait; the link itself is still healthy
    #[error("No frame within {0:?}")]
    Timeout(Duration),

    #[error("Could not bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport not supported: {0}")]
    Unsupported(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub(crate) fn connect(host: impl Into<String>, reason: impl ToString) -> Self {
        Self::ConnectionFailed {
            host: host.into(),
            reason: reason.to_string(),
        }
    }
}
