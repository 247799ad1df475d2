//! Session error types

use farport_transport::TransportError;
use thiserror::Error;

/// Relay session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to bind {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Bind rejected by relay: {0}")]
    BindRejected(String),

    #[error("Relay handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type SessionResult<T> = Result<T, SessionError>;
