//! Transport error types

use std::time::Duration;
use thiserror::Error;

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid transport configuration: {0}")]
    ConfigurationError(String),

    #[error("TLS failure: {0}")]
    TlsError(String),

    #[error("Relay connection error: {0}")]
    ConnectionError(String),

    #[error("Proxy error: {0}")]
    ProxyError(String),

    #[error("Protocol violation: {0}")]
    ProtocolError(String),

    #[error("Connect timeout after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Stream is closed")]
    StreamClosed,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<farport_proto::CodecError> for TransportError {
    fn from(err: farport_proto::CodecError) -> Self {
        match err {
            farport_proto::CodecError::Io(e) => TransportError::IoError(e),
            other => TransportError::ProtocolError(other.to_string()),
        }
    }
}

impl From<farport_proto::MuxError> for TransportError {
    fn from(err: farport_proto::MuxError) -> Self {
        TransportError::ProtocolError(err.to_string())
    }
}
