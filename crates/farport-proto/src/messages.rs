//! Control message types

use serde::{Deserialize, Serialize};

/// Messages exchanged with the relay on a freshly opened stream.
///
/// A client claims a far service by sending `Bind` as the first message on
/// the stream; the relay answers `Bound` or `BindRejected` before any
/// payload bytes flow. `Ping`/`Pong` keep an otherwise idle multiplexed
/// connection alive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    Bind {
        /// Name the far side registered its exposed service under
        service_name: String,
        /// Pre-shared secret authorizing access to that service
        secret_key: String,
        /// Optional relay-wide auth token
        auth_token: Option<String>,
        version: u32,
    },
    Bound {
        service_name: String,
    },
    BindRejected {
        reason: String,
    },
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
}

impl ControlMessage {
    /// Build a bind request for the given service.
    pub fn bind(service_name: &str, secret_key: &str, auth_token: Option<&str>) -> Self {
        ControlMessage::Bind {
            service_name: service_name.to_string(),
            secret_key: secret_key.to_string(),
            auth_token: auth_token.map(|t| t.to_string()),
            version: crate::PROTOCOL_VERSION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_carries_protocol_version() {
        let msg = ControlMessage::bind("db", "secret", Some("token"));
        match msg {
            ControlMessage::Bind {
                service_name,
                version,
                auth_token,
                ..
            } => {
                assert_eq!(service_name, "db");
                assert_eq!(version, crate::PROTOCOL_VERSION);
                assert_eq!(auth_token.as_deref(), Some("token"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
