//! Relay endpoint resolution
//!
//! A relay address can arrive as a full URL (`wss://relay.example.com/ws`),
//! a bare `host:port`, or not at all, in which case the configured default
//! relay host is combined with the well-known port and path. Whatever the
//! source, sessions end up with the same `RelayEndpoint` shape.

use std::fmt;

use farport_proto::{DEFAULT_RELAY_PATH, DEFAULT_RELAY_PORT};
use url::Url;

use crate::error::{TransportError, TransportResult};

/// Wire protocol used to reach the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayProtocol {
    /// Plain byte stream
    Plain,
    /// WebSocket over HTTP
    Ws,
    /// WebSocket over HTTPS
    Wss,
}

impl RelayProtocol {
    pub fn is_websocket(&self) -> bool {
        matches!(self, RelayProtocol::Ws | RelayProtocol::Wss)
    }

    pub fn uses_tls(&self) -> bool {
        matches!(self, RelayProtocol::Wss)
    }

    /// Scheme for the WebSocket upgrade URL.
    pub fn upgrade_scheme(&self) -> &'static str {
        match self {
            RelayProtocol::Wss => "wss",
            _ => "ws",
        }
    }
}

impl fmt::Display for RelayProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayProtocol::Plain => write!(f, "tcp"),
            RelayProtocol::Ws => write!(f, "ws"),
            RelayProtocol::Wss => write!(f, "wss"),
        }
    }
}

/// Resolved relay address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub protocol: RelayProtocol,
}

impl RelayEndpoint {
    /// Parse a relay URL of the shape `scheme://host[:port][/path]`.
    ///
    /// An address without a scheme is treated as `ws://<address>`. Scheme
    /// mapping: ws/http stay WebSocket, wss/https become WebSocket over TLS,
    /// tcp selects the plain byte stream, and anything unrecognized falls
    /// back to ws. A missing port defaults to 443 for TLS schemes and 80
    /// otherwise; a missing path defaults to the reserved relay path.
    pub fn parse(server_url: &str) -> TransportResult<Self> {
        let trimmed = server_url.trim();
        if trimmed.is_empty() {
            return Err(TransportError::ConfigurationError(
                "Relay URL is empty".to_string(),
            ));
        }

        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("ws://{}", trimmed)
        };

        let url = Url::parse(&with_scheme).map_err(|e| {
            TransportError::ConfigurationError(format!(
                "Invalid relay URL '{}': {}",
                server_url, e
            ))
        })?;

        let host = url
            .host_str()
            .ok_or_else(|| {
                TransportError::ConfigurationError(format!(
                    "Relay URL '{}' has no host",
                    server_url
                ))
            })?
            .to_string();

        let protocol = match url.scheme() {
            "wss" | "https" => RelayProtocol::Wss,
            "ws" | "http" => RelayProtocol::Ws,
            "tcp" => RelayProtocol::Plain,
            _ => RelayProtocol::Ws,
        };

        let port = url.port_or_known_default().unwrap_or(match protocol {
            RelayProtocol::Wss => 443,
            _ => 80,
        });

        // The url crate normalizes an absent path to "/" for ws/wss; both
        // mean "use the reserved relay path" here.
        let path = match url.path() {
            "" | "/" => DEFAULT_RELAY_PATH.to_string(),
            p => p.to_string(),
        };

        Ok(Self {
            host,
            port,
            path,
            protocol,
        })
    }

    /// Endpoint used when no relay URL is supplied: the default relay host
    /// on the well-known port, WebSocket protocol, reserved path.
    pub fn default_for_host(host: &str) -> Self {
        Self {
            host: host.to_string(),
            port: DEFAULT_RELAY_PORT,
            path: DEFAULT_RELAY_PATH.to_string(),
            protocol: RelayProtocol::Ws,
        }
    }

    /// `host:port` pair for dialing.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for RelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}{}",
            self.protocol, self.host, self.port, self.path
        )
    }
}
