//! Command and status data model
//!
//! Commands flow one way, from callers to the dispatcher, each carrying an
//! optional single-use reply slot. Status events flow the other way on a
//! best-effort feed and serialize to JSON for whatever surface displays
//! them.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::ManagerError;

/// What the dispatcher should do with a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandAction {
    Connect,
    Disconnect,
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandAction::Connect => write!(f, "connect"),
            CommandAction::Disconnect => write!(f, "disconnect"),
        }
    }
}

/// One instruction for the session dispatcher.
#[derive(Debug)]
pub struct SessionCommand {
    pub action: CommandAction,

    /// Opaque identifier of the remote service instance
    pub instance_id: u64,

    /// Human-readable instance name; also the service name sent to the
    /// relay during the bind handshake
    pub instance_name: String,

    /// Secret key for the bind handshake
    pub secret_key: String,

    /// Local TCP port to bind; 0 binds an OS-assigned port
    pub local_port: u16,

    /// Relay URL override; empty or absent selects the configured default
    pub relay_url: Option<String>,

    /// Receives the command outcome; taken by the dispatcher before the
    /// command is processed. Commands without a slot are fire-and-forget.
    pub reply: Option<oneshot::Sender<Result<(), ManagerError>>>,
}

impl SessionCommand {
    /// Registry name for this command's session.
    pub fn session_name(&self) -> String {
        format!("{}-visitor", self.instance_name)
    }
}

/// Observed session state carried by status events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connected,
    Disconnected,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connected => write!(f, "connected"),
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Error => write!(f, "error"),
        }
    }
}

/// A session state change, published on the status feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub instance_id: u64,
    pub instance_name: String,
    pub state: SessionState,
    pub local_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusEvent {
    pub fn connected(instance_id: u64, instance_name: impl Into<String>, local_port: u16) -> Self {
        Self {
            instance_id,
            instance_name: instance_name.into(),
            state: SessionState::Connected,
            local_port,
            error: None,
        }
    }

    pub fn disconnected(instance_id: u64, instance_name: impl Into<String>) -> Self {
        Self {
            instance_id,
            instance_name: instance_name.into(),
            state: SessionState::Disconnected,
            local_port: 0,
            error: None,
        }
    }

    pub fn error(
        instance_id: u64,
        instance_name: impl Into<String>,
        local_port: u16,
        error: impl Into<String>,
    ) -> Self {
        Self {
            instance_id,
            instance_name: instance_name.into(),
            state: SessionState::Error,
            local_port,
            error: Some(error.into()),
        }
    }
}
