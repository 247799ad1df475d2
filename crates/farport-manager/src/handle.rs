//! Public manager handle

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{ManagerError, ManagerResult};
use crate::model::{CommandAction, SessionCommand};
use crate::registry::SessionRegistry;

/// Deadline for a command to enter the queue
pub const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for a Connect command to resolve
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for a Disconnect command to resolve
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Cloneable front door to the session dispatcher.
///
/// Commands submitted through any clone resolve in submission order. A
/// `QueueFull` or `Timeout` result leaves the command's outcome unknown:
/// Disconnect is safe to retry, while a retried Connect may legitimately
/// come back as `AlreadyExists`.
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    command_tx: mpsc::Sender<SessionCommand>,
    registry: Arc<SessionRegistry>,
    root_cancel: CancellationToken,
}

impl ManagerHandle {
    pub(crate) fn new(
        command_tx: mpsc::Sender<SessionCommand>,
        registry: Arc<SessionRegistry>,
        root_cancel: CancellationToken,
    ) -> Self {
        Self {
            command_tx,
            registry,
            root_cancel,
        }
    }

    /// Start a session for a remote service instance.
    ///
    /// Resolves once the session is registered and listening locally, or
    /// with whatever prevented that. An empty or absent `relay_url`
    /// selects the configured default relay.
    pub async fn connect(
        &self,
        instance_id: u64,
        instance_name: impl Into<String>,
        secret_key: impl Into<String>,
        local_port: u16,
        relay_url: Option<String>,
    ) -> ManagerResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = SessionCommand {
            action: CommandAction::Connect,
            instance_id,
            instance_name: instance_name.into(),
            secret_key: secret_key.into(),
            local_port,
            relay_url,
            reply: Some(reply_tx),
        };
        self.submit(cmd, reply_rx, CONNECT_TIMEOUT).await
    }

    /// Stop the session for a remote service instance.
    pub async fn disconnect(
        &self,
        instance_id: u64,
        instance_name: impl Into<String>,
    ) -> ManagerResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = SessionCommand {
            action: CommandAction::Disconnect,
            instance_id,
            instance_name: instance_name.into(),
            secret_key: String::new(),
            local_port: 0,
            relay_url: None,
            reply: Some(reply_tx),
        };
        self.submit(cmd, reply_rx, DISCONNECT_TIMEOUT).await
    }

    async fn submit(
        &self,
        cmd: SessionCommand,
        reply_rx: oneshot::Receiver<ManagerResult<()>>,
        reply_timeout: Duration,
    ) -> ManagerResult<()> {
        self.command_tx
            .send_timeout(cmd, ENQUEUE_TIMEOUT)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => ManagerError::QueueFull,
                mpsc::error::SendTimeoutError::Closed(_) => ManagerError::NotRunning,
            })?;

        match timeout(reply_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            // Dispatcher dropped the reply slot without answering.
            Ok(Err(_)) => Err(ManagerError::NotRunning),
            Err(_) => Err(ManagerError::Timeout),
        }
    }

    /// Names of the currently registered sessions.
    pub fn active_sessions(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Stop the dispatcher and every active session.
    ///
    /// Idempotent; clones of this handle all observe the shutdown.
    pub fn stop(&self) {
        self.root_cancel.cancel();
        let handles = self.registry.drain();
        if !handles.is_empty() {
            info!("Stopping {} active session(s)", handles.len());
        }
        for handle in handles {
            handle.close();
        }
    }
}
