//! Session dispatcher
//!
//! One task owns the command queue. Commands resolve strictly in
//! submission order, which keeps the AlreadyExists/NotFound checks
//! race-free, and each one answers through its reply slot before the next
//! begins. Sessions themselves run on their own tasks under child
//! cancellation tokens and outlive the command that started them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use farport_session::{RelaySession, SessionConfig};
use farport_transport::{RelayEndpoint, TransportOptions, TunnelConnector};

use crate::config::ManagerConfig;
use crate::error::{ManagerError, ManagerResult};
use crate::handle::ManagerHandle;
use crate::model::{CommandAction, SessionCommand, StatusEvent};
use crate::registry::{SessionHandle, SessionRegistry};
use crate::status::StatusPublisher;

/// Capacity of the command and status queues
pub const CHANNEL_CAPACITY: usize = 10;

/// How long `remove_session` waits for the session task to wind down
const SESSION_SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// Owns the registry and the status feed; runs as the dispatcher task.
pub struct SessionManager {
    config: ManagerConfig,
    registry: Arc<SessionRegistry>,
    status: StatusPublisher,
    root_cancel: CancellationToken,
}

impl SessionManager {
    /// Start the dispatcher and return its public face: a cloneable
    /// command handle and the status feed receiver.
    pub fn start(config: ManagerConfig) -> (ManagerHandle, mpsc::Receiver<StatusEvent>) {
        let (command_tx, command_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (status, status_rx) = StatusPublisher::channel(CHANNEL_CAPACITY);
        let registry = Arc::new(SessionRegistry::new());
        let root_cancel = CancellationToken::new();

        let manager = SessionManager {
            config,
            registry: Arc::clone(&registry),
            status,
            root_cancel: root_cancel.clone(),
        };
        tokio::spawn(manager.dispatch_loop(command_rx));

        (
            ManagerHandle::new(command_tx, registry, root_cancel),
            status_rx,
        )
    }

    async fn dispatch_loop(self, mut commands: mpsc::Receiver<SessionCommand>) {
        info!("Session dispatcher started");

        loop {
            tokio::select! {
                _ = self.root_cancel.cancelled() => {
                    debug!("Dispatcher observed shutdown");
                    break;
                }
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!("Command queue closed");
                        break;
                    }
                },
            }
        }

        // Sessions still registered stop with the dispatcher.
        for handle in self.registry.drain() {
            handle.close();
        }
        info!("Session dispatcher stopped");
    }

    async fn handle_command(&self, mut cmd: SessionCommand) {
        debug!(
            "Received command: {} for instance '{}'",
            cmd.action, cmd.instance_name
        );

        let reply = cmd.reply.take();
        let result = match cmd.action {
            CommandAction::Connect => self.add_session(&cmd).await,
            CommandAction::Disconnect => self.remove_session(&cmd).await,
        };

        if let Err(e) = &result {
            warn!(
                "Command {} for instance '{}' failed: {}",
                cmd.action, cmd.instance_name, e
            );
        }
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    /// Build and start one relay session, registering it under the derived
    /// session name before the caller sees success.
    async fn add_session(&self, cmd: &SessionCommand) -> ManagerResult<()> {
        let session_name = cmd.session_name();
        if self.registry.contains(&session_name) {
            return Err(ManagerError::AlreadyExists(session_name));
        }

        let endpoint = match cmd.relay_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => RelayEndpoint::parse(url)
                .map_err(|e| ManagerError::TransportConfig(e.to_string()))?,
            _ => RelayEndpoint::default_for_host(&self.config.relay_host),
        };

        let mut options = TransportOptions::new(endpoint)
            .with_tls_verify(self.config.tls_verify)
            .with_multiplex(self.config.multiplex);
        if let Some(proxy_url) = &self.config.proxy_url {
            options = options.with_proxy_url(proxy_url.clone());
        }

        let connector = TunnelConnector::new(options)
            .map_err(|e| ManagerError::TransportConfig(e.to_string()))?;
        let relay = connector.endpoint().to_string();

        let mut session_config = SessionConfig::new(
            session_name.clone(),
            cmd.instance_name.clone(),
            cmd.secret_key.clone(),
            cmd.local_port,
        )
        .with_bind_addr(self.config.bind_addr.clone());
        if let Some(token) = &self.config.auth_token {
            session_config = session_config.with_auth_token(token.clone());
        }

        let session = RelaySession::new(session_config, connector)
            .map_err(|e| ManagerError::RelaySession(e.to_string()))?;
        let local_addr = session.local_addr();

        let cancel = self.root_cancel.child_token();
        let task = {
            let cancel = cancel.clone();
            let status = self.status.clone();
            let name = session_name.clone();
            let instance_id = cmd.instance_id;
            let instance_name = cmd.instance_name.clone();
            let local_port = cmd.local_port;
            tokio::spawn(async move {
                if let Err(e) = session.run(cancel).await {
                    error!("Session '{}' failed: {}", name, e);
                    status
                        .publish(StatusEvent::error(
                            instance_id,
                            instance_name,
                            local_port,
                            e.to_string(),
                        ))
                        .await;
                }
            })
        };
        self.registry
            .insert(SessionHandle::new(session_name.clone(), cancel, task));

        info!("Added session: {}", session_name);
        info!("  - Relay: {}", relay);
        info!("  - Local Address: {}", local_addr);
        info!("  - Service Name: {}", cmd.instance_name);
        info!("  - Secret Key: {}", mask(&cmd.secret_key));
        if let Some(token) = &self.config.auth_token {
            info!("  - Token: {}", mask(token));
        }

        // Optimistic: local orchestration succeeded; the relay handshake
        // happens per connection on the session task.
        self.status
            .publish(StatusEvent::connected(
                cmd.instance_id,
                cmd.instance_name.clone(),
                cmd.local_port,
            ))
            .await;

        Ok(())
    }

    async fn remove_session(&self, cmd: &SessionCommand) -> ManagerResult<()> {
        let session_name = cmd.session_name();
        let handle = self
            .registry
            .remove(&session_name)
            .ok_or_else(|| ManagerError::NotFound(session_name.clone()))?;

        handle.shutdown(SESSION_SHUTDOWN_WAIT).await;
        info!("Removed session: {}", session_name);

        self.status
            .publish(StatusEvent::disconnected(
                cmd.instance_id,
                cmd.instance_name.clone(),
            ))
            .await;

        Ok(())
    }
}

/// First characters of a secret for log output.
fn mask(secret: &str) -> String {
    let head: String = secret.chars().take(10).collect();
    format!("{}...", head)
}
