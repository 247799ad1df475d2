//! Relay session lifecycle
//!
//! One session per far service: bind a local listener, accept local
//! connections, open a relay stream per connection, authenticate with the
//! service's secret key, then pump bytes both ways until either side closes
//! or the session is cancelled.

use bytes::Bytes;
use farport_proto::ControlMessage;
use farport_transport::{RelayStream, TunnelConnector};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};

/// Deadline for the relay's answer to a bind request
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Read buffer size on the local side of the pump
const PUMP_BUFFER_SIZE: usize = 8192;

/// An active relay session
///
/// Built with a bound local listener, driven by [`run`](Self::run) until the
/// supplied cancellation token fires. Closing is the owner's job: cancel the
/// token and the session tears itself down.
pub struct RelaySession {
    config: SessionConfig,
    connector: Arc<TunnelConnector>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySession")
            .field("session_name", &self.config.session_name)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl RelaySession {
    /// Validate the configuration and bind the local listener.
    ///
    /// Dialing the relay happens later in `run`; a session that fails here
    /// never existed as far as the caller is concerned.
    pub fn new(config: SessionConfig, connector: TunnelConnector) -> SessionResult<Self> {
        if config.service_name.is_empty() {
            return Err(SessionError::InvalidConfig(
                "service name is empty".to_string(),
            ));
        }
        if config.secret_key.is_empty() {
            return Err(SessionError::InvalidConfig(
                "secret key is empty".to_string(),
            ));
        }

        // Bind synchronously using std so failures surface to the caller
        let bind_addr = format!("{}:{}", config.bind_addr, config.bind_port);
        let std_listener =
            std::net::TcpListener::bind(&bind_addr).map_err(|e| SessionError::BindError {
                address: config.bind_addr.clone(),
                port: config.bind_port,
                reason: e.to_string(),
            })?;

        std_listener.set_nonblocking(true).map_err(|e| {
            SessionError::InvalidConfig(format!("Failed to set nonblocking: {}", e))
        })?;

        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;

        info!(
            "[{}] Session listening on {} for service {}",
            config.session_name, local_addr, config.service_name
        );

        Ok(Self {
            config,
            connector: Arc::new(connector),
            listener,
            local_addr,
        })
    }

    /// Address the local listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session_name(&self) -> &str {
        &self.config.session_name
    }

    /// Serve local connections until the token is cancelled.
    ///
    /// With multiplexing enabled the relay connection is established up
    /// front; every accepted local connection then gets its own relay stream
    /// and its own task.
    pub async fn run(self, cancel: CancellationToken) -> SessionResult<()> {
        let name = self.config.session_name.clone();

        self.connector.open().await?;

        let mut conn_counter: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("[{}] Session cancelled", name);
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((local, peer_addr)) => {
                            conn_counter += 1;
                            let conn_id = conn_counter;
                            debug!(
                                "[{}] Accepted local connection {} from {}",
                                name, conn_id, peer_addr
                            );

                            let connector = self.connector.clone();
                            let config = self.config.clone();
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    handle_connection(local, connector, &config, conn_id, cancel)
                                        .await
                                {
                                    warn!(
                                        "[{}] Connection {} failed: {}",
                                        config.session_name, conn_id, e
                                    );
                                }
                            });
                        }
                        Err(e) => {
                            error!("[{}] Accept failed: {}", name, e);
                        }
                    }
                }
            }
        }

        self.connector.close().await;
        info!("[{}] Session stopped", name);
        Ok(())
    }
}

/// Serve one local connection: relay stream, bind handshake, byte pump.
async fn handle_connection(
    local: TcpStream,
    connector: Arc<TunnelConnector>,
    config: &SessionConfig,
    conn_id: u64,
    cancel: CancellationToken,
) -> SessionResult<()> {
    let mut relay = connector.connect().await?;

    let bind = ControlMessage::bind(
        &config.service_name,
        &config.secret_key,
        config.auth_token.as_deref(),
    );
    relay.send_message(&bind).await?;

    let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, relay.recv_message())
        .await
        .map_err(|_| {
            SessionError::HandshakeFailed("timed out waiting for bind response".to_string())
        })??;

    match reply {
        Some(ControlMessage::Bound { service_name }) => {
            debug!(
                "[{}] Connection {} bound to service {}",
                config.session_name, conn_id, service_name
            );
        }
        Some(ControlMessage::BindRejected { reason }) => {
            return Err(SessionError::BindRejected(reason));
        }
        Some(other) => {
            return Err(SessionError::HandshakeFailed(format!(
                "unexpected bind response: {:?}",
                other
            )));
        }
        None => {
            return Err(SessionError::HandshakeFailed(
                "relay closed the stream during handshake".to_string(),
            ));
        }
    }

    pump(local, relay, &config.session_name, conn_id, cancel).await
}

enum PumpEvent {
    FromLocal(usize),
    FromRelay(Bytes),
    Cancelled,
}

/// Copy bytes both ways until EOF on either side or cancellation.
async fn pump(
    mut local: TcpStream,
    mut relay: Box<dyn RelayStream>,
    session_name: &str,
    conn_id: u64,
    cancel: CancellationToken,
) -> SessionResult<()> {
    let mut local_buf = vec![0u8; PUMP_BUFFER_SIZE];

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => PumpEvent::Cancelled,
            read = local.read(&mut local_buf) => PumpEvent::FromLocal(read?),
            data = relay.recv_bytes(PUMP_BUFFER_SIZE) => PumpEvent::FromRelay(data?),
        };

        match event {
            PumpEvent::FromLocal(0) => {
                debug!("[{}] Connection {} closed locally", session_name, conn_id);
                relay.finish().await?;
                break;
            }
            PumpEvent::FromLocal(n) => {
                relay.send_bytes(&local_buf[..n]).await?;
            }
            PumpEvent::FromRelay(data) if data.is_empty() => {
                debug!("[{}] Connection {} closed by relay", session_name, conn_id);
                break;
            }
            PumpEvent::FromRelay(data) => {
                local.write_all(&data).await?;
            }
            PumpEvent::Cancelled => {
                debug!("[{}] Connection {} cancelled", session_name, conn_id);
                let _ = relay.finish().await;
                break;
            }
        }
    }

    Ok(())
}
