//! Relay connector
//!
//! Dials the relay endpoint (plain TCP, ws, or wss, optionally through an
//! HTTP proxy), performs the TLS and WebSocket handshakes, and hands out
//! relay streams. With multiplexing enabled one physical connection carries
//! every stream; without it each stream is its own dial.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, info};

use crate::endpoint::{RelayEndpoint, RelayProtocol};
use crate::error::{TransportError, TransportResult};
use crate::mux::MuxSession;
use crate::proxy::ProxyConfig;
use crate::stream::{DirectInner, DirectStream, PhysicalStream, RelayStream, WsStream};
use crate::tls;

/// Default keep-alive interval on multiplexed connections
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Default timeout for one dial attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial options for relay connections
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Where to dial
    pub endpoint: RelayEndpoint,

    /// Verify the relay certificate against trusted roots. Relays commonly
    /// run on self-signed certificates, so verification is off by default.
    pub tls_verify: bool,

    /// Extra trusted CA bundle (PEM), used only when verification is on
    pub ca_cert_file: Option<PathBuf>,

    /// SNI override; defaults to the endpoint host
    pub tls_server_name: Option<String>,

    /// Outbound HTTP proxy URL (`http://[user:pass@]host:port`)
    pub proxy_url: Option<String>,

    /// Carry all streams over one multiplexed physical connection
    pub multiplex: bool,

    /// Keep-alive probe interval on multiplexed connections
    pub keep_alive_interval: Duration,

    /// Timeout for each dial attempt
    pub connect_timeout: Duration,
}

impl TransportOptions {
    pub fn new(endpoint: RelayEndpoint) -> Self {
        Self {
            endpoint,
            tls_verify: false,
            ca_cert_file: None,
            tls_server_name: None,
            proxy_url: None,
            multiplex: true,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Enable certificate verification against trusted roots
    pub fn with_tls_verify(mut self, verify: bool) -> Self {
        self.tls_verify = verify;
        self
    }

    /// Route the dial through an HTTP proxy
    pub fn with_proxy_url(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy_url = Some(proxy_url.into());
        self
    }

    pub fn with_multiplex(mut self, multiplex: bool) -> Self {
        self.multiplex = multiplex;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }
}

/// Connector for one relay endpoint
///
/// Configuration problems (bad proxy URL, TLS setup) surface from `new`;
/// dial failures surface from `open`/`connect`.
pub struct TunnelConnector {
    options: TransportOptions,
    proxy: Option<ProxyConfig>,
    tls_connector: Option<tokio_rustls::TlsConnector>,
    mux: Mutex<Option<MuxSession>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for TunnelConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConnector")
            .field("endpoint", &self.options.endpoint)
            .field("multiplex", &self.options.multiplex)
            .finish()
    }
}

impl TunnelConnector {
    pub fn new(options: TransportOptions) -> TransportResult<Self> {
        let proxy = match options.proxy_url.as_deref() {
            Some(url) => Some(ProxyConfig::parse(url)?),
            None => None,
        };

        let tls_connector = if options.endpoint.protocol.uses_tls() {
            Some(tls::build_tls_connector(
                options.tls_verify,
                options.ca_cert_file.as_deref(),
            )?)
        } else {
            None
        };

        debug!("Relay connector created for {}", options.endpoint);

        Ok(Self {
            options,
            proxy,
            tls_connector,
            mux: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &RelayEndpoint {
        &self.options.endpoint
    }

    /// Establish the physical connection up front when multiplexing.
    ///
    /// Without multiplexing this is a no-op; each stream dials on demand.
    pub async fn open(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if !self.options.multiplex {
            return Ok(());
        }

        let mut mux = self.mux.lock().await;
        if let Some(session) = mux.as_ref() {
            if !session.is_closed() {
                return Ok(());
            }
        }

        let conn = self.real_connect().await?;
        *mux = Some(MuxSession::new(conn, self.options.keep_alive_interval));
        info!(
            "Multiplexed relay connection established to {}",
            self.options.endpoint
        );
        Ok(())
    }

    /// Obtain a stream to the relay.
    ///
    /// Uses the mux session when one is active; otherwise dials a fresh
    /// physical connection.
    pub async fn connect(&self) -> TransportResult<Box<dyn RelayStream>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        {
            let mux = self.mux.lock().await;
            if let Some(session) = mux.as_ref() {
                if !session.is_closed() {
                    let stream = session.open_stream().await?;
                    return Ok(Box::new(stream));
                }
            }
        }

        let conn = self.real_connect().await?;
        Ok(Box::new(DirectStream::new(conn)))
    }

    /// Close the connector and any mux session. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut mux = self.mux.lock().await;
        if let Some(session) = mux.take() {
            session.close();
        }

        debug!("Relay connector closed for {}", self.options.endpoint);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn real_connect(&self) -> TransportResult<DirectInner> {
        let endpoint = &self.options.endpoint;
        let timeout = self.options.connect_timeout;

        debug!(
            "Connecting to relay: {}://{}{}",
            endpoint.protocol,
            endpoint.authority(),
            endpoint.path
        );

        let tcp_stream = match &self.proxy {
            Some(proxy) => {
                proxy
                    .connect(&endpoint.host, endpoint.port, timeout)
                    .await?
            }
            None => tokio::time::timeout(
                timeout,
                TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
            )
            .await
            .map_err(|_| TransportError::ConnectTimeout(timeout))?
            .map_err(|e| TransportError::ConnectionError(format!("TCP connect failed: {}", e)))?,
        };

        tcp_stream.set_nodelay(true).map_err(TransportError::IoError)?;

        match endpoint.protocol {
            RelayProtocol::Plain => Ok(DirectInner::Raw(PhysicalStream::Plain(tcp_stream))),
            RelayProtocol::Ws => {
                let ws = self.upgrade(MaybeTlsStream::Plain(tcp_stream)).await?;
                Ok(DirectInner::Ws(Box::new(ws)))
            }
            RelayProtocol::Wss => {
                let tls_connector = self.tls_connector.as_ref().ok_or_else(|| {
                    TransportError::TlsError("TLS connector not configured".to_string())
                })?;

                let dns_name =
                    tls::server_name(&endpoint.host, self.options.tls_server_name.as_deref())?;

                let tls_stream = tls_connector
                    .connect(dns_name, tcp_stream)
                    .await
                    .map_err(|e| {
                        TransportError::TlsError(format!("TLS handshake failed: {}", e))
                    })?;

                let ws = self.upgrade(MaybeTlsStream::Rustls(tls_stream)).await?;
                Ok(DirectInner::Ws(Box::new(ws)))
            }
        }
    }

    async fn upgrade(&self, stream: MaybeTlsStream<TcpStream>) -> TransportResult<WsStream> {
        let endpoint = &self.options.endpoint;
        let ws_url = format!(
            "{}://{}{}",
            endpoint.protocol.upgrade_scheme(),
            endpoint.authority(),
            endpoint.path
        );

        let (ws_stream, _response) = tokio_tungstenite::client_async(ws_url.as_str(), stream)
            .await
            .map_err(|e| {
                TransportError::ConnectionError(format!("WebSocket handshake failed: {}", e))
            })?;

        info!("WebSocket connection established to {}", ws_url);
        Ok(ws_stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use farport_proto::{Frame, FrameType};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn plain_endpoint(port: u16) -> RelayEndpoint {
        RelayEndpoint {
            host: "127.0.0.1".to_string(),
            port,
            path: farport_proto::DEFAULT_RELAY_PATH.to_string(),
            protocol: RelayProtocol::Plain,
        }
    }

    async fn read_frame_from(socket: &mut TcpStream) -> Frame {
        let mut header = [0u8; Frame::HEADER_SIZE];
        socket.read_exact(&mut header).await.unwrap();
        let len = u32::from_be_bytes([header[6], header[7], header[8], header[9]]) as usize;
        let mut buf = BytesMut::with_capacity(Frame::HEADER_SIZE + len);
        buf.extend_from_slice(&header);
        buf.resize(Frame::HEADER_SIZE + len, 0);
        socket.read_exact(&mut buf[Frame::HEADER_SIZE..]).await.unwrap();
        Frame::decode(buf.freeze()).unwrap()
    }

    #[test]
    fn test_new_rejects_bad_proxy_scheme() {
        let options =
            TransportOptions::new(plain_endpoint(7000)).with_proxy_url("socks5://proxy:1080");
        let result = TunnelConnector::new(options);
        assert!(matches!(
            result,
            Err(TransportError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_new_builds_without_tls_for_plain() {
        let options = TransportOptions::new(plain_endpoint(7000));
        let connector = TunnelConnector::new(options).unwrap();
        assert!(connector.tls_connector.is_none());
        assert!(!connector.is_closed());
    }

    #[tokio::test]
    async fn test_connect_without_multiplex_dials_per_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let options = TransportOptions::new(plain_endpoint(port)).with_multiplex(false);
        let connector = TunnelConnector::new(options).unwrap();

        let mut stream = connector.connect().await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        stream.send_bytes(b"hello relay").await.unwrap();
        let mut buf = [0u8; 11];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello relay");

        // A second stream is a second physical connection
        let _stream2 = connector.connect().await.unwrap();
        let accepted = listener.accept().await;
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn test_open_multiplexes_streams_over_one_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let options = TransportOptions::new(plain_endpoint(port))
            .with_keep_alive_interval(Duration::ZERO);
        let connector = TunnelConnector::new(options).unwrap();

        connector.open().await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let mut first = connector.connect().await.unwrap();
        let _second = connector.connect().await.unwrap();

        let announce = read_frame_from(&mut server).await;
        assert_eq!(announce.frame_type, FrameType::Control);
        assert_eq!(announce.stream_id, 1);
        let announce = read_frame_from(&mut server).await;
        assert_eq!(announce.frame_type, FrameType::Control);
        assert_eq!(announce.stream_id, 3);

        first.send_bytes(b"muxed").await.unwrap();
        let data = read_frame_from(&mut server).await;
        assert_eq!(data.frame_type, FrameType::Data);
        assert_eq!(data.stream_id, 1);
        assert_eq!(&data.payload[..], b"muxed");
    }

    #[tokio::test]
    async fn test_open_is_idempotent_while_mux_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let options = TransportOptions::new(plain_endpoint(port))
            .with_keep_alive_interval(Duration::ZERO);
        let connector = TunnelConnector::new(options).unwrap();

        connector.open().await.unwrap();
        let _first = listener.accept().await.unwrap();
        connector.open().await.unwrap();

        // No second physical connection was made
        let second = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let options = TransportOptions::new(plain_endpoint(port)).with_multiplex(false);
        let connector = TunnelConnector::new(options).unwrap();

        let result = connector.connect().await;
        assert!(matches!(result, Err(TransportError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn test_ws_upgrade_requests_custom_path() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let endpoint =
            RelayEndpoint::parse(&format!("ws://127.0.0.1:{}/custom-path", port)).unwrap();
        let options = TransportOptions::new(endpoint).with_multiplex(false);
        let connector = TunnelConnector::new(options).unwrap();

        // Capture the upgrade request, then hang up without answering it.
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            String::from_utf8(request).unwrap()
        });

        let result = connector.connect().await;
        assert!(matches!(result, Err(TransportError::ConnectionError(_))));

        let request = server.await.unwrap();
        assert!(
            request.starts_with("GET /custom-path HTTP/1.1"),
            "unexpected request line: {}",
            request.lines().next().unwrap_or("")
        );
        assert!(request.contains(&format!("Host: 127.0.0.1:{}", port)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_connect() {
        let options = TransportOptions::new(plain_endpoint(7000));
        let connector = TunnelConnector::new(options).unwrap();

        connector.close().await;
        connector.close().await;
        assert!(connector.is_closed());

        assert!(matches!(
            connector.connect().await,
            Err(TransportError::ConnectionClosed)
        ));
        assert!(matches!(
            connector.open().await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
