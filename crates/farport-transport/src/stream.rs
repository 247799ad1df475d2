//! Relay stream abstraction
//!
//! A `RelayStream` is one logical byte stream to the relay, with a small
//! control-message layer used for the bind handshake before payload bytes
//! flow. Implementations are the direct per-connection stream in this module
//! and the multiplexed stream in `mux`.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::trace;

use farport_proto::{codec, ControlMessage};

use crate::error::{TransportError, TransportResult};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One logical byte stream to the relay.
///
/// `send_message`/`recv_message` carry the bind handshake and must complete
/// before any payload bytes are exchanged; afterwards the stream is a plain
/// byte pipe via `send_bytes`/`recv_bytes`. An empty result from
/// `recv_bytes` signals end of stream.
#[async_trait]
pub trait RelayStream: Send {
    async fn send_message(&mut self, message: &ControlMessage) -> TransportResult<()>;
    async fn recv_message(&mut self) -> TransportResult<Option<ControlMessage>>;
    async fn send_bytes(&mut self, data: &[u8]) -> TransportResult<()>;
    async fn recv_bytes(&mut self, max_size: usize) -> TransportResult<Bytes>;
    async fn finish(&mut self) -> TransportResult<()>;
    fn stream_id(&self) -> u64;
    fn is_closed(&self) -> bool;
}

/// Physical connection to the relay, plain or TLS-wrapped
pub(crate) enum PhysicalStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for PhysicalStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PhysicalStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            PhysicalStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PhysicalStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            PhysicalStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            PhysicalStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PhysicalStream::Plain(s) => Pin::new(s).poll_flush(cx),
            PhysicalStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            PhysicalStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            PhysicalStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

pub(crate) enum DirectInner {
    Raw(PhysicalStream),
    Ws(Box<WsStream>),
}

/// Stream backed by its own physical connection (no multiplexing)
pub struct DirectStream {
    inner: DirectInner,
    closed: bool,
    /// Chunks received but not yet handed out (WebSocket messages can exceed
    /// the caller's max_size)
    data_queue: VecDeque<Bytes>,
}

impl DirectStream {
    pub(crate) fn new(inner: DirectInner) -> Self {
        Self {
            inner,
            closed: false,
            data_queue: VecDeque::new(),
        }
    }

    fn pop_queued(&mut self, max_size: usize) -> Option<Bytes> {
        let data = self.data_queue.pop_front()?;
        if data.len() <= max_size {
            return Some(data);
        }
        let (first, rest) = data.split_at(max_size);
        self.data_queue.push_front(Bytes::copy_from_slice(rest));
        Some(Bytes::copy_from_slice(first))
    }

    /// Wait for the next binary WebSocket message; None means the peer went
    /// away.
    async fn next_ws_binary(ws: &mut WsStream) -> TransportResult<Option<Vec<u8>>> {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    // Pong replies are handled by tungstenite
                    trace!("WebSocket ping/pong");
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {
                    // Text or other message types - ignore
                }
                Some(Err(e)) => {
                    return Err(TransportError::ConnectionError(format!(
                        "WebSocket read error: {}",
                        e
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl RelayStream for DirectStream {
    async fn send_message(&mut self, message: &ControlMessage) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::StreamClosed);
        }

        match &mut self.inner {
            DirectInner::Raw(stream) => codec::write_message(stream, message).await?,
            DirectInner::Ws(ws) => {
                let encoded = codec::encode_message(message)?;
                ws.send(Message::Binary(encoded.to_vec())).await.map_err(|e| {
                    TransportError::ConnectionError(format!("WebSocket send failed: {}", e))
                })?;
            }
        }

        trace!("Sent control message: {:?}", message);
        Ok(())
    }

    async fn recv_message(&mut self) -> TransportResult<Option<ControlMessage>> {
        if self.closed {
            return Ok(None);
        }

        match &mut self.inner {
            DirectInner::Raw(stream) => match codec::read_message(stream).await {
                Ok(msg) => Ok(Some(msg)),
                Err(codec::CodecError::Io(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.closed = true;
                    Ok(None)
                }
                Err(e) => Err(e.into()),
            },
            DirectInner::Ws(ws) => match Self::next_ws_binary(ws).await? {
                Some(data) => Ok(Some(codec::decode_message(&data)?)),
                None => {
                    self.closed = true;
                    Ok(None)
                }
            },
        }
    }

    async fn send_bytes(&mut self, data: &[u8]) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::StreamClosed);
        }

        match &mut self.inner {
            DirectInner::Raw(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
            DirectInner::Ws(ws) => {
                ws.send(Message::Binary(data.to_vec())).await.map_err(|e| {
                    TransportError::ConnectionError(format!("WebSocket send failed: {}", e))
                })?;
            }
        }
        Ok(())
    }

    async fn recv_bytes(&mut self, max_size: usize) -> TransportResult<Bytes> {
        if let Some(data) = self.pop_queued(max_size) {
            return Ok(data);
        }
        if self.closed {
            return Ok(Bytes::new());
        }

        match &mut self.inner {
            DirectInner::Raw(stream) => {
                let mut buf = vec![0u8; max_size.min(64 * 1024)];
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    self.closed = true;
                    return Ok(Bytes::new());
                }
                buf.truncate(n);
                Ok(Bytes::from(buf))
            }
            DirectInner::Ws(ws) => match Self::next_ws_binary(ws).await? {
                Some(data) => {
                    if data.is_empty() {
                        return Ok(Bytes::new());
                    }
                    self.data_queue.push_back(Bytes::from(data));
                    Ok(self.pop_queued(max_size).unwrap_or_default())
                }
                None => {
                    self.closed = true;
                    Ok(Bytes::new())
                }
            },
        }
    }

    async fn finish(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match &mut self.inner {
            DirectInner::Raw(stream) => {
                let _ = stream.shutdown().await;
            }
            DirectInner::Ws(ws) => {
                let _ = ws.as_mut().close(None).await;
            }
        }
        Ok(())
    }

    fn stream_id(&self) -> u64 {
        0
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
