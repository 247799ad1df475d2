//! Stream multiplexing over one physical relay connection
//!
//! When multiplexing is enabled the connector dials once and every session
//! stream becomes a logical stream carried in frames. The writer task owns
//! the physical sink; the reader task routes incoming frames to per-stream
//! channels. Clients allocate odd stream IDs; stream 0 carries keep-alive
//! probes.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use farport_proto::{codec, ControlMessage, Frame, FrameFlags, FrameType, StreamId};

use crate::error::{TransportError, TransportResult};
use crate::stream::{DirectInner, PhysicalStream, RelayStream, WsStream};

/// Frame channel depth between stream handles and the writer task
const FRAME_CHANNEL_CAPACITY: usize = 256;

/// Per-stream inbound channel depth
const STREAM_CHANNEL_CAPACITY: usize = 256;

/// Multiplexing session over one physical connection
pub struct MuxSession {
    session_id: String,
    frame_tx: mpsc::Sender<Frame>,
    streams: Arc<RwLock<HashMap<StreamId, mpsc::Sender<Bytes>>>>,
    next_stream_id: AtomicU32,
    closed: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("session_id", &self.session_id)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl MuxSession {
    /// Start a mux session over an established physical connection.
    pub(crate) fn new(conn: DirectInner, keep_alive_interval: Duration) -> Self {
        let session_id = format!("mux-{}", uuid::Uuid::new_v4());

        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(FRAME_CHANNEL_CAPACITY);
        let streams: Arc<RwLock<HashMap<StreamId, mpsc::Sender<Bytes>>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let (sink, source) = match conn {
            DirectInner::Ws(ws) => {
                let (sink, source) = (*ws).split();
                (FrameSink::Ws(sink), FrameSource::Ws(source))
            }
            DirectInner::Raw(phys) => {
                let (read, write) = tokio::io::split(phys);
                (FrameSink::Raw(write), FrameSource::Raw(read))
            }
        };

        {
            let closed = closed.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move {
                Self::writer_task(sink, frame_rx, closed, session_id).await;
            });
        }

        {
            let streams = streams.clone();
            let frame_tx = frame_tx.clone();
            let closed = closed.clone();
            let shutdown = shutdown.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move {
                Self::reader_task(source, streams, frame_tx, closed, shutdown, session_id).await;
            });
        }

        if !keep_alive_interval.is_zero() {
            let frame_tx = frame_tx.clone();
            let closed = closed.clone();
            let shutdown = shutdown.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move {
                Self::keep_alive_task(frame_tx, keep_alive_interval, closed, shutdown, session_id)
                    .await;
            });
        }

        Self {
            session_id,
            frame_tx,
            streams,
            // Client-initiated streams use odd IDs
            next_stream_id: AtomicU32::new(1),
            closed,
            shutdown,
        }
    }

    /// Open a new logical stream.
    pub async fn open_stream(&self) -> TransportResult<MuxStream> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let stream_id = self.next_stream_id.fetch_add(2, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        self.streams.write().await.insert(stream_id, tx);

        // Announce the stream so the relay can register it before data flows
        if self
            .frame_tx
            .send(Frame::control(stream_id, Bytes::new()))
            .await
            .is_err()
        {
            self.streams.write().await.remove(&stream_id);
            return Err(TransportError::ConnectionClosed);
        }

        debug!("[{}] Opened stream {}", self.session_id, stream_id);

        Ok(MuxStream::new(stream_id, rx, self.frame_tx.clone()))
    }

    /// Mark the session closed. Idempotent; in-flight streams drain and the
    /// background tasks wind down as their channels close.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("[{}] Mux session closed", self.session_id);
            self.shutdown.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn writer_task(
        mut sink: FrameSink,
        mut rx: mpsc::Receiver<Frame>,
        closed: Arc<AtomicBool>,
        session_id: String,
    ) {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send_frame(&frame).await {
                error!("[{}] Mux send error: {}", session_id, e);
                break;
            }
        }

        debug!("[{}] Mux writer task ended", session_id);
        closed.store(true, Ordering::SeqCst);
        sink.close().await;
    }

    async fn reader_task(
        mut source: FrameSource,
        streams: Arc<RwLock<HashMap<StreamId, mpsc::Sender<Bytes>>>>,
        frame_tx: mpsc::Sender<Frame>,
        closed: Arc<AtomicBool>,
        shutdown: CancellationToken,
        session_id: String,
    ) {
        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = source.next_frame() => frame,
            };

            match frame {
                Ok(Some(frame)) => {
                    Self::handle_frame(frame, &streams, &frame_tx, &session_id).await;
                }
                Ok(None) => {
                    debug!("[{}] Mux connection closed by peer", session_id);
                    break;
                }
                Err(e) => {
                    error!("[{}] Mux read error: {}", session_id, e);
                    break;
                }
            }
        }

        debug!("[{}] Mux reader task ended", session_id);
        closed.store(true, Ordering::SeqCst);

        // Close all streams
        let streams = streams.read().await;
        for tx in streams.values() {
            let _ = tx.send(Bytes::new()).await;
        }
    }

    async fn handle_frame(
        frame: Frame,
        streams: &Arc<RwLock<HashMap<StreamId, mpsc::Sender<Bytes>>>>,
        frame_tx: &mpsc::Sender<Frame>,
        session_id: &str,
    ) {
        trace!(
            "[{}] Received frame: stream={}, type={:?}, len={}",
            session_id,
            frame.stream_id,
            frame.frame_type,
            frame.payload.len()
        );

        match frame.frame_type {
            FrameType::Data => {
                let streams_read = streams.read().await;
                match streams_read.get(&frame.stream_id) {
                    Some(tx) => {
                        if tx.send(frame.payload).await.is_err() {
                            let stream_id = frame.stream_id;
                            drop(streams_read);
                            warn!("[{}] Stream {} receiver dropped", session_id, stream_id);
                            streams.write().await.remove(&stream_id);
                            let reset =
                                Frame::close(stream_id).with_flags(FrameFlags::new().with_rst());
                            let _ = frame_tx.send(reset).await;
                        }
                    }
                    None => {
                        drop(streams_read);
                        warn!(
                            "[{}] Data for unknown stream {}",
                            session_id, frame.stream_id
                        );
                        let reset = Frame::close(frame.stream_id)
                            .with_flags(FrameFlags::new().with_rst());
                        let _ = frame_tx.send(reset).await;
                    }
                }
            }
            FrameType::Close => {
                if let Some(tx) = streams.write().await.remove(&frame.stream_id) {
                    // Empty bytes signal stream close to the handle
                    let _ = tx.send(Bytes::new()).await;
                }
            }
            FrameType::Ping => {
                if frame.flags.has_ack() {
                    trace!("[{}] Keep-alive ack", session_id);
                } else {
                    let ack = Frame::new(frame.stream_id, FrameType::Ping, frame.payload)
                        .with_flags(FrameFlags::new().with_ack());
                    let _ = frame_tx.send(ack).await;
                }
            }
            FrameType::Control => {
                // The relay never announces streams toward the client
                trace!(
                    "[{}] Ignoring control frame on stream {}",
                    session_id,
                    frame.stream_id
                );
            }
        }
    }

    async fn keep_alive_task(
        frame_tx: mpsc::Sender<Frame>,
        interval: Duration,
        closed: Arc<AtomicBool>,
        shutdown: CancellationToken,
        session_id: String,
    ) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; a ping straight after connect is
        // pointless
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if closed.load(Ordering::SeqCst) {
                        break;
                    }
                    let timestamp = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_millis() as u64;
                    if frame_tx.send(Frame::ping(timestamp)).await.is_err() {
                        break;
                    }
                    trace!("[{}] Keep-alive ping sent", session_id);
                }
            }
        }

        debug!("[{}] Keep-alive task ended", session_id);
    }
}

/// Writing half of the physical connection
enum FrameSink {
    Ws(SplitSink<WsStream, Message>),
    Raw(WriteHalf<PhysicalStream>),
}

impl FrameSink {
    async fn send_frame(&mut self, frame: &Frame) -> TransportResult<()> {
        let encoded = frame.encode()?;
        match self {
            FrameSink::Ws(sink) => sink.send(Message::Binary(encoded.to_vec())).await.map_err(
                |e| TransportError::ConnectionError(format!("WebSocket send failed: {}", e)),
            ),
            FrameSink::Raw(write) => {
                write.write_all(&encoded).await?;
                write.flush().await?;
                Ok(())
            }
        }
    }

    async fn close(&mut self) {
        match self {
            FrameSink::Ws(sink) => {
                let _ = sink.close().await;
            }
            FrameSink::Raw(write) => {
                let _ = write.shutdown().await;
            }
        }
    }
}

/// Reading half of the physical connection
enum FrameSource {
    Ws(SplitStream<WsStream>),
    Raw(ReadHalf<PhysicalStream>),
}

impl FrameSource {
    /// Next frame off the wire; None when the peer closed the connection.
    async fn next_frame(&mut self) -> TransportResult<Option<Frame>> {
        match self {
            FrameSource::Ws(source) => loop {
                match source.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        return Frame::decode(Bytes::from(data)).map(Some).map_err(Into::into)
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
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
            },
            FrameSource::Raw(read) => {
                let mut header = [0u8; Frame::HEADER_SIZE];
                match read.read_exact(&mut header).await {
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                    Err(e) => return Err(e.into()),
                }

                let payload_len =
                    u32::from_be_bytes([header[6], header[7], header[8], header[9]]) as usize;
                if payload_len > farport_proto::MAX_FRAME_SIZE as usize {
                    return Err(TransportError::ProtocolError(format!(
                        "Frame too large: {} bytes",
                        payload_len
                    )));
                }

                let mut buf = BytesMut::with_capacity(Frame::HEADER_SIZE + payload_len);
                buf.extend_from_slice(&header);
                buf.resize(Frame::HEADER_SIZE + payload_len, 0);
                read.read_exact(&mut buf[Frame::HEADER_SIZE..]).await?;

                Frame::decode(buf.freeze()).map(Some).map_err(Into::into)
            }
        }
    }
}

/// A logical stream over a mux session
pub struct MuxStream {
    stream_id: StreamId,
    /// Inbound payloads routed by the reader task
    rx: mpsc::Receiver<Bytes>,
    /// Shared sender to the writer task
    frame_tx: mpsc::Sender<Frame>,
    /// Buffer for incomplete control messages
    recv_buffer: BytesMut,
    /// Received chunks not yet handed out
    data_queue: VecDeque<Bytes>,
    closed: bool,
}

impl MuxStream {
    fn new(stream_id: StreamId, rx: mpsc::Receiver<Bytes>, frame_tx: mpsc::Sender<Frame>) -> Self {
        Self {
            stream_id,
            rx,
            frame_tx,
            recv_buffer: BytesMut::with_capacity(8192),
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
}

#[async_trait]
impl RelayStream for MuxStream {
    async fn send_message(&mut self, message: &ControlMessage) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::StreamClosed);
        }

        let framed = codec::encode_framed(message)?;
        self.send_bytes(&framed).await?;

        trace!("Sent control message on stream {}: {:?}", self.stream_id, message);
        Ok(())
    }

    async fn recv_message(&mut self) -> TransportResult<Option<ControlMessage>> {
        if self.closed && self.recv_buffer.is_empty() && self.data_queue.is_empty() {
            return Ok(None);
        }

        loop {
            if let Some(msg) = codec::try_decode_framed(&mut self.recv_buffer)? {
                trace!("Received control message on stream {}: {:?}", self.stream_id, msg);
                return Ok(Some(msg));
            }

            if let Some(data) = self.data_queue.pop_front() {
                self.recv_buffer.extend_from_slice(&data);
                continue;
            }

            match self.rx.recv().await {
                Some(data) if !data.is_empty() => {
                    self.recv_buffer.extend_from_slice(&data);
                }
                _ => {
                    // Empty bytes or closed channel both mean stream end
                    self.closed = true;
                    if self.recv_buffer.is_empty() {
                        return Ok(None);
                    }
                    return Err(TransportError::ProtocolError(
                        "Stream closed with incomplete message".to_string(),
                    ));
                }
            }
        }
    }

    async fn send_bytes(&mut self, data: &[u8]) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::StreamClosed);
        }

        for chunk in data.chunks(farport_proto::MAX_FRAME_SIZE as usize) {
            let frame = Frame::data(self.stream_id, Bytes::copy_from_slice(chunk));
            self.frame_tx.send(frame).await.map_err(|_| {
                TransportError::ConnectionError("Mux connection closed".to_string())
            })?;
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

        match self.rx.recv().await {
            Some(data) => {
                if data.is_empty() {
                    self.closed = true;
                    return Ok(Bytes::new());
                }
                self.data_queue.push_back(data);
                Ok(self.pop_queued(max_size).unwrap_or_default())
            }
            None => {
                self.closed = true;
                Ok(Bytes::new())
            }
        }
    }

    async fn finish(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let frame = Frame::close(self.stream_id).with_flags(FrameFlags::new().with_fin());
        // Ignore error if connection is already closed
        let _ = self.frame_tx.send(frame).await;
        Ok(())
    }

    fn stream_id(&self) -> u64 {
        self.stream_id as u64
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
