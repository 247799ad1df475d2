//! End-to-end session tests against an in-process relay
//!
//! The relay here accepts the session's connections, answers bind requests,
//! and echoes payload bytes, which is enough to exercise the full path:
//! local client -> session listener -> relay stream -> relay and back.

use bytes::BytesMut;
use farport_proto::{codec, ControlMessage, Frame, FrameFlags, FrameType};
use farport_session::{RelaySession, SessionConfig};
use farport_transport::{RelayEndpoint, RelayProtocol, TransportOptions, TunnelConnector};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

fn plain_options(port: u16) -> TransportOptions {
    TransportOptions::new(RelayEndpoint {
        host: "127.0.0.1".to_string(),
        port,
        path: farport_proto::DEFAULT_RELAY_PATH.to_string(),
        protocol: RelayProtocol::Plain,
    })
}

/// Relay for direct connections: one bind handshake, then byte echo.
async fn run_echo_relay(listener: TcpListener, expect_service: &str, expect_secret: &str) {
    let (mut conn, _) = listener.accept().await.unwrap();

    match codec::read_message(&mut conn).await.unwrap() {
        ControlMessage::Bind {
            service_name,
            secret_key,
            auth_token,
            ..
        } => {
            assert_eq!(service_name, expect_service);
            assert_eq!(secret_key, expect_secret);
            assert_eq!(auth_token.as_deref(), Some("relay-token"));
        }
        other => panic!("expected bind request, got {:?}", other),
    }

    codec::write_message(
        &mut conn,
        &ControlMessage::Bound {
            service_name: expect_service.to_string(),
        },
    )
    .await
    .unwrap();

    let mut buf = [0u8; 4096];
    loop {
        let n = conn.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        conn.write_all(&buf[..n]).await.unwrap();
    }
}

async fn read_frame(conn: &mut TcpStream) -> Option<Frame> {
    let mut header = [0u8; Frame::HEADER_SIZE];
    match conn.read_exact(&mut header).await {
        Ok(_) => {}
        Err(_) => return None,
    }
    let len = u32::from_be_bytes([header[6], header[7], header[8], header[9]]) as usize;
    let mut buf = BytesMut::with_capacity(Frame::HEADER_SIZE + len);
    buf.extend_from_slice(&header);
    buf.resize(Frame::HEADER_SIZE + len, 0);
    conn.read_exact(&mut buf[Frame::HEADER_SIZE..]).await.ok()?;
    Some(Frame::decode(buf.freeze()).unwrap())
}

async fn write_frame(conn: &mut TcpStream, frame: Frame) {
    conn.write_all(&frame.encode().unwrap()).await.unwrap();
}

/// Relay for multiplexed connections: binds streams, then echoes their data
/// frames.
async fn run_mux_echo_relay(listener: TcpListener) {
    let (mut conn, _) = listener.accept().await.unwrap();

    let mut pending: HashMap<u32, BytesMut> = HashMap::new();
    let mut bound: HashSet<u32> = HashSet::new();

    while let Some(frame) = read_frame(&mut conn).await {
        match frame.frame_type {
            FrameType::Data if bound.contains(&frame.stream_id) => {
                write_frame(&mut conn, Frame::data(frame.stream_id, frame.payload)).await;
            }
            FrameType::Data => {
                let buf = pending.entry(frame.stream_id).or_default();
                buf.extend_from_slice(&frame.payload);
                if let Some(ControlMessage::Bind { service_name, .. }) =
                    codec::try_decode_framed(buf).unwrap()
                {
                    let ack = codec::encode_framed(&ControlMessage::Bound { service_name })
                        .unwrap();
                    write_frame(&mut conn, Frame::data(frame.stream_id, ack)).await;
                    bound.insert(frame.stream_id);
                }
            }
            FrameType::Ping if !frame.flags.has_ack() => {
                let ack = Frame::new(frame.stream_id, FrameType::Ping, frame.payload)
                    .with_flags(FrameFlags::new().with_ack());
                write_frame(&mut conn, ack).await;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_session_pumps_bytes_between_local_and_relay() {
    let relay_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_port = relay_listener.local_addr().unwrap().port();
    tokio::spawn(async move { run_echo_relay(relay_listener, "db", "s3cret").await });

    let connector =
        TunnelConnector::new(plain_options(relay_port).with_multiplex(false)).unwrap();
    let config =
        SessionConfig::new("db-visitor", "db", "s3cret", 0).with_auth_token("relay-token");
    let session = RelaySession::new(config, connector).unwrap();
    let local_addr = session.local_addr();

    let cancel = CancellationToken::new();
    let run_task = tokio::spawn(session.run(cancel.clone()));

    let mut client = TcpStream::connect(local_addr).await.unwrap();
    client.write_all(b"hello far side").await.unwrap();

    let mut buf = [0u8; 14];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .expect("echo should arrive before the deadline")
        .unwrap();
    assert_eq!(&buf, b"hello far side");

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), run_task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_session_over_multiplexed_connection() {
    let relay_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_port = relay_listener.local_addr().unwrap().port();
    tokio::spawn(async move { run_mux_echo_relay(relay_listener).await });

    let connector = TunnelConnector::new(plain_options(relay_port)).unwrap();
    let config = SessionConfig::new("web-visitor", "web", "k3y", 0);
    let session = RelaySession::new(config, connector).unwrap();
    let local_addr = session.local_addr();

    let cancel = CancellationToken::new();
    let run_task = tokio::spawn(session.run(cancel.clone()));

    // Two concurrent local clients share one physical relay connection
    let mut first = TcpStream::connect(local_addr).await.unwrap();
    let mut second = TcpStream::connect(local_addr).await.unwrap();

    first.write_all(b"alpha").await.unwrap();
    second.write_all(b"beta").await.unwrap();

    let mut buf = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(5), first.read_exact(&mut buf))
        .await
        .expect("first echo should arrive")
        .unwrap();
    assert_eq!(&buf, b"alpha");

    let mut buf = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), second.read_exact(&mut buf))
        .await
        .expect("second echo should arrive")
        .unwrap();
    assert_eq!(&buf, b"beta");

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), run_task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_rejected_bind_closes_local_connection() {
    let relay_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_port = relay_listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut conn, _) = relay_listener.accept().await.unwrap();
        let _ = codec::read_message(&mut conn).await.unwrap();
        codec::write_message(
            &mut conn,
            &ControlMessage::BindRejected {
                reason: "bad secret".to_string(),
            },
        )
        .await
        .unwrap();
    });

    let connector =
        TunnelConnector::new(plain_options(relay_port).with_multiplex(false)).unwrap();
    let config = SessionConfig::new("db-visitor", "db", "wrong", 0);
    let session = RelaySession::new(config, connector).unwrap();
    let local_addr = session.local_addr();

    let cancel = CancellationToken::new();
    let run_task = tokio::spawn(session.run(cancel.clone()));

    // The local connection is dropped without payload once the relay rejects
    let mut client = TcpStream::connect(local_addr).await.unwrap();
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("connection should close before the deadline")
        .unwrap();
    assert_eq!(n, 0);

    // The session itself keeps serving
    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), run_task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_cancelled_session_stops_promptly() {
    let connector =
        TunnelConnector::new(plain_options(port_nobody_listens_on()).with_multiplex(false))
            .unwrap();
    let config = SessionConfig::new("idle-visitor", "idle", "k", 0);
    let session = RelaySession::new(config, connector).unwrap();

    let cancel = CancellationToken::new();
    let run_task = tokio::spawn(session.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), run_task)
        .await
        .expect("run should stop promptly after cancel")
        .unwrap();
    assert!(result.is_ok());
}

fn port_nobody_listens_on() -> u16 {
    // Bind and immediately drop to get a port that is very likely free
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
