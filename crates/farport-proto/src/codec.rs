//! Wire codec for control messages
//!
//! Messages are bincode-encoded and carried with a u32 length prefix so
//! boundaries survive on plain byte streams. Message-delimited transports
//! (one WebSocket message per control message) use the unprefixed form.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::messages::ControlMessage;

/// Upper bound for an encoded control message (messages are tiny; anything
/// larger indicates a corrupt or hostile peer)
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Failed to encode message: {0}")]
    Encode(bincode::Error),

    #[error("Failed to decode message: {0}")]
    Decode(bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode a control message to its wire bytes (no length prefix).
pub fn encode_message(msg: &ControlMessage) -> Result<Bytes, CodecError> {
    let encoded = bincode::serialize(msg).map_err(CodecError::Encode)?;
    Ok(Bytes::from(encoded))
}

/// Decode a control message from wire bytes.
pub fn decode_message(data: &[u8]) -> Result<ControlMessage, CodecError> {
    bincode::deserialize(data).map_err(CodecError::Decode)
}

/// Encode a control message with its u32 length prefix.
pub fn encode_framed(msg: &ControlMessage) -> Result<Bytes, CodecError> {
    let encoded = encode_message(msg)?;
    let mut buf = BytesMut::with_capacity(4 + encoded.len());
    buf.put_u32(encoded.len() as u32);
    buf.put(encoded);
    Ok(buf.freeze())
}

/// Try to decode one length-prefixed message from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete message;
/// consumed bytes are removed from `buf` only on success.
pub fn try_decode_framed(buf: &mut BytesMut) -> Result<Option<ControlMessage>, CodecError> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(len));
    }
    if buf.len() < 4 + len as usize {
        return Ok(None);
    }

    buf.advance(4);
    let body = buf.split_to(len as usize);
    decode_message(&body).map(Some)
}

/// Write one length-prefixed message to a raw byte stream.
pub async fn write_message<W>(writer: &mut W, msg: &ControlMessage) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let framed = encode_framed(msg)?;
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed message from a raw byte stream.
pub async fn read_message<R>(reader: &mut R) -> Result<ControlMessage, CodecError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await?;
    if len > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(len));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    decode_message(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = ControlMessage::bind("web", "sk-123", None);
        let encoded = encode_message(&msg).unwrap();
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result = decode_message(&[0xff; 3]);
        assert!(result.is_err());
    }

    #[test]
    fn test_framed_decode_waits_for_full_message() {
        let msg = ControlMessage::bind("db", "secret", Some("token"));
        let framed = encode_framed(&msg).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&framed[..framed.len() - 1]);
        assert!(try_decode_framed(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&framed[framed.len() - 1..]);
        assert_eq!(try_decode_framed(&mut buf).unwrap(), Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_framed_decode_two_messages_back_to_back() {
        let first = ControlMessage::Bound {
            service_name: "db".to_string(),
        };
        let second = ControlMessage::BindRejected {
            reason: "bad key".to_string(),
        };

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_framed(&first).unwrap());
        buf.extend_from_slice(&encode_framed(&second).unwrap());

        assert_eq!(try_decode_framed(&mut buf).unwrap(), Some(first));
        assert_eq!(try_decode_framed(&mut buf).unwrap(), Some(second));
        assert!(try_decode_framed(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_length_prefixed_stream_roundtrip() {
        let msg = ControlMessage::Bound {
            service_name: "db".to_string(),
        };

        let mut wire = Vec::new();
        write_message(&mut wire, &msg).await.unwrap();

        let mut reader = std::io::Cursor::new(wire);
        let decoded = read_message(&mut reader).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let mut wire = Vec::new();
        tokio::io::AsyncWriteExt::write_u32(&mut wire, MAX_MESSAGE_SIZE + 1)
            .await
            .unwrap();

        let mut reader = std::io::Cursor::new(wire);
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, CodecError::MessageTooLarge(_)));
    }
}
