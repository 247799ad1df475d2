//! Multiplexing frame layout
//!
//! One physical relay connection can carry many logical streams. Each frame
//! is a 10-byte header followed by the payload; stream 0 is reserved for
//! connection-level control traffic.
//!
//! Wire header, big-endian: stream id (4 bytes), frame type (1), flags (1),
//! payload length (4).

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Identifier of one logical stream within a relay connection
pub type StreamId = u32;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Stream lifecycle control (open announcement on the frame's stream)
    Control = 0,
    /// Payload bytes for a logical stream
    Data = 1,
    /// Logical stream teardown
    Close = 2,
    /// Connection keep-alive probe
    Ping = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(raw: u8) -> Result<Self, MuxError> {
        Ok(match raw {
            0 => FrameType::Control,
            1 => FrameType::Data,
            2 => FrameType::Close,
            3 => FrameType::Ping,
            other => return Err(MuxError::UnknownFrameType(other)),
        })
    }
}

/// Bit flags carried in the frame header.
///
/// FIN marks the sender's last frame on the stream, ACK marks a reply to a
/// probe, RST tells the peer to drop the stream without draining it.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    pub const FIN: u8 = 1 << 0;
    pub const ACK: u8 = 1 << 1;
    pub const RST: u8 = 1 << 2;

    pub fn new() -> Self {
        Self(0)
    }

    fn set(self, bit: u8) -> Self {
        Self(self.0 | bit)
    }

    fn test(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn with_fin(self) -> Self {
        self.set(Self::FIN)
    }

    pub fn with_ack(self) -> Self {
        self.set(Self::ACK)
    }

    pub fn with_rst(self) -> Self {
        self.set(Self::RST)
    }

    pub fn has_fin(&self) -> bool {
        self.test(Self::FIN)
    }

    pub fn has_ack(&self) -> bool {
        self.test(Self::ACK)
    }

    pub fn has_rst(&self) -> bool {
        self.test(Self::RST)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(raw: u8) -> Self {
        Self(raw)
    }
}

/// One unit of traffic on the multiplexed connection
#[derive(Debug, Clone)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    pub const HEADER_SIZE: usize = 10;

    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: FrameFlags::new(),
            payload,
        }
    }

    pub fn control(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Control, payload)
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new())
    }

    /// Keep-alive probe on the control stream, carrying a millisecond
    /// timestamp the peer echoes back.
    pub fn ping(timestamp: u64) -> Self {
        Self::new(
            crate::CONTROL_STREAM_ID,
            FrameType::Ping,
            Bytes::copy_from_slice(&timestamp.to_be_bytes()),
        )
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Encode the frame to wire bytes.
    pub fn encode(&self) -> Result<Bytes, MuxError> {
        let len = self.payload.len();
        if len > crate::MAX_FRAME_SIZE as usize {
            return Err(MuxError::PayloadTooLarge(len));
        }

        let mut wire = BytesMut::with_capacity(Self::HEADER_SIZE + len);
        wire.extend_from_slice(&self.stream_id.to_be_bytes());
        wire.extend_from_slice(&[self.frame_type as u8, self.flags.as_u8()]);
        wire.extend_from_slice(&(len as u32).to_be_bytes());
        wire.extend_from_slice(&self.payload);
        Ok(wire.freeze())
    }

    /// Decode one frame from the front of `wire`. Bytes past the declared
    /// payload length are ignored.
    pub fn decode(wire: Bytes) -> Result<Self, MuxError> {
        if wire.len() < Self::HEADER_SIZE {
            return Err(MuxError::Truncated);
        }

        let stream_id = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]);
        let frame_type = FrameType::try_from(wire[4])?;
        let flags = FrameFlags::from_u8(wire[5]);
        let declared = u32::from_be_bytes([wire[6], wire[7], wire[8], wire[9]]) as usize;

        if declared > crate::MAX_FRAME_SIZE as usize {
            return Err(MuxError::PayloadTooLarge(declared));
        }
        if wire.len() < Self::HEADER_SIZE + declared {
            return Err(MuxError::Truncated);
        }

        Ok(Self {
            stream_id,
            frame_type,
            flags,
            payload: wire.slice(Self::HEADER_SIZE..Self::HEADER_SIZE + declared),
        })
    }
}

/// Frame-level errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Unknown frame type {0}")]
    UnknownFrameType(u8),

    #[error("Payload of {0} bytes exceeds the frame cap")]
    PayloadTooLarge(usize),

    #[error("Frame shorter than its header claims")]
    Truncated,
}
