//! Relay Protocol Definitions
//!
//! This crate defines the control messages, wire codec, and multiplexing
//! primitives shared by the farport transport and session layers.

pub mod codec;
pub mod messages;
pub mod mux;

pub use codec::{
    decode_message, encode_framed, encode_message, read_message, try_decode_framed, write_message,
    CodecError,
};
pub use messages::ControlMessage;
pub use mux::{Frame, FrameFlags, FrameType, MuxError, StreamId};

/// Protocol version carried in every bind request
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum mux frame payload (6MB, sized for bulk transfer)
pub const MAX_FRAME_SIZE: u32 = 6 * 1024 * 1024;

/// Stream 0 is reserved for connection-level control frames
pub const CONTROL_STREAM_ID: u32 = 0;

/// Relay port used when no server URL is configured
pub const DEFAULT_RELAY_PORT: u16 = 7000;

/// WebSocket path reserved by the relay for its multiplexed framing
pub const DEFAULT_RELAY_PATH: &str = "/~!tunnel";
