//! GoExpose tunnel protocol
//!
//! Frame types exchanged over the control tunnel, the length-delimited codec that
//! carries them, and the stream identifier allocator used to multiplex relayed
//! connections over a single tunnel.

pub mod codec;
pub mod messages;
pub mod mux;

pub use codec::{decode, encode, CodecError, FrameReader, FrameWriter};
pub use messages::*;
pub use mux::{MuxError, StreamId, StreamIdAllocator};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum encoded frame payload (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Reserved stream ID, never handed out for relayed traffic
pub const CONTROL_STREAM_ID: StreamId = 0;

/// Well-known port of the control listener
pub const DEFAULT_CONTROL_PORT: u16 = 47921;

/// First port of the relay port range
pub const DEFAULT_PROXY_PORT_BASE: u16 = 47923;

/// Number of ports in the relay port range
pub const DEFAULT_PROXY_PORT_AMOUNT: u16 = 10;
