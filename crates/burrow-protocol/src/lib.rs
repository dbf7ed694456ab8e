//! Burrow Protocol -- wire formats for tunneling HTTP and WebSocket traffic
//! over multiplexed P2P streams.
//!
//! Two framings live here:
//! - packets: 2-byte big-endian head length + JSON head (with `bodyLength`) + body,
//!   optionally sliced into 64 KiB pieces and reassembled by [`PacketCodec`];
//! - typed chunks: a 1-byte tag (HEAD/BODY/END/ABORT) + payload, used by the
//!   request tunnel so bodies can stream without a known length.

pub mod chunk;
pub mod codec;
pub mod messages;
pub mod packet;
pub mod timing;

pub use chunk::{Chunk, ChunkType, Frame, FrameReader};
pub use codec::PacketCodec;
pub use messages::*;
pub use packet::{Head, Packet};
pub use timing::{TunnelTiming, DEFAULT_TIMING};

/// Request tunnel: typed-chunk framed HTTP requests and responses.
pub const REQUEST_PROTOCOL: &str = "/burrow/request/1.0.0";

/// WebSocket tunnel: typed packets on the COMMAND/MESSAGE/STATUS channels.
pub const WEBSOCKET_PROTOCOL: &str = "/burrow/websocket/1.0.0";

/// Server-pushed heartbeat sentinels.
pub const HEARTBEAT_PROTOCOL: &str = "/burrow/heartbeat/1.0.0";

/// Server-pushed relay and public address announcements.
pub const RELAY_PROTOCOL: &str = "/burrow/relay/1.0.0";

/// Standard libp2p ping protocol, used for on-demand liveness checks.
pub const PING_PROTOCOL: &str = "/ipfs/ping/1.0.0";

/// Sentinel written periodically on heartbeat streams.
pub const HEARTBEAT_SENTINEL: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];

/// Reference slice size for chunked packets and typed-chunk bodies.
pub const CHUNK_SIZE: usize = DEFAULT_TIMING.chunk_size;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("truncated input: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("body length mismatch: head declares {declared}, body has {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("head too large: {size} bytes (max {max})")]
    HeadTooLarge { size: usize, max: usize },
    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },
    #[error("invalid head: {0}")]
    InvalidHead(String),
    #[error("empty chunk")]
    EmptyChunk,
    #[error("unknown chunk type: {0:#04x}")]
    UnknownChunkType(u8),
    #[error("unexpected chunk: {0}")]
    UnexpectedChunk(&'static str),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
