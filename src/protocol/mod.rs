//! Wire protocol: action tags, fixed heads, framing and payload spooling.

pub mod head;
pub(crate) mod spool;
pub(crate) mod wire;

pub use head::{ActionHead, InputHead, StreamHead};
pub use head::{ACTION_HEAD_LEN, INPUT_HEAD_LEN, STREAM_HEAD_LEN};

/// One-byte action tags.
pub mod tags {
    /// Request/response action with a sized payload.
    pub const ACTION: u8 = 0x00;
    /// Chunked streaming action.
    pub const STREAM: u8 = 0x01;
    /// Intermediate input prompt or its reply.
    pub const INPUT: u8 = 0x02;
    /// Download-rate cap for the receiver's send path.
    pub const DOWNLOAD_SPEED: u8 = 0x05;
    /// Cancels a pending input prompt.
    pub const CANCEL_INPUT: u8 = 0x06;
    /// Reserved: session encryption start.
    pub const START_ENCRYPTION: u8 = 0xF0;
    /// Reserved: session encryption stop.
    pub const STOP_ENCRYPTION: u8 = 0xF1;
    /// Keepalive.
    pub const PING: u8 = 0xFF;
}

/// The protocol generation this build speaks.
pub const PROTOCOL_VERSION: u32 = 2;

/// Two-byte separator terminating the header block inside an envelope.
pub(crate) const HEADER_SEPARATOR: [u8; 2] = [0x00, 0x00];

/// Milliseconds since the Unix epoch.
pub(crate) fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
