//! Error types for the RTP media plane

use thiserror::Error;

/// Errors produced by packet codecs and sessions
#[derive(Error, Debug)]
pub enum Error {
    /// Buffer ended before a complete field
    #[error("Buffer too small: needed {required} bytes, had {available}")]
    BufferTooSmall {
        /// Bytes the decoder needed
        required: usize,
        /// Bytes actually available
        available: usize,
    },

    /// RTP version field was not 2
    #[error("Unsupported RTP version {0}")]
    InvalidVersion(u8),

    /// Payload type outside 0..=127
    #[error("Invalid payload type {0}")]
    InvalidPayloadType(u8),

    /// RTCP sub-packet type byte not recognised
    #[error("Unknown RTCP packet type {0}")]
    UnknownRtcpType(u8),

    /// RTCP sub-packet declared a length overflowing its container
    #[error("Malformed RTCP packet: {0}")]
    MalformedRtcp(&'static str),

    /// Session level failure (socket setup, state)
    #[error("Session error: {0}")]
    SessionError(String),

    /// Session is shut down
    #[error("Session closed")]
    SessionClosed,

    /// Underlying transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] tandem_transport_core::Error),

    /// Socket I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for RTP operations
pub type Result<T> = std::result::Result<T, Error>;
