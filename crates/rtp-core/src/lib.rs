//! RTP/RTCP media plane for the tandem telephony stack
//!
//! This crate provides the RFC 3550 wire formats (data packets and the
//! RTCP compound sub-packets), the per-channel `RtpSession` with its send
//! and receive state machines and statistics, and the adaptive jitter
//! buffer placed in front of the read path.

pub mod error;
pub mod jitter;
pub mod packet;
pub mod session;

pub use error::{Error, Result};
pub use jitter::{JitterBuffer, JitterBufferConfig, JitterBufferStats};
pub use packet::{RtpHeader, RtpPacket};
pub use packet::rtcp::{RtcpCompound, RtcpPacket};
pub use session::{
    ProtectionHook, ReceiverAction, RtpSession, RtpSessionConfig, RtpSessionEvent,
    SessionObserver,
};
pub use session::stats::{ReceiverStats, SenderStats};

/// RTP synchronization source identifier
pub type RtpSsrc = u32;

/// RTP contributing source identifier
pub type RtpCsrc = u32;

/// RTP sequence number (16 bit, wraps)
pub type RtpSequenceNumber = u16;

/// RTP media timestamp in clock-rate units
pub type RtpTimestamp = u32;

/// RTP payload type (7 bit)
pub type RtpPayloadType = u8;

/// RTP protocol version carried in every header
pub const RTP_VERSION: u8 = 2;

/// Largest valid payload type value
pub const MAX_PAYLOAD_TYPE: RtpPayloadType = 127;

/// First dynamically assignable payload type
pub const DYNAMIC_PAYLOAD_TYPE_BASE: RtpPayloadType = 96;

/// Fixed part of the RTP header in bytes
pub const RTP_FIXED_HEADER_SIZE: usize = 12;

/// Largest datagram an RTP session will send or accept
pub const MAX_RTP_PACKET_SIZE: usize = 2048;
