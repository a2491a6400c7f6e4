//! RTCP reception report block
//!
//! RFC 3550 Section 6.4.1: one 24 byte block per reported source,
//! carried inside SR and RR packets.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};

/// Reception quality for one synchronization source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportBlock {
    /// Source this block reports on
    pub ssrc: RtpSsrc,

    /// Fraction of packets lost since the previous report, as lost*256/expected
    pub fraction_lost: u8,

    /// Cumulative packets lost, 24 bit signed on the wire
    pub cumulative_lost: u32,

    /// Extended highest sequence number received
    pub highest_sequence: u32,

    /// Interarrival jitter in timestamp units
    pub jitter: u32,

    /// Middle 32 bits of the last SR's NTP timestamp
    pub last_sr: u32,

    /// Delay since that SR in 1/65536 second units
    pub delay_since_last_sr: u32,
}

impl ReportBlock {
    /// Wire size of one block
    pub const SIZE: usize = 24;

    /// Empty block for a source
    pub fn new(ssrc: RtpSsrc) -> Self {
        Self {
            ssrc,
            fraction_lost: 0,
            cumulative_lost: 0,
            highest_sequence: 0,
            jitter: 0,
            last_sr: 0,
            delay_since_last_sr: 0,
        }
    }

    /// Serialize into the buffer
    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        buf.put_u8(self.fraction_lost);
        // Cumulative loss is 24 bits
        buf.put_u8((self.cumulative_lost >> 16) as u8);
        buf.put_u8((self.cumulative_lost >> 8) as u8);
        buf.put_u8(self.cumulative_lost as u8);
        buf.put_u32(self.highest_sequence);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr);
        buf.put_u32(self.delay_since_last_sr);
    }

    /// Parse one block
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                required: Self::SIZE,
                available: buf.remaining(),
            });
        }
        let ssrc = buf.get_u32();
        let fraction_lost = buf.get_u8();
        let cumulative_lost =
            ((buf.get_u8() as u32) << 16) | ((buf.get_u8() as u32) << 8) | buf.get_u8() as u32;
        Ok(Self {
            ssrc,
            fraction_lost,
            cumulative_lost,
            highest_sequence: buf.get_u32(),
            jitter: buf.get_u32(),
            last_sr: buf.get_u32(),
            delay_since_last_sr: buf.get_u32(),
        })
    }
}
