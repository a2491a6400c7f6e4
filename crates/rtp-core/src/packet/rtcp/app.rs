//! RTCP application-defined packet (APP)
//!
//! RFC 3550 Section 6.7: SSRC, a four character name, and opaque
//! word-aligned application data. The subtype rides in the count field of
//! the common header.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};

/// Application-defined sub-packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPacket {
    /// Application-defined subtype (5 bits on the wire)
    pub subtype: u8,

    /// Source of the packet
    pub ssrc: RtpSsrc,

    /// Four ASCII character name identifying the application
    pub name: [u8; 4],

    /// Application data; length must be a multiple of 4
    pub data: Bytes,
}

impl AppPacket {
    /// Create an APP packet; `data` is padded to a word boundary
    pub fn new(subtype: u8, ssrc: RtpSsrc, name: [u8; 4], data: Bytes) -> Self {
        let mut padded = BytesMut::from(&data[..]);
        while padded.len() % 4 != 0 {
            padded.put_u8(0);
        }
        Self { subtype: subtype & 0x1f, ssrc, name, data: padded.freeze() }
    }

    /// Name as a string for logging
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    /// Wire size in bytes, excluding the common RTCP header
    pub fn size(&self) -> usize {
        8 + self.data.len()
    }

    /// Serialize the body into the buffer
    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        buf.put_slice(&self.name);
        buf.put_slice(&self.data);
    }

    /// Parse a body of `body_len` bytes with the given subtype
    pub fn parse(buf: &mut impl Buf, subtype: u8, body_len: usize) -> Result<Self> {
        if body_len < 8 || buf.remaining() < body_len {
            return Err(Error::BufferTooSmall {
                required: body_len.max(8),
                available: buf.remaining(),
            });
        }
        let ssrc = buf.get_u32();
        let mut name = [0u8; 4];
        buf.copy_to_slice(&mut name);
        let data = buf.copy_to_bytes(body_len - 8);
        Ok(Self { subtype, ssrc, name, data })
    }
}
