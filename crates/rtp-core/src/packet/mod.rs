//! RTP data packet wire format
//!
//! RFC 3550 Section 5.1: a 12 byte fixed header, an optional CSRC list,
//! an optional header extension, the payload, and optional padding whose
//! last byte holds the pad length. All fields big endian.

pub mod rtcp;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::{
    Result, RtpCsrc, RtpPayloadType, RtpSequenceNumber, RtpSsrc, RtpTimestamp,
    MAX_PAYLOAD_TYPE, RTP_FIXED_HEADER_SIZE, RTP_VERSION,
};

/// RTP header extension: profile-defined id plus word-aligned data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpExtension {
    /// Profile-defined identifier
    pub profile_id: u16,

    /// Extension payload; length must be a multiple of 4
    pub data: Bytes,
}

/// Decoded RTP packet header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    /// Padding flag; pad length sits in the last payload byte
    pub padding: bool,

    /// Marker bit: talk-spurt start for audio, frame end for video
    pub marker: bool,

    /// Payload type, 0..=127
    pub payload_type: RtpPayloadType,

    /// Sequence number, increments by one per packet
    pub sequence_number: RtpSequenceNumber,

    /// Media timestamp in clock-rate units
    pub timestamp: RtpTimestamp,

    /// Synchronization source
    pub ssrc: RtpSsrc,

    /// Contributing sources, present when a mixer combined inputs
    pub csrc: Vec<RtpCsrc>,

    /// Optional header extension
    pub extension: Option<RtpExtension>,
}

impl RtpHeader {
    /// Create a header with no CSRC list or extension
    pub fn new(
        payload_type: RtpPayloadType,
        sequence_number: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        ssrc: RtpSsrc,
    ) -> Self {
        Self {
            padding: false,
            marker: false,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            extension: None,
        }
    }

    /// Header size in bytes, computed from the flag fields
    pub fn size(&self) -> usize {
        let mut size = RTP_FIXED_HEADER_SIZE + self.csrc.len() * 4;
        if let Some(ext) = &self.extension {
            size += 4 + ext.data.len();
        }
        size
    }

    /// Serialize into the buffer
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<()> {
        if self.payload_type > MAX_PAYLOAD_TYPE {
            return Err(Error::InvalidPayloadType(self.payload_type));
        }
        if self.csrc.len() > 15 {
            return Err(Error::MalformedRtcp("more than 15 contributing sources"));
        }

        let mut first = (RTP_VERSION << 6) | (self.csrc.len() as u8);
        if self.padding {
            first |= 0x20;
        }
        if self.extension.is_some() {
            first |= 0x10;
        }
        buf.put_u8(first);

        let mut second = self.payload_type;
        if self.marker {
            second |= 0x80;
        }
        buf.put_u8(second);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }

        if let Some(ext) = &self.extension {
            if ext.data.len() % 4 != 0 {
                return Err(Error::MalformedRtcp("extension data not word aligned"));
            }
            buf.put_u16(ext.profile_id);
            buf.put_u16((ext.data.len() / 4) as u16);
            buf.put_slice(&ext.data);
        }

        Ok(())
    }

    /// Parse a header, leaving `buf` positioned at the payload
    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < RTP_FIXED_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                required: RTP_FIXED_HEADER_SIZE,
                available: buf.remaining(),
            });
        }

        let first = buf.get_u8();
        let version = first >> 6;
        if version != RTP_VERSION {
            return Err(Error::InvalidVersion(version));
        }
        let padding = (first & 0x20) != 0;
        let has_extension = (first & 0x10) != 0;
        let csrc_count = (first & 0x0f) as usize;

        let second = buf.get_u8();
        let marker = (second & 0x80) != 0;
        let payload_type = second & 0x7f;

        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        if buf.remaining() < csrc_count * 4 {
            return Err(Error::BufferTooSmall {
                required: csrc_count * 4,
                available: buf.remaining(),
            });
        }
        let mut csrc = Vec::with_capacity(csrc_count);
        for _ in 0..csrc_count {
            csrc.push(buf.get_u32());
        }

        let extension = if has_extension {
            if buf.remaining() < 4 {
                return Err(Error::BufferTooSmall { required: 4, available: buf.remaining() });
            }
            let profile_id = buf.get_u16();
            let words = buf.get_u16() as usize;
            if buf.remaining() < words * 4 {
                return Err(Error::BufferTooSmall {
                    required: words * 4,
                    available: buf.remaining(),
                });
            }
            Some(RtpExtension { profile_id, data: buf.copy_to_bytes(words * 4) })
        } else {
            None
        };

        Ok(Self {
            padding,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
            extension,
        })
    }
}

/// A complete RTP data packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// Packet header
    pub header: RtpHeader,

    /// Media payload, padding already stripped
    pub payload: Bytes,
}

impl RtpPacket {
    /// Create a packet from a header and payload
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Total serialized size, without padding
    pub fn size(&self) -> usize {
        self.header.size() + self.payload.len()
    }

    /// Serialize into a fresh buffer
    pub fn serialize(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.size());
        self.header.serialize(&mut buf)?;
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse a whole datagram.
    ///
    /// Rejects version != 2 and payload types above 127; strips padding
    /// using the count in the last byte.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let header = RtpHeader::parse(&mut buf)?;

        let mut payload_len = buf.remaining();
        if header.padding {
            if payload_len == 0 {
                return Err(Error::MalformedRtcp("padding flag with empty payload"));
            }
            let pad = data[data.len() - 1] as usize;
            if pad == 0 || pad > payload_len {
                return Err(Error::MalformedRtcp("bad padding length"));
            }
            payload_len -= pad;
        }

        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&buf.chunk()[..payload_len]),
        })
    }
}
