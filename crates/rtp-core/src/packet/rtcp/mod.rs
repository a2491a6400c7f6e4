//! RTCP compound packet codec
//!
//! An RTCP datagram is a concatenation of sub-packets, each with a common
//! four byte header `{V=2|P|count, packet-type, length}` where the length
//! is in 32 bit words minus one, so every sub-packet is word aligned.

pub mod app;
pub mod bye;
pub mod ntp;
pub mod receiver_report;
pub mod report_block;
pub mod sdes;
pub mod sender_report;

pub use app::AppPacket;
pub use bye::Goodbye;
pub use ntp::NtpTimestamp;
pub use receiver_report::ReceiverReport;
pub use report_block::ReportBlock;
pub use sdes::{SdesChunk, SdesItem, SdesItemKind, SourceDescription};
pub use sender_report::SenderReport;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::error::Error;
use crate::{Result, RtpSsrc, RTP_VERSION};

/// Packet type codes
pub const PT_SENDER_REPORT: u8 = 200;
pub const PT_RECEIVER_REPORT: u8 = 201;
pub const PT_SOURCE_DESCRIPTION: u8 = 202;
pub const PT_GOODBYE: u8 = 203;
pub const PT_APP: u8 = 204;
pub const PT_INTRA_FRAME_REQUEST: u8 = 206;

/// One RTCP sub-packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    /// Sender report (200)
    SenderReport(SenderReport),
    /// Receiver report (201)
    ReceiverReport(ReceiverReport),
    /// Source description (202)
    SourceDescription(SourceDescription),
    /// Goodbye (203)
    Goodbye(Goodbye),
    /// Application defined (204)
    App(AppPacket),
    /// Video intra frame (decoder refresh) request (206)
    IntraFrameRequest {
        /// Requesting SSRC
        sender_ssrc: RtpSsrc,
        /// Media source the request is about
        media_ssrc: RtpSsrc,
    },
}

impl RtcpPacket {
    fn type_code(&self) -> u8 {
        match self {
            RtcpPacket::SenderReport(_) => PT_SENDER_REPORT,
            RtcpPacket::ReceiverReport(_) => PT_RECEIVER_REPORT,
            RtcpPacket::SourceDescription(_) => PT_SOURCE_DESCRIPTION,
            RtcpPacket::Goodbye(_) => PT_GOODBYE,
            RtcpPacket::App(_) => PT_APP,
            RtcpPacket::IntraFrameRequest { .. } => PT_INTRA_FRAME_REQUEST,
        }
    }

    fn count_field(&self) -> u8 {
        match self {
            RtcpPacket::SenderReport(sr) => sr.reports.len() as u8,
            RtcpPacket::ReceiverReport(rr) => rr.reports.len() as u8,
            RtcpPacket::SourceDescription(sdes) => sdes.chunks.len() as u8,
            RtcpPacket::Goodbye(bye) => bye.sources.len() as u8,
            RtcpPacket::App(app) => app.subtype,
            // FMT 1 = picture loss indication
            RtcpPacket::IntraFrameRequest { .. } => 1,
        }
    }

    fn body_size(&self) -> usize {
        match self {
            RtcpPacket::SenderReport(sr) => sr.size(),
            RtcpPacket::ReceiverReport(rr) => rr.size(),
            RtcpPacket::SourceDescription(sdes) => sdes.size(),
            RtcpPacket::Goodbye(bye) => bye.size(),
            RtcpPacket::App(app) => app.size(),
            RtcpPacket::IntraFrameRequest { .. } => 8,
        }
    }
}

/// A whole RTCP datagram: one or more sub-packets
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtcpCompound {
    /// Sub-packets in wire order
    pub packets: Vec<RtcpPacket>,
}

impl RtcpCompound {
    /// Empty compound
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sub-packet
    pub fn push(&mut self, packet: RtcpPacket) -> &mut Self {
        self.packets.push(packet);
        self
    }

    /// Total wire size in bytes
    pub fn size(&self) -> usize {
        self.packets.iter().map(|p| 4 + p.body_size()).sum()
    }

    /// Serialize the compound packet.
    ///
    /// Every sub-packet length is checked to land on a word boundary; the
    /// total equals the sum of sub-packet lengths.
    pub fn serialize(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.size());
        for packet in &self.packets {
            let body_size = packet.body_size();
            if body_size % 4 != 0 {
                return Err(Error::MalformedRtcp("sub-packet not word aligned"));
            }
            let words = (body_size / 4) as u16; // Header word is the -1
            buf.put_u8((RTP_VERSION << 6) | packet.count_field());
            buf.put_u8(packet.type_code());
            buf.put_u16(words);

            match packet {
                RtcpPacket::SenderReport(sr) => sr.serialize(&mut buf),
                RtcpPacket::ReceiverReport(rr) => rr.serialize(&mut buf),
                RtcpPacket::SourceDescription(sdes) => sdes.serialize(&mut buf),
                RtcpPacket::Goodbye(bye) => bye.serialize(&mut buf),
                RtcpPacket::App(app) => app.serialize(&mut buf),
                RtcpPacket::IntraFrameRequest { sender_ssrc, media_ssrc } => {
                    buf.put_u32(*sender_ssrc);
                    buf.put_u32(*media_ssrc);
                }
            }
        }
        Ok(buf.freeze())
    }

    /// Parse a datagram into sub-packets.
    ///
    /// Unknown packet types are skipped using their declared length; a
    /// declared length overflowing the datagram stops the parse.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let mut packets = Vec::new();

        while buf.remaining() >= 4 {
            let first = buf.get_u8();
            let version = first >> 6;
            if version != RTP_VERSION {
                return Err(Error::InvalidVersion(version));
            }
            let count = first & 0x1f;
            let packet_type = buf.get_u8();
            let body_len = buf.get_u16() as usize * 4;

            if body_len > buf.remaining() {
                return Err(Error::MalformedRtcp("sub-packet length overflows datagram"));
            }

            // Give each sub-packet its own window so a short parse cannot
            // bleed into the next one
            let mut body = &buf.chunk()[..body_len];
            match packet_type {
                PT_SENDER_REPORT => {
                    packets.push(RtcpPacket::SenderReport(SenderReport::parse(&mut body, count)?));
                }
                PT_RECEIVER_REPORT => {
                    packets
                        .push(RtcpPacket::ReceiverReport(ReceiverReport::parse(&mut body, count)?));
                }
                PT_SOURCE_DESCRIPTION => {
                    packets.push(RtcpPacket::SourceDescription(SourceDescription::parse(
                        &mut body, count,
                    )?));
                }
                PT_GOODBYE => {
                    packets.push(RtcpPacket::Goodbye(Goodbye::parse(&mut body, count)?));
                }
                PT_APP => {
                    packets.push(RtcpPacket::App(AppPacket::parse(&mut body, count, body_len)?));
                }
                PT_INTRA_FRAME_REQUEST => {
                    if body_len < 8 {
                        return Err(Error::MalformedRtcp("short intra frame request"));
                    }
                    packets.push(RtcpPacket::IntraFrameRequest {
                        sender_ssrc: body.get_u32(),
                        media_ssrc: body.get_u32(),
                    });
                }
                other => {
                    warn!("Skipping unknown RTCP packet type {}", other);
                }
            }
            buf.advance(body_len);
        }

        if packets.is_empty() {
            return Err(Error::MalformedRtcp("no sub-packets in datagram"));
        }
        Ok(Self { packets })
    }
}

/// Quick check whether a datagram looks like RTCP rather than RTP.
///
/// The RTCP packet-type range 200..=206 aliases the RTP payload-type byte
/// with its marker bit set.
pub fn looks_like_rtcp(data: &[u8]) -> bool {
    data.len() >= 4 && (200..=206).contains(&data[1])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_compound() -> RtcpCompound {
        let mut sr = SenderReport::new(0x1000_0001);
        sr.ntp_timestamp = NtpTimestamp { seconds: 100, fraction: 200 };
        sr.rtp_timestamp = 8000;
        sr.packet_count = 50;
        sr.octet_count = 8000;
        sr.reports.push(ReportBlock::new(0x2000_0002));

        let mut compound = RtcpCompound::new();
        compound.push(RtcpPacket::SenderReport(sr));
        compound.push(RtcpPacket::SourceDescription(SourceDescription::for_session(
            0x1000_0001,
            "user@host",
            "tandem",
        )));
        compound
    }

    #[test]
    fn test_compound_round_trip() {
        let compound = sample_compound();
        let wire = compound.serialize().unwrap();
        assert_eq!(wire.len(), compound.size());
        assert_eq!(wire.len() % 4, 0);

        let parsed = RtcpCompound::parse(&wire).unwrap();
        assert_eq!(parsed, compound);
    }

    #[test]
    fn test_sub_packet_lengths_word_aligned() {
        let compound = sample_compound();
        let wire = compound.serialize().unwrap();

        // Walk the headers and confirm total == sum of declared lengths
        let mut offset = 0;
        let mut declared = 0;
        while offset + 4 <= wire.len() {
            let words = u16::from_be_bytes([wire[offset + 2], wire[offset + 3]]) as usize;
            let sub_len = 4 + words * 4;
            assert_eq!(sub_len % 4, 0);
            declared += sub_len;
            offset += sub_len;
        }
        assert_eq!(declared, wire.len());
    }

    #[test]
    fn test_bye_round_trip() {
        let mut compound = RtcpCompound::new();
        compound.push(RtcpPacket::Goodbye(Goodbye::with_reason(7, "done")));
        let wire = compound.serialize().unwrap();
        let parsed = RtcpCompound::parse(&wire).unwrap();
        assert_eq!(parsed, compound);
    }

    #[test]
    fn test_intra_frame_request_round_trip() {
        let mut compound = RtcpCompound::new();
        compound.push(RtcpPacket::IntraFrameRequest { sender_ssrc: 1, media_ssrc: 2 });
        let wire = compound.serialize().unwrap();
        let parsed = RtcpCompound::parse(&wire).unwrap();
        assert_eq!(parsed, compound);
    }

    #[test]
    fn test_overflowing_length_rejected() {
        // Header claims 100 words of body with nothing behind it
        let wire = [0x80u8, PT_RECEIVER_REPORT, 0, 100, 0, 0, 0, 1];
        assert!(matches!(
            RtcpCompound::parse(&wire),
            Err(Error::MalformedRtcp(_))
        ));
    }

    #[test]
    fn test_unknown_type_skipped() {
        let mut compound = RtcpCompound::new();
        compound.push(RtcpPacket::Goodbye(Goodbye::for_source(9)));
        let mut wire = BytesMut::from(&compound.serialize().unwrap()[..]);

        // Prepend an unknown packet type 195 with a 4 byte body
        let mut full = BytesMut::new();
        full.put_u8(0x80);
        full.put_u8(195);
        full.put_u16(1);
        full.put_u32(0xffffffff);
        full.extend_from_slice(&wire.split());

        let parsed = RtcpCompound::parse(&full).unwrap();
        assert_eq!(parsed.packets.len(), 1);
        assert!(matches!(parsed.packets[0], RtcpPacket::Goodbye(_)));
    }

    #[test]
    fn test_rtcp_discriminator() {
        let compound = sample_compound();
        assert!(looks_like_rtcp(&compound.serialize().unwrap()));

        // An RTP packet with payload type 0 does not alias
        let rtp = crate::packet::RtpPacket::new(
            crate::packet::RtpHeader::new(0, 1, 1, 1),
            Bytes::from_static(b"x"),
        );
        assert!(!looks_like_rtcp(&rtp.serialize().unwrap()));
    }
}
