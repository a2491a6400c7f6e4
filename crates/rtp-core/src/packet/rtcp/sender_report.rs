//! RTCP sender report (SR)
//!
//! RFC 3550 Section 6.4.1: sender SSRC, NTP/RTP timestamp pair, send
//! counters, then zero or more reception report blocks.

use bytes::{Buf, BufMut, BytesMut};

use super::ntp::NtpTimestamp;
use super::report_block::ReportBlock;
use crate::error::Error;
use crate::{Result, RtpSsrc, RtpTimestamp};

/// Sender report sub-packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    /// SSRC of the sender
    pub ssrc: RtpSsrc,

    /// Wall clock at the moment this report was generated
    pub ntp_timestamp: NtpTimestamp,

    /// Media clock corresponding to the NTP timestamp
    pub rtp_timestamp: RtpTimestamp,

    /// Packets sent since session start
    pub packet_count: u32,

    /// Payload octets sent since session start
    pub octet_count: u32,

    /// Reception reports for sources we receive from
    pub reports: Vec<ReportBlock>,
}

/// SSRC plus the fixed sender-info section
const SR_FIXED_SIZE: usize = 4 + 20;

impl SenderReport {
    /// Report with current wall clock and zeroed counters
    pub fn new(ssrc: RtpSsrc) -> Self {
        Self {
            ssrc,
            ntp_timestamp: NtpTimestamp::now(),
            rtp_timestamp: 0,
            packet_count: 0,
            octet_count: 0,
            reports: Vec::new(),
        }
    }

    /// Wire size in bytes, excluding the common RTCP header
    pub fn size(&self) -> usize {
        SR_FIXED_SIZE + self.reports.len() * ReportBlock::SIZE
    }

    /// Serialize the body into the buffer
    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        buf.put_u32(self.ntp_timestamp.seconds);
        buf.put_u32(self.ntp_timestamp.fraction);
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.packet_count);
        buf.put_u32(self.octet_count);
        for report in &self.reports {
            report.serialize(buf);
        }
    }

    /// Parse a body holding `report_count` blocks
    pub fn parse(buf: &mut impl Buf, report_count: u8) -> Result<Self> {
        if buf.remaining() < SR_FIXED_SIZE {
            return Err(Error::BufferTooSmall {
                required: SR_FIXED_SIZE,
                available: buf.remaining(),
            });
        }
        let ssrc = buf.get_u32();
        let ntp_timestamp = NtpTimestamp { seconds: buf.get_u32(), fraction: buf.get_u32() };
        let rtp_timestamp = buf.get_u32();
        let packet_count = buf.get_u32();
        let octet_count = buf.get_u32();

        let mut reports = Vec::with_capacity(report_count as usize);
        for _ in 0..report_count {
            reports.push(ReportBlock::parse(buf)?);
        }

        Ok(Self { ssrc, ntp_timestamp, rtp_timestamp, packet_count, octet_count, reports })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_with_report() {
        let mut sr = SenderReport::new(0x12345678);
        sr.ntp_timestamp = NtpTimestamp { seconds: 0x01020304, fraction: 0x05060708 };
        sr.rtp_timestamp = 160_000;
        sr.packet_count = 1000;
        sr.octet_count = 160_000;
        sr.reports.push(ReportBlock {
            ssrc: 0xcafef00d,
            fraction_lost: 3,
            cumulative_lost: 12,
            highest_sequence: 4000,
            jitter: 7,
            last_sr: 0x01020304,
            delay_since_last_sr: 100,
        });

        let mut buf = BytesMut::new();
        sr.serialize(&mut buf);
        assert_eq!(buf.len(), sr.size());

        let parsed = SenderReport::parse(&mut buf.freeze(), 1).unwrap();
        assert_eq!(parsed, sr);
    }

    #[test]
    fn test_short_body_rejected() {
        let mut buf = &[0u8; 10][..];
        assert!(matches!(
            SenderReport::parse(&mut buf, 0),
            Err(Error::BufferTooSmall { .. })
        ));
    }
}
