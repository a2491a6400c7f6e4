//! RTCP receiver report (RR)
//!
//! RFC 3550 Section 6.4.2: reporter SSRC followed by reception report
//! blocks. Sent instead of SR by a receive-only session.

use bytes::{Buf, BufMut, BytesMut};

use super::report_block::ReportBlock;
use crate::error::Error;
use crate::{Result, RtpSsrc};

/// Receiver report sub-packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    /// SSRC of the reporter
    pub ssrc: RtpSsrc,

    /// Reception reports for sources we receive from
    pub reports: Vec<ReportBlock>,
}

impl ReceiverReport {
    /// Empty report for the given reporter
    pub fn new(ssrc: RtpSsrc) -> Self {
        Self { ssrc, reports: Vec::new() }
    }

    /// Wire size in bytes, excluding the common RTCP header
    pub fn size(&self) -> usize {
        4 + self.reports.len() * ReportBlock::SIZE
    }

    /// Serialize the body into the buffer
    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        for report in &self.reports {
            report.serialize(buf);
        }
    }

    /// Parse a body holding `report_count` blocks
    pub fn parse(buf: &mut impl Buf, report_count: u8) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(Error::BufferTooSmall { required: 4, available: buf.remaining() });
        }
        let ssrc = buf.get_u32();
        let mut reports = Vec::with_capacity(report_count as usize);
        for _ in 0..report_count {
            reports.push(ReportBlock::parse(buf)?);
        }
        Ok(Self { ssrc, reports })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut rr = ReceiverReport::new(0xfeedface);
        rr.reports.push(ReportBlock::new(0x11111111));
        rr.reports.push(ReportBlock::new(0x22222222));

        let mut buf = BytesMut::new();
        rr.serialize(&mut buf);
        assert_eq!(buf.len(), rr.size());

        let parsed = ReceiverReport::parse(&mut buf.freeze(), 2).unwrap();
        assert_eq!(parsed, rr);
    }

    #[test]
    fn test_empty_report() {
        let rr = ReceiverReport::new(7);
        let mut buf = BytesMut::new();
        rr.serialize(&mut buf);
        assert_eq!(buf.len(), 4);
        let parsed = ReceiverReport::parse(&mut buf.freeze(), 0).unwrap();
        assert!(parsed.reports.is_empty());
    }
}
