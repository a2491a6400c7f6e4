//! RTCP goodbye (BYE)
//!
//! RFC 3550 Section 6.6: list of departing sources plus an optional
//! length-prefixed reason string, padded to a word boundary.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};

/// Goodbye sub-packet
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Goodbye {
    /// Departing sources
    pub sources: Vec<RtpSsrc>,

    /// Optional reason for leaving
    pub reason: Option<String>,
}

impl Goodbye {
    /// BYE for a single source
    pub fn for_source(ssrc: RtpSsrc) -> Self {
        Self { sources: vec![ssrc], reason: None }
    }

    /// BYE for a single source with a reason
    pub fn with_reason(ssrc: RtpSsrc, reason: impl Into<String>) -> Self {
        Self { sources: vec![ssrc], reason: Some(reason.into()) }
    }

    /// Wire size in bytes, excluding the common RTCP header
    pub fn size(&self) -> usize {
        let mut size = self.sources.len() * 4;
        if let Some(reason) = &self.reason {
            let text = reason.len().min(255);
            size += (1 + text + 3) & !3; // Length byte + text, word aligned
        }
        size
    }

    /// Serialize the body into the buffer
    pub fn serialize(&self, buf: &mut BytesMut) {
        for ssrc in &self.sources {
            buf.put_u32(*ssrc);
        }
        if let Some(reason) = &self.reason {
            let text = reason.len().min(255);
            buf.put_u8(text as u8);
            buf.put_slice(&reason.as_bytes()[..text]);
            let mut written = 1 + text;
            while written % 4 != 0 {
                buf.put_u8(0);
                written += 1;
            }
        }
    }

    /// Parse a body holding `source_count` sources
    pub fn parse(buf: &mut impl Buf, source_count: u8) -> Result<Self> {
        let needed = source_count as usize * 4;
        if buf.remaining() < needed {
            return Err(Error::BufferTooSmall { required: needed, available: buf.remaining() });
        }
        let mut sources = Vec::with_capacity(source_count as usize);
        for _ in 0..source_count {
            sources.push(buf.get_u32());
        }

        let reason = if buf.has_remaining() {
            let len = buf.get_u8() as usize;
            if len > buf.remaining() {
                return Err(Error::MalformedRtcp("BYE reason length overflows packet"));
            }
            let mut text = vec![0u8; len];
            buf.copy_to_slice(&mut text);
            Some(String::from_utf8_lossy(&text).into_owned())
        } else {
            None
        };

        Ok(Self { sources, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_with_reason() {
        let bye = Goodbye::with_reason(0x12345678, "session ended");
        let mut buf = BytesMut::new();
        bye.serialize(&mut buf);
        assert_eq!(buf.len(), bye.size());
        assert_eq!(buf.len() % 4, 0);

        let parsed = Goodbye::parse(&mut buf.freeze(), 1).unwrap();
        assert_eq!(parsed.sources, vec![0x12345678]);
        assert_eq!(parsed.reason.as_deref(), Some("session ended"));
    }

    #[test]
    fn test_round_trip_no_reason() {
        let bye = Goodbye::for_source(0xabcd0123);
        let mut buf = BytesMut::new();
        bye.serialize(&mut buf);
        assert_eq!(buf.len(), 4);

        let parsed = Goodbye::parse(&mut buf.freeze(), 1).unwrap();
        assert!(parsed.reason.is_none());
    }

    #[test]
    fn test_reason_overflow_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(50); // Claims 50 bytes with none following
        assert!(matches!(
            Goodbye::parse(&mut buf.freeze(), 1),
            Err(Error::MalformedRtcp(_))
        ));
    }
}
