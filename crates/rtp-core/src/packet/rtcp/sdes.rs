//! RTCP source description (SDES)
//!
//! RFC 3550 Section 6.5: one chunk per source, each an SSRC followed by
//! items of `{type, length, bytes}`. The END item (type 0) carries no
//! length byte and the chunk is then padded to a word boundary. Item
//! lengths come off the wire unchecked, so the parser keeps an
//! accumulated-size guard and stops at the first item that would overflow
//! the declared chunk rather than reading past it.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};

/// SDES item types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SdesItemKind {
    /// Canonical endpoint identifier; mandatory in every SDES
    Cname = 1,
    /// User's display name
    Name = 2,
    /// Email address
    Email = 3,
    /// Phone number
    Phone = 4,
    /// Geographic location
    Location = 5,
    /// Application or tool name
    Tool = 6,
    /// Transient note
    Note = 7,
    /// Private extension
    Private = 8,
}

impl SdesItemKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(SdesItemKind::Cname),
            2 => Some(SdesItemKind::Name),
            3 => Some(SdesItemKind::Email),
            4 => Some(SdesItemKind::Phone),
            5 => Some(SdesItemKind::Location),
            6 => Some(SdesItemKind::Tool),
            7 => Some(SdesItemKind::Note),
            8 => Some(SdesItemKind::Private),
            _ => None,
        }
    }
}

/// One SDES item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesItem {
    /// Item type
    pub kind: SdesItemKind,
    /// Item text
    pub value: String,
}

/// One SDES chunk: a source and its items
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    /// Source being described
    pub ssrc: RtpSsrc,
    /// Items in wire order
    pub items: Vec<SdesItem>,
}

impl SdesChunk {
    /// Chunk with no items yet
    pub fn new(ssrc: RtpSsrc) -> Self {
        Self { ssrc, items: Vec::new() }
    }

    /// Append an item
    pub fn add_item(&mut self, kind: SdesItemKind, value: impl Into<String>) -> &mut Self {
        self.items.push(SdesItem { kind, value: value.into() });
        self
    }

    /// First item of the given kind
    pub fn find(&self, kind: SdesItemKind) -> Option<&str> {
        self.items.iter().find(|i| i.kind == kind).map(|i| i.value.as_str())
    }
}

/// Source description sub-packet
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceDescription {
    /// Chunks, one per described source
    pub chunks: Vec<SdesChunk>,
}

impl SourceDescription {
    /// Empty SDES
    pub fn new() -> Self {
        Self::default()
    }

    /// The common CNAME+TOOL description every session emits
    pub fn for_session(ssrc: RtpSsrc, cname: &str, tool: &str) -> Self {
        let mut chunk = SdesChunk::new(ssrc);
        chunk.add_item(SdesItemKind::Cname, cname);
        chunk.add_item(SdesItemKind::Tool, tool);
        Self { chunks: vec![chunk] }
    }

    /// Wire size in bytes including per-chunk END items and padding
    pub fn size(&self) -> usize {
        self.chunks
            .iter()
            .map(|chunk| {
                let items: usize =
                    chunk.items.iter().map(|i| 2 + i.value.len().min(255)).sum();
                let unpadded = 4 + items + 1; // SSRC + items + END
                (unpadded + 3) & !3
            })
            .sum()
    }

    /// Serialize the body into the buffer
    pub fn serialize(&self, buf: &mut BytesMut) {
        for chunk in &self.chunks {
            let start = buf.len();
            buf.put_u32(chunk.ssrc);
            for item in &chunk.items {
                let len = item.value.len().min(255);
                buf.put_u8(item.kind as u8);
                buf.put_u8(len as u8);
                buf.put_slice(&item.value.as_bytes()[..len]);
            }
            buf.put_u8(0); // END
            while (buf.len() - start) % 4 != 0 {
                buf.put_u8(0);
            }
        }
    }

    /// Parse a body containing `chunk_count` chunks
    pub fn parse(buf: &mut impl Buf, chunk_count: u8) -> Result<Self> {
        let mut chunks = Vec::with_capacity(chunk_count as usize);

        for _ in 0..chunk_count {
            if buf.remaining() < 4 {
                return Err(Error::BufferTooSmall { required: 4, available: buf.remaining() });
            }
            let mut chunk = SdesChunk::new(buf.get_u32());
            let mut consumed = 4usize;

            loop {
                if !buf.has_remaining() {
                    return Err(Error::MalformedRtcp("SDES chunk missing END item"));
                }
                let kind = buf.get_u8();
                consumed += 1;
                if kind == 0 {
                    // END item; skip padding to the word boundary
                    while consumed % 4 != 0 {
                        if !buf.has_remaining() {
                            return Err(Error::MalformedRtcp("SDES padding truncated"));
                        }
                        buf.advance(1);
                        consumed += 1;
                    }
                    break;
                }

                if !buf.has_remaining() {
                    return Err(Error::MalformedRtcp("SDES item missing length"));
                }
                let len = buf.get_u8() as usize;
                consumed += 1;

                // Overflow guard: a hostile length must not walk past the
                // packet data
                if len > buf.remaining() {
                    return Err(Error::MalformedRtcp("SDES item length overflows packet"));
                }
                let mut value = vec![0u8; len];
                buf.copy_to_slice(&mut value);
                consumed += len;

                if let Some(kind) = SdesItemKind::from_u8(kind) {
                    chunk.items.push(SdesItem {
                        kind,
                        value: String::from_utf8_lossy(&value).into_owned(),
                    });
                }
                // Unknown kinds are skipped but still counted
            }

            chunks.push(chunk);
        }

        Ok(Self { chunks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let sdes = SourceDescription::for_session(0xdeadbeef, "alice@host", "tandem 0.1");
        let mut buf = BytesMut::new();
        sdes.serialize(&mut buf);
        assert_eq!(buf.len(), sdes.size());
        assert_eq!(buf.len() % 4, 0);

        let parsed = SourceDescription::parse(&mut buf.freeze(), 1).unwrap();
        assert_eq!(parsed.chunks.len(), 1);
        assert_eq!(parsed.chunks[0].find(SdesItemKind::Cname), Some("alice@host"));
        assert_eq!(parsed.chunks[0].find(SdesItemKind::Tool), Some("tandem 0.1"));
    }

    #[test]
    fn test_overflowing_item_length_stopped() {
        let mut buf = BytesMut::new();
        buf.put_u32(0x12345678);
        buf.put_u8(1); // CNAME
        buf.put_u8(200); // Claims 200 bytes...
        buf.put_slice(b"tiny"); // ...but only 4 follow

        let result = SourceDescription::parse(&mut buf.freeze(), 1);
        assert!(matches!(result, Err(Error::MalformedRtcp(_))));
    }

    #[test]
    fn test_missing_end_item() {
        let mut buf = BytesMut::new();
        buf.put_u32(0x12345678);
        buf.put_u8(1);
        buf.put_u8(2);
        buf.put_slice(b"ab");
        // No END item, buffer just stops

        let result = SourceDescription::parse(&mut buf.freeze(), 1);
        assert!(matches!(result, Err(Error::MalformedRtcp(_))));
    }

    #[test]
    fn test_unknown_item_kind_skipped() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(99); // Unknown kind
        buf.put_u8(2);
        buf.put_slice(b"xx");
        buf.put_u8(1); // CNAME
        buf.put_u8(1);
        buf.put_slice(b"a");
        buf.put_u8(0); // END
        while buf.len() % 4 != 0 {
            buf.put_u8(0);
        }

        let parsed = SourceDescription::parse(&mut buf.freeze(), 1).unwrap();
        assert_eq!(parsed.chunks[0].items.len(), 1);
        assert_eq!(parsed.chunks[0].find(SdesItemKind::Cname), Some("a"));
    }

    #[test]
    fn test_two_chunks() {
        let mut sdes = SourceDescription::new();
        let mut a = SdesChunk::new(1);
        a.add_item(SdesItemKind::Cname, "a@x");
        let mut b = SdesChunk::new(2);
        b.add_item(SdesItemKind::Cname, "b@y");
        sdes.chunks.push(a);
        sdes.chunks.push(b);

        let mut buf = BytesMut::new();
        sdes.serialize(&mut buf);
        let parsed = SourceDescription::parse(&mut buf.freeze(), 2).unwrap();
        assert_eq!(parsed.chunks.len(), 2);
        assert_eq!(parsed.chunks[1].ssrc, 2);
    }
}
