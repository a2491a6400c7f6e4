//! PDU framing for reliable transports
//!
//! The default framing is RFC1006 TPKT: a 4 byte header of
//! `{version=3, reserved=0, length-hi, length-lo}` where the 16 bit big
//! endian length covers the header itself. A configurable length-prefix
//! framing is also supported for protocols that count only the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// TPKT protocol version byte
pub const TPKT_VERSION: u8 = 3;

/// TPKT header size in bytes
pub const TPKT_HEADER_SIZE: usize = 4;

/// How PDUs are delimited on a reliable byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Framing {
    /// RFC1006 TPKT, length includes the 4 byte header
    Tpkt,

    /// Raw length prefix counting only the payload
    LengthPrefix {
        /// Prefix size in bytes (1..=4)
        size: u8,
        /// Big endian prefix when true
        big_endian: bool,
    },
}

impl Default for Framing {
    fn default() -> Self {
        Framing::Tpkt
    }
}

impl Framing {
    /// Encode one PDU into a single buffer ready for one write call.
    ///
    /// A single buffer matters: Nagle is disabled on signalling sockets so
    /// header and payload must not go out as separate segments.
    pub fn encode(&self, pdu: &[u8]) -> Result<Bytes> {
        match self {
            Framing::Tpkt => {
                let total = pdu.len() + TPKT_HEADER_SIZE;
                if total > u16::MAX as usize {
                    return Err(Error::ProtocolFailure("PDU too large for TPKT"));
                }
                let mut buf = BytesMut::with_capacity(total);
                buf.put_u8(TPKT_VERSION);
                buf.put_u8(0);
                buf.put_u16(total as u16);
                buf.put_slice(pdu);
                Ok(buf.freeze())
            }
            Framing::LengthPrefix { size, big_endian } => {
                let size = *size as usize;
                if size == 0 || size > 4 {
                    return Err(Error::ProtocolFailure("invalid length prefix size"));
                }
                let max = if size >= 4 { u32::MAX as usize } else { (1usize << (8 * size)) - 1 };
                if pdu.len() > max {
                    return Err(Error::ProtocolFailure("PDU too large for length prefix"));
                }
                let mut buf = BytesMut::with_capacity(size + pdu.len());
                let len = pdu.len() as u32;
                for i in 0..size {
                    let shift = if *big_endian { 8 * (size - 1 - i) } else { 8 * i };
                    buf.put_u8((len >> shift) as u8);
                }
                buf.put_slice(pdu);
                Ok(buf.freeze())
            }
        }
    }

    /// Read one framed PDU from the stream.
    ///
    /// Fails with `ProtocolFailure` when the TPKT version byte is not 3 or
    /// the declared length is shorter than the header ("dwarf" PDU).
    pub async fn read_pdu<R>(&self, stream: &mut R) -> Result<Bytes>
    where
        R: AsyncRead + Unpin,
    {
        match self {
            Framing::Tpkt => {
                let mut header = [0u8; TPKT_HEADER_SIZE];
                stream.read_exact(&mut header).await?;
                if header[0] != TPKT_VERSION {
                    return Err(Error::ProtocolFailure("not a TPKT version 3 header"));
                }
                let total = u16::from_be_bytes([header[2], header[3]]) as usize;
                if total < TPKT_HEADER_SIZE {
                    return Err(Error::ProtocolFailure("dwarf TPKT received"));
                }
                let mut payload = vec![0u8; total - TPKT_HEADER_SIZE];
                stream.read_exact(&mut payload).await?;
                Ok(Bytes::from(payload))
            }
            Framing::LengthPrefix { size, big_endian } => {
                let size = *size as usize;
                let mut header = [0u8; 4];
                stream.read_exact(&mut header[..size]).await?;
                let mut len: usize = 0;
                for (i, byte) in header[..size].iter().enumerate() {
                    let shift = if *big_endian { 8 * (size - 1 - i) } else { 8 * i };
                    len |= (*byte as usize) << shift;
                }
                let mut payload = vec![0u8; len];
                stream.read_exact(&mut payload).await?;
                Ok(Bytes::from(payload))
            }
        }
    }

    /// Write one framed PDU with a single write call
    pub async fn write_pdu<W>(&self, stream: &mut W, pdu: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let framed = self.encode(pdu)?;
        stream.write_all(&framed).await?;
        Ok(())
    }

    /// Decode one PDU from an in-memory buffer, consuming it.
    ///
    /// Returns `None` when the buffer does not yet hold a whole PDU.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        match self {
            Framing::Tpkt => {
                if buf.len() < TPKT_HEADER_SIZE {
                    return Ok(None);
                }
                if buf[0] != TPKT_VERSION {
                    return Err(Error::ProtocolFailure("not a TPKT version 3 header"));
                }
                let total = u16::from_be_bytes([buf[2], buf[3]]) as usize;
                if total < TPKT_HEADER_SIZE {
                    return Err(Error::ProtocolFailure("dwarf TPKT received"));
                }
                if buf.len() < total {
                    return Ok(None);
                }
                buf.advance(TPKT_HEADER_SIZE);
                Ok(Some(buf.split_to(total - TPKT_HEADER_SIZE).freeze()))
            }
            Framing::LengthPrefix { size, big_endian } => {
                let size = *size as usize;
                if buf.len() < size {
                    return Ok(None);
                }
                let mut len: usize = 0;
                for i in 0..size {
                    let shift = if *big_endian { 8 * (size - 1 - i) } else { 8 * i };
                    len |= (buf[i] as usize) << shift;
                }
                if buf.len() < size + len {
                    return Ok(None);
                }
                buf.advance(size);
                Ok(Some(buf.split_to(len).freeze()))
            }
        }
    }
}
