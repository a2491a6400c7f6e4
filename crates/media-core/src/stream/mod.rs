//! Media streams
//!
//! A stream is a unidirectional flow of media frames at the application
//! level: sources are read from, sinks are written to. Concrete streams
//! are backed by an RTP session, an in-process channel (soundcard and IVR
//! style endpoints), a bit bucket, or a recording buffer.

pub mod patch;

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

use tandem_rtp_core::jitter::{JitterBuffer, JitterBufferConfig, PullResult};
use tandem_rtp_core::packet::{RtpHeader, RtpPacket};
use tandem_rtp_core::session::RtpSession;

use crate::error::{Error, Result};
use crate::format::MediaFormat;

/// Commands passed along a stream, typically towards the far end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCommand {
    /// Ask the video source for a decoder refresh point
    IntraFrameRequest,
    /// Protocol or application specific command
    Custom(String),
}

/// Unidirectional media flow
#[async_trait]
pub trait MediaStream: Send + Sync {
    /// Session this stream belongs to within its connection
    fn session_id(&self) -> u32;

    /// Negotiated format of the frames on this stream
    fn format(&self) -> MediaFormat;

    /// True for a source (read side), false for a sink (write side)
    fn is_source(&self) -> bool;

    /// Stream has been opened and not yet closed
    fn is_open(&self) -> bool;

    /// Paused streams silently discard traffic
    fn is_paused(&self) -> bool;

    /// Pause or resume
    fn set_paused(&self, paused: bool);

    /// Make the stream ready to carry frames
    async fn open(&self) -> Result<()>;

    /// Stop the stream; idempotent
    async fn close(&self);

    /// Read the next frame (sources only)
    async fn read_packet(&self) -> Result<RtpPacket>;

    /// Write a frame (sinks only)
    async fn write_packet(&self, packet: RtpPacket) -> Result<()>;

    /// Execute a command; returns whether the stream handled it
    async fn execute_command(&self, _command: StreamCommand) -> bool {
        false
    }
}

// ---------------------------------------------------------------------
// RTP-backed stream
// ---------------------------------------------------------------------

/// Stream carried by an RTP session.
///
/// A source reads from the network, optionally through a jitter buffer; a
/// sink stamps and transmits. The jitter buffer is bypassed entirely when
/// both its delays are zero.
pub struct RtpMediaStream {
    session: RtpSession,
    format: MediaFormat,
    session_id: u32,
    source: bool,
    open: AtomicBool,
    paused: AtomicBool,
    jitter: Option<Mutex<JitterBuffer>>,
    reported_too_late: AtomicU32,
}

impl RtpMediaStream {
    /// Wrap a session. `jitter` applies to sources only.
    pub fn new(
        session: RtpSession,
        format: MediaFormat,
        session_id: u32,
        source: bool,
        jitter: Option<JitterBufferConfig>,
    ) -> Self {
        let jitter = match jitter {
            Some(config) if source && !config.is_bypass() => {
                Some(Mutex::new(JitterBuffer::new(config)))
            }
            _ => None,
        };
        Self {
            session,
            format,
            session_id,
            source,
            open: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            jitter,
            reported_too_late: AtomicU32::new(0),
        }
    }

    /// The underlying RTP session
    pub fn rtp_session(&self) -> &RtpSession {
        &self.session
    }

    fn sync_too_late_stats(&self, buffer: &JitterBuffer) {
        let total = buffer.stats().packets_too_late as u32;
        let reported = self.reported_too_late.swap(total, Ordering::Relaxed);
        if total > reported {
            self.session.add_packets_too_late((total - reported) as u64);
        }
    }
}

#[async_trait]
impl MediaStream for RtpMediaStream {
    fn session_id(&self) -> u32 {
        self.session_id
    }

    fn format(&self) -> MediaFormat {
        self.format.clone()
    }

    fn is_source(&self) -> bool {
        self.source
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed) && self.session.is_open()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    async fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::Relaxed);
        debug!(
            "Opened RTP {} stream, session {} format {}",
            if self.source { "source" } else { "sink" },
            self.session_id,
            self.format
        );
        Ok(())
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::Relaxed) {
            debug!("Closed RTP stream, session {}", self.session_id);
        }
    }

    async fn read_packet(&self) -> Result<RtpPacket> {
        if !self.source {
            return Err(Error::WrongDirection("read on sink"));
        }
        if !self.is_open() {
            return Err(Error::StreamNotOpen);
        }

        let Some(jitter) = &self.jitter else {
            return Ok(self.session.read_data().await?);
        };

        // Single-reader model: this task both feeds and drains the buffer
        loop {
            let action = {
                let mut buffer = jitter.lock().await;
                let result = buffer.pull(std::time::Instant::now());
                self.sync_too_late_stats(&buffer);
                result
            };
            match action {
                PullResult::Packet(packet) => return Ok(packet),
                PullResult::Wait(wait) => {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        received = self.session.read_data() => {
                            let packet = received?;
                            let mut buffer = jitter.lock().await;
                            buffer.insert(packet, std::time::Instant::now());
                        }
                    }
                }
                PullResult::Starved => {
                    let packet = self.session.read_data().await?;
                    let mut buffer = jitter.lock().await;
                    buffer.insert(packet, std::time::Instant::now());
                }
            }
        }
    }

    async fn write_packet(&self, mut packet: RtpPacket) -> Result<()> {
        if self.source {
            return Err(Error::WrongDirection("write on source"));
        }
        if !self.is_open() {
            return Err(Error::StreamNotOpen);
        }
        if self.is_paused() {
            trace!("Discarding frame on paused stream {}", self.session_id);
            return Ok(());
        }
        self.session.send_packet(&mut packet).await?;
        Ok(())
    }

    async fn execute_command(&self, command: StreamCommand) -> bool {
        match command {
            StreamCommand::IntraFrameRequest => {
                let mut compound = tandem_rtp_core::packet::rtcp::RtcpCompound::new();
                compound.push(tandem_rtp_core::packet::rtcp::RtcpPacket::IntraFrameRequest {
                    sender_ssrc: self.session.ssrc(),
                    media_ssrc: self.session.remote_ssrc(),
                });
                self.session.send_control(&compound).await.is_ok()
            }
            StreamCommand::Custom(_) => false,
        }
    }
}

// ---------------------------------------------------------------------
// Channel-backed stream (soundcard / IVR style)
// ---------------------------------------------------------------------

/// Stream bridged to the application through an in-process channel
pub struct ChannelMediaStream {
    format: MediaFormat,
    session_id: u32,
    source: bool,
    open: AtomicBool,
    paused: AtomicBool,
    receiver: Option<Mutex<mpsc::Receiver<RtpPacket>>>,
    sender: Option<mpsc::Sender<RtpPacket>>,
}

impl ChannelMediaStream {
    /// Source stream; the returned sender injects frames (microphone side)
    pub fn source(
        format: MediaFormat,
        session_id: u32,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Sender<RtpPacket>) {
        let (tx, rx) = mpsc::channel(capacity);
        let stream = Arc::new(Self {
            format,
            session_id,
            source: true,
            open: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            receiver: Some(Mutex::new(rx)),
            sender: None,
        });
        (stream, tx)
    }

    /// Sink stream; the returned receiver observes frames (speaker side)
    pub fn sink(
        format: MediaFormat,
        session_id: u32,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<RtpPacket>) {
        let (tx, rx) = mpsc::channel(capacity);
        let stream = Arc::new(Self {
            format,
            session_id,
            source: false,
            open: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            receiver: None,
            sender: Some(tx),
        });
        (stream, rx)
    }
}

#[async_trait]
impl MediaStream for ChannelMediaStream {
    fn session_id(&self) -> u32 {
        self.session_id
    }

    fn format(&self) -> MediaFormat {
        self.format.clone()
    }

    fn is_source(&self) -> bool {
        self.source
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    async fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
    }

    async fn read_packet(&self) -> Result<RtpPacket> {
        let Some(receiver) = &self.receiver else {
            return Err(Error::WrongDirection("read on sink"));
        };
        if !self.is_open() {
            return Err(Error::StreamNotOpen);
        }
        receiver.lock().await.recv().await.ok_or(Error::StreamClosed)
    }

    async fn write_packet(&self, packet: RtpPacket) -> Result<()> {
        let Some(sender) = &self.sender else {
            return Err(Error::WrongDirection("write on source"));
        };
        if !self.is_open() {
            return Err(Error::StreamNotOpen);
        }
        if self.is_paused() {
            return Ok(());
        }
        sender.send(packet).await.map_err(|_| Error::StreamClosed)
    }
}

// ---------------------------------------------------------------------
// Null stream
// ---------------------------------------------------------------------

/// A source of paced silence or a sink that discards everything
pub struct NullMediaStream {
    format: MediaFormat,
    session_id: u32,
    source: bool,
    open: AtomicBool,
    paused: AtomicBool,
    sequence: AtomicU16,
    timestamp: AtomicU32,
    frames_discarded: AtomicU32,
}

impl NullMediaStream {
    /// Create a null stream in the given direction
    pub fn new(format: MediaFormat, session_id: u32, source: bool) -> Self {
        Self {
            format,
            session_id,
            source,
            open: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            sequence: AtomicU16::new(0),
            timestamp: AtomicU32::new(0),
            frames_discarded: AtomicU32::new(0),
        }
    }

    /// Frames swallowed by the sink side
    pub fn frames_discarded(&self) -> u32 {
        self.frames_discarded.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MediaStream for NullMediaStream {
    fn session_id(&self) -> u32 {
        self.session_id
    }

    fn format(&self) -> MediaFormat {
        self.format.clone()
    }

    fn is_source(&self) -> bool {
        self.source
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    async fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
    }

    async fn read_packet(&self) -> Result<RtpPacket> {
        if !self.source {
            return Err(Error::WrongDirection("read on sink"));
        }
        if !self.is_open() {
            return Err(Error::StreamNotOpen);
        }

        // Pace the silence at the format's frame time
        let frame_time = self.format.frame_time().max(1);
        let ms = frame_time * 1000 / self.format.clock_rate().max(1);
        tokio::time::sleep(Duration::from_millis(ms as u64)).await;

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let timestamp = self.timestamp.fetch_add(frame_time, Ordering::Relaxed);
        let silence = vec![0u8; frame_time as usize];
        Ok(RtpPacket::new(
            RtpHeader::new(0, sequence, timestamp, 0),
            Bytes::from(silence),
        ))
    }

    async fn write_packet(&self, _packet: RtpPacket) -> Result<()> {
        if self.source {
            return Err(Error::WrongDirection("write on source"));
        }
        if !self.is_open() {
            return Err(Error::StreamNotOpen);
        }
        self.frames_discarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Recording sink
// ---------------------------------------------------------------------

/// Sink that appends every payload to a shared buffer
pub struct RecordingSink {
    format: MediaFormat,
    session_id: u32,
    open: AtomicBool,
    paused: AtomicBool,
    data: Arc<SyncMutex<Vec<u8>>>,
}

impl RecordingSink {
    /// Create a recording sink
    pub fn new(format: MediaFormat, session_id: u32) -> Self {
        Self {
            format,
            session_id,
            open: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            data: Arc::new(SyncMutex::new(Vec::new())),
        }
    }

    /// Shared handle to the recorded bytes
    pub fn data(&self) -> Arc<SyncMutex<Vec<u8>>> {
        self.data.clone()
    }
}

#[async_trait]
impl MediaStream for RecordingSink {
    fn session_id(&self) -> u32 {
        self.session_id
    }

    fn format(&self) -> MediaFormat {
        self.format.clone()
    }

    fn is_source(&self) -> bool {
        false
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    async fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
    }

    async fn read_packet(&self) -> Result<RtpPacket> {
        Err(Error::WrongDirection("read on sink"))
    }

    async fn write_packet(&self, packet: RtpPacket) -> Result<()> {
        if !self.is_open() {
            return Err(Error::StreamNotOpen);
        }
        if !self.is_paused() {
            self.data.lock().extend_from_slice(&packet.payload);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::registry::standard_formats;
    use crate::format::names;

    fn pcm16() -> MediaFormat {
        standard_formats().into_iter().find(|f| f.name() == names::PCM16).unwrap()
    }

    fn frame(seq: u16) -> RtpPacket {
        RtpPacket::new(RtpHeader::new(0, seq, seq as u32 * 160, 1), Bytes::from_static(b"pcm"))
    }

    #[tokio::test]
    async fn test_channel_pair_flow() {
        let (source, feed) = ChannelMediaStream::source(pcm16(), 1, 8);
        source.open().await.unwrap();

        feed.send(frame(1)).await.unwrap();
        let got = source.read_packet().await.unwrap();
        assert_eq!(got.header.sequence_number, 1);

        let (sink, mut observe) = ChannelMediaStream::sink(pcm16(), 1, 8);
        sink.open().await.unwrap();
        sink.write_packet(frame(2)).await.unwrap();
        assert_eq!(observe.recv().await.unwrap().header.sequence_number, 2);
    }

    #[tokio::test]
    async fn test_direction_enforced() {
        let (source, _feed) = ChannelMediaStream::source(pcm16(), 1, 8);
        source.open().await.unwrap();
        assert!(matches!(
            source.write_packet(frame(1)).await,
            Err(Error::WrongDirection(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_stream_rejects() {
        let (sink, _observe) = ChannelMediaStream::sink(pcm16(), 1, 8);
        assert!(matches!(sink.write_packet(frame(1)).await, Err(Error::StreamNotOpen)));
    }

    #[tokio::test]
    async fn test_paused_sink_discards() {
        let (sink, mut observe) = ChannelMediaStream::sink(pcm16(), 1, 8);
        sink.open().await.unwrap();
        sink.set_paused(true);
        sink.write_packet(frame(1)).await.unwrap();
        sink.set_paused(false);
        sink.write_packet(frame(2)).await.unwrap();
        // Only the unpaused frame arrives
        assert_eq!(observe.recv().await.unwrap().header.sequence_number, 2);
    }

    #[tokio::test]
    async fn test_null_source_paces_silence() {
        let stream = NullMediaStream::new(pcm16(), 1, true);
        stream.open().await.unwrap();
        let a = stream.read_packet().await.unwrap();
        let b = stream.read_packet().await.unwrap();
        assert_eq!(b.header.sequence_number, a.header.sequence_number + 1);
        assert_eq!(b.header.timestamp, a.header.timestamp + 160);
        assert!(a.payload.iter().all(|&byte| byte == 0));
    }

    #[tokio::test]
    async fn test_recording_sink_accumulates() {
        let sink = RecordingSink::new(pcm16(), 1);
        sink.open().await.unwrap();
        sink.write_packet(frame(1)).await.unwrap();
        sink.write_packet(frame(2)).await.unwrap();
        assert_eq!(&*sink.data().lock(), b"pcmpcm");
    }
}
