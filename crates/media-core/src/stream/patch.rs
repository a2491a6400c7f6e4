//! Media patch
//!
//! A patch pipes exactly one source stream into one or more sinks. In
//! active mode a task pulls the source, runs the filter chain and fans out
//! to every sink; in passive mode the source's owner pushes frames into
//! the patch inline. A bypass flag skips the filter chain for zero-copy
//! forwarding between two RTP legs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use tandem_rtp_core::packet::RtpPacket;

use crate::error::{Error, Result};
use crate::format::MediaFormat;
use crate::stream::MediaStream;

/// What a filter decided about a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    /// Pass the (possibly modified) frame on
    Forward,
    /// Swallow the frame
    Drop,
}

/// A frame filter; may modify the packet in place
pub type FilterFn = Arc<dyn Fn(&mut RtpPacket) -> FilterAction + Send + Sync>;

/// Identity of an installed filter, used for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterHandle(u64);

struct FilterEntry {
    id: u64,
    format_name: String,
    filter: FilterFn,
}

/// Converts frames between two formats
pub trait Transcoder: Send {
    /// Convert one input frame into zero or more output frames
    fn transcode(&mut self, packet: RtpPacket) -> Result<Vec<RtpPacket>>;
}

/// Factory registry keyed by (source format, destination format) names
#[derive(Default)]
pub struct TranscoderRegistry {
    factories: SyncMutex<HashMap<(String, String), Arc<dyn Fn() -> Box<dyn Transcoder> + Send + Sync>>>,
}

impl TranscoderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a conversion
    pub fn register(
        &self,
        from: &str,
        to: &str,
        factory: Arc<dyn Fn() -> Box<dyn Transcoder> + Send + Sync>,
    ) {
        self.factories
            .lock()
            .insert((from.to_string(), to.to_string()), factory);
    }

    /// Instantiate a transcoder for the conversion
    pub fn create(&self, from: &MediaFormat, to: &MediaFormat) -> Result<Box<dyn Transcoder>> {
        if from.name() == to.name() {
            return Ok(Box::new(PassthroughTranscoder));
        }
        let factories = self.factories.lock();
        match factories.get(&(from.name().to_string(), to.name().to_string())) {
            Some(factory) => Ok(factory()),
            None => Err(Error::NoTranscoder(from.name().to_string(), to.name().to_string())),
        }
    }

    /// Whether a conversion is possible
    pub fn can_convert(&self, from: &MediaFormat, to: &MediaFormat) -> bool {
        from.name() == to.name()
            || self
                .factories
                .lock()
                .contains_key(&(from.name().to_string(), to.name().to_string()))
    }
}

/// Transcoder for matching formats; frames pass unchanged
pub struct PassthroughTranscoder;

impl Transcoder for PassthroughTranscoder {
    fn transcode(&mut self, packet: RtpPacket) -> Result<Vec<RtpPacket>> {
        Ok(vec![packet])
    }
}

struct SinkEntry {
    stream: Arc<dyn MediaStream>,
    transcoder: Option<SyncMutex<Box<dyn Transcoder>>>,
}

/// Pipes one source stream into one or more sinks
#[derive(Clone)]
pub struct MediaPatch {
    inner: Arc<PatchInner>,
}

struct PatchInner {
    source: Arc<dyn MediaStream>,
    sinks: RwLock<Vec<SinkEntry>>,
    filters: SyncMutex<Vec<FilterEntry>>,
    task: SyncMutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    bypass: AtomicBool,
    next_filter_id: AtomicU64,
    frames_forwarded: AtomicU64,
    frames_dropped: AtomicU64,
}

impl MediaPatch {
    /// Create a patch for an open source
    pub fn new(source: Arc<dyn MediaStream>) -> Self {
        Self {
            inner: Arc::new(PatchInner {
                source,
                sinks: RwLock::new(Vec::new()),
                filters: SyncMutex::new(Vec::new()),
                task: SyncMutex::new(None),
                running: AtomicBool::new(false),
                bypass: AtomicBool::new(false),
                next_filter_id: AtomicU64::new(1),
                frames_forwarded: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// The patch's source stream
    pub fn source(&self) -> &Arc<dyn MediaStream> {
        &self.inner.source
    }

    /// Attach a sink. Source and sink must both be open; a transcoder is
    /// inserted when the formats differ.
    pub async fn add_sink(
        &self,
        sink: Arc<dyn MediaStream>,
        transcoders: &TranscoderRegistry,
    ) -> Result<()> {
        if !self.inner.source.is_open() || !sink.is_open() {
            return Err(Error::StreamNotOpen);
        }
        let source_format = self.inner.source.format();
        let sink_format = sink.format();
        let transcoder = if source_format.name() == sink_format.name() {
            None
        } else {
            debug!(
                "Inserting transcoder {} -> {}",
                source_format.name(),
                sink_format.name()
            );
            Some(SyncMutex::new(transcoders.create(&source_format, &sink_format)?))
        };

        // Write lock: waits for any in-flight frame dispatch to finish
        self.inner.sinks.write().await.push(SinkEntry { stream: sink, transcoder });
        Ok(())
    }

    /// Detach a sink by identity
    pub async fn remove_sink(&self, sink: &Arc<dyn MediaStream>) {
        self.inner
            .sinks
            .write()
            .await
            .retain(|entry| !Arc::ptr_eq(&entry.stream, sink));
    }

    /// Number of attached sinks
    pub async fn sink_count(&self) -> usize {
        self.inner.sinks.read().await.len()
    }

    /// Install a filter keyed by the format it applies to
    pub fn add_filter(&self, format: &MediaFormat, filter: FilterFn) -> FilterHandle {
        let id = self.inner.next_filter_id.fetch_add(1, Ordering::Relaxed);
        self.inner.filters.lock().push(FilterEntry {
            id,
            format_name: format.name().to_string(),
            filter,
        });
        FilterHandle(id)
    }

    /// Remove one filter by handle
    pub fn remove_filter(&self, handle: FilterHandle) -> bool {
        let mut filters = self.inner.filters.lock();
        let before = filters.len();
        filters.retain(|entry| entry.id != handle.0);
        filters.len() != before
    }

    /// Remove every filter bound to a format; used when the stream's
    /// format changes so stale filters do not run on new frames
    pub fn remove_filters_for_format(&self, format_name: &str) -> usize {
        let mut filters = self.inner.filters.lock();
        let before = filters.len();
        filters.retain(|entry| entry.format_name != format_name);
        before - filters.len()
    }

    /// Skip the filter chain entirely (two-RTP-leg forwarding)
    pub fn set_bypass(&self, bypass: bool) {
        self.inner.bypass.store(bypass, Ordering::Relaxed);
    }

    /// Frames delivered to sinks
    pub fn frames_forwarded(&self) -> u64 {
        self.inner.frames_forwarded.load(Ordering::Relaxed)
    }

    /// Frames swallowed by filters
    pub fn frames_dropped(&self) -> u64 {
        self.inner.frames_dropped.load(Ordering::Relaxed)
    }

    /// True while the active pull loop runs
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Relaxed)
    }

    /// Start the active pull loop: read the source, filter, fan out
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::Relaxed) {
            return;
        }
        let patch = self.clone();
        let handle = tokio::spawn(async move {
            debug!("Media patch thread started");
            while patch.inner.running.load(Ordering::Relaxed) {
                match patch.inner.source.read_packet().await {
                    Ok(packet) => {
                        if let Err(e) = patch.push_packet(packet).await {
                            warn!("Patch dispatch failed: {}", e);
                        }
                    }
                    Err(Error::StreamClosed) | Err(Error::StreamNotOpen) => break,
                    Err(e) => {
                        warn!("Patch source read failed: {}", e);
                        break;
                    }
                }
            }
            patch.inner.running.store(false, Ordering::Relaxed);
            debug!("Media patch thread ended");
        });
        *self.inner.task.lock() = Some(handle);
    }

    /// Passive mode: the caller pushes a frame through filters and sinks
    pub async fn push_packet(&self, mut packet: RtpPacket) -> Result<()> {
        if !self.inner.bypass.load(Ordering::Relaxed) {
            // Snapshot the chain so filters run without the lock held
            let filters: Vec<FilterFn> = {
                let entries = self.inner.filters.lock();
                entries.iter().map(|entry| entry.filter.clone()).collect()
            };
            for filter in filters {
                if filter(&mut packet) == FilterAction::Drop {
                    self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
            }
        }

        // Read lock held across delivery: sink changes wait for us
        let sinks = self.inner.sinks.read().await;
        for entry in sinks.iter() {
            let frames = match &entry.transcoder {
                Some(transcoder) => match transcoder.lock().transcode(packet.clone()) {
                    Ok(frames) => frames,
                    Err(e) => {
                        warn!("Transcode failed: {}", e);
                        continue;
                    }
                },
                None => vec![packet.clone()],
            };
            for frame in frames {
                if let Err(e) = entry.stream.write_packet(frame).await {
                    trace!("Sink write failed: {}", e);
                }
            }
        }
        drop(sinks);

        self.inner.frames_forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Stop the loop and close source and sinks
    pub async fn close(&self) {
        self.inner.running.store(false, Ordering::Relaxed);
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        self.inner.source.close().await;
        let sinks = self.inner.sinks.read().await;
        for entry in sinks.iter() {
            entry.stream.close().await;
        }
        debug!("Media patch closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::registry::standard_formats;
    use crate::format::names;
    use crate::stream::ChannelMediaStream;
    use bytes::Bytes;
    use tandem_rtp_core::packet::RtpHeader;
    use std::time::Duration;

    fn format(name: &str) -> MediaFormat {
        standard_formats().into_iter().find(|f| f.name() == name).unwrap()
    }

    fn frame(seq: u16, payload: &'static [u8]) -> RtpPacket {
        RtpPacket::new(RtpHeader::new(0, seq, seq as u32 * 160, 1), Bytes::from_static(payload))
    }

    async fn open_source() -> (Arc<ChannelMediaStream>, tokio::sync::mpsc::Sender<RtpPacket>) {
        let (source, feed) = ChannelMediaStream::source(format(names::PCM16), 1, 16);
        source.open().await.unwrap();
        (source, feed)
    }

    async fn open_sink() -> (Arc<ChannelMediaStream>, tokio::sync::mpsc::Receiver<RtpPacket>) {
        let (sink, observe) = ChannelMediaStream::sink(format(names::PCM16), 1, 16);
        sink.open().await.unwrap();
        (sink, observe)
    }

    #[tokio::test]
    async fn test_fan_out_to_two_sinks() {
        let (source, feed) = open_source().await;
        let (sink_a, mut observe_a) = open_sink().await;
        let (sink_b, mut observe_b) = open_sink().await;

        let patch = MediaPatch::new(source);
        let transcoders = TranscoderRegistry::new();
        patch.add_sink(sink_a, &transcoders).await.unwrap();
        patch.add_sink(sink_b, &transcoders).await.unwrap();
        patch.start();

        feed.send(frame(1, b"x")).await.unwrap();

        let a = tokio::time::timeout(Duration::from_secs(1), observe_a.recv()).await.unwrap().unwrap();
        let b = tokio::time::timeout(Duration::from_secs(1), observe_b.recv()).await.unwrap().unwrap();
        assert_eq!(a.header.sequence_number, 1);
        assert_eq!(b.header.sequence_number, 1);
        assert_eq!(patch.frames_forwarded(), 1);

        patch.close().await;
        assert!(!patch.is_running());
    }

    #[tokio::test]
    async fn test_filter_modifies_and_drops() {
        let (source, _feed) = open_source().await;
        let (sink, mut observe) = open_sink().await;

        let patch = MediaPatch::new(source);
        patch.add_sink(sink, &TranscoderRegistry::new()).await.unwrap();

        // Drop frames with odd sequence numbers, tag the rest
        patch.add_filter(
            &format(names::PCM16),
            Arc::new(|packet: &mut RtpPacket| {
                if packet.header.sequence_number % 2 == 1 {
                    FilterAction::Drop
                } else {
                    packet.header.marker = true;
                    FilterAction::Forward
                }
            }),
        );

        patch.push_packet(frame(1, b"odd")).await.unwrap();
        patch.push_packet(frame(2, b"even")).await.unwrap();

        let got = observe.recv().await.unwrap();
        assert_eq!(got.header.sequence_number, 2);
        assert!(got.header.marker);
        assert_eq!(patch.frames_dropped(), 1);
        assert_eq!(patch.frames_forwarded(), 1);
    }

    #[tokio::test]
    async fn test_bypass_skips_filters() {
        let (source, _feed) = open_source().await;
        let (sink, mut observe) = open_sink().await;

        let patch = MediaPatch::new(source);
        patch.add_sink(sink, &TranscoderRegistry::new()).await.unwrap();
        patch.add_filter(&format(names::PCM16), Arc::new(|_: &mut RtpPacket| FilterAction::Drop));
        patch.set_bypass(true);

        patch.push_packet(frame(1, b"through")).await.unwrap();
        assert_eq!(observe.recv().await.unwrap().header.sequence_number, 1);
    }

    #[tokio::test]
    async fn test_filter_removal_by_format() {
        let (source, _feed) = open_source().await;
        let patch = MediaPatch::new(source);
        patch.add_filter(&format(names::PCM16), Arc::new(|_: &mut RtpPacket| FilterAction::Drop));
        patch.add_filter(&format(names::PCM16), Arc::new(|_: &mut RtpPacket| FilterAction::Drop));
        patch.add_filter(&format(names::PCMU), Arc::new(|_: &mut RtpPacket| FilterAction::Drop));

        assert_eq!(patch.remove_filters_for_format(names::PCM16), 2);
        assert_eq!(patch.remove_filters_for_format(names::PCM16), 0);
    }

    #[tokio::test]
    async fn test_filter_removal_by_handle() {
        let (source, _feed) = open_source().await;
        let (sink, mut observe) = open_sink().await;
        let patch = MediaPatch::new(source);
        patch.add_sink(sink, &TranscoderRegistry::new()).await.unwrap();

        let handle =
            patch.add_filter(&format(names::PCM16), Arc::new(|_: &mut RtpPacket| FilterAction::Drop));
        patch.push_packet(frame(1, b"dropped")).await.unwrap();
        assert!(patch.remove_filter(handle));
        assert!(!patch.remove_filter(handle));
        patch.push_packet(frame(2, b"passes")).await.unwrap();

        assert_eq!(observe.recv().await.unwrap().header.sequence_number, 2);
    }

    #[tokio::test]
    async fn test_transcoder_inserted_for_format_change() {
        struct Doubler;
        impl Transcoder for Doubler {
            fn transcode(&mut self, packet: RtpPacket) -> Result<Vec<RtpPacket>> {
                Ok(vec![packet.clone(), packet])
            }
        }

        let (source, _feed) = open_source().await;
        let (sink, mut observe) = ChannelMediaStream::sink(format(names::PCMU), 1, 16);
        sink.open().await.unwrap();

        let transcoders = TranscoderRegistry::new();
        transcoders.register(
            names::PCM16,
            names::PCMU,
            Arc::new(|| Box::new(Doubler) as Box<dyn Transcoder>),
        );

        let patch = MediaPatch::new(source);
        patch.add_sink(sink, &transcoders).await.unwrap();
        patch.push_packet(frame(1, b"pcm")).await.unwrap();

        // The doubling transcoder produced two frames
        assert!(observe.recv().await.is_some());
        assert!(observe.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_missing_transcoder_rejected() {
        let (source, _feed) = open_source().await;
        let (sink, _observe) = ChannelMediaStream::sink(format(names::PCMU), 1, 16);
        sink.open().await.unwrap();

        let patch = MediaPatch::new(source);
        let result = patch.add_sink(sink, &TranscoderRegistry::new()).await;
        assert!(matches!(result, Err(Error::NoTranscoder(_, _))));
    }

    #[tokio::test]
    async fn test_unopened_sink_rejected() {
        let (source, _feed) = open_source().await;
        let (sink, _observe) = ChannelMediaStream::sink(format(names::PCM16), 1, 16);
        // Sink never opened
        let patch = MediaPatch::new(source);
        assert!(matches!(
            patch.add_sink(sink, &TranscoderRegistry::new()).await,
            Err(Error::StreamNotOpen)
        ));
    }
}
