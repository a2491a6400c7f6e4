//! Media plane for the tandem telephony stack
//!
//! Media formats and their negotiation rules, the source/sink stream
//! abstraction, the patch that pipes one source into one or more sinks
//! through a filter chain, and the audio filters (silence detection, DTMF
//! detection and generation, recording taps).

pub mod dtmf;
pub mod error;
pub mod filters;
pub mod format;
pub mod stream;

pub use dtmf::{digit_to_event, event_to_digit, Rfc2833Event};
pub use error::{Error, Result};
pub use filters::{
    recording_tap, DtmfDetector, DtmfInjector, SilenceDetectMode, SilenceDetector,
};
pub use format::list::OrderedFormatList;
pub use format::registry::FormatRegistry;
pub use format::{FormatOption, MediaFormat, MediaType, MergePolicy, PayloadTypeSpec};
pub use stream::patch::{
    FilterAction, FilterFn, FilterHandle, MediaPatch, PassthroughTranscoder, Transcoder,
    TranscoderRegistry,
};
pub use stream::{
    ChannelMediaStream, MediaStream, NullMediaStream, RecordingSink, RtpMediaStream,
    StreamCommand,
};
