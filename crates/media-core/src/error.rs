//! Error types for the media plane

use thiserror::Error;

/// Errors produced by formats, streams and patches
#[derive(Error, Debug)]
pub enum Error {
    /// Lookup by name found nothing
    #[error("Media format \"{0}\" not registered")]
    FormatNotFound(String),

    /// A different format already holds this name
    #[error("Media format \"{0}\" already registered with different definition")]
    DuplicateFormat(String),

    /// Two formats could not be merged
    #[error("Cannot merge option \"{0}\": {1}")]
    MergeConflict(String, &'static str),

    /// Operation on a stream that is not open
    #[error("Media stream not open")]
    StreamNotOpen,

    /// Stream was closed under the caller
    #[error("Media stream closed")]
    StreamClosed,

    /// Wrong direction, e.g. read on a sink
    #[error("Operation not supported by this stream: {0}")]
    WrongDirection(&'static str),

    /// No transcoder between two formats
    #[error("No transcoder from \"{0}\" to \"{1}\"")]
    NoTranscoder(String, String),

    /// Patch level failure
    #[error("Media patch error: {0}")]
    Patch(String),

    /// Underlying RTP failure
    #[error("RTP error: {0}")]
    Rtp(#[from] tandem_rtp_core::Error),
}

/// Result type for media operations
pub type Result<T> = std::result::Result<T, Error>;
