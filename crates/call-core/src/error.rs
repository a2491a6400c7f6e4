//! Call clearing reasons and crate errors

use thiserror::Error;

/// Why a call (or one of its connections) ended.
///
/// Every completion maps to exactly one of these; the first reason set on
/// a connection wins and later setters are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CallEndReason {
    /// Local side cleared the call
    LocalUser,
    /// Remote side cleared the call
    RemoteUser,
    /// Caller gave up before answer
    CallerAbort,
    /// Application refused to answer
    AnswerDenied,
    /// Ring timeout
    NoAnswer,
    /// Call was forwarded elsewhere
    CallForwarded,
    /// Cleared to accept a waiting call
    AcceptingCallWaiting,
    /// Remote did not accept the call attempt
    NoAccept,
    /// Remote refused
    Refusal,
    /// No such user at the destination
    NoUser,
    /// No endpoint registered for the destination scheme
    NoEndPoint,
    /// Destination host is off line
    HostOffline,
    /// Destination unreachable
    Unreachable,
    /// Transient failure, retry may work
    TemporaryFailure,
    /// Bandwidth budget exhausted
    NoBandwidth,
    /// Capability negotiation found no common media
    CapabilityExchange,
    /// Line interface found no dial tone
    NoDialTone,
    /// Line interface found no ring back tone
    NoRingBackTone,
    /// Service out of order
    OutOfService,
    /// Transport layer failed mid-call
    TransportFail,
    /// Transport connect failed
    ConnectFail,
    /// Media setup or flow failed
    MediaFailed,
    /// TLS certificate rejected
    CertificateAuthority,
    /// Destination address did not parse
    IllegalAddress,
    /// Gatekeeper refused
    Gatekeeper,
    /// Gatekeeper admission failed
    GkAdmissionFailed,
    /// Security policy refused the call
    SecurityDenial,
    /// Conference identifier not valid
    InvalidConferenceId,
    /// Configured duration limit reached
    DurationLimit,
    /// Local end busy
    LocalBusy,
    /// Local resources exhausted
    LocalCongestion,
    /// Remote end busy
    RemoteBusy,
    /// Remote resources exhausted
    RemoteCongestion,
    /// Opaque Q.931 cause carried through from the wire
    Q931Cause(u8),
}

impl CallEndReason {
    /// The reason the peer connection is released with when this side
    /// goes first
    pub fn as_peer_reason(self) -> CallEndReason {
        match self {
            CallEndReason::LocalUser => CallEndReason::RemoteUser,
            other => other,
        }
    }

    /// Standard Q.931 cause code for this reason, for interop logging
    pub fn q931_cause(self) -> u8 {
        match self {
            CallEndReason::LocalUser | CallEndReason::RemoteUser => 16, // Normal clearing
            CallEndReason::CallerAbort => 16,
            CallEndReason::NoAnswer => 18,
            CallEndReason::AnswerDenied | CallEndReason::Refusal => 21,
            CallEndReason::NoUser => 1, // Unallocated number
            CallEndReason::LocalBusy | CallEndReason::RemoteBusy => 17,
            CallEndReason::LocalCongestion | CallEndReason::RemoteCongestion => 42,
            CallEndReason::Unreachable | CallEndReason::HostOffline => 3,
            CallEndReason::NoBandwidth => 34,
            CallEndReason::CapabilityExchange | CallEndReason::MediaFailed => 65,
            CallEndReason::TemporaryFailure => 41,
            CallEndReason::Q931Cause(cause) => cause,
            _ => 31, // Normal, unspecified
        }
    }
}

impl std::fmt::Display for CallEndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallEndReason::Q931Cause(cause) => {
                write!(f, "Call cleared with Q.931 cause code {}", cause)
            }
            other => write!(f, "{:?}", other),
        }
    }
}

/// Errors from the call control layer
#[derive(Error, Debug)]
pub enum Error {
    /// Party string had no scheme or no endpoint handles it
    #[error("No endpoint for party \"{0}\"")]
    NoEndPoint(String),

    /// Routing produced nothing
    #[error("No route to destination \"{0}\"")]
    NoRoute(String),

    /// Token lookup failed
    #[error("Unknown token \"{0}\"")]
    UnknownToken(String),

    /// A phase transition the machine forbids
    #[error("Invalid phase transition {from:?} -> {to:?}")]
    InvalidPhaseTransition {
        /// Phase the connection was in
        from: crate::phase::Phase,
        /// Phase that was requested
        to: crate::phase::Phase,
    },

    /// Bandwidth budget would be exceeded
    #[error("Insufficient bandwidth: need {needed} bps, {available} bps available")]
    NoBandwidth {
        /// Requested allocation
        needed: u64,
        /// Remaining budget
        available: u64,
    },

    /// Manager is clearing all calls; no new ones allowed
    #[error("Manager is clearing all calls")]
    ClearingAll,

    /// Connection is released or releasing
    #[error("Connection released")]
    ConnectionReleased,

    /// No common media format between the legs
    #[error("No common media format for {0}")]
    NoCommonFormats(String),

    /// Media layer failure
    #[error("Media error: {0}")]
    Media(#[from] tandem_media_core::Error),

    /// RTP layer failure
    #[error("RTP error: {0}")]
    Rtp(#[from] tandem_rtp_core::Error),

    /// Transport layer failure
    #[error("Transport error: {0}")]
    Transport(#[from] tandem_transport_core::Error),

    /// Catch-all for endpoint specific failures
    #[error("{0}")]
    Other(String),
}

/// Result type for call control operations
pub type Result<T> = std::result::Result<T, Error>;
