//! Transport layer for the tandem telephony stack
//!
//! This crate provides the address grammar, framed signalling transports
//! (TCP with TPKT framing, UDP, TLS, WebSocket), listeners, NAT traversal
//! methods and port range allocation used by the media and call layers.

pub mod address;
pub mod error;
pub mod framing;
pub mod listener;
pub mod nat;
pub mod ports;
pub mod transport;

pub use address::{TransportAddress, TransportProto};
pub use error::{Error, Result};
pub use framing::Framing;
pub use listener::{Listener, ListenerConfig, ListenerEvent, ThreadMode};
pub use nat::{NatMethod, NatMethods};
pub use ports::PortRange;
pub use transport::{Transport, TransportEvent};
pub use transport::tcp::TcpTransport;
pub use transport::udp::UdpTransport;
#[cfg(feature = "tls")]
pub use transport::tls::{TlsContext, TlsTransport};
#[cfg(feature = "ws")]
pub use transport::ws::WebSocketTransport;

use std::time::Duration;

/// Default idle time before an inactive signalling transport is closed.
pub const DEFAULT_TRANSPORT_IDLE_TIME: Duration = Duration::from_secs(60);

/// Default bound on protocol turns (TCP connect, first PDU, negotiation).
pub const DEFAULT_SIGNALLING_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum permitted keep-alive interval.
pub const MIN_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Common timeout knobs shared by the transport implementations.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TransportTimeouts {
    /// Close a signalling transport after this much inactivity
    pub idle: Duration,

    /// Bound on a single protocol turn (connect, whole-PDU read)
    pub signalling: Duration,
}

impl Default for TransportTimeouts {
    fn default() -> Self {
        Self {
            idle: DEFAULT_TRANSPORT_IDLE_TIME,
            signalling: DEFAULT_SIGNALLING_TIMEOUT,
        }
    }
}

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        Error, Result, Transport, TransportEvent, TransportAddress, TransportProto,
        Framing, Listener, ListenerEvent, ThreadMode, NatMethod, NatMethods, PortRange,
        TcpTransport, UdpTransport,
    };
    #[cfg(feature = "tls")]
    pub use crate::{TlsContext, TlsTransport};
    #[cfg(feature = "ws")]
    pub use crate::WebSocketTransport;
}
