//! Error types for the transport layer

use std::net::SocketAddr;
use thiserror::Error;

/// Errors produced by transports, listeners and allocators
#[derive(Error, Debug)]
pub enum Error {
    /// Address string did not match the `proto$host:port` grammar
    #[error("Invalid transport address \"{0}\": {1}")]
    InvalidAddress(String, &'static str),

    /// Framing header on a reliable transport was malformed
    #[error("Protocol failure: {0}")]
    ProtocolFailure(&'static str),

    /// A read was unblocked by a concurrent close
    #[error("Operation interrupted by close")]
    Interrupted,

    /// Transport already closed
    #[error("Transport closed")]
    TransportClosed,

    /// Remote end is not connected / connect failed
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// A protocol turn exceeded the signalling timeout
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// No port left in the configured range
    #[error("Port range {base}-{max} exhausted")]
    PortRangeExhausted {
        /// First port of the range
        base: u16,
        /// Last port of the range
        max: u16,
    },

    /// Packet arrived from an unexpected peer and was dropped
    #[error("Packet from unexpected address {0}")]
    UnexpectedPeer(SocketAddr),

    /// TLS context could not be built
    #[cfg(feature = "tls")]
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    /// WebSocket upgrade failed
    #[cfg(feature = "ws")]
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Underlying socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;
