//! Signalling listeners
//!
//! A listener accepts inbound transports on a bound address and hands each
//! one to the accept callback according to the configured thread mode.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::address::{HostPart, TransportAddress, TransportProto};
use crate::error::{Error, Result};
use crate::framing::Framing;
use crate::nat::NatMethods;
use crate::transport::tcp::TcpTransport;
use crate::transport::Transport;
use crate::TransportTimeouts;

#[cfg(feature = "tls")]
use crate::transport::tls::{TlsContext, TlsTransport};
#[cfg(feature = "ws")]
use crate::transport::ws::WebSocketTransport;

/// How accepted transports are dispatched to the callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadMode {
    /// Run the callback on a fresh task per accepted transport
    SpawnNew,
    /// Hand the accepted transport off and keep accepting immediately.
    /// Under the async runtime this dispatches like `SpawnNew`; the mode is
    /// kept for configuration compatibility.
    HandOff,
    /// Run the callback inline; accepts are serialized behind it
    Single,
}

/// Event emitted for observability of the accept loop
#[derive(Debug)]
pub enum ListenerEvent {
    /// A transport was accepted from this peer
    Accepted(SocketAddr),
    /// The accept loop terminated
    Closed,
}

/// Callback invoked with each accepted transport
pub type AcceptCallback =
    Arc<dyn Fn(Arc<dyn Transport>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Everything a listener needs besides its bind address
#[derive(Clone)]
pub struct ListenerConfig {
    /// Dispatch policy for accepted transports
    pub mode: ThreadMode,

    /// Framing applied to accepted reliable transports
    pub framing: Framing,

    /// Idle and signalling timeouts for accepted transports
    pub timeouts: TransportTimeouts,

    /// NAT methods consulted by `local_address_for`
    pub nat_methods: NatMethods,

    /// Credentials for tls listeners; accepts are dropped without one
    #[cfg(feature = "tls")]
    pub tls: Option<TlsContext>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            mode: ThreadMode::SpawnNew,
            framing: Framing::Tpkt,
            timeouts: TransportTimeouts::default(),
            nat_methods: NatMethods::new(),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

/// Accepts inbound signalling transports
pub struct Listener {
    local: SocketAddr,
    proto: TransportProto,
    bound_wildcard: bool,
    closed: Arc<AtomicBool>,
    accept_task: JoinHandle<()>,
    nat_methods: NatMethods,
}

impl Listener {
    /// Bind and start accepting.
    ///
    /// The address must be tcp, tls or ws; UDP traffic does not use a
    /// stream listener. A wildcard host binds all interfaces and
    /// `local_address_for` later selects a reachable one per peer.
    pub async fn open(
        address: &TransportAddress,
        callback: AcceptCallback,
        config: ListenerConfig,
    ) -> Result<Self> {
        let port = address.port.unwrap_or(0);
        let bind_addr: SocketAddr = match &address.host {
            HostPart::Ip(ip) => SocketAddr::new(*ip, port),
            HostPart::Any | HostPart::Interface(_) => {
                SocketAddr::new(IpAddr::from([0u8, 0, 0, 0]), port)
            }
            HostPart::Name(name) => {
                return Err(Error::InvalidAddress(
                    name.clone(),
                    "cannot listen on a hostname",
                ))
            }
        };

        let proto = address.proto;
        match proto {
            TransportProto::Tcp | TransportProto::Tls | TransportProto::Ws | TransportProto::Wss => {}
            _ => {
                return Err(Error::InvalidAddress(
                    address.to_string(),
                    "listener requires a stream protocol",
                ))
            }
        }

        let tcp_listener = TcpListener::bind(bind_addr).await?;
        let local = tcp_listener.local_addr()?;
        info!("Listening for {} on {}", proto, local);

        let closed = Arc::new(AtomicBool::new(false));
        let closed_flag = closed.clone();
        let nat_methods = config.nat_methods.clone();

        let accept_task = tokio::spawn(async move {
            while !closed_flag.load(Ordering::Relaxed) {
                let (stream, peer) = match tcp_listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        if closed_flag.load(Ordering::Relaxed) {
                            break;
                        }
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                debug!("Accepted {} connection from {}", proto, peer);

                let transport: Arc<dyn Transport> = match proto {
                    TransportProto::Tcp => {
                        match TcpTransport::from_stream(
                            stream,
                            config.framing,
                            config.timeouts.clone(),
                        ) {
                            Ok(t) => Arc::new(t),
                            Err(e) => {
                                warn!("Could not wrap accepted stream: {}", e);
                                continue;
                            }
                        }
                    }
                    #[cfg(feature = "tls")]
                    TransportProto::Tls => {
                        let Some(ref context) = config.tls else {
                            warn!("No TLS context configured, dropping {}", peer);
                            continue;
                        };
                        match TlsTransport::accept(
                            stream,
                            context,
                            config.framing,
                            config.timeouts.clone(),
                        )
                        .await
                        {
                            Ok(t) => Arc::new(t),
                            Err(e) => {
                                warn!("TLS accept from {} failed: {}", peer, e);
                                continue;
                            }
                        }
                    }
                    #[cfg(feature = "ws")]
                    TransportProto::Ws | TransportProto::Wss => {
                        match WebSocketTransport::accept(stream, config.timeouts.clone()).await {
                            Ok(t) => Arc::new(t),
                            Err(e) => {
                                warn!("WebSocket accept from {} failed: {}", peer, e);
                                continue;
                            }
                        }
                    }
                    _ => continue,
                };

                match config.mode {
                    ThreadMode::SpawnNew | ThreadMode::HandOff => {
                        let cb = callback.clone();
                        tokio::spawn(async move { cb(transport).await });
                    }
                    ThreadMode::Single => callback(transport).await,
                }
            }
            debug!("Accept loop on {} terminated", local);
        });

        Ok(Self {
            local,
            proto,
            bound_wildcard: address.is_wildcard() || matches!(address.host, HostPart::Interface(_)),
            closed,
            accept_task,
            nat_methods,
        })
    }

    /// Address the listener is bound to
    pub fn local_address(&self) -> TransportAddress {
        TransportAddress::from_socket_addr(self.proto, self.local)
    }

    /// An address for this listener that the given peer can reach.
    ///
    /// For wildcard binds the kernel routing table picks the interface
    /// facing the peer; NAT methods may then substitute the external
    /// address.
    pub async fn local_address_for(&self, peer: SocketAddr) -> TransportAddress {
        let mut addr = self.local;
        if self.bound_wildcard || addr.ip().is_unspecified() {
            if let Some(interface_ip) = route_interface_for(peer.ip()) {
                addr.set_ip(interface_ip);
            }
        }
        let translated = self.nat_methods.translate_address(addr, peer.ip()).await;
        TransportAddress::from_socket_addr(self.proto, translated)
    }

    /// Stop accepting. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            self.accept_task.abort();
            info!("Closed listener on {}", self.local);
        }
    }

    /// True until `close()` is called
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Relaxed)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Interface the kernel would route towards `peer`.
///
/// Implemented with a connected (but never used) UDP socket; no packet is
/// sent.
pub fn route_interface_for(peer: IpAddr) -> Option<IpAddr> {
    let probe = std::net::UdpSocket::bind(if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }).ok()?;
    probe.connect(SocketAddr::new(peer, 9)).ok()?;
    probe.local_addr().ok().map(|a| a.ip())
}
