//! NAT traversal methods
//!
//! A manager holds an ordered collection of NAT methods. For each outbound
//! UDP session the collection is asked for the first method that applies to
//! the local/peer address pair; the method then supplies translated
//! addresses to advertise in signalling, and may create the socket pair
//! itself (STUN style methods).

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::Result;

/// A pair of UDP sockets for one media session (data + control)
pub struct UdpSocketPair {
    /// RTP data socket
    pub data: UdpSocket,
    /// RTCP control socket
    pub control: UdpSocket,
    /// Externally visible address of the data socket
    pub external_data: SocketAddr,
    /// Externally visible address of the control socket
    pub external_control: SocketAddr,
}

/// One NAT traversal method (fixed router, STUN, ...)
#[async_trait]
pub trait NatMethod: Send + Sync {
    /// Method name for configuration and logs
    fn name(&self) -> &str;

    /// Larger numbers are consulted first
    fn priority(&self) -> u32 {
        0
    }

    /// Whether this method is switched on
    fn is_enabled(&self) -> bool {
        true
    }

    /// Whether this method applies to traffic from `local` towards `peer`.
    ///
    /// The usual policy: applies when the peer is off-subnet and the local
    /// address is private.
    fn is_applicable(&self, local: IpAddr, peer: IpAddr) -> bool;

    /// Translate a locally bound address to its externally visible form
    async fn translate(&self, local: SocketAddr) -> Option<SocketAddr>;

    /// Create a socket pair whose external mapping is known.
    ///
    /// Methods that only rewrite addresses return `None` and the session
    /// binds its own sockets.
    async fn create_socket_pair(&self, _bind: IpAddr, _base_port: u16) -> Option<Result<UdpSocketPair>> {
        None
    }
}

/// A NAT method with a statically configured external address.
///
/// Models the "this router always maps us to X" deployment where the
/// public address is known ahead of time.
pub struct FixedRouterNat {
    external_ip: IpAddr,
    enabled: bool,
    priority: u32,
}

impl FixedRouterNat {
    /// Create a method mapping every local address to `external_ip`
    pub fn new(external_ip: IpAddr) -> Self {
        Self { external_ip, enabled: true, priority: 10 }
    }

    /// Enable or disable without removing from the collection
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

#[async_trait]
impl NatMethod for FixedRouterNat {
    fn name(&self) -> &str {
        "Fixed"
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn is_applicable(&self, local: IpAddr, peer: IpAddr) -> bool {
        is_private(local) && !is_private(peer)
    }

    async fn translate(&self, local: SocketAddr) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.external_ip, local.port()))
    }
}

/// Ordered collection of NAT methods
#[derive(Clone, Default)]
pub struct NatMethods {
    methods: Vec<Arc<dyn NatMethod>>,
}

impl NatMethods {
    /// Empty collection; every address is used verbatim
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a method, keeping the collection sorted by descending priority
    pub fn add(&mut self, method: Arc<dyn NatMethod>) {
        self.methods.push(method);
        self.methods.sort_by(|a, b| b.priority().cmp(&a.priority()));
    }

    /// Find the first enabled method applicable to the local/peer pair
    pub fn find_applicable(&self, local: IpAddr, peer: IpAddr) -> Option<Arc<dyn NatMethod>> {
        let found = self
            .methods
            .iter()
            .find(|m| m.is_enabled() && m.is_applicable(local, peer))
            .cloned();
        if let Some(ref m) = found {
            debug!("NAT method \"{}\" applies to {} -> {}", m.name(), local, peer);
        }
        found
    }

    /// Translate `local` for advertising to `peer`, if any method applies
    pub async fn translate_address(&self, local: SocketAddr, peer: IpAddr) -> SocketAddr {
        match self.find_applicable(local.ip(), peer) {
            Some(method) => method.translate(local).await.unwrap_or(local),
            None => local,
        }
    }

    /// Number of registered methods
    pub fn len(&self) -> usize {
        self.methods.len()
    }
}

impl fmt::Debug for NatMethods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.methods.iter().map(|m| m.name().to_string()))
            .finish()
    }
}

/// RFC1918 / loopback / link-local test
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_router_translation() {
        let mut methods = NatMethods::new();
        methods.add(Arc::new(FixedRouterNat::new("203.0.113.9".parse().unwrap())));

        let local: SocketAddr = "192.168.1.10:5002".parse().unwrap();
        let peer: IpAddr = "198.51.100.1".parse().unwrap();
        let translated = methods.translate_address(local, peer).await;
        assert_eq!(translated.to_string(), "203.0.113.9:5002");
    }

    #[tokio::test]
    async fn test_not_applicable_to_private_peer() {
        let mut methods = NatMethods::new();
        methods.add(Arc::new(FixedRouterNat::new("203.0.113.9".parse().unwrap())));

        let local: SocketAddr = "192.168.1.10:5002".parse().unwrap();
        let peer: IpAddr = "192.168.1.20".parse().unwrap();
        // Same subnet, no translation
        assert_eq!(methods.translate_address(local, peer).await, local);
    }

    #[test]
    fn test_priority_ordering() {
        struct Named(&'static str, u32);

        #[async_trait]
        impl NatMethod for Named {
            fn name(&self) -> &str {
                self.0
            }
            fn priority(&self) -> u32 {
                self.1
            }
            fn is_applicable(&self, _: IpAddr, _: IpAddr) -> bool {
                true
            }
            async fn translate(&self, local: SocketAddr) -> Option<SocketAddr> {
                Some(local)
            }
        }

        let mut methods = NatMethods::new();
        methods.add(Arc::new(Named("low", 1)));
        methods.add(Arc::new(Named("high", 99)));

        let local: IpAddr = "192.168.0.1".parse().unwrap();
        let peer: IpAddr = "203.0.113.1".parse().unwrap();
        let found = methods.find_applicable(local, peer).unwrap();
        assert_eq!(found.name(), "high");
    }
}
