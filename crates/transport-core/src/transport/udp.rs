//! UDP transport
//!
//! One PDU per datagram. The remote transmit address is learned from the
//! first packet and locked; later packets from other peers are dropped
//! unless `allow_remote_address_change` was set during session setup
//! (symmetric RTP learning for SIP).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::address::{TransportAddress, TransportProto};
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Largest datagram accepted
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// UDP transport with remote-address locking
#[derive(Clone)]
pub struct UdpTransport {
    inner: Arc<UdpTransportInner>,
}

struct UdpTransportInner {
    socket: UdpSocket,
    local: SocketAddr,
    remote: Mutex<Option<SocketAddr>>,
    remote_locked: AtomicBool,
    allow_remote_address_change: AtomicBool,
    closed: AtomicBool,
    close_notify: Notify,
    packets_from_wrong_peer: AtomicU64,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind to a local address; the remote is learned from traffic
    pub async fn bind(local: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        let local = socket.local_addr()?;
        info!("UDP transport bound to {}", local);
        Ok(Self {
            inner: Arc::new(UdpTransportInner {
                socket,
                local,
                remote: Mutex::new(None),
                remote_locked: AtomicBool::new(false),
                allow_remote_address_change: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                close_notify: Notify::new(),
                packets_from_wrong_peer: AtomicU64::new(0),
                keep_alive: Mutex::new(None),
            }),
        })
    }

    /// Bind and set an initial remote for outbound traffic.
    ///
    /// The first inbound packet still locks the transmit address, which may
    /// differ from `remote` when the peer is behind a NAT.
    pub async fn bind_connected(local: SocketAddr, remote: SocketAddr) -> Result<Self> {
        let transport = Self::bind(local).await?;
        *transport.inner.remote.lock() = Some(remote);
        Ok(transport)
    }

    /// Permit the next inbound packet to move the remote transmit address
    pub fn set_allow_remote_address_change(&self, allow: bool) {
        self.inner.allow_remote_address_change.store(allow, Ordering::Relaxed);
    }

    /// Set the DSCP marking on outgoing datagrams (media QoS)
    pub fn set_dscp(&self, dscp: u8) -> Result<()> {
        let socket = socket2::SockRef::from(&self.inner.socket);
        socket.set_tos((dscp as u32) << 2)?;
        Ok(())
    }

    /// Datagrams dropped because they came from an unexpected peer
    pub fn packets_from_wrong_peer(&self) -> u64 {
        self.inner.packets_from_wrong_peer.load(Ordering::Relaxed)
    }

    /// Read the next datagram along with its source address.
    ///
    /// Unlike `read_pdu` this does not filter by remote, letting callers
    /// that multiplex peers (listeners) see every packet.
    pub async fn recv_from(&self) -> Result<(Bytes, SocketAddr)> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(Error::TransportClosed);
        }
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        tokio::select! {
            result = self.inner.socket.recv_from(&mut buf) => {
                let (len, src) = result?;
                buf.truncate(len);
                Ok((Bytes::from(buf), src))
            }
            _ = self.inner.close_notify.notified() => Err(Error::Interrupted),
        }
    }

    /// Send a datagram to an explicit destination
    pub async fn send_to(&self, pdu: &[u8], dest: SocketAddr) -> Result<()> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(Error::TransportClosed);
        }
        match self.inner.socket.send_to(pdu, dest).await {
            Ok(_) => Ok(()),
            // Late ICMP errors on UDP are not fatal to the session
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset
                || e.kind() == std::io::ErrorKind::ConnectionRefused => {
                debug!("Ignoring transient UDP send error to {}: {}", dest, e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn accept_source(&self, src: SocketAddr) -> bool {
        let mut remote = self.inner.remote.lock();
        match *remote {
            None => {
                *remote = Some(src);
                self.inner.remote_locked.store(true, Ordering::Relaxed);
                debug!("UDP remote transmit address locked to {}", src);
                true
            }
            Some(current) if current == src => {
                self.inner.remote_locked.store(true, Ordering::Relaxed);
                true
            }
            Some(current) => {
                // First packet wins unless a change was explicitly permitted
                let locked = self.inner.remote_locked.load(Ordering::Relaxed);
                if !locked || self.inner.allow_remote_address_change.load(Ordering::Relaxed) {
                    debug!("UDP remote transmit address changed {} -> {}", current, src);
                    *remote = Some(src);
                    self.inner.remote_locked.store(true, Ordering::Relaxed);
                    true
                } else {
                    self.inner.packets_from_wrong_peer.fetch_add(1, Ordering::Relaxed);
                    warn!("Dropped packet from {} expecting {}", src, current);
                    false
                }
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_address(&self) -> Result<TransportAddress> {
        Ok(TransportAddress::from_socket_addr(TransportProto::Udp, self.inner.local))
    }

    fn remote_address(&self) -> Option<TransportAddress> {
        self.inner
            .remote
            .lock()
            .map(|addr| TransportAddress::from_socket_addr(TransportProto::Udp, addr))
    }

    async fn read_pdu(&self) -> Result<Bytes> {
        loop {
            let (pdu, src) = self.recv_from().await?;
            if self.accept_source(src) {
                return Ok(pdu);
            }
            // Wrong peer: keep reading
        }
    }

    async fn write_pdu(&self, pdu: &[u8]) -> Result<()> {
        let dest = self
            .inner
            .remote
            .lock()
            .ok_or(Error::ConnectFailed("no remote address".to_string()))?;
        self.send_to(pdu, dest).await
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        self.inner.close_notify.notify_waiters();
        if let Some(task) = self.inner.keep_alive.lock().take() {
            task.abort();
        }
    }

    fn is_good(&self) -> bool {
        !self.inner.closed.load(Ordering::Relaxed)
    }

    async fn set_keep_alive(&self, interval: Duration, payload: Bytes) -> Result<()> {
        if !self.is_good() {
            return Err(Error::TransportClosed);
        }
        let interval = interval.max(crate::MIN_KEEP_ALIVE_INTERVAL);
        let transport = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if transport.write_pdu(&payload).await.is_err() {
                    break;
                }
            }
        });
        if let Some(old) = self.inner.keep_alive.lock().replace(task) {
            old.abort();
        }
        Ok(())
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UdpTransport({})", self.inner.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remote_lock_first_packet_wins() {
        let server = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = server.inner.local;

        let peer1 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer2 = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        peer1.send_to(b"first", server_addr).await.unwrap();
        let pdu = server.read_pdu().await.unwrap();
        assert_eq!(&pdu[..], b"first");

        // Packet from another peer must be dropped; follow with a good one
        peer2.send_to(b"intruder", server_addr).await.unwrap();
        peer1.send_to(b"second", server_addr).await.unwrap();
        let pdu = server.read_pdu().await.unwrap();
        assert_eq!(&pdu[..], b"second");
        assert_eq!(server.packets_from_wrong_peer(), 1);
    }

    #[tokio::test]
    async fn test_remote_change_permitted() {
        let server = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        server.set_allow_remote_address_change(true);
        let server_addr = server.inner.local;

        let peer1 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer2 = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        peer1.send_to(b"first", server_addr).await.unwrap();
        server.read_pdu().await.unwrap();

        peer2.send_to(b"moved", server_addr).await.unwrap();
        let pdu = server.read_pdu().await.unwrap();
        assert_eq!(&pdu[..], b"moved");
        assert_eq!(server.packets_from_wrong_peer(), 0);
    }

    #[tokio::test]
    async fn test_close_unblocks_reader() {
        let server = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let reader = server.clone();
        let task = tokio::spawn(async move { reader.read_pdu().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.close().await;
        assert!(matches!(task.await.unwrap(), Err(Error::Interrupted)));
    }

    #[tokio::test]
    async fn test_bidirectional() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpTransport::bind_connected(
            "127.0.0.1:0".parse().unwrap(),
            a.inner.local,
        )
        .await
        .unwrap();

        b.write_pdu(b"hello").await.unwrap();
        assert_eq!(&a.read_pdu().await.unwrap()[..], b"hello");

        // a learned b's address from the first packet
        a.write_pdu(b"world").await.unwrap();
        assert_eq!(&b.read_pdu().await.unwrap()[..], b"world");
    }
}
