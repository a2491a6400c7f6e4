//! TCP transport with TPKT framing

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::address::{TransportAddress, TransportProto};
use crate::error::{Error, Result};
use crate::framing::Framing;
use crate::transport::{FramedStream, Transport};
use crate::TransportTimeouts;

/// TCP transport carrying TPKT (or length-prefix) framed PDUs
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TcpTransportInner>,
}

struct TcpTransportInner {
    stream: FramedStream<TcpStream>,
    local: SocketAddr,
    remote: SocketAddr,
}

impl TcpTransport {
    /// Connect to a remote signalling port.
    ///
    /// The connect itself is bounded by the signalling timeout.
    pub async fn connect(
        remote: SocketAddr,
        framing: Framing,
        timeouts: TransportTimeouts,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(timeouts.signalling, TcpStream::connect(remote))
            .await
            .map_err(|_| Error::Timeout("TCP connect"))?
            .map_err(|e| Error::ConnectFailed(e.to_string()))?;
        info!("TCP transport connected to {}", remote);
        Self::from_stream(stream, framing, timeouts)
    }

    /// Wrap an accepted stream
    pub fn from_stream(
        stream: TcpStream,
        framing: Framing,
        timeouts: TransportTimeouts,
    ) -> Result<Self> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;

        // Nagle off: signalling PDUs are written whole and latency matters
        stream.set_nodelay(true)?;

        debug!("TCP transport {} <-> {}", local, remote);
        Ok(Self {
            inner: Arc::new(TcpTransportInner {
                stream: FramedStream::new(stream, framing, timeouts.idle + Duration::from_secs(10)),
                local,
                remote,
            }),
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_address(&self) -> Result<TransportAddress> {
        Ok(TransportAddress::from_socket_addr(TransportProto::Tcp, self.inner.local))
    }

    fn remote_address(&self) -> Option<TransportAddress> {
        Some(TransportAddress::from_socket_addr(TransportProto::Tcp, self.inner.remote))
    }

    async fn read_pdu(&self) -> Result<Bytes> {
        self.inner.stream.read_pdu().await
    }

    async fn write_pdu(&self, pdu: &[u8]) -> Result<()> {
        self.inner.stream.write_pdu(pdu).await
    }

    async fn close(&self) {
        self.inner.stream.close().await;
    }

    fn is_good(&self) -> bool {
        self.inner.stream.is_good()
    }

    async fn set_keep_alive(&self, interval: Duration, payload: Bytes) -> Result<()> {
        self.inner.stream.set_keep_alive(interval, payload).await
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TcpTransport({} <-> {})", self.inner.local, self.inner.remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn transport_pair() -> (TcpTransport, TcpTransport) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            TcpTransport::from_stream(stream, Framing::Tpkt, TransportTimeouts::default()).unwrap()
        });

        let client = TcpTransport::connect(addr, Framing::Tpkt, TransportTimeouts::default())
            .await
            .unwrap();
        let server = accept.await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_pdu_round_trip() {
        let (client, server) = transport_pair().await;

        client.write_pdu(b"setup-pdu").await.unwrap();
        let pdu = server.read_pdu().await.unwrap();
        assert_eq!(&pdu[..], b"setup-pdu");

        server.write_pdu(b"alerting").await.unwrap();
        let pdu = client.read_pdu().await.unwrap();
        assert_eq!(&pdu[..], b"alerting");
    }

    #[tokio::test]
    async fn test_close_unblocks_reader() {
        let (client, _server) = transport_pair().await;

        let reader = client.clone();
        let read_task = tokio::spawn(async move { reader.read_pdu().await });

        // Give the read a moment to block
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close().await;

        let result = read_task.await.unwrap();
        assert!(matches!(result, Err(Error::Interrupted)));
        assert!(!client.is_good());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _server) = transport_pair().await;
        client.close().await;
        client.close().await;
        assert!(!client.is_good());
    }

    #[tokio::test]
    async fn test_bad_framing_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            use tokio::io::AsyncWriteExt;
            // Version byte 9 is not TPKT
            stream.write_all(&[9u8, 0, 0, 8, 1, 2, 3, 4]).await.unwrap();
            stream
        });

        let client = TcpTransport::connect(addr, Framing::Tpkt, TransportTimeouts::default())
            .await
            .unwrap();
        let _held = accept.await.unwrap();

        let result = client.read_pdu().await;
        assert!(matches!(result, Err(Error::ProtocolFailure(_))));
        assert!(!client.is_good());
    }
}
