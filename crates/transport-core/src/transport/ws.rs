//! WebSocket transport
//!
//! Performs the HTTP upgrade over an inbound or outbound TCP stream, then
//! carries one PDU per binary message.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

use crate::address::{TransportAddress, TransportProto};
use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::TransportTimeouts;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// WebSocket transport carrying one PDU per binary message
#[derive(Clone)]
pub struct WebSocketTransport {
    inner: Arc<WebSocketTransportInner>,
}

struct WebSocketTransportInner {
    sink: Arc<Mutex<WsSink>>,
    source: Mutex<WsSource>,
    local: SocketAddr,
    remote: SocketAddr,
    secure: bool,
    closed: AtomicBool,
    close_notify: Notify,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Connect a TCP stream and upgrade it to a WebSocket
    pub async fn connect(
        remote: SocketAddr,
        path: &str,
        timeouts: TransportTimeouts,
    ) -> Result<Self> {
        let tcp = tokio::time::timeout(timeouts.signalling, TcpStream::connect(remote))
            .await
            .map_err(|_| Error::Timeout("WebSocket connect"))?
            .map_err(|e| Error::ConnectFailed(e.to_string()))?;
        let local = tcp.local_addr()?;

        let url = format!("ws://{}{}", remote, path);
        let (stream, _response) = tokio::time::timeout(
            timeouts.signalling,
            tokio_tungstenite::client_async(url.as_str(), tcp),
        )
        .await
        .map_err(|_| Error::Timeout("WebSocket upgrade"))?
        .map_err(|e| Error::WebSocket(e.to_string()))?;
        info!("WebSocket transport connected to {}", url);

        Ok(Self::from_stream(stream, local, remote, false))
    }

    /// Accept side: upgrade an inbound TCP stream
    pub async fn accept(tcp: TcpStream, timeouts: TransportTimeouts) -> Result<Self> {
        let local = tcp.local_addr()?;
        let remote = tcp.peer_addr()?;
        let stream = tokio::time::timeout(timeouts.signalling, tokio_tungstenite::accept_async(tcp))
            .await
            .map_err(|_| Error::Timeout("WebSocket upgrade"))?
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        debug!("WebSocket transport accepted from {}", remote);
        Ok(Self::from_stream(stream, local, remote, false))
    }

    fn from_stream(
        stream: WebSocketStream<TcpStream>,
        local: SocketAddr,
        remote: SocketAddr,
        secure: bool,
    ) -> Self {
        let (sink, source) = stream.split();
        Self {
            inner: Arc::new(WebSocketTransportInner {
                sink: Arc::new(Mutex::new(sink)),
                source: Mutex::new(source),
                local,
                remote,
                secure,
                closed: AtomicBool::new(false),
                close_notify: Notify::new(),
                keep_alive: Mutex::new(None),
            }),
        }
    }

    fn proto(&self) -> TransportProto {
        if self.inner.secure {
            TransportProto::Wss
        } else {
            TransportProto::Ws
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn local_address(&self) -> Result<TransportAddress> {
        Ok(TransportAddress::from_socket_addr(self.proto(), self.inner.local))
    }

    fn remote_address(&self) -> Option<TransportAddress> {
        Some(TransportAddress::from_socket_addr(self.proto(), self.inner.remote))
    }

    async fn read_pdu(&self) -> Result<Bytes> {
        if !self.is_good() {
            return Err(Error::TransportClosed);
        }
        let mut source = self.inner.source.lock().await;
        loop {
            tokio::select! {
                message = source.next() => {
                    match message {
                        Some(Ok(Message::Binary(data))) => return Ok(Bytes::from(data)),
                        Some(Ok(Message::Text(text))) => return Ok(Bytes::from(text.into_bytes())),
                        Some(Ok(Message::Close(_))) | None => {
                            self.inner.closed.store(true, Ordering::Relaxed);
                            return Err(Error::TransportClosed);
                        }
                        Some(Ok(_)) => continue, // Ping/pong handled by the library
                        Some(Err(e)) => {
                            self.inner.closed.store(true, Ordering::Relaxed);
                            return Err(Error::WebSocket(e.to_string()));
                        }
                    }
                }
                _ = self.inner.close_notify.notified() => return Err(Error::Interrupted),
            }
        }
    }

    async fn write_pdu(&self, pdu: &[u8]) -> Result<()> {
        if !self.is_good() {
            return Err(Error::TransportClosed);
        }
        let mut sink = self.inner.sink.lock().await;
        sink.send(Message::Binary(pdu.to_vec()))
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        self.inner.close_notify.notify_waiters();
        if let Some(task) = self.inner.keep_alive.lock().await.take() {
            task.abort();
        }
        let _ = self.inner.sink.lock().await.send(Message::Close(None)).await;
    }

    fn is_good(&self) -> bool {
        !self.inner.closed.load(Ordering::Relaxed)
    }

    async fn set_keep_alive(&self, interval: Duration, payload: Bytes) -> Result<()> {
        if !self.is_good() {
            return Err(Error::TransportClosed);
        }
        let interval = interval.max(crate::MIN_KEEP_ALIVE_INTERVAL);
        let sink = self.inner.sink.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut s = sink.lock().await;
                if s.send(Message::Ping(payload.to_vec())).await.is_err() {
                    break;
                }
            }
        });
        if let Some(old) = self.inner.keep_alive.lock().await.replace(task) {
            old.abort();
        }
        Ok(())
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WebSocketTransport({} <-> {})", self.inner.local, self.inner.remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_upgrade_and_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            WebSocketTransport::accept(tcp, TransportTimeouts::default()).await.unwrap()
        });

        let client = WebSocketTransport::connect(addr, "/signalling", TransportTimeouts::default())
            .await
            .unwrap();
        let server = accept.await.unwrap();

        client.write_pdu(b"invite").await.unwrap();
        assert_eq!(&server.read_pdu().await.unwrap()[..], b"invite");

        server.write_pdu(b"ok").await.unwrap();
        assert_eq!(&client.read_pdu().await.unwrap()[..], b"ok");
    }
}
