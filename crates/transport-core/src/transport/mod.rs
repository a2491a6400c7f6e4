//! Transport trait and shared plumbing
//!
//! A transport is a duplex PDU channel. Reliable variants (TCP, TLS) carry
//! TPKT or length-prefixed framing; datagram and message variants (UDP,
//! WebSocket) map one PDU to one datagram/message.

pub mod tcp;
#[cfg(feature = "tls")]
pub mod tls;
pub mod udp;
#[cfg(feature = "ws")]
pub mod ws;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::address::TransportAddress;
use crate::error::{Error, Result};
use crate::framing::Framing;
use crate::MIN_KEEP_ALIVE_INTERVAL;

/// Events emitted by transports that push inbound traffic
#[derive(Debug)]
pub enum TransportEvent {
    /// A whole PDU arrived
    PduReceived {
        /// The decoded PDU payload
        pdu: Bytes,
        /// Peer the PDU came from
        source: std::net::SocketAddr,
    },
    /// Transport hit an unrecoverable error
    Error {
        /// Human readable description
        error: String,
    },
    /// Transport was closed
    Closed,
}

/// Duplex PDU channel
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Address this transport is bound to
    fn local_address(&self) -> Result<TransportAddress>;

    /// Address of the remote end, once known
    fn remote_address(&self) -> Option<TransportAddress>;

    /// Read one whole PDU.
    ///
    /// Blocks until a PDU arrives, the idle timeout passes, or `close()`
    /// unblocks the read with `Error::Interrupted`.
    async fn read_pdu(&self) -> Result<Bytes>;

    /// Write one whole PDU
    async fn write_pdu(&self, pdu: &[u8]) -> Result<()>;

    /// Close the transport. Idempotent; concurrent readers are unblocked.
    async fn close(&self);

    /// True until closed or a fatal error occurred
    fn is_good(&self) -> bool;

    /// Periodically write an opaque payload to defeat NAT binding expiry.
    ///
    /// The interval is clamped up to the 10 second minimum.
    async fn set_keep_alive(&self, interval: Duration, payload: Bytes) -> Result<()>;
}

/// Shared state for transports over a framed reliable stream.
///
/// Owns split read/write halves, the closed flag, and the keep-alive task.
pub(crate) struct FramedStream<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Arc<Mutex<WriteHalf<S>>>,
    framing: Framing,
    closed: AtomicBool,
    close_notify: Notify,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
    read_timeout: Duration,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub(crate) fn new(stream: S, framing: Framing, read_timeout: Duration) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Arc::new(Mutex::new(writer)),
            framing,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            keep_alive: Mutex::new(None),
            read_timeout,
        }
    }

    pub(crate) fn is_good(&self) -> bool {
        !self.closed.load(Ordering::Relaxed)
    }

    pub(crate) async fn read_pdu(&self) -> Result<Bytes> {
        if !self.is_good() {
            return Err(Error::TransportClosed);
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            result = tokio::time::timeout(self.read_timeout, self.framing.read_pdu(&mut *reader)) => {
                match result {
                    Ok(Ok(pdu)) => Ok(pdu),
                    Ok(Err(e)) => {
                        // Framing corruption on a reliable stream is fatal
                        self.closed.store(true, Ordering::Relaxed);
                        Err(e)
                    }
                    Err(_) => Err(Error::Timeout("PDU read")),
                }
            }
            _ = self.close_notify.notified() => Err(Error::Interrupted),
        }
    }

    pub(crate) async fn write_pdu(&self, pdu: &[u8]) -> Result<()> {
        if !self.is_good() {
            return Err(Error::TransportClosed);
        }
        let mut writer = self.writer.lock().await;
        self.framing.write_pdu(&mut *writer, pdu).await
    }

    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return; // Already closed
        }
        self.close_notify.notify_waiters();
        if let Some(task) = self.keep_alive.lock().await.take() {
            task.abort();
        }
        use tokio::io::AsyncWriteExt;
        let _ = self.writer.lock().await.shutdown().await;
    }

    pub(crate) async fn set_keep_alive(&self, interval: Duration, payload: Bytes) -> Result<()> {
        if !self.is_good() {
            return Err(Error::TransportClosed);
        }
        let interval = interval.max(MIN_KEEP_ALIVE_INTERVAL);
        let writer = self.writer.clone();
        let framing = self.framing;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // First tick completes immediately
            loop {
                ticker.tick().await;
                let mut w = writer.lock().await;
                if framing.write_pdu(&mut *w, &payload).await.is_err() {
                    debug!("Keep-alive write failed, stopping");
                    break;
                }
                trace!("Sent {} byte keep-alive", payload.len());
            }
        });
        if let Some(old) = self.keep_alive.lock().await.replace(task) {
            old.abort();
        }
        Ok(())
    }
}

/// Spawn a loop that reads PDUs from `transport` into an event channel.
///
/// Used by accept paths that hand inbound traffic to a signalling task.
pub fn spawn_pdu_loop(
    transport: Arc<dyn Transport>,
    capacity: usize,
) -> mpsc::Receiver<TransportEvent> {
    let (tx, rx) = mpsc::channel(capacity);
    tokio::spawn(async move {
        loop {
            match transport.read_pdu().await {
                Ok(pdu) => {
                    let source = transport
                        .remote_address()
                        .and_then(|a| a.socket_addr())
                        .unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());
                    if tx.send(TransportEvent::PduReceived { pdu, source }).await.is_err() {
                        break;
                    }
                }
                Err(Error::Interrupted) | Err(Error::TransportClosed) => {
                    let _ = tx.send(TransportEvent::Closed).await;
                    break;
                }
                Err(e) => {
                    warn!("Transport read failed: {}", e);
                    let _ = tx.send(TransportEvent::Error { error: e.to_string() }).await;
                    let _ = tx.send(TransportEvent::Closed).await;
                    break;
                }
            }
        }
    });
    rx
}
