//! TLS transport
//!
//! Wraps the TCP framing in rustls. The context is built from a CA bundle,
//! certificate and key paths; when the files are absent and
//! `auto_create_certificate` is set, a self-signed certificate is generated
//! in memory (lab and test deployments).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio_rustls::rustls::{self, Certificate, PrivateKey, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

use crate::address::{TransportAddress, TransportProto};
use crate::error::{Error, Result};
use crate::framing::Framing;
use crate::transport::{FramedStream, Transport};
use crate::TransportTimeouts;

/// TLS credential configuration
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TlsContext {
    /// PEM bundle of trusted CAs; peers are verified against it
    pub ca_file: Option<PathBuf>,

    /// Our certificate chain (PEM)
    pub cert_file: Option<PathBuf>,

    /// Our private key (PEM, PKCS#8 or RSA)
    pub key_file: Option<PathBuf>,

    /// Generate a self-signed certificate when cert/key files are absent
    pub auto_create_certificate: bool,
}

impl TlsContext {
    fn load_identity(&self) -> Result<(Vec<Certificate>, PrivateKey)> {
        match (&self.cert_file, &self.key_file) {
            (Some(cert_path), Some(key_path)) => {
                let cert_pem = std::fs::read(cert_path)?;
                let key_pem = std::fs::read(key_path)?;
                let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
                    .map_err(|e| Error::TlsConfig(format!("bad certificate file: {}", e)))?
                    .into_iter()
                    .map(Certificate)
                    .collect::<Vec<_>>();
                let mut keys = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_slice())
                    .map_err(|e| Error::TlsConfig(format!("bad key file: {}", e)))?;
                if keys.is_empty() {
                    keys = rustls_pemfile::rsa_private_keys(&mut key_pem.as_slice())
                        .map_err(|e| Error::TlsConfig(format!("bad key file: {}", e)))?;
                }
                let key = keys
                    .into_iter()
                    .next()
                    .map(PrivateKey)
                    .ok_or_else(|| Error::TlsConfig("no private key in file".to_string()))?;
                Ok((certs, key))
            }
            _ if self.auto_create_certificate => {
                debug!("Generating self-signed TLS certificate");
                let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
                    .map_err(|e| Error::TlsConfig(e.to_string()))?;
                let der = cert
                    .serialize_der()
                    .map_err(|e| Error::TlsConfig(e.to_string()))?;
                let key = cert.serialize_private_key_der();
                Ok((vec![Certificate(der)], PrivateKey(key)))
            }
            _ => Err(Error::TlsConfig(
                "no certificate/key configured and auto-create disabled".to_string(),
            )),
        }
    }

    /// Server side rustls config
    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>> {
        let (certs, key) = self.load_identity()?;
        let config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::TlsConfig(e.to_string()))?;
        Ok(Arc::new(config))
    }

    /// Client side rustls config.
    ///
    /// With no CA bundle and auto-create on, certificate verification is
    /// disabled; that pairs with the self-signed server side and is only
    /// suitable for closed networks.
    pub fn client_config(&self) -> Result<Arc<rustls::ClientConfig>> {
        let builder = rustls::ClientConfig::builder().with_safe_defaults();
        let config = match &self.ca_file {
            Some(ca_path) => {
                let ca_pem = std::fs::read(ca_path)?;
                let mut roots = RootCertStore::empty();
                for der in rustls_pemfile::certs(&mut ca_pem.as_slice())
                    .map_err(|e| Error::TlsConfig(format!("bad CA file: {}", e)))?
                {
                    roots
                        .add(&Certificate(der))
                        .map_err(|e| Error::TlsConfig(e.to_string()))?;
                }
                builder.with_root_certificates(roots).with_no_client_auth()
            }
            None if self.auto_create_certificate => {
                let mut config = builder
                    .with_root_certificates(RootCertStore::empty())
                    .with_no_client_auth();
                config
                    .dangerous()
                    .set_certificate_verifier(Arc::new(AcceptAnyCert));
                config
            }
            None => {
                return Err(Error::TlsConfig(
                    "no CA bundle configured and auto-create disabled".to_string(),
                ))
            }
        };
        Ok(Arc::new(config))
    }
}

struct AcceptAnyCert;

impl rustls::client::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

enum TlsStreamKind {
    Client(FramedStream<tokio_rustls::client::TlsStream<TcpStream>>),
    Server(FramedStream<tokio_rustls::server::TlsStream<TcpStream>>),
}

/// TLS transport carrying framed PDUs
#[derive(Clone)]
pub struct TlsTransport {
    inner: Arc<TlsTransportInner>,
}

struct TlsTransportInner {
    stream: TlsStreamKind,
    local: SocketAddr,
    remote: SocketAddr,
}

impl TlsTransport {
    /// Connect and complete the TLS handshake
    pub async fn connect(
        remote: SocketAddr,
        server_name: &str,
        context: &TlsContext,
        framing: Framing,
        timeouts: TransportTimeouts,
    ) -> Result<Self> {
        let tcp = tokio::time::timeout(timeouts.signalling, TcpStream::connect(remote))
            .await
            .map_err(|_| Error::Timeout("TLS connect"))?
            .map_err(|e| Error::ConnectFailed(e.to_string()))?;
        tcp.set_nodelay(true)?;
        let local = tcp.local_addr()?;

        let connector = TlsConnector::from(context.client_config()?);
        let name = rustls::ServerName::try_from(server_name)
            .map_err(|_| Error::TlsConfig(format!("bad server name {}", server_name)))?;
        let stream = tokio::time::timeout(timeouts.signalling, connector.connect(name, tcp))
            .await
            .map_err(|_| Error::Timeout("TLS handshake"))?
            .map_err(|e| Error::ConnectFailed(e.to_string()))?;
        info!("TLS transport connected to {}", remote);

        Ok(Self {
            inner: Arc::new(TlsTransportInner {
                stream: TlsStreamKind::Client(FramedStream::new(
                    stream,
                    framing,
                    timeouts.idle + Duration::from_secs(10),
                )),
                local,
                remote,
            }),
        })
    }

    /// Accept side: wrap an inbound TCP stream and complete the handshake
    pub async fn accept(
        tcp: TcpStream,
        context: &TlsContext,
        framing: Framing,
        timeouts: TransportTimeouts,
    ) -> Result<Self> {
        tcp.set_nodelay(true)?;
        let local = tcp.local_addr()?;
        let remote = tcp.peer_addr()?;

        let acceptor = TlsAcceptor::from(context.server_config()?);
        let stream = tokio::time::timeout(timeouts.signalling, acceptor.accept(tcp))
            .await
            .map_err(|_| Error::Timeout("TLS handshake"))?
            .map_err(|e| Error::ConnectFailed(e.to_string()))?;
        debug!("TLS transport accepted from {}", remote);

        Ok(Self {
            inner: Arc::new(TlsTransportInner {
                stream: TlsStreamKind::Server(FramedStream::new(
                    stream,
                    framing,
                    timeouts.idle + Duration::from_secs(10),
                )),
                local,
                remote,
            }),
        })
    }
}

#[async_trait]
impl Transport for TlsTransport {
    fn local_address(&self) -> Result<TransportAddress> {
        Ok(TransportAddress::from_socket_addr(TransportProto::Tls, self.inner.local))
    }

    fn remote_address(&self) -> Option<TransportAddress> {
        Some(TransportAddress::from_socket_addr(TransportProto::Tls, self.inner.remote))
    }

    async fn read_pdu(&self) -> Result<Bytes> {
        match &self.inner.stream {
            TlsStreamKind::Client(s) => s.read_pdu().await,
            TlsStreamKind::Server(s) => s.read_pdu().await,
        }
    }

    async fn write_pdu(&self, pdu: &[u8]) -> Result<()> {
        match &self.inner.stream {
            TlsStreamKind::Client(s) => s.write_pdu(pdu).await,
            TlsStreamKind::Server(s) => s.write_pdu(pdu).await,
        }
    }

    async fn close(&self) {
        match &self.inner.stream {
            TlsStreamKind::Client(s) => s.close().await,
            TlsStreamKind::Server(s) => s.close().await,
        }
    }

    fn is_good(&self) -> bool {
        match &self.inner.stream {
            TlsStreamKind::Client(s) => s.is_good(),
            TlsStreamKind::Server(s) => s.is_good(),
        }
    }

    async fn set_keep_alive(&self, interval: Duration, payload: Bytes) -> Result<()> {
        match &self.inner.stream {
            TlsStreamKind::Client(s) => s.set_keep_alive(interval, payload).await,
            TlsStreamKind::Server(s) => s.set_keep_alive(interval, payload).await,
        }
    }
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TlsTransport({} <-> {})", self.inner.local, self.inner.remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_self_signed_round_trip() {
        let context = TlsContext { auto_create_certificate: true, ..Default::default() };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_ctx = context.clone();
        let accept = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            TlsTransport::accept(tcp, &server_ctx, Framing::Tpkt, TransportTimeouts::default())
                .await
                .unwrap()
        });

        let client = TlsTransport::connect(
            addr,
            "localhost",
            &context,
            Framing::Tpkt,
            TransportTimeouts::default(),
        )
        .await
        .unwrap();
        let server = accept.await.unwrap();

        client.write_pdu(b"secure-setup").await.unwrap();
        assert_eq!(&server.read_pdu().await.unwrap()[..], b"secure-setup");
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let context = TlsContext::default();
        assert!(matches!(context.server_config(), Err(Error::TlsConfig(_))));
        assert!(matches!(context.client_config(), Err(Error::TlsConfig(_))));
    }
}
