//! Byte channel to the XMPP server.
//!
//! [`Channel`] is the seam between the negotiation state machine and the
//! network: the connection only ever opens, polls, reads, writes, upgrades,
//! and closes. [`TcpChannel`] is the production implementation over
//! tokio TCP with an optional rustls upgrade.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument, warn};

use crate::error::XmppError;

const READ_CHUNK: usize = 8192;

pub trait Channel: Send + Sized + 'static {
    /// Open a channel to `address` (`host:port`) within `timeout`.
    fn open(address: &str, timeout: Duration)
        -> impl Future<Output = Result<Self, XmppError>> + Send;

    /// Read up to `max` bytes. An empty result means the peer closed the channel.
    fn read(&mut self, max: usize) -> impl Future<Output = Result<Vec<u8>, XmppError>> + Send;

    /// Write `data`, returning the number of bytes written.
    fn write(&mut self, data: &[u8]) -> impl Future<Output = Result<usize, XmppError>> + Send;

    /// Wait up to `timeout` for data (or end of stream) to become readable.
    fn poll_readable(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<bool, XmppError>> + Send;

    /// Switch the open channel to TLS.
    fn upgrade_to_encrypted(&mut self) -> impl Future<Output = Result<(), XmppError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), XmppError>> + Send;
}

#[derive(Debug, Default)]
enum StreamInner {
    #[default]
    Closed,
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// TCP channel with optional TLS, reading ahead into a small buffer so that
/// readability can be polled without losing bytes.
#[derive(Debug)]
pub struct TcpChannel {
    inner: StreamInner,
    host: String,
    pending: Vec<u8>,
    eof: bool,
}

impl TcpChannel {
    /// Whether the TLS upgrade has completed.
    pub fn is_encrypted(&self) -> bool {
        matches!(self.inner, StreamInner::Tls(_))
    }

    async fn fill(&mut self) -> Result<usize, XmppError> {
        let mut buf = vec![0u8; READ_CHUNK];
        let n = match &mut self.inner {
            StreamInner::Tcp(stream) => stream.read(&mut buf).await?,
            StreamInner::Tls(stream) => stream.read(&mut buf).await?,
            StreamInner::Closed => return Err(XmppError::transport("channel is closed")),
        };
        if n == 0 {
            self.eof = true;
        }
        self.pending.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

impl Channel for TcpChannel {
    #[instrument(skip(timeout), name = "xmpp.channel.open")]
    async fn open(address: &str, timeout: Duration) -> Result<Self, XmppError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| XmppError::transport(format!("connect to {address} timed out")))?
            .map_err(|e| XmppError::transport(format!("connect to {address} failed: {e}")))?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY");
        }

        let host = address
            .rsplit_once(':')
            .map_or(address, |(host, _)| host)
            .to_string();

        debug!(%address, "TCP channel open");

        Ok(Self {
            inner: StreamInner::Tcp(stream),
            host,
            pending: Vec::new(),
            eof: false,
        })
    }

    async fn read(&mut self, max: usize) -> Result<Vec<u8>, XmppError> {
        if self.pending.is_empty() && !self.eof {
            self.fill().await?;
        }
        let take = max.min(self.pending.len());
        Ok(self.pending.drain(..take).collect())
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, XmppError> {
        match &mut self.inner {
            StreamInner::Tcp(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
            StreamInner::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
            StreamInner::Closed => return Err(XmppError::transport("channel is closed")),
        }
        Ok(data.len())
    }

    async fn poll_readable(&mut self, timeout: Duration) -> Result<bool, XmppError> {
        if !self.pending.is_empty() || self.eof {
            return Ok(true);
        }
        match tokio::time::timeout(timeout, self.fill()).await {
            Ok(result) => result.map(|_| true),
            Err(_) => Ok(false),
        }
    }

    #[instrument(skip(self), fields(host = %self.host), name = "xmpp.channel.upgrade")]
    async fn upgrade_to_encrypted(&mut self) -> Result<(), XmppError> {
        let tcp_stream = match std::mem::take(&mut self.inner) {
            StreamInner::Tcp(s) => s,
            StreamInner::Tls(s) => {
                self.inner = StreamInner::Tls(s);
                return Err(XmppError::tls("channel is already encrypted"));
            }
            StreamInner::Closed => return Err(XmppError::transport("channel is closed")),
        };

        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| XmppError::tls(format!("invalid server name {}: {e}", self.host)))?;

        let tls_stream = create_tls_connector()?
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| XmppError::tls(format!("TLS handshake with {} failed: {e}", self.host)))?;

        self.inner = StreamInner::Tls(Box::new(tls_stream));
        self.pending.clear();

        debug!("TLS upgrade complete");

        Ok(())
    }

    async fn close(&mut self) -> Result<(), XmppError> {
        self.pending.clear();
        match std::mem::take(&mut self.inner) {
            StreamInner::Tcp(mut stream) => stream.shutdown().await?,
            StreamInner::Tls(mut stream) => stream.shutdown().await?,
            StreamInner::Closed => {}
        }
        Ok(())
    }
}

/// Build a TLS connector trusting the platform's root certificates.
fn create_tls_connector() -> Result<TlsConnector, XmppError> {
    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    for error in &native_certs.errors {
        warn!(%error, "failed to load a native root certificate");
    }
    if native_certs.certs.is_empty() {
        return Err(XmppError::tls("no system root certificates found"));
    }
    for cert in native_certs.certs {
        root_store
            .add(cert)
            .map_err(|e| XmppError::tls(format!("failed to add root certificate: {e}")))?;
    }

    let config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| XmppError::tls(e.to_string()))?
            .with_root_certificates(root_store)
            .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    #[tokio::test]
    async fn open_read_write_close_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let mut channel = assert_ok!(TcpChannel::open(&address, Duration::from_secs(5)).await);
        assert!(!channel.is_encrypted());
        assert_eq!(channel.write(b"<presence/>").await.unwrap(), 11);

        assert!(channel.poll_readable(Duration::from_secs(5)).await.unwrap());
        let echoed = channel.read(1024).await.unwrap();
        assert_eq!(echoed, b"<presence/>");

        server.await.unwrap();

        // Peer hung up: readable, and the read reports end of stream.
        assert!(channel.poll_readable(Duration::from_secs(5)).await.unwrap());
        assert!(channel.read(1024).await.unwrap().is_empty());

        assert_ok!(channel.close().await);
        assert!(matches!(
            channel.write(b"x").await,
            Err(XmppError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn poll_times_out_without_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let _accept = tokio::spawn(async move { listener.accept().await });

        let mut channel = assert_ok!(TcpChannel::open(&address, Duration::from_secs(5)).await);
        assert!(!assert_ok!(
            channel.poll_readable(Duration::from_millis(20)).await
        ));
    }

    #[tokio::test]
    async fn open_to_closed_port_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = assert_err!(TcpChannel::open(&address, Duration::from_secs(5)).await);
        assert!(err.is_transport());
    }
}
