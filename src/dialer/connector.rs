//! Outbound connection establishment

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{anyhow, Context};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::tls;
use crate::config::{split_host_port, Config};
use crate::Result;

/// The outbound leg of a session
pub enum RemoteStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_tls() { "Tls" } else { "Plain" };
        f.debug_struct("RemoteStream")
            .field("kind", &kind)
            .field("peer_addr", &self.peer_addr().ok())
            .finish()
    }
}

impl RemoteStream {
    /// Address of the remote peer
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            RemoteStream::Plain(stream) => stream.peer_addr(),
            RemoteStream::Tls(stream) => stream.get_ref().0.peer_addr(),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, RemoteStream::Tls(_))
    }
}

impl AsyncRead for RemoteStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RemoteStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            RemoteStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RemoteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            RemoteStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            RemoteStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RemoteStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            RemoteStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RemoteStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            RemoteStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// TLS settings resolved once at startup
struct TlsTarget {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

/// Opens one outbound connection per session
pub struct Dialer {
    remote_addr: String,
    connect_timeout: Option<Duration>,
    tls: Option<TlsTarget>,
}

impl Dialer {
    /// Create a dialer from configuration.
    ///
    /// The TLS client configuration is built here, so a bad CA file or an
    /// unusable server name fails at startup rather than per session.
    pub fn from_config(config: &Config) -> Result<Self> {
        let remote_addr = config
            .remote_ep()
            .ok_or_else(|| anyhow!("Remote end point not specified"))?
            .to_string();

        let tls = if config.tls.enabled {
            let host = match &config.tls.server_name {
                Some(name) => name.as_str(),
                None => split_host_port(&remote_addr)?.0,
            };
            let client_config = tls::build_client_config(&config.tls)?;
            Some(TlsTarget {
                connector: TlsConnector::from(client_config),
                server_name: tls::server_name(host)?,
            })
        } else {
            None
        };

        Ok(Self {
            remote_addr,
            connect_timeout: config.tunnel.connect_timeout,
            tls,
        })
    }

    /// The configured remote endpoint
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn uses_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Connect to the remote, negotiating TLS when configured
    pub async fn dial(&self) -> Result<RemoteStream> {
        match self.connect_timeout {
            Some(limit) => timeout(limit, self.establish())
                .await
                .map_err(|_| anyhow!("Connection to {} timed out after {:?}", self.remote_addr, limit))?,
            None => self.establish().await,
        }
    }

    async fn establish(&self) -> Result<RemoteStream> {
        let stream = TcpStream::connect(self.remote_addr.as_str())
            .await
            .with_context(|| format!("Failed to connect to {}", self.remote_addr))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on remote socket: {}", e);
        }

        let Some(tls) = &self.tls else {
            debug!("Connected to {} over plain TCP", self.remote_addr);
            return Ok(RemoteStream::Plain(stream));
        };

        let stream = tls
            .connector
            .connect(tls.server_name.clone(), stream)
            .await
            .with_context(|| format!("TLS handshake with {} failed", self.remote_addr))?;

        debug!("Completed TLS handshake with {}", self.remote_addr);
        Ok(RemoteStream::Tls(Box::new(stream)))
    }
}
