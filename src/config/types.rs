//! Configuration Types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default local listen address
pub const DEFAULT_TUNNEL_EP: &str = "localhost:23";

/// Default per-direction relay buffer size in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub tunnel: TunnelConfig,
    pub tls: TlsConfig,
    pub logging: LoggingConfig,
}

/// Listener, remote endpoint and relay settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Local listen address (`host:port`)
    pub tunnel_ep: String,
    /// Remote address (`host:port`), required
    pub remote_ep: Option<String>,
    /// Per-direction buffer size in bytes
    pub buffer_size: usize,
    /// Bound on TCP connect plus TLS handshake; unbounded when unset
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,
    /// Tear a session down after this long without traffic in either direction
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
    /// Admission limit on concurrent sessions; unlimited when unset
    pub max_connections: Option<usize>,
    /// How long a graceful shutdown waits for live sessions
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// TLS settings for the outbound leg
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// Accept any certificate chain and hostname (insecure)
    pub skip_verification: bool,
    /// Extra PEM trust anchors on top of the web PKI roots
    pub ca_file: Option<PathBuf>,
    /// Name used for SNI and verification instead of the remote host
    pub server_name: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            tunnel_ep: DEFAULT_TUNNEL_EP.to_string(),
            remote_ep: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            connect_timeout: None,
            idle_timeout: None,
            max_connections: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Create a configuration for the given remote with all other settings defaulted
    pub fn for_remote(remote_ep: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.tunnel.remote_ep = Some(remote_ep.into());
        config
    }

    /// The configured remote endpoint, if any
    pub fn remote_ep(&self) -> Option<&str> {
        self.tunnel
            .remote_ep
            .as_deref()
            .filter(|ep| !ep.trim().is_empty())
    }
}
