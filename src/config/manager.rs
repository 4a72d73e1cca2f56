//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{anyhow, bail, Context};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest accepted relay buffer
const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Manages configuration loading and validation
pub struct ConfigManager;

/// Values supplied on the command line; `None`/`false` leaves the loaded value alone
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub tunnel_ep: Option<String>,
    pub remote_ep: Option<String>,
    pub buffer_size: Option<usize>,
    pub use_tls: bool,
    pub skip_verification: bool,
    pub ca_file: Option<PathBuf>,
    pub server_name: Option<String>,
    pub connect_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub max_connections: Option<usize>,
    pub log_level: Option<String>,
}

impl ConfigManager {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        tracing::info!("Loading configuration from: {}", path.display());
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        Self::load_from_vars(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    pub fn load_from_vars<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(tunnel_ep) = lookup("TLSTUNNEL_TUNNEL_EP") {
            config.tunnel.tunnel_ep = tunnel_ep;
        }

        if let Some(remote_ep) = lookup("TLSTUNNEL_REMOTE_EP") {
            config.tunnel.remote_ep = Some(remote_ep);
        }

        if let Some(buffer_size) = lookup("TLSTUNNEL_BUFFER_SIZE") {
            config.tunnel.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid TLSTUNNEL_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Some(use_tls) = lookup("TLSTUNNEL_USE_TLS") {
            config.tls.enabled = use_tls
                .parse::<bool>()
                .with_context(|| format!("Invalid TLSTUNNEL_USE_TLS: {}", use_tls))?;
        }

        if let Some(skip) = lookup("TLSTUNNEL_SKIP_VERIFICATION") {
            config.tls.skip_verification = skip
                .parse::<bool>()
                .with_context(|| format!("Invalid TLSTUNNEL_SKIP_VERIFICATION: {}", skip))?;
        }

        if let Some(ca_file) = lookup("TLSTUNNEL_CA_FILE") {
            config.tls.ca_file = Some(PathBuf::from(ca_file));
        }

        if let Some(timeout) = lookup("TLSTUNNEL_CONNECT_TIMEOUT") {
            config.tunnel.connect_timeout = Some(
                humantime::parse_duration(&timeout)
                    .with_context(|| format!("Invalid TLSTUNNEL_CONNECT_TIMEOUT: {}", timeout))?,
            );
        }

        if let Some(timeout) = lookup("TLSTUNNEL_IDLE_TIMEOUT") {
            config.tunnel.idle_timeout = Some(
                humantime::parse_duration(&timeout)
                    .with_context(|| format!("Invalid TLSTUNNEL_IDLE_TIMEOUT: {}", timeout))?,
            );
        }

        if let Some(max_conn) = lookup("TLSTUNNEL_MAX_CONNECTIONS") {
            config.tunnel.max_connections = Some(
                max_conn
                    .parse::<usize>()
                    .with_context(|| format!("Invalid TLSTUNNEL_MAX_CONNECTIONS: {}", max_conn))?,
            );
        }

        if let Some(log_level) = lookup("TLSTUNNEL_LOG_LEVEL") {
            config.logging.level = log_level;
        }

        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_tunnel_config()
            .with_context(|| "Tunnel configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_tunnel_config(&self) -> Result<()> {
        let remote_ep = match self.remote_ep() {
            Some(ep) => ep,
            None => bail!("Remote end point not specified, use --remoteEP"),
        };

        split_host_port(&self.tunnel.tunnel_ep)
            .with_context(|| format!("Invalid tunnel endpoint '{}'", self.tunnel.tunnel_ep))?;
        split_host_port(remote_ep)
            .with_context(|| format!("Invalid remote endpoint '{}'", remote_ep))?;

        if self.tunnel.buffer_size == 0 {
            bail!("buffer_size must be greater than 0");
        }

        if self.tunnel.buffer_size > MAX_BUFFER_SIZE {
            bail!("buffer_size cannot exceed {} bytes", MAX_BUFFER_SIZE);
        }

        if self.tunnel.max_connections == Some(0) {
            bail!("max_connections must be greater than 0 when set");
        }

        if self.tunnel.connect_timeout.is_some_and(|t| t.is_zero()) {
            bail!("connect_timeout must be greater than 0 when set");
        }

        if self.tunnel.idle_timeout.is_some_and(|t| t.is_zero()) {
            bail!("idle_timeout must be greater than 0 when set");
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                VALID_LOG_LEVELS.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(&mut self, cli: &CliOverrides) {
        if let Some(tunnel_ep) = &cli.tunnel_ep {
            self.tunnel.tunnel_ep = tunnel_ep.clone();
            tracing::debug!("CLI override: tunnel endpoint set to {}", tunnel_ep);
        }

        if let Some(remote_ep) = &cli.remote_ep {
            self.tunnel.remote_ep = Some(remote_ep.clone());
            tracing::debug!("CLI override: remote endpoint set to {}", remote_ep);
        }

        if let Some(buffer_size) = cli.buffer_size {
            self.tunnel.buffer_size = buffer_size;
            tracing::debug!("CLI override: buffer size set to {} bytes", buffer_size);
        }

        if cli.use_tls {
            self.tls.enabled = true;
        }

        if cli.skip_verification {
            self.tls.skip_verification = true;
        }

        if let Some(ca_file) = &cli.ca_file {
            self.tls.ca_file = Some(ca_file.clone());
        }

        if let Some(server_name) = &cli.server_name {
            self.tls.server_name = Some(server_name.clone());
        }

        if let Some(timeout) = cli.connect_timeout {
            self.tunnel.connect_timeout = Some(timeout);
            tracing::debug!("CLI override: connect timeout set to {:?}", timeout);
        }

        if let Some(timeout) = cli.idle_timeout {
            self.tunnel.idle_timeout = Some(timeout);
            tracing::debug!("CLI override: idle timeout set to {:?}", timeout);
        }

        if let Some(max_conn) = cli.max_connections {
            self.tunnel.max_connections = Some(max_conn);
            tracing::debug!("CLI override: max connections set to {}", max_conn);
        }

        if let Some(log_level) = &cli.log_level {
            self.logging.level = log_level.clone();
        }
    }
}

/// Split a `host:port` string, stripping brackets from IPv6 literals
pub fn split_host_port(addr: &str) -> Result<(&str, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing port in '{}'", addr))?;

    let host = match host.strip_prefix('[') {
        Some(rest) => rest
            .strip_suffix(']')
            .ok_or_else(|| anyhow!("unterminated IPv6 literal in '{}'", addr))?,
        None if host.contains(':') => bail!("IPv6 literal must be bracketed in '{}'", addr),
        None => host,
    };

    let port = port
        .parse::<u16>()
        .with_context(|| format!("invalid port in '{}'", addr))?;

    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("localhost:23").unwrap(), ("localhost", 23));
        assert_eq!(split_host_port("10.0.0.1:443").unwrap(), ("10.0.0.1", 443));
        assert_eq!(split_host_port("[::1]:8443").unwrap(), ("::1", 8443));
        assert_eq!(split_host_port(":8080").unwrap(), ("", 8080));

        assert!(split_host_port("localhost").is_err());
        assert!(split_host_port("localhost:http").is_err());
        assert!(split_host_port("::1:80").is_err());
        assert!(split_host_port("[::1:80").is_err());
    }

    #[test]
    fn test_env_lookup() {
        let config = ConfigManager::load_from_vars(|key| match key {
            "TLSTUNNEL_REMOTE_EP" => Some("example.com:443".to_string()),
            "TLSTUNNEL_USE_TLS" => Some("true".to_string()),
            "TLSTUNNEL_BUFFER_SIZE" => Some("8192".to_string()),
            "TLSTUNNEL_IDLE_TIMEOUT" => Some("5m".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(config.remote_ep(), Some("example.com:443"));
        assert!(config.tls.enabled);
        assert_eq!(config.tunnel.buffer_size, 8192);
        assert_eq!(config.tunnel.idle_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.tunnel.tunnel_ep, "localhost:23");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_lookup_rejects_garbage() {
        let result = ConfigManager::load_from_vars(|key| match key {
            "TLSTUNNEL_BUFFER_SIZE" => Some("lots".to_string()),
            _ => None,
        });
        assert!(result.is_err());
    }
}
