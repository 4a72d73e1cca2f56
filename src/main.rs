//! tlstunnel - Transparent TCP tunnel with optional TLS on the remote leg

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tlstunnel::{
    config::{CliOverrides, ConfigManager},
    ConnectionManager,
};

/// CLI arguments for tlstunnel
#[derive(Parser, Debug)]
#[command(name = "tlstunnel")]
#[command(about = "Transparent TCP tunnel with optional TLS to the remote end point")]
#[command(version)]
#[command(long_about = "
tlstunnel - Transparent TCP tunnel

Accepts plaintext TCP connections on --tunnelEP and relays them, byte for
byte, to --remoteEP, optionally wrapping the remote leg in TLS.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file (--config)
3. Environment variables (only when no configuration file is given)
4. Built-in defaults

Environment variables:
  TLSTUNNEL_TUNNEL_EP          - Local listen address (host:port)
  TLSTUNNEL_REMOTE_EP          - Remote end point (host:port)
  TLSTUNNEL_BUFFER_SIZE        - Per-direction buffer size in bytes
  TLSTUNNEL_USE_TLS            - Use TLS for the remote connection (true/false)
  TLSTUNNEL_SKIP_VERIFICATION  - Skip certificate verification (true/false)
  TLSTUNNEL_CA_FILE            - Extra PEM trust anchors
  TLSTUNNEL_CONNECT_TIMEOUT    - Remote connect timeout (e.g. 10s)
  TLSTUNNEL_IDLE_TIMEOUT       - Session idle timeout (e.g. 5m)
  TLSTUNNEL_MAX_CONNECTIONS    - Maximum concurrent sessions
  TLSTUNNEL_LOG_LEVEL          - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Local listening address
    #[arg(long = "tunnelEP", value_name = "HOST:PORT", help = "Local listening address [default: localhost:23]")]
    pub tunnel_ep: Option<String>,

    /// Remote end point
    #[arg(long = "remoteEP", value_name = "HOST:PORT", help = "Remote end point (ip:port)")]
    pub remote_ep: Option<String>,

    /// Read/write buffer size
    #[arg(long = "buf", value_name = "BYTES", help = "Read/Write buffer size [default: 4096]")]
    pub buffer_size: Option<usize>,

    /// Use TLS for the remote connection
    #[arg(long = "useTLS", help = "Use TLS for remote connection")]
    pub use_tls: bool,

    /// Skip certificate verification
    #[arg(
        long = "skipVerification",
        help = "Skip certificate verification. Only applicable if --useTLS is specified"
    )]
    pub skip_verification: bool,

    /// Extra trust anchors for the remote certificate
    #[arg(long = "caFile", value_name = "PEM", help = "Additional CA certificates (PEM) to trust")]
    pub ca_file: Option<PathBuf>,

    /// Override the TLS server name
    #[arg(long = "serverName", help = "TLS server name to send and verify instead of the remote host")]
    pub server_name: Option<String>,

    /// Remote connect timeout
    #[arg(long = "connectTimeout", value_parser = humantime::parse_duration, help = "Remote connect and handshake timeout (e.g. 10s)")]
    pub connect_timeout: Option<Duration>,

    /// Session idle timeout
    #[arg(long = "idleTimeout", value_parser = humantime::parse_duration, help = "Close sessions idle in both directions this long (e.g. 5m)")]
    pub idle_timeout: Option<Duration>,

    /// Maximum number of concurrent sessions
    #[arg(long = "maxConnections", help = "Maximum number of concurrent sessions [default: unlimited]")]
    pub max_connections: Option<usize>,

    /// Configuration file path
    #[arg(short, long, help = "Path to TOML configuration file")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level [default: info]")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

impl CliArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            tunnel_ep: self.tunnel_ep.clone(),
            remote_ep: self.remote_ep.clone(),
            buffer_size: self.buffer_size,
            use_tls: self.use_tls,
            skip_verification: self.skip_verification,
            ca_file: self.ca_file.clone(),
            server_name: self.server_name.clone(),
            connect_timeout: self.connect_timeout,
            idle_timeout: self.idle_timeout,
            max_connections: self.max_connections,
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let mut config = match &args.config {
        Some(path) => ConfigManager::load_from_file(path)?,
        None => ConfigManager::load_from_env()?,
    };
    config.merge_with_cli_args(&args.overrides());

    init_tracing(&config.logging.level, args.verbose);

    if config.remote_ep().is_none() {
        eprintln!("Remote end point not specified, use --remoteEP");
        eprintln!("{}", CliArgs::command().render_help());
        std::process::exit(1);
    }

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Tunnel end point: {}", config.tunnel.tunnel_ep);
        info!("  Remote end point: {}", config.remote_ep().unwrap_or_default());
        info!("  Buffer size: {} bytes", config.tunnel.buffer_size);
        info!(
            "  TLS: {}",
            match (config.tls.enabled, config.tls.skip_verification) {
                (false, _) => "disabled",
                (true, false) => "enabled",
                (true, true) => "enabled (verification skipped)",
            }
        );
        info!("  Connect timeout: {:?}", config.tunnel.connect_timeout);
        info!("  Idle timeout: {:?}", config.tunnel.idle_timeout);
        info!("  Max connections: {:?}", config.tunnel.max_connections);
        return Ok(());
    }

    info!(
        "Start TCP-TLS Proxy listening at : {}",
        config.tunnel.tunnel_ep
    );
    if !config.tls.enabled {
        warn!("Using non-secure connection to remote end point, specify --useTLS to secure remote connection.");
        if config.tls.skip_verification {
            warn!("--skipVerification has no effect without --useTLS");
        }
    } else if config.tls.skip_verification {
        warn!("Not verifying server certificates risks man in the middle attacks.");
    }
    if let Some(max) = config.tunnel.max_connections {
        info!("Admission limit: at most {} concurrent sessions", max);
    }

    let mut connection_manager = ConnectionManager::new(Arc::new(config))?;
    connection_manager.bind().await?;
    let connection_manager = Arc::new(connection_manager);

    let shutdown_coordinator = Arc::clone(connection_manager.shutdown_coordinator());

    let server = Arc::clone(&connection_manager);
    let mut server_handle = tokio::spawn(async move { server.accept_connections().await });

    tokio::select! {
        result = &mut server_handle => {
            // The accept loop only returns on its own when it could not start.
            return match result {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("Server task failed: {}", e)),
            };
        }
        signal = shutdown_coordinator.listen_for_signals() => {
            if let Err(e) = signal {
                error!("Error setting up signal handlers: {}", e);
                connection_manager.initiate_shutdown();
            }
        }
    }

    if let Err(e) = server_handle.await {
        if !e.is_cancelled() {
            error!("Server task failed: {}", e);
        }
    }
    connection_manager.wait_for_connections_to_close().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, verbose: bool) {
    let log_level = if verbose { "debug" } else { log_level };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();
}
