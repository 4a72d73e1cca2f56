//! Connection Manager Implementation

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::dialer::Dialer;
use crate::relay::RelayEngine;
use crate::resource::ResourceManager;
use crate::shutdown::ShutdownCoordinator;
use crate::Result;

/// Accepts tunnel clients and runs one session per connection
pub struct ConnectionManager {
    listener: Mutex<Option<TcpListener>>,
    bind_addr: Option<SocketAddr>,
    config: Arc<Config>,
    dialer: Arc<Dialer>,
    relay_engine: Arc<RelayEngine>,
    resource_manager: Arc<ResourceManager>,
    next_connection_id: AtomicUsize,
    shutdown: Arc<ShutdownCoordinator>,
}

impl ConnectionManager {
    /// Create a new ConnectionManager.
    ///
    /// Fails when the dialer cannot be built, e.g. an unreadable CA file.
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let dialer = Arc::new(Dialer::from_config(&config).context("Failed to set up dialer")?);
        let relay_engine = Arc::new(RelayEngine::from_config(&config));
        let resource_manager = Arc::new(ResourceManager::new(Arc::clone(&config)));

        Ok(Self {
            listener: Mutex::new(None),
            bind_addr: None,
            config,
            dialer,
            relay_engine,
            resource_manager,
            next_connection_id: AtomicUsize::new(1),
            shutdown: Arc::new(ShutdownCoordinator::new()),
        })
    }

    /// Bind the listening socket, returning the bound address
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let tunnel_ep = &self.config.tunnel.tunnel_ep;

        info!("Binding TCP listener to {}", tunnel_ep);
        let listener = TcpListener::bind(listen_addr(tunnel_ep).as_str())
            .await
            .with_context(|| format!("Listen failed on {}", tunnel_ep))?;
        let bind_addr = listener.local_addr()?;

        info!("Successfully bound to {}", bind_addr);
        self.bind_addr = Some(bind_addr);
        *self.listener.lock().unwrap_or_else(|p| p.into_inner()) = Some(listener);
        Ok(bind_addr)
    }

    /// Main connection acceptance loop.
    ///
    /// Takes ownership of the listener, so the socket closes when the loop
    /// stops. Accept failures are logged and never end the loop.
    pub async fn accept_connections(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| anyhow::anyhow!("Listener not initialized"))?;

        info!("Starting connection acceptance loop");
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            if self.shutdown.is_triggered() {
                info!("Shutdown flag set, stopping connection acceptance");
                break;
            }

            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => self.dispatch(stream, addr),
                        Err(e) => {
                            error!("Accept failed : {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    break;
                }
            }
        }

        info!("Connection acceptance loop stopped");
        Ok(())
    }

    /// Hand an accepted connection to its own task
    fn dispatch(&self, stream: TcpStream, addr: SocketAddr) {
        debug!("Accepted connection from {}", addr);

        let connection_slot = match self.resource_manager.acquire_connection_slot() {
            Ok(slot) => slot,
            Err(_) => {
                warn!("Connection limit reached, rejecting connection from {}", addr);
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on client socket {}: {}", addr, e);
        }

        let connection_id = format!(
            "conn_{}",
            self.next_connection_id.fetch_add(1, Ordering::Relaxed)
        );
        let dialer = Arc::clone(&self.dialer);
        let relay_engine = Arc::clone(&self.relay_engine);

        tokio::spawn(async move {
            let _connection_slot = connection_slot;
            let started = Instant::now();

            Self::handle_connection(stream, addr, dialer, relay_engine, &connection_id).await;

            info!(
                "Connection {} from {} closed after {:?}",
                connection_id,
                addr,
                started.elapsed()
            );
        });
    }

    /// Dial the remote for one client and relay until the session ends
    #[instrument(skip(stream, dialer, relay_engine), fields(connection_id = %connection_id, addr = %addr))]
    async fn handle_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        dialer: Arc<Dialer>,
        relay_engine: Arc<RelayEngine>,
        connection_id: &str,
    ) {
        let remote = match dialer.dial().await {
            Ok(remote) => remote,
            Err(e) => {
                error!("Remote connection failed : {:#}", e);
                if let Err(e) = stream.shutdown().await {
                    debug!("Closing client {} after failed dial: {}", addr, e);
                }
                return;
            }
        };

        info!(
            "Tunnel established from {} to {}",
            addr,
            dialer.remote_addr()
        );

        relay_engine.run_session(stream, remote, addr).await;
    }

    /// Get the number of active connections, i.e. admitted and not yet closed
    pub fn get_active_connections(&self) -> usize {
        self.resource_manager.get_stats().active_connections
    }

    /// Get the bind address once the listener is bound
    pub fn get_bind_addr(&self) -> Option<SocketAddr> {
        self.bind_addr
    }

    /// The coordinator whose signal stops the accept loop
    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The engine running this manager's sessions
    pub fn relay_engine(&self) -> &Arc<RelayEngine> {
        &self.relay_engine
    }

    /// Get connection statistics
    pub fn get_connection_stats(&self) -> ConnectionStats {
        let resources = self.resource_manager.get_stats();

        ConnectionStats {
            active_connections: resources.active_connections,
            active_sessions: self.relay_engine.active_session_count(),
            total_connections_served: resources.total_connections_created,
            total_connections_rejected: resources.total_connections_rejected,
            max_connections_allowed: resources.max_connections,
        }
    }

    /// Initiate graceful shutdown
    pub fn initiate_shutdown(&self) {
        info!("Initiating graceful shutdown of connection manager");
        self.shutdown.trigger();
    }

    /// Check if shutdown has been initiated
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Wait for live sessions to finish, up to the configured grace period
    pub async fn wait_for_connections_to_close(&self) -> Result<()> {
        let shutdown_timeout = self.config.tunnel.shutdown_timeout;
        let start_time = Instant::now();

        info!(
            "Waiting for {} active connections to close (timeout: {:?})",
            self.get_active_connections(),
            shutdown_timeout
        );

        while self.get_active_connections() > 0 && start_time.elapsed() < shutdown_timeout {
            debug!(
                "Waiting for {} active connections to close",
                self.get_active_connections()
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let remaining = self.get_active_connections();
        let elapsed = start_time.elapsed();

        if remaining == 0 {
            info!("All connections closed gracefully in {:?}", elapsed);
        } else {
            warn!(
                "Shutdown timeout reached after {:?} with {} connections still active",
                elapsed, remaining
            );
        }

        Ok(())
    }

    /// Gracefully shutdown the connection manager
    pub async fn shutdown(&self) -> Result<()> {
        self.initiate_shutdown();
        self.wait_for_connections_to_close().await
    }
}

/// An empty host (":23") listens on all interfaces
fn listen_addr(tunnel_ep: &str) -> String {
    match tunnel_ep.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => tunnel_ep.to_string(),
    }
}

/// Connection statistics
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub active_connections: usize,
    pub active_sessions: usize,
    pub total_connections_served: usize,
    pub total_connections_rejected: usize,
    pub max_connections_allowed: Option<usize>,
}
