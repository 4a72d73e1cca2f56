//! Relay Engine

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use super::pump::{Direction, Relay};
use super::{ConnectionStats, RelaySession};
use crate::config::Config;

/// Upper bound on a single connection's shutdown, e.g. flushing a TLS close_notify
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs the two relays of every session and tracks the live ones
pub struct RelayEngine {
    remote_addr: String,
    buffer_size: usize,
    idle_timeout: Option<Duration>,
    active_sessions: Arc<Mutex<HashMap<String, Arc<RelaySession>>>>,
}

impl RelayEngine {
    /// Create a relay engine from configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            remote_addr: config.remote_ep().unwrap_or_default().to_string(),
            buffer_size: config.tunnel.buffer_size,
            idle_timeout: config.tunnel.idle_timeout,
            active_sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Relay between an accepted client and its dialed remote until both directions end.
    ///
    /// Each connection is split between the two relays and reassembled here
    /// once both have finished, so this is the only place either side is closed.
    #[instrument(skip(self, client, remote), fields(client_addr = %client_addr))]
    pub async fn run_session<C, R>(
        &self,
        client: C,
        remote: R,
        client_addr: SocketAddr,
    ) -> ConnectionStats
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let session_id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(RelaySession::new(
            session_id.clone(),
            client_addr,
            self.remote_addr.clone(),
        ));
        self.track(&session);

        let (client_rd, client_wr) = tokio::io::split(client);
        let (remote_rd, remote_wr) = tokio::io::split(remote);

        let (teardown, _) = broadcast::channel(2);
        let upstream = Relay::new(
            Direction::ClientToRemote,
            self.buffer_size,
            Arc::clone(&session),
            &teardown,
        )
        .with_idle_timeout(self.idle_timeout);
        let downstream = Relay::new(
            Direction::RemoteToClient,
            self.buffer_size,
            Arc::clone(&session),
            &teardown,
        )
        .with_idle_timeout(self.idle_timeout);

        let upstream = tokio::spawn(upstream.run(client_rd, remote_wr));
        let downstream = tokio::spawn(downstream.run(remote_rd, client_wr));

        match tokio::join!(upstream, downstream) {
            (Ok((client_rd, remote_wr)), Ok((remote_rd, client_wr))) => {
                tokio::join!(
                    close(client_rd.unsplit(client_wr), "client"),
                    close(remote_rd.unsplit(remote_wr), "remote server"),
                );
            }
            (up, down) => {
                // A panicked relay dropped its halves; dropping the rest closes both sockets.
                for joined in [up.err(), down.err()].into_iter().flatten() {
                    error!("Relay task for session {} failed: {}", session_id, joined);
                }
            }
        }

        self.untrack(&session_id);
        session.log_stats();
        session.to_stats()
    }

    fn track(&self, session: &Arc<RelaySession>) {
        let mut sessions = self
            .active_sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.insert(session.session_id.clone(), Arc::clone(session));
    }

    fn untrack(&self, session_id: &str) {
        let mut sessions = self
            .active_sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if sessions.remove(session_id).is_some() {
            debug!("Removed session {} from active tracking", session_id);
        }
    }

    /// Get all active sessions
    pub fn get_active_sessions(&self) -> Vec<Arc<RelaySession>> {
        let sessions = self
            .active_sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.values().cloned().collect()
    }

    /// Get active session count
    pub fn active_session_count(&self) -> usize {
        let sessions = self
            .active_sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions.len()
    }
}

/// Shut the stream down once and release it.
///
/// A peer that stopped reading can keep shutdown pending forever, so the
/// stream is dropped once `CLOSE_TIMEOUT` passes.
async fn close<S>(mut stream: S, side: &str)
where
    S: AsyncWrite + Unpin,
{
    match timeout(CLOSE_TIMEOUT, stream.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Closing {} connection: {}", side, e),
        Err(_) => warn!(
            "Closing {} connection timed out after {:?}, dropping it",
            side, CLOSE_TIMEOUT
        ),
    }
    info!("Closed {} connection", side);
}
