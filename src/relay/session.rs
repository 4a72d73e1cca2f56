//! Relay Session

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::pump::Direction;

/// Book-keeping for one active tunnel session
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub remote_addr: String,
    pub start_time: Instant,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    /// Milliseconds since `start_time` at which bytes last moved
    last_activity_ms: AtomicU64,
}

/// Connection statistics for completed sessions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub remote_addr: String,
    pub duration_ms: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub total_bytes: u64,
}

impl RelaySession {
    /// Create a new relay session
    pub fn new(session_id: String, client_addr: SocketAddr, remote_addr: String) -> Self {
        debug!(
            "Creating new relay session: {} ({} -> {})",
            session_id, client_addr, remote_addr
        );

        Self {
            session_id,
            client_addr,
            remote_addr,
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    /// Bytes forwarded client to remote
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes forwarded remote to client
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_up() + self.bytes_down()
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Time since bytes last moved in either direction
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.duration().saturating_sub(last)
    }

    /// Account for bytes forwarded in one direction
    pub fn record(&self, direction: Direction, bytes: u64) {
        match direction {
            Direction::ClientToRemote => self.bytes_up.fetch_add(bytes, Ordering::Relaxed),
            Direction::RemoteToClient => self.bytes_down.fetch_add(bytes, Ordering::Relaxed),
        };
        let now_ms = self.duration().as_millis() as u64;
        self.last_activity_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    /// Generate connection statistics
    pub fn to_stats(&self) -> ConnectionStats {
        ConnectionStats {
            session_id: self.session_id.clone(),
            client_addr: self.client_addr,
            remote_addr: self.remote_addr.clone(),
            duration_ms: self.duration().as_millis() as u64,
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            total_bytes: self.total_bytes(),
        }
    }

    /// Log session statistics
    pub fn log_stats(&self) {
        info!(
            session_id = %self.session_id,
            client_addr = %self.client_addr,
            remote_addr = %self.remote_addr,
            duration_ms = self.duration().as_millis() as u64,
            bytes_up = self.bytes_up(),
            bytes_down = self.bytes_down(),
            "Session {} closed: {} -> {} | Duration: {:?} | Up: {} bytes | Down: {} bytes",
            self.session_id,
            self.client_addr,
            self.remote_addr,
            self.duration(),
            self.bytes_up(),
            self.bytes_down()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> RelaySession {
        RelaySession::new(
            "test_session".to_string(),
            "127.0.0.1:12345".parse().unwrap(),
            "example.com:443".to_string(),
        )
    }

    #[test]
    fn test_byte_accounting() {
        let session = session();
        assert_eq!(session.total_bytes(), 0);

        session.record(Direction::ClientToRemote, 1024);
        session.record(Direction::RemoteToClient, 2048);
        session.record(Direction::ClientToRemote, 1);

        let stats = session.to_stats();
        assert_eq!(stats.session_id, "test_session");
        assert_eq!(stats.remote_addr, "example.com:443");
        assert_eq!(stats.bytes_up, 1025);
        assert_eq!(stats.bytes_down, 2048);
        assert_eq!(stats.total_bytes, 3073);
    }

    #[test]
    fn test_activity_resets_idle_clock() {
        let session = session();
        std::thread::sleep(Duration::from_millis(30));
        assert!(session.idle_for() >= Duration::from_millis(30));

        session.record(Direction::RemoteToClient, 1);
        assert!(session.idle_for() < Duration::from_millis(30));
    }
}
