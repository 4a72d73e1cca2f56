//! Resource Management
//!
//! Optional admission control on concurrent tunnel sessions. Without a
//! configured limit every accepted connection gets a slot.

use crate::config::Config;
use crate::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Resource manager that tracks and enforces the session limit
pub struct ResourceManager {
    max_connections: Option<usize>,
    /// Present only when a limit is configured
    connection_semaphore: Option<Arc<Semaphore>>,
    active: Arc<AtomicUsize>,
    stats: ResourceStats,
}

/// Resource usage counters
#[derive(Debug, Default)]
struct ResourceStats {
    peak_connections: AtomicUsize,
    total_connections_created: AtomicUsize,
    total_connections_rejected: AtomicUsize,
}

impl ResourceManager {
    /// Create a new resource manager
    pub fn new(config: Arc<Config>) -> Self {
        let max_connections = config.tunnel.max_connections;

        Self {
            max_connections,
            connection_semaphore: max_connections.map(|max| Arc::new(Semaphore::new(max))),
            active: Arc::new(AtomicUsize::new(0)),
            stats: ResourceStats::default(),
        }
    }

    /// Try to acquire a connection slot
    pub fn acquire_connection_slot(&self) -> Result<ConnectionSlot> {
        let permit = match &self.connection_semaphore {
            Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.stats
                        .total_connections_rejected
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Connection limit reached ({}), rejecting connection",
                        self.max_connections.unwrap_or_default()
                    );
                    return Err(anyhow::anyhow!("Connection limit reached"));
                }
            },
            None => None,
        };

        self.stats
            .total_connections_created
            .fetch_add(1, Ordering::Relaxed);
        let current = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats
            .peak_connections
            .fetch_max(current, Ordering::Relaxed);

        debug!("Acquired connection slot, active connections: {}", current);
        Ok(ConnectionSlot {
            _permit: permit,
            active: Arc::clone(&self.active),
        })
    }

    /// Get current resource usage statistics
    pub fn get_stats(&self) -> ResourceUsageStats {
        ResourceUsageStats {
            active_connections: self.active.load(Ordering::Relaxed),
            peak_connections: self.stats.peak_connections.load(Ordering::Relaxed),
            total_connections_created: self.stats.total_connections_created.load(Ordering::Relaxed),
            total_connections_rejected: self
                .stats
                .total_connections_rejected
                .load(Ordering::Relaxed),
            max_connections: self.max_connections,
        }
    }
}

/// Connection slot that automatically releases when dropped
pub struct ConnectionSlot {
    _permit: Option<OwnedSemaphorePermit>,
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        debug!("Released connection slot");
    }
}

/// Resource usage statistics for monitoring
#[derive(Debug, Clone)]
pub struct ResourceUsageStats {
    pub active_connections: usize,
    pub peak_connections: usize,
    pub total_connections_created: usize,
    pub total_connections_rejected: usize,
    pub max_connections: Option<usize>,
}
