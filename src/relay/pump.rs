//! One-direction byte pump

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::RelaySession;

/// Which way a relay moves bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToRemote,
    RemoteToClient,
}

impl Direction {
    pub fn source(&self) -> &'static str {
        match self {
            Direction::ClientToRemote => "client",
            Direction::RemoteToClient => "remote server",
        }
    }

    pub fn destination(&self) -> &'static str {
        match self {
            Direction::ClientToRemote => "remote server",
            Direction::RemoteToClient => "client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source(), self.destination())
    }
}

/// Moves bytes from one connection to another until either side fails.
///
/// A relay stops on the first read error, end of stream, write error, or
/// teardown notice from its peer relay, and never resumes. On the way out it
/// broadcasts its own teardown notice so the opposite direction stops too.
pub struct Relay {
    direction: Direction,
    buffer_size: usize,
    idle_timeout: Option<Duration>,
    session: Arc<RelaySession>,
    teardown_tx: broadcast::Sender<()>,
    teardown_rx: broadcast::Receiver<()>,
}

impl Relay {
    /// Create a relay that listens on, and signals through, `teardown`.
    ///
    /// The receiver is subscribed here so a notice sent before this relay
    /// starts running is still observed.
    pub fn new(
        direction: Direction,
        buffer_size: usize,
        session: Arc<RelaySession>,
        teardown: &broadcast::Sender<()>,
    ) -> Self {
        Self {
            direction,
            buffer_size,
            idle_timeout: None,
            session,
            teardown_tx: teardown.clone(),
            teardown_rx: teardown.subscribe(),
        }
    }

    /// Stop once the whole session has been idle this long
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Pump until termination, handing both halves back to the caller for closing
    pub async fn run<R, W>(self, mut reader: R, mut writer: W) -> (R, W)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let Relay {
            direction,
            buffer_size,
            idle_timeout,
            session,
            teardown_tx,
            mut teardown_rx,
        } = self;

        let mut buf = vec![0u8; buffer_size];

        loop {
            let n = tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        info!("Read from {} : EOF", direction.source());
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!("Read from {} : {}", direction.source(), e);
                        break;
                    }
                },
                _ = teardown_rx.recv() => {
                    debug!("Relay {} stopping, opposite direction finished", direction);
                    break;
                }
                _ = idle_deadline(&session, idle_timeout) => {
                    if idle_expired(&session, idle_timeout) {
                        info!("Session {} idle for {:?}, closing", session.session_id, session.idle_for());
                        break;
                    }
                    continue;
                }
            };

            tokio::select! {
                written = forward(&mut writer, &buf[..n], &session, direction) => {
                    if let Err(e) = written {
                        warn!("Write to {} : {}", direction.destination(), e);
                        break;
                    }
                }
                _ = teardown_rx.recv() => {
                    debug!("Relay {} stopping mid-write, opposite direction finished", direction);
                    break;
                }
            }
        }

        let _ = teardown_tx.send(());
        (reader, writer)
    }
}

/// Write one chunk in full, counting each partial write as session activity
async fn forward<W>(
    writer: &mut W,
    chunk: &[u8],
    session: &RelaySession,
    direction: Direction,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < chunk.len() {
        let n = writer.write(&chunk[written..]).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        session.record(direction, n as u64);
        written += n;
    }
    writer.flush().await
}

/// Resolves when the session could have reached its idle limit
async fn idle_deadline(session: &RelaySession, idle_timeout: Option<Duration>) {
    match idle_timeout {
        Some(limit) => tokio::time::sleep(limit.saturating_sub(session.idle_for())).await,
        None => std::future::pending().await,
    }
}

fn idle_expired(session: &RelaySession, idle_timeout: Option<Duration>) -> bool {
    idle_timeout.is_some_and(|limit| session.idle_for() >= limit)
}
