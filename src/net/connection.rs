//! Connection slot and lifecycle tracking.
//!
//! # Responsibilities
//! - Wrap an accepted socket with its admission permit
//! - Track keep-alive budget, last access and idle timeout
//! - Carry the state tag the dispatcher acts on
//! - Generate unique connection IDs for tracing
//!
//! # Design Decisions
//! - The slot owns its permit: closing or dropping the slot releases admission
//! - Only the worker currently holding the slot mutates it

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::net::latch::AdmissionPermit;

/// Atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state, also the result of one processing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Ready for another read cycle.
    Open,
    /// Done; close the socket and release admission.
    Closed,
    /// Switching protocols; treated like `Open` by the dispatcher.
    Upgrading,
    /// Waiting for more input: park until the socket turns readable, is
    /// resumed, or times out.
    Long,
    /// Waiting on an asynchronous completion: park until resumed or timed out.
    AsyncWaiting,
}

impl SocketState {
    /// Whether the dispatcher parks the connection in its waiting set.
    pub fn is_parked(&self) -> bool {
        matches!(self, SocketState::Long | SocketState::AsyncWaiting)
    }
}

/// Why a connection is being handed to the protocol handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    /// Data may be read (fresh accept, recycle, or resume).
    OpenRead,
    /// The connection sat parked longer than its timeout.
    Timeout,
}

/// Per-connection settings taken from the connector configuration.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub timeout: Duration,
    pub max_keep_alive_requests: Option<u32>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            max_keep_alive_requests: None,
        }
    }
}

/// An admitted connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    stream: TcpStream,
    peer_addr: SocketAddr,
    keep_alive_left: Option<u32>,
    last_access: Instant,
    timeout: Duration,
    state: SocketState,
    permit: Option<AdmissionPermit>,
}

impl Connection {
    /// Wrap an accepted stream. `permit` is released when the connection goes away.
    pub fn new(
        stream: TcpStream,
        peer_addr: SocketAddr,
        permit: Option<AdmissionPermit>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            stream,
            peer_addr,
            keep_alive_left: settings.max_keep_alive_requests,
            last_access: Instant::now(),
            timeout: settings.timeout,
            state: SocketState::Open,
            permit,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn set_state(&mut self, state: SocketState) {
        self.state = state;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    /// Mark activity now.
    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    /// Whether the connection has been idle longer than its timeout at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_access) > self.timeout
    }

    /// Count one served request against the keep-alive budget.
    ///
    /// Returns `false` once the budget is exhausted; the handler should then
    /// answer `Closed`.
    pub fn consume_keep_alive(&mut self) -> bool {
        match self.keep_alive_left.as_mut() {
            None => true,
            Some(left) => {
                *left = left.saturating_sub(1);
                *left > 0
            }
        }
    }

    /// Remaining keep-alive requests (None = unlimited).
    pub fn keep_alive_left(&self) -> Option<u32> {
        self.keep_alive_left
    }

    /// Whether this connection still holds an admission slot.
    pub fn holds_permit(&self) -> bool {
        self.permit.is_some()
    }

    /// Shut the socket down and release admission.
    pub async fn close(mut self) {
        self.state = SocketState::Closed;
        if let Err(e) = self.stream.shutdown().await {
            tracing::trace!(connection_id = %self.id, error = %e, "Socket shutdown failed");
        }
        tracing::trace!(connection_id = %self.id, peer_addr = %self.peer_addr, "Connection closed");
        // Dropping `self` drops the permit.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::latch::AdmissionLatch;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, SocketAddr, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (server, peer, client)
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("conn-"));
    }

    #[test]
    fn parked_states() {
        assert!(SocketState::Long.is_parked());
        assert!(SocketState::AsyncWaiting.is_parked());
        assert!(!SocketState::Open.is_parked());
        assert!(!SocketState::Upgrading.is_parked());
        assert!(!SocketState::Closed.is_parked());
    }

    #[tokio::test]
    async fn keep_alive_budget_runs_out() {
        let (server, peer, _client) = connected_pair().await;
        let settings = ConnectionSettings {
            timeout: Duration::from_secs(1),
            max_keep_alive_requests: Some(2),
        };
        let mut conn = Connection::new(server, peer, None, settings);

        assert!(conn.consume_keep_alive());
        assert!(!conn.consume_keep_alive());
        assert_eq!(conn.keep_alive_left(), Some(0));
    }

    #[tokio::test]
    async fn expiry_follows_last_access() {
        let (server, peer, _client) = connected_pair().await;
        let settings = ConnectionSettings {
            timeout: Duration::from_millis(50),
            max_keep_alive_requests: None,
        };
        let mut conn = Connection::new(server, peer, None, settings);

        let now = Instant::now();
        assert!(!conn.is_expired(now));
        assert!(conn.is_expired(now + Duration::from_millis(60)));

        tokio::time::sleep(Duration::from_millis(10)).await;
        conn.touch();
        assert!(!conn.is_expired(conn.last_access() + Duration::from_millis(40)));
    }

    #[tokio::test]
    async fn close_releases_permit() {
        let latch = Arc::new(AdmissionLatch::new(1));
        let permit = latch.try_acquire_owned().unwrap();
        let (server, peer, _client) = connected_pair().await;

        let conn = Connection::new(server, peer, Some(permit), ConnectionSettings::default());
        assert!(conn.holds_permit());
        assert_eq!(latch.count(), 1);

        conn.close().await;
        assert_eq!(latch.count(), 0);
    }
}
