use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::{
    auth::{Grant, Visibility},
    error::RelayError,
    pending::PendingTable,
    route::Route,
    transport::Frame,
};

pub type ConnectionId = u64;

/// Lifecycle of one control connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// One live control channel as seen by the rest of the relay.
///
/// Frames are queued on an unbounded channel drained by the connection's
/// writer task, so sending never waits on socket I/O.
#[derive(Debug)]
pub struct TunnelConnection {
    id: ConnectionId,
    route: Route,
    owner: String,
    visibility: Visibility,
    created_at: SystemTime,
    started: Instant,
    last_activity_ms: AtomicU64,
    state: Mutex<ConnectionState>,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Arc<PendingTable>,
    shutdown: watch::Sender<bool>,
}

impl TunnelConnection {
    pub fn new(
        id: ConnectionId,
        route: Route,
        grant: Grant,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            id,
            route,
            owner: grant.owner,
            visibility: grant.visibility,
            created_at: SystemTime::now(),
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            state: Mutex::new(ConnectionState::Connecting),
            outbound,
            pending: PendingTable::new(),
            shutdown,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn pending(&self) -> &Arc<PendingTable> {
        &self.pending
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves the state forward. Going backwards is ignored.
    pub fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if rank(next) > rank(*state) {
            debug!(
                "Tunnel {} connection {}: {:?} -> {:?}",
                self.route, self.id, *state, next
            );
            *state = next;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Records inbound traffic for keepalive accounting.
    pub fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.store(elapsed, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    pub fn last_activity(&self) -> SystemTime {
        self.created_at + Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed))
    }

    /// Queues a frame for the writer task.
    ///
    /// Fails with `TunnelDisconnected` once the connection is closing or
    /// its writer has gone away.
    pub fn send(&self, frame: Frame) -> Result<(), RelayError> {
        if matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return Err(RelayError::TunnelDisconnected);
        }
        self.outbound
            .send(frame)
            .map_err(|_| RelayError::TunnelDisconnected)
    }

    /// Asks the owning control channel to shut down. Idempotent.
    pub fn close(&self) {
        self.set_state(ConnectionState::Closing);
        self.shutdown.send_replace(true);
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            route: self.route.to_string(),
            owner: self.owner.clone(),
            connected: self.is_connected(),
            created_at: unix_secs(self.created_at),
            last_seen: unix_secs(self.last_activity()),
            is_public: self.visibility.is_public(),
        }
    }
}

fn rank(state: ConnectionState) -> u8 {
    match state {
        ConnectionState::Connecting => 0,
        ConnectionState::Connected => 1,
        ConnectionState::Closing => 2,
        ConnectionState::Closed => 3,
    }
}

fn unix_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Snapshot served by the management endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TunnelInfo {
    pub route: String,
    pub owner: String,
    pub connected: bool,
    pub created_at: f64,
    pub last_seen: f64,
    pub is_public: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (TunnelConnection, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let grant = Grant {
            owner: "alice".to_string(),
            visibility: Visibility::Public,
        };
        (
            TunnelConnection::new(1, Route::parse("demo").unwrap(), grant, tx),
            rx,
        )
    }

    #[test]
    fn test_state_only_moves_forward() {
        let (conn, _rx) = connection();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        conn.set_state(ConnectionState::Connected);
        assert!(conn.is_connected());
        conn.set_state(ConnectionState::Closed);
        conn.set_state(ConnectionState::Connected);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_send_fails_after_close() {
        let (conn, mut rx) = connection();
        conn.set_state(ConnectionState::Connected);
        conn.send(Frame::Ping { timestamp_ms: 1 }).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Frame::Ping { timestamp_ms: 1 });

        conn.close();
        assert!(matches!(
            conn.send(Frame::Ping { timestamp_ms: 2 }),
            Err(RelayError::TunnelDisconnected)
        ));
    }

    #[test]
    fn test_send_fails_when_writer_gone() {
        let (conn, rx) = connection();
        conn.set_state(ConnectionState::Connected);
        drop(rx);
        assert!(matches!(
            conn.send(Frame::Ping { timestamp_ms: 1 }),
            Err(RelayError::TunnelDisconnected)
        ));
    }

    #[tokio::test]
    async fn test_closed_resolves_after_close() {
        let (conn, _rx) = connection();
        let conn = Arc::new(conn);
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.closed().await })
        };
        conn.close();
        waiter.await.unwrap();
        // Already closed: returns immediately.
        conn.closed().await;
        assert_eq!(conn.state(), ConnectionState::Closing);
    }

    #[test]
    fn test_info_snapshot() {
        let (conn, _rx) = connection();
        conn.touch();
        let info = conn.info();
        assert_eq!(info.route, "demo");
        assert_eq!(info.owner, "alice");
        assert!(!info.connected);
        assert!(info.is_public);
        assert!(info.last_seen >= info.created_at);
    }
}
