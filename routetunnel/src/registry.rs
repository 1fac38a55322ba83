use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::info;

use crate::{
    config::ReplacementPolicy,
    error::RelayError,
    route::Route,
    tunnel::{ConnectionId, ConnectionState, TunnelConnection, TunnelInfo},
};

/// Receipt for a successful `register`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub route: Route,
    pub connection_id: ConnectionId,
    /// Connection that was displaced, if any.
    pub replaced: Option<ConnectionId>,
}

/// In-memory map from route to its live control connection.
///
/// The lock is only held for the map mutation itself, never across I/O.
#[derive(Debug)]
pub struct TunnelRegistry {
    tunnels: Mutex<HashMap<Route, Arc<TunnelConnection>>>,
    policy: ReplacementPolicy,
    next_connection_id: AtomicU64,
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new(ReplacementPolicy::default())
    }
}

impl TunnelRegistry {
    pub fn new(policy: ReplacementPolicy) -> Self {
        Self {
            tunnels: Mutex::new(HashMap::new()),
            policy,
            next_connection_id: AtomicU64::new(1),
        }
    }

    fn tunnels(&self) -> MutexGuard<'_, HashMap<Route, Arc<TunnelConnection>>> {
        self.tunnels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Installs `connection` as the authoritative tunnel for its route.
    ///
    /// With [`ReplacementPolicy::Replace`] an existing connection is
    /// displaced and closed inside the same critical section, so
    /// [`lookup_connected`](Self::lookup_connected) sees either the old or
    /// the new connection as live, never neither.
    pub fn register(&self, connection: Arc<TunnelConnection>) -> Result<Registration, RelayError> {
        let route = connection.route().clone();
        let mut tunnels = self.tunnels();
        if let Some(existing) = tunnels.get(&route) {
            let live = !matches!(
                existing.state(),
                ConnectionState::Closing | ConnectionState::Closed
            );
            if live && self.policy == ReplacementPolicy::Reject {
                return Err(RelayError::AlreadyExists(route.to_string()));
            }
        }

        let replaced = tunnels
            .insert(route.clone(), Arc::clone(&connection))
            .filter(|old| old.id() != connection.id())
            .map(|old| {
                old.close();
                old.id()
            });
        drop(tunnels);

        if let Some(old) = replaced {
            info!(
                "Tunnel {}: connection {} replaced by {}",
                route,
                old,
                connection.id()
            );
        }

        Ok(Registration {
            route,
            connection_id: connection.id(),
            replaced,
        })
    }

    /// Current connection for `route`.
    ///
    /// The result may go stale right after this returns; senders must still
    /// handle a failed send.
    pub fn lookup(&self, route: &str) -> Option<Arc<TunnelConnection>> {
        self.tunnels().get(route).cloned()
    }

    /// Like [`lookup`](Self::lookup), but only returns a connection that was
    /// `Connected` while the map was locked.
    pub fn lookup_connected(&self, route: &str) -> Option<Arc<TunnelConnection>> {
        self.tunnels()
            .get(route)
            .filter(|conn| conn.is_connected())
            .cloned()
    }

    /// Removes the entry only if it still belongs to `connection_id`.
    pub fn unregister(&self, route: &Route, connection_id: ConnectionId) -> bool {
        let mut tunnels = self.tunnels();
        match tunnels.get(route) {
            Some(current) if current.id() == connection_id => {
                tunnels.remove(route);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tunnels().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list_public(&self) -> Vec<TunnelInfo> {
        self.snapshot(|conn| conn.visibility().is_public())
    }

    pub fn list_for_owner(&self, owner: &str) -> Vec<TunnelInfo> {
        self.snapshot(|conn| conn.owner() == owner)
    }

    fn snapshot(&self, filter: impl Fn(&TunnelConnection) -> bool) -> Vec<TunnelInfo> {
        let connections: Vec<Arc<TunnelConnection>> = self.tunnels().values().cloned().collect();
        let mut infos: Vec<TunnelInfo> = connections
            .iter()
            .filter(|conn| filter(conn))
            .map(|conn| conn.info())
            .collect();
        infos.sort_by(|a, b| a.route.cmp(&b.route));
        infos
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        auth::{Grant, Visibility},
        transport::Frame,
    };

    fn connection(
        registry: &TunnelRegistry,
        route: &str,
        owner: &str,
        visibility: Visibility,
    ) -> (Arc<TunnelConnection>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let grant = Grant {
            owner: owner.to_string(),
            visibility,
        };
        let conn = TunnelConnection::new(
            registry.next_connection_id(),
            Route::parse(route).unwrap(),
            grant,
            tx,
        );
        conn.set_state(ConnectionState::Connected);
        (Arc::new(conn), rx)
    }

    #[test]
    fn test_lookup_unknown_route_is_absent() {
        let registry = TunnelRegistry::default();
        assert!(registry.lookup("demo").is_none());
        assert!(registry.lookup("not a route").is_none());
    }

    #[test]
    fn test_register_lookup_unregister() {
        let registry = TunnelRegistry::default();
        let (conn, _rx) = connection(&registry, "demo", "alice", Visibility::Public);
        let registration = registry.register(Arc::clone(&conn)).unwrap();
        assert_eq!(registration.connection_id, conn.id());
        assert_eq!(registration.replaced, None);

        let found = registry.lookup("demo").unwrap();
        assert_eq!(found.id(), conn.id());

        assert!(registry.unregister(conn.route(), conn.id()));
        assert!(registry.lookup("demo").is_none());
        assert!(!registry.unregister(conn.route(), conn.id()));
    }

    #[tokio::test]
    async fn test_last_writer_wins_and_old_is_closed() {
        let registry = TunnelRegistry::default();
        let (old, _old_rx) = connection(&registry, "demo", "alice", Visibility::Public);
        let (new, _new_rx) = connection(&registry, "demo", "alice", Visibility::Public);

        registry.register(Arc::clone(&old)).unwrap();
        let registration = registry.register(Arc::clone(&new)).unwrap();
        assert_eq!(registration.replaced, Some(old.id()));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup("demo").unwrap().id(), new.id());

        old.closed().await;
        assert_eq!(old.state(), ConnectionState::Closing);
        assert!(new.is_connected());

        assert_eq!(registry.lookup_connected("demo").unwrap().id(), new.id());

        // The displaced connection's late teardown must not evict the new one.
        assert!(!registry.unregister(old.route(), old.id()));
        assert_eq!(registry.lookup("demo").unwrap().id(), new.id());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_replacement_never_leaves_route_without_live_connection() {
        let registry = Arc::new(TunnelRegistry::default());
        let (first, _rx) = connection(&registry, "demo", "alice", Visibility::Public);
        registry.register(first).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let watcher = tokio::spawn({
            let registry = Arc::clone(&registry);
            let stop = Arc::clone(&stop);
            async move {
                let mut misses = 0;
                while !stop.load(Ordering::Relaxed) {
                    if registry.lookup_connected("demo").is_none() {
                        misses += 1;
                    }
                    tokio::task::yield_now().await;
                }
                misses
            }
        });

        let mut receivers = Vec::new();
        for _ in 0..200 {
            let (next, rx) = connection(&registry, "demo", "alice", Visibility::Public);
            receivers.push(rx);
            registry.register(next).unwrap();
            tokio::task::yield_now().await;
        }
        stop.store(true, Ordering::Relaxed);

        assert_eq!(watcher.await.unwrap(), 0);
    }

    #[test]
    fn test_reject_policy_refuses_live_duplicate() {
        let registry = TunnelRegistry::new(ReplacementPolicy::Reject);
        let (first, _rx1) = connection(&registry, "demo", "alice", Visibility::Public);
        let (second, _rx2) = connection(&registry, "demo", "alice", Visibility::Public);

        registry.register(Arc::clone(&first)).unwrap();
        match registry.register(Arc::clone(&second)) {
            Err(RelayError::AlreadyExists(route)) => assert_eq!(route, "demo"),
            other => panic!("expected AlreadyExists, got {other:?}"),
        }
        assert_eq!(registry.lookup("demo").unwrap().id(), first.id());
        assert!(first.is_connected());

        // A closing connection no longer blocks the route.
        first.close();
        registry.register(Arc::clone(&second)).unwrap();
        assert_eq!(registry.lookup("demo").unwrap().id(), second.id());
    }

    #[test]
    fn test_listings() {
        let registry = TunnelRegistry::default();
        let (a, _ra) = connection(&registry, "zeta", "alice", Visibility::Public);
        let (b, _rb) = connection(&registry, "alpha", "alice", Visibility::Private);
        let (c, _rc) = connection(&registry, "beta", "bob", Visibility::Public);
        for conn in [&a, &b, &c] {
            registry.register(Arc::clone(conn)).unwrap();
        }

        let public: Vec<String> = registry
            .list_public()
            .into_iter()
            .map(|info| info.route)
            .collect();
        assert_eq!(public, vec!["beta", "zeta"]);

        let alice: Vec<String> = registry
            .list_for_owner("alice")
            .into_iter()
            .map(|info| info.route)
            .collect();
        assert_eq!(alice, vec!["alpha", "zeta"]);
        assert!(registry.list_for_owner("carol").is_empty());
    }
}
