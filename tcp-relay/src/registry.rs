//! The set of connections currently eligible to receive broadcasts.

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::Mutex;

use crate::connection::Peer;

/// Handle returned by [`ClientRegistry::register`], used to unregister and to
/// recognise the origin of a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientToken(u64);

impl fmt::Display for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct ClientEntry {
    addr: SocketAddr,
    peer: Weak<Peer>,
}

/// Shared registry of live connections.
///
/// Entries hold weak references: the handler task owns its connection and
/// removes its own entry on exit.
pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientToken, ClientEntry>>,
    next_token: AtomicU64,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    pub async fn register(&self, peer: &Arc<Peer>) -> ClientToken {
        let token = ClientToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let entry = ClientEntry {
            addr: peer.addr(),
            peer: Arc::downgrade(peer),
        };
        self.clients.lock().await.insert(token, entry);
        token
    }

    /// Removes `token`. Returns `false` if it was already gone.
    pub async fn unregister(&self, token: ClientToken) -> bool {
        self.clients.lock().await.remove(&token).is_some()
    }

    /// Copies out the live entries so callers can do I/O without the lock.
    pub async fn snapshot(&self) -> Vec<(ClientToken, Arc<Peer>)> {
        let clients = self.clients.lock().await;
        clients
            .iter()
            .filter_map(|(token, entry)| entry.peer.upgrade().map(|peer| (*token, peer)))
            .collect()
    }

    pub async fn addr_of(&self, token: ClientToken) -> Option<SocketAddr> {
        self.clients.lock().await.get(&token).map(|entry| entry.addr)
    }

    pub async fn contains(&self, token: ClientToken) -> bool {
        self.clients.lock().await.contains_key(&token)
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionOptions, tests::loopback_pair};

    #[tokio::test]
    async fn register_then_unregister_is_net_zero() {
        let registry = ClientRegistry::new();
        let (conn, _client) = loopback_pair(ConnectionOptions::default()).await;

        let token = registry.register(conn.peer()).await;
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.addr_of(token).await, Some(conn.addr()));

        assert!(registry.unregister(token).await);
        assert!(registry.is_empty().await);
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn unregister_twice_is_a_no_op() {
        let registry = ClientRegistry::new();
        let (conn, _client) = loopback_pair(ConnectionOptions::default()).await;

        let token = registry.register(conn.peer()).await;
        assert!(registry.unregister(token).await);
        assert!(!registry.unregister(token).await);
        assert!(!registry.contains(token).await);
    }

    #[tokio::test]
    async fn tokens_are_unique_per_registration() {
        let registry = ClientRegistry::new();
        let (first, _a) = loopback_pair(ConnectionOptions::default()).await;
        let (second, _b) = loopback_pair(ConnectionOptions::default()).await;

        let one = registry.register(first.peer()).await;
        let two = registry.register(second.peer()).await;
        assert_ne!(one, two);

        let mut tokens: Vec<_> = registry
            .snapshot()
            .await
            .into_iter()
            .map(|(token, _)| token)
            .collect();
        tokens.sort();
        assert_eq!(tokens, vec![one, two]);
    }

    #[tokio::test]
    async fn snapshot_skips_dropped_connections() {
        let registry = ClientRegistry::new();
        let (kept, _a) = loopback_pair(ConnectionOptions::default()).await;
        let (dropped, _b) = loopback_pair(ConnectionOptions::default()).await;

        let kept_token = registry.register(kept.peer()).await;
        registry.register(dropped.peer()).await;
        drop(dropped);

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, kept_token);
    }
}
