//! Presence registry: which users are reachable, and on which connections.

use chrono::{DateTime, Utc};
use huddle_common::{ConnectionId, Signal, UserId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};

/// One live relay connection.
#[derive(Debug, Clone)]
pub struct Presence {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    /// Last heartbeat (or registration) time
    pub last_seen: DateTime<Utc>,
    outbound: mpsc::Sender<Signal>,
}

/// Result of unbinding a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub user_id: UserId,
    /// The user has no live connection left.
    pub last_connection: bool,
}

#[derive(Default)]
struct PresenceIndex {
    /// connection_id → Presence
    connections: HashMap<ConnectionId, Presence>,
    /// user_id → connection ids (a user can have multiple devices)
    by_user: HashMap<UserId, Vec<ConnectionId>>,
}

/// Tracks all live connections.
///
/// Both indexes sit behind one lock so "was this the user's last connection"
/// is answered atomically with the removal.
#[derive(Default)]
pub struct PresenceRegistry {
    inner: RwLock<PresenceIndex>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection to a user. Returns `true` if this is the user's first
    /// live connection. Registering the same connection twice is a no-op.
    pub async fn register(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
        outbound: mpsc::Sender<Signal>,
    ) -> bool {
        let mut index = self.inner.write().await;
        if index.connections.contains_key(&connection_id) {
            return false;
        }

        let sessions = index.by_user.entry(user_id.clone()).or_default();
        let first = sessions.is_empty();
        sessions.push(connection_id);

        index.connections.insert(
            connection_id,
            Presence {
                user_id,
                connection_id,
                last_seen: Utc::now(),
                outbound,
            },
        );
        first
    }

    /// Unbind a connection.
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<Departure> {
        let mut index = self.inner.write().await;
        let presence = index.connections.remove(&connection_id)?;

        let mut last_connection = true;
        if let Some(sessions) = index.by_user.get_mut(&presence.user_id) {
            sessions.retain(|c| *c != connection_id);
            last_connection = sessions.is_empty();
        }
        if last_connection {
            index.by_user.remove(&presence.user_id);
        }

        Some(Departure {
            user_id: presence.user_id,
            last_connection,
        })
    }

    /// Record a heartbeat. Returns `false` for unknown connections.
    pub async fn touch(&self, connection_id: ConnectionId) -> bool {
        match self.inner.write().await.connections.get_mut(&connection_id) {
            Some(presence) => {
                presence.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, connection_id: ConnectionId) -> Option<Presence> {
        self.inner.read().await.connections.get(&connection_id).cloned()
    }

    /// Outbound queue of one connection.
    pub async fn sender(&self, connection_id: ConnectionId) -> Option<mpsc::Sender<Signal>> {
        self.inner
            .read()
            .await
            .connections
            .get(&connection_id)
            .map(|p| p.outbound.clone())
    }

    /// Outbound queues of every live connection of a user.
    pub async fn senders(&self, user_id: &UserId) -> Vec<mpsc::Sender<Signal>> {
        let index = self.inner.read().await;
        index
            .by_user
            .get(user_id)
            .map(|conns| {
                conns
                    .iter()
                    .filter_map(|c| index.connections.get(c))
                    .map(|p| p.outbound.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Outbound queues of every connection not owned by `user_id`.
    pub async fn senders_except(&self, user_id: &UserId) -> Vec<mpsc::Sender<Signal>> {
        self.inner
            .read()
            .await
            .connections
            .values()
            .filter(|p| p.user_id != *user_id)
            .map(|p| p.outbound.clone())
            .collect()
    }

    /// Check if a user is online (has at least one live connection).
    pub async fn is_online(&self, user_id: &UserId) -> bool {
        self.inner.read().await.by_user.contains_key(user_id)
    }

    /// Connections whose last heartbeat is older than `timeout`.
    pub async fn stale(&self, timeout: Duration) -> Vec<ConnectionId> {
        let Some(cutoff) = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| Utc::now().checked_sub_signed(t))
        else {
            return Vec::new();
        };
        self.inner
            .read()
            .await
            .connections
            .values()
            .filter(|p| p.last_seen < cutoff)
            .map(|p| p.connection_id)
            .collect()
    }

    /// (live connections, online users)
    pub async fn counts(&self) -> (usize, usize) {
        let index = self.inner.read().await;
        (index.connections.len(), index.by_user.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound() -> mpsc::Sender<Signal> {
        mpsc::channel(8).0
    }

    #[tokio::test]
    async fn test_first_and_last_connection() {
        let registry = PresenceRegistry::new();
        let alice = UserId::from("alice");
        let phone = ConnectionId::new();
        let laptop = ConnectionId::new();

        assert!(registry.register(alice.clone(), phone, outbound()).await);
        assert!(!registry.register(alice.clone(), laptop, outbound()).await);
        assert_eq!(registry.senders(&alice).await.len(), 2);

        let departure = registry.unregister(phone).await.unwrap();
        assert!(!departure.last_connection);
        assert!(registry.is_online(&alice).await);

        let departure = registry.unregister(laptop).await.unwrap();
        assert!(departure.last_connection);
        assert!(!registry.is_online(&alice).await);
        assert!(registry.unregister(laptop).await.is_none());
    }

    #[tokio::test]
    async fn test_register_is_idempotent_per_connection() {
        let registry = PresenceRegistry::new();
        let conn = ConnectionId::new();

        assert!(registry.register("bob".into(), conn, outbound()).await);
        assert!(!registry.register("bob".into(), conn, outbound()).await);
        assert_eq!(registry.counts().await, (1, 1));
    }

    #[tokio::test]
    async fn test_senders_except_skips_all_of_the_users_devices() {
        let registry = PresenceRegistry::new();
        registry.register("alice".into(), ConnectionId::new(), outbound()).await;
        registry.register("alice".into(), ConnectionId::new(), outbound()).await;
        registry.register("bob".into(), ConnectionId::new(), outbound()).await;

        assert_eq!(registry.senders_except(&"alice".into()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_connections() {
        let registry = PresenceRegistry::new();
        let conn = ConnectionId::new();
        registry.register("carol".into(), conn, outbound()).await;
        tokio::time::sleep(Duration::from_millis(2)).await;

        assert!(registry.stale(Duration::from_secs(60)).await.is_empty());
        assert_eq!(registry.stale(Duration::ZERO).await.len(), 1);
        assert!(registry.touch(conn).await);
        assert!(!registry.touch(ConnectionId::new()).await);
    }
}
