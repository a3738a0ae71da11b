//! Client registry
//!
//! The authoritative map from [`Identity`] to client record. Every operation
//! takes the same lock for a short, constant-time critical section, which
//! gives all register/attach/detach/resolve/set_peer calls a total order.
//! No network I/O happens under the lock: sending on a [`Channel`] only
//! enqueues for that connection's writer task.

use crate::channel::{CLOSE_REPLACED, Channel, ChannelId};
use crate::error::SignalingError;
use crate::identity::Identity;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Returned when attaching a connection to an identity that is not registered
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachError {
    #[error("identity not found")]
    NotFound,
}

/// One registered client
#[derive(Debug)]
struct ClientRecord {
    user_id: String,
    /// At most one live connection per identity
    connection: Option<Channel>,
    /// Lookup key of the paired client, never a direct reference
    peer: Option<Identity>,
    /// When the record last had no connection (registration counts)
    idle_since: Option<Instant>,
}

/// Owned copy of a client record, safe to hold across suspension points
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSnapshot {
    pub identity: Identity,
    pub user_id: String,
    pub connected: bool,
    pub peer: Option<Identity>,
}

/// Registry of all clients known to one server instance
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<Identity, ClientRecord>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Identity, ClientRecord>> {
        // critical sections never leave the map half-updated
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new client and return its freshly issued identity
    pub fn register(&self, user_id: impl Into<String>) -> Identity {
        let record = ClientRecord {
            user_id: user_id.into(),
            connection: None,
            peer: None,
            idle_since: Some(Instant::now()),
        };
        let mut clients = self.lock();
        let mut identity = Identity::issue();
        while clients.contains_key(&identity) {
            identity = Identity::issue();
        }
        clients.insert(identity, record);
        identity
    }

    /// Attach a live connection to a registered identity.
    ///
    /// A connection already attached to the identity is replaced and closed.
    pub fn attach_connection(&self, identity: Identity, channel: Channel) -> Result<(), AttachError> {
        let previous = {
            let mut clients = self.lock();
            let record = clients.get_mut(&identity).ok_or(AttachError::NotFound)?;
            record.idle_since = None;
            record.connection.replace(channel)
        };

        if let Some(previous) = previous {
            tracing::info!(identity = %identity, "replacing existing connection");
            previous.close(CLOSE_REPLACED, "replaced by a newer connection");
        }
        Ok(())
    }

    /// Live connection of an identity, if it is registered and connected
    pub fn resolve(&self, identity: Identity) -> Option<Channel> {
        self.lock()
            .get(&identity)
            .and_then(|record| record.connection.clone())
    }

    /// Resolve `identity` and queue `text` on its connection in one step
    pub fn deliver(&self, identity: Identity, text: &str) -> Result<(), SignalingError> {
        let clients = self.lock();
        let record = clients.get(&identity).ok_or(SignalingError::UnknownIdentity)?;
        let channel = record.connection.as_ref().ok_or(SignalingError::NotConnected)?;
        channel.send_text(text)
    }

    /// Clear the connection of an identity.
    ///
    /// Only clears it while `channel` is still the attached one, so a
    /// replaced connection shutting down late leaves its successor alone.
    /// Returns whether anything was detached; repeated calls are no-ops.
    pub fn detach_connection(&self, identity: Identity, channel: ChannelId) -> bool {
        let mut clients = self.lock();
        let Some(record) = clients.get_mut(&identity) else {
            return false;
        };
        match &record.connection {
            Some(current) if current.id() == channel => {
                record.connection = None;
                record.idle_since = Some(Instant::now());
                true
            }
            _ => false,
        }
    }

    /// Make `a` and `b` each other's peer.
    ///
    /// No-op (returns `false`) if either identity is unknown or both are the
    /// same. Earlier partners pointing back at `a` or `b` are unlinked so
    /// that peer links stay symmetric.
    pub fn set_peer(&self, a: Identity, b: Identity) -> bool {
        let mut clients = self.lock();
        if a == b || !clients.contains_key(&a) || !clients.contains_key(&b) {
            return false;
        }

        for identity in [a, b] {
            let old = clients.get(&identity).and_then(|record| record.peer);
            if let Some(old) = old {
                if let Some(old_record) = clients.get_mut(&old) {
                    if old_record.peer == Some(identity) {
                        old_record.peer = None;
                    }
                }
            }
        }

        if let Some(record) = clients.get_mut(&a) {
            record.peer = Some(b);
        }
        if let Some(record) = clients.get_mut(&b) {
            record.peer = Some(a);
        }
        true
    }

    pub fn peer_of(&self, identity: Identity) -> Option<Identity> {
        self.lock().get(&identity).and_then(|record| record.peer)
    }

    pub fn lookup(&self, identity: Identity) -> Option<ClientSnapshot> {
        self.lock().get(&identity).map(|record| ClientSnapshot {
            identity,
            user_id: record.user_id.clone(),
            connected: record.connection.is_some(),
            peer: record.peer,
        })
    }

    pub fn contains(&self, identity: Identity) -> bool {
        self.lock().contains_key(&identity)
    }

    pub fn is_connected(&self, identity: Identity) -> bool {
        self.lock()
            .get(&identity)
            .is_some_and(|record| record.connection.is_some())
    }

    /// Number of registered identities
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of identities with a live connection
    pub fn connected_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|record| record.connection.is_some())
            .count()
    }

    /// Remove records that have had no connection for at least `ttl` as of
    /// `now`. Partners of evicted records lose their peer link. Returns the
    /// evicted identities.
    pub fn evict_idle(&self, ttl: Duration, now: Instant) -> Vec<Identity> {
        let mut evicted = Vec::new();
        let mut clients = self.lock();
        clients.retain(|identity, record| {
            let expired = record
                .idle_since
                .is_some_and(|since| now.saturating_duration_since(since) >= ttl);
            if expired {
                evicted.push(*identity);
            }
            !expired
        });

        for record in clients.values_mut() {
            if record.peer.is_some_and(|peer| evicted.contains(&peer)) {
                record.peer = None;
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn register_creates_unconnected_unpaired_record() {
        let registry = ClientRegistry::new();
        let id = registry.register("alice");

        let snapshot = registry.lookup(id).unwrap();
        assert_eq!(snapshot.user_id, "alice");
        assert!(!snapshot.connected);
        assert_eq!(snapshot.peer, None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn display_labels_need_not_be_unique() {
        let registry = ClientRegistry::new();
        let a = registry.register("same");
        let b = registry.register("same");
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn resolve_round_trip() {
        let registry = ClientRegistry::new();
        let id = registry.register("alice");
        assert!(registry.resolve(id).is_none());

        let (channel, _rx) = Channel::new();
        let channel_id = channel.id();
        registry.attach_connection(id, channel).unwrap();
        assert_eq!(registry.resolve(id).map(|c| c.id()), Some(channel_id));
        assert!(registry.is_connected(id));

        assert!(registry.detach_connection(id, channel_id));
        assert!(registry.resolve(id).is_none());
        assert!(!registry.detach_connection(id, channel_id));
    }

    #[test]
    fn attach_to_unknown_identity_is_not_found() {
        let registry = ClientRegistry::new();
        let (channel, _rx) = Channel::new();
        assert_eq!(
            registry.attach_connection(Identity::issue(), channel),
            Err(AttachError::NotFound)
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn second_attach_closes_first_connection() {
        let registry = ClientRegistry::new();
        let id = registry.register("alice");
        let (first, mut first_rx) = Channel::new();
        let (second, mut second_rx) = Channel::new();
        let first_id = first.id();
        let second_id = second.id();

        registry.attach_connection(id, first).unwrap();
        registry.attach_connection(id, second).unwrap();

        match first_rx.try_recv() {
            Ok(Message::Close(Some(frame))) => assert_eq!(frame.code, CLOSE_REPLACED),
            other => panic!("expected close frame, got {other:?}"),
        }
        assert_eq!(registry.resolve(id).map(|c| c.id()), Some(second_id));

        registry.deliver(id, "hello").unwrap();
        assert_eq!(second_rx.try_recv().unwrap(), Message::Text("hello".into()));
        assert!(first_rx.try_recv().is_err());

        // the replaced connection shutting down must not detach its successor
        assert!(!registry.detach_connection(id, first_id));
        assert!(registry.is_connected(id));
    }

    #[test]
    fn deliver_reports_unknown_and_disconnected() {
        let registry = ClientRegistry::new();
        let id = registry.register("bob");
        assert!(matches!(
            registry.deliver(Identity::issue(), "x"),
            Err(SignalingError::UnknownIdentity)
        ));
        assert!(matches!(registry.deliver(id, "x"), Err(SignalingError::NotConnected)));
    }

    #[test]
    fn set_peer_is_symmetric() {
        let registry = ClientRegistry::new();
        let a = registry.register("a");
        let b = registry.register("b");
        assert!(registry.set_peer(a, b));
        assert_eq!(registry.peer_of(a), Some(b));
        assert_eq!(registry.peer_of(b), Some(a));
    }

    #[test]
    fn set_peer_with_unknown_identity_is_noop() {
        let registry = ClientRegistry::new();
        let a = registry.register("a");
        assert!(!registry.set_peer(a, Identity::issue()));
        assert!(!registry.set_peer(a, a));
        assert_eq!(registry.peer_of(a), None);
    }

    #[test]
    fn repairing_unlinks_previous_partner() {
        let registry = ClientRegistry::new();
        let a = registry.register("a");
        let b = registry.register("b");
        let c = registry.register("c");
        registry.set_peer(a, b);
        registry.set_peer(a, c);
        assert_eq!(registry.peer_of(a), Some(c));
        assert_eq!(registry.peer_of(c), Some(a));
        assert_eq!(registry.peer_of(b), None);
    }

    #[test]
    fn concurrent_registrations_are_all_kept() {
        let registry = Arc::new(ClientRegistry::new());
        let ids: Vec<Identity> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..100)
                .map(|i| {
                    let registry = Arc::clone(&registry);
                    scope.spawn(move || registry.register(format!("user-{i}")))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let unique: HashSet<_> = ids.iter().copied().collect();
        assert_eq!(unique.len(), 100);
        assert_eq!(registry.len(), 100);
        assert!(ids.iter().all(|id| registry.contains(*id)));
    }

    #[test]
    fn evict_idle_only_removes_disconnected_records() {
        let registry = ClientRegistry::new();
        let idle = registry.register("idle");
        let live = registry.register("live");
        let (channel, _rx) = Channel::new();
        registry.attach_connection(live, channel).unwrap();

        let ttl = Duration::from_secs(60);
        assert!(registry.evict_idle(ttl, Instant::now()).is_empty());

        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(registry.evict_idle(ttl, later), vec![idle]);
        assert!(!registry.contains(idle));
        assert!(registry.contains(live));
        assert_eq!(registry.connected_count(), 1);
    }

    #[test]
    fn evicting_a_peer_unlinks_its_partner() {
        let registry = ClientRegistry::new();
        let live = registry.register("live");
        let gone = registry.register("gone");
        let (channel, _rx) = Channel::new();
        registry.attach_connection(live, channel).unwrap();
        registry.set_peer(live, gone);

        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(registry.evict_idle(Duration::from_secs(60), later), vec![gone]);
        assert_eq!(registry.peer_of(live), None);
    }
}
