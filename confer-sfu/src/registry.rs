//! Peer registry
//!
//! Maps peer ids to their sessions. Registration and unregistration are the
//! only writers; every other component reads through [`PeerRegistry::lookup`]
//! or the snapshot helpers. The registry is passed explicitly to whoever needs
//! it, so independent registries can coexist (one per test, for instance).

use crate::error::{Result, SfuError};
use crate::message::Notification;
use crate::session::PeerSession;
use crate::types::PeerId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

#[derive(Default)]
pub struct PeerRegistry {
    /// Active sessions (DashMap for lock-free concurrent access)
    sessions: DashMap<PeerId, Arc<PeerSession>>,
}

impl PeerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and store a session for `peer_id`
    pub fn register(
        &self,
        peer_id: PeerId,
        queue_capacity: usize,
    ) -> Result<(Arc<PeerSession>, mpsc::Receiver<Notification>)> {
        match self.sessions.entry(peer_id.clone()) {
            Entry::Occupied(_) => {
                error!(peer_id = %peer_id, "Session id registered twice");
                Err(SfuError::DuplicateSession(peer_id))
            }
            Entry::Vacant(entry) => {
                let (session, notify_rx) = PeerSession::new(peer_id.clone(), queue_capacity);
                let session = Arc::new(session);
                entry.insert(Arc::clone(&session));
                info!(peer_id = %peer_id, total_peers = self.sessions.len(), "Peer registered");
                Ok((session, notify_rx))
            }
        }
    }

    #[must_use]
    pub fn lookup(&self, peer_id: &PeerId) -> Option<Arc<PeerSession>> {
        self.sessions.get(peer_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove the session and hand it back for teardown.
    /// Returns `None` if it was already removed.
    pub fn unregister(&self, peer_id: &PeerId) -> Option<Arc<PeerSession>> {
        let removed = self.sessions.remove(peer_id).map(|(_, session)| session);
        match &removed {
            Some(_) => info!(
                peer_id = %peer_id,
                remaining = self.sessions.len(),
                "Peer unregistered"
            ),
            None => debug!(peer_id = %peer_id, "Peer already unregistered"),
        }
        removed
    }

    /// Snapshot of every session except `peer_id`.
    ///
    /// No map lock is held once this returns, so callers may await while
    /// walking the result.
    #[must_use]
    pub fn others(&self, peer_id: &PeerId) -> Vec<Arc<PeerSession>> {
        self.sessions
            .iter()
            .filter(|entry| entry.key() != peer_id)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Snapshot of every session
    #[must_use]
    pub fn all(&self) -> Vec<Arc<PeerSession>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<PeerId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_lookup_unregister() {
        let registry = PeerRegistry::new();
        let peer = PeerId::from("a");

        let (session, _rx) = registry.register(peer.clone(), 8).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&session, &registry.lookup(&peer).unwrap()));

        let removed = registry.unregister(&peer).unwrap();
        assert!(Arc::ptr_eq(&session, &removed));
        assert!(registry.lookup(&peer).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = PeerRegistry::new();
        let _first = registry.register(PeerId::from("a"), 8).unwrap();

        let err = registry.register(PeerId::from("a"), 8).unwrap_err();
        assert!(matches!(err, SfuError::DuplicateSession(ref id) if id.as_str() == "a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = PeerRegistry::new();
        let _session = registry.register(PeerId::from("a"), 8).unwrap();

        assert!(registry.unregister(&PeerId::from("a")).is_some());
        assert!(registry.unregister(&PeerId::from("a")).is_none());
        assert!(registry.unregister(&PeerId::from("never")).is_none());
    }

    #[test]
    fn test_others_excludes_requester() {
        let registry = PeerRegistry::new();
        for id in ["a", "b", "c"] {
            let _ = registry.register(PeerId::from(id), 8).unwrap();
        }

        let mut others: Vec<_> = registry
            .others(&PeerId::from("b"))
            .into_iter()
            .map(|s| s.id.to_string())
            .collect();
        others.sort();
        assert_eq!(others, vec!["a", "c"]);

        let mut ids = registry.ids();
        ids.sort();
        assert_eq!(ids.len(), 3);
        assert_eq!(registry.all().len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_unregister_returns_session_once() {
        let registry = Arc::new(PeerRegistry::new());
        let _session = registry.register(PeerId::from("a"), 8).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.unregister(&PeerId::from("a")).is_some() })
            })
            .collect();

        let mut removed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                removed += 1;
            }
        }
        assert_eq!(removed, 1);
    }
}
