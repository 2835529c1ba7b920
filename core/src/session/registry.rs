// Roster bookkeeping: who is in the room, and who we are

use crate::types::{LocalIdentity, PeerId, PeerRecord};
use std::collections::BTreeMap;
use tracing::debug;

/// Authoritative map of known remote peers plus the local identity.
///
/// Only roster, arrival and departure envelopes mutate it.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    peers: BTreeMap<PeerId, PeerRecord>,
    local: Option<LocalIdentity>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the roster wholesale with a relay snapshot.
    pub fn apply_roster(&mut self, peers: Vec<PeerRecord>, local: LocalIdentity) {
        self.peers = peers
            .into_iter()
            .filter(|p| p.id != local.id)
            .map(|p| (p.id.clone(), p))
            .collect();
        debug!("Roster replaced: {} peer(s), local id {}", self.peers.len(), local.id);
        self.local = Some(local);
    }

    /// Returns false when the peer was already known (record refreshed).
    pub fn insert(&mut self, peer: PeerRecord) -> bool {
        self.peers.insert(peer.id.clone(), peer).is_none()
    }

    pub fn remove(&mut self, id: &PeerId) -> Option<PeerRecord> {
        self.peers.remove(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    /// Display identity of a peer, empty when unknown.
    pub fn avatar(&self, id: &PeerId) -> String {
        self.peers
            .get(id)
            .map(|p| p.avatar.clone())
            .unwrap_or_default()
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.values().cloned().collect()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    pub fn local(&self) -> Option<&LocalIdentity> {
        self.local.as_ref()
    }

    /// A roster snapshot has been received since the last reset.
    pub fn has_roster(&self) -> bool {
        self.local.is_some()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.local = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> PeerRecord {
        PeerRecord::new(PeerId::new(id), format!("{}.png", id))
    }

    fn me() -> LocalIdentity {
        LocalIdentity {
            id: PeerId::new("me"),
            avatar: "me.png".into(),
        }
    }

    #[test]
    fn test_roster_replaces_atomically() {
        let mut registry = SessionRegistry::new();
        registry.insert(record("stale"));
        assert!(!registry.has_roster());

        registry.apply_roster(vec![record("a"), record("b")], me());
        assert!(registry.has_roster());
        assert_eq!(registry.peer_ids(), vec![PeerId::new("a"), PeerId::new("b")]);
        assert!(!registry.contains(&PeerId::new("stale")));
        assert_eq!(registry.local().unwrap().id, PeerId::new("me"));
    }

    #[test]
    fn test_roster_never_lists_ourselves() {
        let mut registry = SessionRegistry::new();
        registry.apply_roster(vec![record("me"), record("a")], me());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_insert_and_remove() {
        let mut registry = SessionRegistry::new();
        assert!(registry.insert(record("q")));
        assert!(!registry.insert(record("q")));
        assert_eq!(registry.avatar(&PeerId::new("q")), "q.png");
        assert!(registry.remove(&PeerId::new("q")).is_some());
        assert!(registry.remove(&PeerId::new("q")).is_none());
        assert_eq!(registry.avatar(&PeerId::new("q")), "");
        assert!(registry.is_empty());
    }
}
