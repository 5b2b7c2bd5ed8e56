//! Process-wide directory of connected peers.
//!
//! Three views are kept consistent:
//!
//! - a flat map `id -> Peer` (authoritative membership),
//! - a tenant index `tenant_code -> {id -> Peer}` for routing lookups,
//! - a last-activity map `id -> Instant` read only by the sweeper.
//!
//! A bank of 16 read/write lock shards, selected by hashing the peer id,
//! serializes compound per-peer transitions (register, unregister, reindex)
//! without a single hot lock. Each map has its own lock; compound
//! operations hold the shard lock outermost and take at most one map lock
//! at a time inside it, so no two map locks ever nest.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::constants::SHARD_COUNT;
use crate::peer::Peer;
use crate::protocol::PeerFamily;

/// Aggregate connection counts, logged by the stats ticker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCounts {
    pub total: usize,
    pub desk: usize,
    pub device: usize,
}

/// Shared peer directory. Cheap to clone via `Arc` at the hub level; all
/// methods take `&self`.
pub struct Registry {
    /// Authoritative membership, keyed by peer id.
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    /// Secondary index by tenant code. Buckets are removed when emptied.
    by_tenant: RwLock<HashMap<String, HashMap<String, Arc<Peer>>>>,
    /// Last inbound activity per peer. Written on register and every frame,
    /// read by the sweeper.
    last_activity: RwLock<HashMap<String, Instant>>,
    /// Per-peer lock bank for compound transitions.
    shards: Vec<RwLock<()>>,
}

impl Registry {
    /// Create an empty registry with the default shard count.
    #[must_use]
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            by_tenant: RwLock::new(HashMap::new()),
            last_activity: RwLock::new(HashMap::new()),
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(())).collect(),
        }
    }

    /// Insert a peer into the flat map, its current tenant bucket, and the
    /// activity map.
    ///
    /// Holds the peer's shard lock across all three inserts so a concurrent
    /// `reindex` cannot observe the peer half-admitted and leave it indexed
    /// under a stale tenant.
    pub fn register(&self, peer: Arc<Peer>) {
        let _shard = self.shard_write(peer.id());

        let id = peer.id().to_string();
        let tenant = peer.tenant_code();

        self.peers_mut().insert(id.clone(), peer.clone());
        self.tenant_mut()
            .entry(tenant)
            .or_default()
            .insert(id.clone(), peer);
        self.activity_mut().insert(id, Instant::now());
    }

    /// Remove a peer from every view.
    ///
    /// Returns `true` if the peer was present — callers gate the
    /// exactly-once disconnect callback on this.
    pub fn unregister(&self, peer: &Peer) -> bool {
        let _shard = self.shard_write(peer.id());

        if self.peers_mut().remove(peer.id()).is_none() {
            return false;
        }

        let tenant = peer.tenant_code();
        {
            let mut index = self.tenant_mut();
            if let Some(bucket) = index.get_mut(&tenant) {
                bucket.remove(peer.id());
                if bucket.is_empty() {
                    index.remove(&tenant);
                }
            }
        }

        self.activity_mut().remove(peer.id());
        true
    }

    /// Move a peer between tenant buckets when its tenant code changes.
    ///
    /// The whole transition happens under the tenant index's write lock, so
    /// the router never observes the peer in both buckets or neither.
    /// No-op when the tenant is unchanged or the peer is not registered.
    pub fn reindex(&self, peer: &Arc<Peer>, new_tenant: &str) {
        let _shard = self.shard_write(peer.id());

        let old_tenant = peer.tenant_code();
        if old_tenant == new_tenant {
            return;
        }
        if !self.peers_read().contains_key(peer.id()) {
            // Identity learned before admission finished; register() will
            // insert straight into the right bucket.
            peer.set_tenant_code(new_tenant);
            return;
        }

        log::info!(
            "peer {} tenant change: {} -> {}",
            peer.id(),
            old_tenant,
            new_tenant
        );

        let mut index = self.tenant_mut();
        if let Some(bucket) = index.get_mut(&old_tenant) {
            bucket.remove(peer.id());
            if bucket.is_empty() {
                index.remove(&old_tenant);
            }
        }
        peer.set_tenant_code(new_tenant);
        index
            .entry(new_tenant.to_string())
            .or_default()
            .insert(peer.id().to_string(), peer.clone());
    }

    /// Record inbound activity for a peer.
    pub fn touch(&self, peer_id: &str) {
        self.activity_mut().insert(peer_id.to_string(), Instant::now());
    }

    /// Snapshot of every peer in a tenant.
    ///
    /// The caller iterates the snapshot without any registry lock held.
    #[must_use]
    pub fn peers_for_tenant(&self, tenant_code: &str) -> Vec<Arc<Peer>> {
        self.tenant_read()
            .get(tenant_code)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every registered peer.
    #[must_use]
    pub fn all_peers(&self) -> Vec<Arc<Peer>> {
        self.peers_read().values().cloned().collect()
    }

    /// Peers whose last activity is older than `timeout`, optionally
    /// restricted to one family.
    #[must_use]
    pub fn idle_peers(&self, timeout: Duration, family: Option<PeerFamily>) -> Vec<Arc<Peer>> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .activity_read()
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let peers = self.peers_read();
        stale
            .iter()
            .filter_map(|id| peers.get(id))
            .filter(|peer| family.map_or(true, |f| peer.family() == f))
            .cloned()
            .collect()
    }

    /// Whether a peer id is registered.
    #[must_use]
    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers_read().contains_key(peer_id)
    }

    /// Whether a peer id is in a given tenant's bucket.
    #[must_use]
    pub fn tenant_contains(&self, tenant_code: &str, peer_id: &str) -> bool {
        self.tenant_read()
            .get(tenant_code)
            .is_some_and(|bucket| bucket.contains_key(peer_id))
    }

    /// Number of registered peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers_read().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers_read().is_empty()
    }

    /// Aggregate counts by family.
    #[must_use]
    pub fn counts(&self) -> PeerCounts {
        let peers = self.peers_read();
        let desk = peers
            .values()
            .filter(|p| p.family() == PeerFamily::Desk)
            .count();
        PeerCounts {
            total: peers.len(),
            desk,
            device: peers.len() - desk,
        }
    }

    /// Shard index for a peer id: byte sum mod shard count.
    fn shard_index(&self, peer_id: &str) -> usize {
        let sum: usize = peer_id.bytes().map(usize::from).sum();
        sum % self.shards.len()
    }

    fn shard_write(&self, peer_id: &str) -> RwLockWriteGuard<'_, ()> {
        self.shards[self.shard_index(peer_id)]
            .write()
            .expect("shard lock poisoned")
    }

    fn peers_read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Peer>>> {
        self.peers.read().expect("peer map lock poisoned")
    }

    fn peers_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Peer>>> {
        self.peers.write().expect("peer map lock poisoned")
    }

    fn tenant_read(&self) -> RwLockReadGuard<'_, HashMap<String, HashMap<String, Arc<Peer>>>> {
        self.by_tenant.read().expect("tenant index lock poisoned")
    }

    fn tenant_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, HashMap<String, Arc<Peer>>>> {
        self.by_tenant.write().expect("tenant index lock poisoned")
    }

    fn activity_read(&self) -> RwLockReadGuard<'_, HashMap<String, Instant>> {
        self.last_activity.read().expect("activity map lock poisoned")
    }

    fn activity_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, Instant>> {
        self.last_activity.write().expect("activity map lock poisoned")
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("peer_count", &self.len())
            .field("tenant_count", &self.tenant_read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::UNKNOWN_TENANT;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn make_peer(family: PeerFamily) -> Arc<Peer> {
        let (tx, _rx) = mpsc::channel(4);
        // Leak the receiver so try_enqueue in other tests stays open; here
        // the queue is unused.
        std::mem::forget(_rx);
        Arc::new(Peer::new(
            family,
            "127.0.0.1:1".to_string(),
            tx,
            CancellationToken::new(),
        ))
    }

    #[test]
    fn test_register_appears_in_all_views() {
        let registry = Registry::new();
        let peer = make_peer(PeerFamily::Desk);
        registry.register(peer.clone());

        assert!(registry.contains(peer.id()));
        assert!(registry.tenant_contains(UNKNOWN_TENANT, peer.id()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_clears_all_views_and_is_idempotent() {
        let registry = Registry::new();
        let peer = make_peer(PeerFamily::Device);
        registry.register(peer.clone());

        assert!(registry.unregister(&peer));
        assert!(!registry.contains(peer.id()));
        assert!(!registry.tenant_contains(UNKNOWN_TENANT, peer.id()));
        assert!(registry.is_empty());

        // Second unregister reports absence.
        assert!(!registry.unregister(&peer));
    }

    #[test]
    fn test_empty_tenant_bucket_is_removed() {
        let registry = Registry::new();
        let peer = make_peer(PeerFamily::Desk);
        registry.register(peer.clone());
        registry.reindex(&peer, "ACME");
        registry.unregister(&peer);

        assert!(registry.peers_for_tenant("ACME").is_empty());
        assert!(registry.peers_for_tenant(UNKNOWN_TENANT).is_empty());
        assert_eq!(registry.tenant_read().len(), 0);
    }

    #[test]
    fn test_reindex_moves_between_buckets() {
        let registry = Registry::new();
        let peer = make_peer(PeerFamily::Device);
        registry.register(peer.clone());

        registry.reindex(&peer, "ACME");
        assert_eq!(peer.tenant_code(), "ACME");
        assert!(registry.tenant_contains("ACME", peer.id()));
        assert!(!registry.tenant_contains(UNKNOWN_TENANT, peer.id()));

        // Re-tenanting later moves the bucket again.
        registry.reindex(&peer, "BETA");
        assert!(registry.tenant_contains("BETA", peer.id()));
        assert!(!registry.tenant_contains("ACME", peer.id()));
    }

    #[test]
    fn test_reindex_same_tenant_is_noop() {
        let registry = Registry::new();
        let peer = make_peer(PeerFamily::Device);
        registry.register(peer.clone());
        registry.reindex(&peer, "ACME");
        registry.reindex(&peer, "ACME");
        assert!(registry.tenant_contains("ACME", peer.id()));
    }

    #[test]
    fn test_reindex_before_registration_updates_identity_only() {
        let registry = Registry::new();
        let peer = make_peer(PeerFamily::Device);
        registry.reindex(&peer, "ACME");

        // No bucket yet, but the identity carries the tenant so a later
        // register() lands in the right place.
        assert!(registry.peers_for_tenant("ACME").is_empty());
        assert_eq!(peer.tenant_code(), "ACME");

        registry.register(peer.clone());
        assert!(registry.tenant_contains("ACME", peer.id()));
    }

    #[test]
    fn test_flat_set_and_tenant_index_stay_consistent() {
        let registry = Registry::new();
        let peers: Vec<_> = (0..6)
            .map(|i| {
                let peer = make_peer(if i % 2 == 0 {
                    PeerFamily::Desk
                } else {
                    PeerFamily::Device
                });
                registry.register(peer.clone());
                registry.reindex(&peer, if i < 3 { "ACME" } else { "BETA" });
                peer
            })
            .collect();

        // Every flat-set member is in its tenant bucket, and vice versa.
        for peer in &peers {
            assert!(registry.tenant_contains(&peer.tenant_code(), peer.id()));
        }
        let indexed: usize = ["ACME", "BETA"]
            .iter()
            .map(|t| registry.peers_for_tenant(t).len())
            .sum();
        assert_eq!(indexed, registry.len());
    }

    #[test]
    fn test_counts_by_family() {
        let registry = Registry::new();
        registry.register(make_peer(PeerFamily::Desk));
        registry.register(make_peer(PeerFamily::Desk));
        registry.register(make_peer(PeerFamily::Device));

        let counts = registry.counts();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.desk, 2);
        assert_eq!(counts.device, 1);
    }

    #[test]
    fn test_idle_peers_respects_timeout_and_family() {
        let registry = Registry::new();
        let desk = make_peer(PeerFamily::Desk);
        let device = make_peer(PeerFamily::Device);
        registry.register(desk.clone());
        registry.register(device.clone());

        // Nothing is idle against a generous timeout.
        assert!(registry.idle_peers(Duration::from_secs(60), None).is_empty());

        // Everything is idle against a zero timeout (last activity is in
        // the past by at least a few nanoseconds).
        std::thread::sleep(Duration::from_millis(2));
        let idle = registry.idle_peers(Duration::ZERO, None);
        assert_eq!(idle.len(), 2);

        let idle_devices = registry.idle_peers(Duration::ZERO, Some(PeerFamily::Device));
        assert_eq!(idle_devices.len(), 1);
        assert_eq!(idle_devices[0].id(), device.id());

        // Touching refreshes a peer out of the idle set.
        registry.touch(desk.id());
        let idle = registry.idle_peers(Duration::from_millis(1), None);
        assert!(idle.iter().all(|p| p.id() != desk.id()));
    }

    #[test]
    fn test_peers_for_tenant_is_a_snapshot() {
        let registry = Registry::new();
        let peer = make_peer(PeerFamily::Desk);
        registry.register(peer.clone());
        registry.reindex(&peer, "ACME");

        let snapshot = registry.peers_for_tenant("ACME");
        registry.unregister(&peer);

        // The snapshot still holds the peer; the registry does not.
        assert_eq!(snapshot.len(), 1);
        assert!(registry.peers_for_tenant("ACME").is_empty());
    }

    #[test]
    fn test_shard_index_is_stable_and_bounded() {
        let registry = Registry::new();
        let peer = make_peer(PeerFamily::Device);
        let index = registry.shard_index(peer.id());
        assert_eq!(index, registry.shard_index(peer.id()));
        assert!(index < SHARD_COUNT);
    }
}
