//! Kademlia routing table with XOR-distance metric.
//!
//! 256 buckets indexed by the number of leading zero bits of
//! `distance(local, peer)`: bucket 0 holds the farthest half of the key space,
//! bucket 255 the nearest. Buckets are unbounded; peers leave only when their
//! link goes down.
//!
//! ## Next hop
//!
//! A lookup starts at the target's home bucket, walks toward farther buckets
//! (lower indices) and then toward nearer ones. The first bucket with an
//! eligible peer wins, and within it the peer closest to the target.

use std::collections::HashSet;

use arc_types::{Distance, NodeId, PeerInfo};
use tracing::debug;

use crate::NUM_BUCKETS;

#[derive(Clone, Debug, Default)]
struct KBucket {
    entries: Vec<PeerInfo>,
}

impl KBucket {
    fn find_index(&self, id: &NodeId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == *id)
    }

    /// Closest entry to `target` not in `excluded`.
    fn closest(&self, target: &NodeId, excluded: &HashSet<NodeId>) -> Option<&PeerInfo> {
        self.entries
            .iter()
            .filter(|e| !excluded.contains(&e.id))
            .min_by_key(|e| e.id.distance(target))
    }
}

/// Result of attempting to add a peer to the routing table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddPeerResult {
    Inserted,
    /// Already present; the existing entry is kept.
    Duplicate,
    /// The local node's own id.
    Ignored,
}

pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            buckets: vec![KBucket::default(); NUM_BUCKETS],
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Bucket for `id`. The local id itself maps to the nearest bucket.
    pub fn bucket_index(&self, id: &NodeId) -> usize {
        self.local_id
            .distance(id)
            .leading_zeros()
            .unwrap_or(NUM_BUCKETS - 1)
    }

    pub fn add_peer(&mut self, info: PeerInfo) -> AddPeerResult {
        if info.id == self.local_id {
            return AddPeerResult::Ignored;
        }
        let idx = self.bucket_index(&info.id);
        let bucket = &mut self.buckets[idx];
        if bucket.find_index(&info.id).is_some() {
            debug!(peer = %info.id.short(), "peer already in routing table");
            return AddPeerResult::Duplicate;
        }
        debug!(peer = %info.id.short(), bucket = idx, "peer added to routing table");
        bucket.entries.push(info);
        AddPeerResult::Inserted
    }

    /// Remove a peer. Absent ids are a no-op.
    pub fn del_peer(&mut self, id: &NodeId) -> Option<PeerInfo> {
        let idx = self.bucket_index(id);
        let bucket = &mut self.buckets[idx];
        let pos = bucket.find_index(id)?;
        debug!(peer = %id.short(), bucket = idx, "peer removed from routing table");
        Some(bucket.entries.remove(pos))
    }

    /// Next hop toward `target`. `None` only when the table is empty.
    pub fn get_next_hop(&self, target: &NodeId) -> Option<PeerInfo> {
        self.get_closest_excluding(target, &HashSet::new())
    }

    /// Next hop toward `target` skipping `excluded` peers.
    pub fn get_closest_excluding(
        &self,
        target: &NodeId,
        excluded: &HashSet<NodeId>,
    ) -> Option<PeerInfo> {
        let home = self.bucket_index(target);
        let farther = (0..=home).rev();
        let nearer = home + 1..NUM_BUCKETS;
        farther
            .chain(nearer)
            .find_map(|idx| self.buckets[idx].closest(target, excluded))
            .cloned()
    }

    /// Whether `peer` is strictly closer to `target` than the local node.
    pub fn is_closer_than_self(&self, peer: &NodeId, target: &NodeId) -> bool {
        let theirs: Distance = peer.distance(target);
        theirs.less_than(&self.local_id.distance(target))
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.entries.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arc_types::TransportKind;

    fn id_with(first: u8, last: u8) -> NodeId {
        let mut id = [0u8; 32];
        id[0] = first;
        id[31] = last;
        NodeId::from_bytes(id)
    }

    fn peer(id: NodeId) -> PeerInfo {
        PeerInfo::new(id, "127.0.0.1:11000", TransportKind::Tcp)
    }

    fn table_with(ids: &[NodeId]) -> RoutingTable {
        let mut table = RoutingTable::new(NodeId::from_bytes([0u8; 32]));
        for id in ids {
            assert_eq!(table.add_peer(peer(*id)), AddPeerResult::Inserted);
        }
        table
    }

    #[test]
    fn test_bucket_index() {
        let table = RoutingTable::new(NodeId::from_bytes([0u8; 32]));
        assert_eq!(table.bucket_index(&id_with(0x80, 0)), 0);
        assert_eq!(table.bucket_index(&id_with(0x01, 0)), 7);
        assert_eq!(table.bucket_index(&id_with(0, 0x01)), 255);
        assert_eq!(table.bucket_index(table.local_id()), 255);
    }

    #[test]
    fn test_add_duplicate_and_self() {
        let mut table = table_with(&[id_with(0x10, 0)]);
        assert_eq!(table.add_peer(peer(id_with(0x10, 0))), AddPeerResult::Duplicate);
        assert_eq!(
            table.add_peer(peer(NodeId::from_bytes([0u8; 32]))),
            AddPeerResult::Ignored
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_del_peer() {
        let a = id_with(0x10, 0);
        let mut table = table_with(&[a]);
        assert_eq!(table.del_peer(&a).map(|p| p.id), Some(a));
        assert!(table.is_empty());
        assert!(table.del_peer(&a).is_none());
    }

    #[test]
    fn test_next_hop_prefers_home_bucket() {
        // a shares bucket 0 with the target; b sits in a nearer bucket.
        let a = id_with(0x81, 0);
        let b = id_with(0x01, 0);
        let table = table_with(&[a, b]);
        let target = id_with(0x80, 0);
        assert_eq!(table.get_next_hop(&target).map(|p| p.id), Some(a));
    }

    #[test]
    fn test_next_hop_scans_farther_then_nearer() {
        let far = id_with(0x80, 0);
        let near = id_with(0, 0x01);
        let table = table_with(&[far, near]);

        // Home bucket 7 is empty: farther buckets are scanned first.
        let target = id_with(0x01, 0);
        assert_eq!(table.get_next_hop(&target).map(|p| p.id), Some(far));

        // With only a nearer peer present the scan turns around.
        let table = table_with(&[near]);
        assert_eq!(table.get_next_hop(&target).map(|p| p.id), Some(near));
    }

    #[test]
    fn test_next_hop_min_distance_within_bucket() {
        let a = id_with(0x81, 0);
        let b = id_with(0xC0, 0);
        let table = table_with(&[a, b]);
        assert_eq!(table.get_next_hop(&id_with(0xC1, 0)).map(|p| p.id), Some(b));
        assert_eq!(table.get_next_hop(&id_with(0x80, 0)).map(|p| p.id), Some(a));
    }

    #[test]
    fn test_next_hop_self_target_and_empty() {
        let empty = RoutingTable::new(NodeId::from_bytes([0u8; 32]));
        assert!(empty.get_next_hop(&id_with(1, 1)).is_none());

        let a = id_with(0x40, 0);
        let table = table_with(&[a]);
        assert_eq!(table.get_next_hop(table.local_id()).map(|p| p.id), Some(a));
    }

    #[test]
    fn test_closest_excluding() {
        let a = id_with(0x81, 0);
        let b = id_with(0x82, 0);
        let c = id_with(0x01, 0);
        let table = table_with(&[a, b, c]);
        let target = id_with(0x80, 0);

        let mut excluded = HashSet::new();
        excluded.insert(a);
        assert_eq!(
            table.get_closest_excluding(&target, &excluded).map(|p| p.id),
            Some(b)
        );
        excluded.insert(b);
        assert_eq!(
            table.get_closest_excluding(&target, &excluded).map(|p| p.id),
            Some(c)
        );
        excluded.insert(c);
        assert!(table.get_closest_excluding(&target, &excluded).is_none());
    }

    #[test]
    fn test_is_closer_than_self() {
        let table = RoutingTable::new(NodeId::from_bytes([0u8; 32]));
        let target = id_with(0xF0, 0);
        assert!(table.is_closer_than_self(&id_with(0xF1, 0), &target));
        assert!(!table.is_closer_than_self(&id_with(0x01, 0), &target));
        assert!(!table.is_closer_than_self(table.local_id(), &target));
    }

    #[test]
    fn test_buckets_unbounded() {
        let ids: Vec<NodeId> = (1..=10u8).map(|i| id_with(0x80, i)).collect();
        let table = table_with(&ids);
        assert_eq!(table.len(), 10);
        assert!(ids.iter().all(|id| table.bucket_index(id) == 0));
    }
}
