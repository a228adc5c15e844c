// Copyright (c) 2026 Meshnet
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]

//! Kademlia routing table: k-buckets over the XOR metric.
//!
//! Buckets are binary-trie prefixes covering non-overlapping regions of the
//! id space. The bucket containing our own id splits on overflow (refinement
//! property); other buckets keep newcomers in a bounded replacement cache
//! until the least-recently-seen resident fails a liveness probe.

use crate::core::types::{dht_time, DhtExpiration, NodeId, NODE_ID_BYTES};
use libp2p::PeerId;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Dialable peer endpoint (`host:port` for the TCP transport).
pub type Endpoint = String;

/// One live peer as tracked by the routing table.
#[derive(Clone, Debug, PartialEq)]
pub struct BucketEntry {
    /// Routing identifier (hash of the peer's serialized public key).
    pub node_id: NodeId,
    /// Peer identity.
    pub peer_id: PeerId,
    /// Dialable endpoint.
    pub endpoint: Endpoint,
}

/// Result of [`RoutingTable::add_or_update`].
#[derive(Clone, Debug, PartialEq)]
pub enum AddOutcome {
    /// Peer inserted into a bucket.
    Added,
    /// Peer was already present; freshness and endpoint updated.
    Updated,
    /// Bucket full: newcomer parked in the replacement cache. The returned
    /// least-recently-seen resident should be pinged; evict it on failure.
    PendingPing(BucketEntry),
    /// Entry not tracked (our own id).
    Ignored,
}

#[derive(Debug)]
struct KBucket {
    /// Canonical prefix: bits beyond `depth` are zero.
    prefix: NodeId,
    depth: usize,
    /// Residents, least-recently-seen first.
    entries: Vec<BucketEntry>,
    /// Overflow candidates, oldest first.
    replacement: VecDeque<BucketEntry>,
    last_refreshed: DhtExpiration,
}

impl KBucket {
    fn new(prefix: NodeId, depth: usize) -> Self {
        Self {
            prefix,
            depth,
            entries: Vec::new(),
            replacement: VecDeque::new(),
            last_refreshed: dht_time(),
        }
    }

    fn covers(&self, id: &NodeId) -> bool {
        (0..self.depth).all(|i| id.bit(i) == self.prefix.bit(i))
    }
}

/// The routing table. Single-writer; wrap in a mutex for shared use.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    bucket_size: usize,
    buckets: Vec<KBucket>,
    peer_index: HashMap<PeerId, NodeId>,
    uid_index: BTreeMap<NodeId, PeerId>,
}

impl RoutingTable {
    /// Table for `local_id` with bucket width `bucket_size` (k).
    pub fn new(local_id: NodeId, bucket_size: usize) -> Self {
        Self {
            local_id,
            bucket_size,
            buckets: vec![KBucket::new(
                NodeId::from_bytes([0u8; NODE_ID_BYTES]),
                0,
            )],
            peer_index: HashMap::new(),
            uid_index: BTreeMap::new(),
        }
    }

    /// Our own id.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.buckets
            .iter()
            .position(|b| b.covers(id))
            .expect("buckets partition the id space")
    }

    /// Insert or refresh a peer. See [`AddOutcome`].
    pub fn add_or_update(
        &mut self,
        node_id: NodeId,
        peer_id: PeerId,
        endpoint: Endpoint,
    ) -> AddOutcome {
        if node_id == self.local_id {
            return AddOutcome::Ignored;
        }

        let idx = self.bucket_index(&node_id);
        if let Some(pos) = self.buckets[idx]
            .entries
            .iter()
            .position(|e| e.peer_id == peer_id)
        {
            let mut entry = self.buckets[idx].entries.remove(pos);
            entry.endpoint = endpoint;
            self.buckets[idx].entries.push(entry);
            return AddOutcome::Updated;
        }

        let entry = BucketEntry {
            node_id,
            peer_id,
            endpoint,
        };

        loop {
            let idx = self.bucket_index(&node_id);
            if self.buckets[idx].entries.len() < self.bucket_size {
                self.peer_index.insert(entry.peer_id, entry.node_id);
                self.uid_index.insert(entry.node_id, entry.peer_id);
                self.buckets[idx].entries.push(entry);
                return AddOutcome::Added;
            }
            let covers_local =
                self.buckets[idx].covers(&self.local_id) && self.buckets[idx].depth < NODE_ID_BYTES * 8 - 1;
            if covers_local {
                self.split(idx);
                continue;
            }
            // Full foreign bucket: park the newcomer, surface the LRU resident.
            let bucket = &mut self.buckets[idx];
            bucket.replacement.retain(|e| e.peer_id != entry.peer_id);
            bucket.replacement.push_back(entry);
            while bucket.replacement.len() > self.bucket_size {
                bucket.replacement.pop_front();
            }
            return AddOutcome::PendingPing(bucket.entries[0].clone());
        }
    }

    fn split(&mut self, idx: usize) {
        let bucket = self.buckets.remove(idx);
        let depth = bucket.depth;
        let mut zero = KBucket::new(bucket.prefix, depth + 1);
        let mut one = KBucket::new(bucket.prefix.with_flipped_bit(depth), depth + 1);
        zero.last_refreshed = bucket.last_refreshed;
        one.last_refreshed = bucket.last_refreshed;

        for e in bucket.entries {
            if e.node_id.bit(depth) {
                one.entries.push(e);
            } else {
                zero.entries.push(e);
            }
        }
        for e in bucket.replacement {
            if e.node_id.bit(depth) {
                one.replacement.push_back(e);
            } else {
                zero.replacement.push_back(e);
            }
        }

        self.buckets.insert(idx, one);
        self.buckets.insert(idx, zero);
    }

    /// Mark a peer as just seen (moves it to the most-recently-seen slot).
    pub fn confirm_alive(&mut self, peer_id: &PeerId) {
        let Some(node_id) = self.peer_index.get(peer_id).copied() else {
            return;
        };
        let idx = self.bucket_index(&node_id);
        let bucket = &mut self.buckets[idx];
        if let Some(pos) = bucket.entries.iter().position(|e| e.peer_id == *peer_id) {
            let entry = bucket.entries.remove(pos);
            bucket.entries.push(entry);
        }
    }

    /// Unlink a peer; the freshest replacement-cache candidate is promoted.
    pub fn remove(&mut self, peer_id: &PeerId) -> bool {
        let Some(node_id) = self.peer_index.remove(peer_id) else {
            return false;
        };
        self.uid_index.remove(&node_id);
        let idx = self.bucket_index(&node_id);
        let bucket = &mut self.buckets[idx];
        let Some(pos) = bucket.entries.iter().position(|e| e.peer_id == *peer_id) else {
            return false;
        };
        bucket.entries.remove(pos);
        if let Some(promoted) = bucket.replacement.pop_back() {
            self.peer_index.insert(promoted.peer_id, promoted.node_id);
            self.uid_index.insert(promoted.node_id, promoted.peer_id);
            bucket.entries.push(promoted);
        }
        true
    }

    /// Up to `n` peers closest to `target` by XOR distance, ascending.
    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<BucketEntry> {
        let mut all: Vec<BucketEntry> = self
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter().cloned())
            .collect();
        all.sort_by_key(|e| e.node_id.distance(target));
        all.truncate(n);
        all
    }

    /// Tracked entry for a peer, if resident.
    pub fn get(&self, peer_id: &PeerId) -> Option<BucketEntry> {
        let node_id = self.peer_index.get(peer_id)?;
        let idx = self.bucket_index(node_id);
        self.buckets[idx]
            .entries
            .iter()
            .find(|e| e.peer_id == *peer_id)
            .cloned()
    }

    /// Auxiliary index: routing id to peer id.
    pub fn uid_to_peer_id(&self, node_id: &NodeId) -> Option<PeerId> {
        self.uid_index.get(node_id).copied()
    }

    /// Number of resident peers.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    /// Whether no peers are resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// All resident entries (admin/debug surface).
    pub fn entries(&self) -> Vec<BucketEntry> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().cloned())
            .collect()
    }

    /// Prefix and depth of the least recently refreshed bucket.
    pub fn stalest_bucket(&self) -> (NodeId, usize) {
        let bucket = self
            .buckets
            .iter()
            .min_by(|a, b| a.last_refreshed.total_cmp(&b.last_refreshed))
            .expect("at least one bucket");
        (bucket.prefix, bucket.depth)
    }

    /// Record a refresh of the bucket covering `id`.
    pub fn mark_refreshed(&mut self, id: &NodeId) {
        let idx = self.bucket_index(id);
        self.buckets[idx].last_refreshed = dht_time();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(i: u32) -> (NodeId, PeerId, Endpoint) {
        let id = NodeId::generate(format!("peer-{i}").as_bytes());
        let peer = crate::core::identity::NodeIdentity::generate().peer_id();
        (id, peer, format!("127.0.0.1:{}", 20000 + i))
    }

    #[test]
    fn add_update_and_closest_ordering() {
        let local = NodeId::generate(b"local");
        let mut rt = RoutingTable::new(local, 20);
        let mut ids = Vec::new();
        for i in 0..10 {
            let (nid, pid, ep) = entry(i);
            assert_eq!(rt.add_or_update(nid, pid, ep), AddOutcome::Added);
            ids.push(nid);
        }
        let target = NodeId::generate(b"target");
        let closest = rt.closest(&target, 5);
        assert_eq!(closest.len(), 5);
        for pair in closest.windows(2) {
            assert!(pair[0].node_id.distance(&target) <= pair[1].node_id.distance(&target));
        }
    }

    #[test]
    fn own_bucket_splits_instead_of_overflowing() {
        let local = NodeId::generate(b"local");
        let mut rt = RoutingTable::new(local, 4);
        let mut added = 0;
        let mut i = 0u32;
        while added < 12 {
            let (nid, pid, ep) = entry(i);
            i += 1;
            match rt.add_or_update(nid, pid, ep) {
                AddOutcome::Added => added += 1,
                AddOutcome::PendingPing(_) => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert!(rt.bucket_count() > 1);
        assert_eq!(rt.len(), added);
    }

    #[test]
    fn full_foreign_bucket_surfaces_lru_for_ping() {
        let local = NodeId::generate(b"local");
        let mut rt = RoutingTable::new(local, 2);
        // Fill until some insert lands in a full foreign bucket.
        let mut pending = None;
        for i in 0..256 {
            let (nid, pid, ep) = entry(i);
            if let AddOutcome::PendingPing(lru) = rt.add_or_update(nid, pid, ep) {
                pending = Some(lru);
                break;
            }
        }
        let lru = pending.expect("a foreign bucket should eventually fill");
        assert!(rt.get(&lru.peer_id).is_some());

        // Failed ping: evict the LRU, the replacement candidate is promoted.
        let before = rt.len();
        assert!(rt.remove(&lru.peer_id));
        assert_eq!(rt.len(), before); // promotion refills the slot
        assert!(rt.get(&lru.peer_id).is_none());
    }

    #[test]
    fn uid_index_tracks_membership() {
        let local = NodeId::generate(b"local");
        let mut rt = RoutingTable::new(local, 20);
        let (nid, pid, ep) = entry(1);
        rt.add_or_update(nid, pid, ep);
        assert_eq!(rt.uid_to_peer_id(&nid), Some(pid));
        rt.remove(&pid);
        assert_eq!(rt.uid_to_peer_id(&nid), None);
    }

    #[test]
    fn local_id_is_never_tracked() {
        let local = NodeId::generate(b"local");
        let mut rt = RoutingTable::new(local, 20);
        let peer = crate::core::identity::NodeIdentity::generate().peer_id();
        assert_eq!(
            rt.add_or_update(local, peer, "127.0.0.1:1".into()),
            AddOutcome::Ignored
        );
        assert!(rt.is_empty());
    }
}
