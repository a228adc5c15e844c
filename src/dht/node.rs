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

//! The DHT node: iterative lookups over the protocol, bulk store/get, a TTL
//! cache of retrieved values, and background refresh/sweep tasks.
//!
//! Lookups run a beam search over the XOR-ordered candidate frontier with
//! `alpha` requests in flight, terminating when the `k` closest candidates
//! have responded (or on the overall deadline). Value lookups exit early on
//! the first hit.

use crate::core::types::{dht_time, DhtExpiration, DhtKey, Distance, NodeId, Subkey};
use crate::dht::protocol::{DhtProtocol, FindResult, NodeInfoWire};
use crate::dht::routing::{BucketEntry, Endpoint};
use crate::dht::storage::{DhtValueView, TimedStorage};
use crate::dht::validation::RecordRequestType;
use crate::core::types::DhtRecord;
use futures::stream::{FuturesUnordered, StreamExt};
use libp2p::PeerId;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

/// Node configuration.
#[derive(Clone, Debug)]
pub struct DhtNodeConfig {
    /// Lookup concurrency (alpha).
    pub alpha: usize,
    /// Bound on concurrent outbound workers for bulk operations.
    pub num_workers: usize,
    /// Overall deadline per iterative lookup.
    pub lookup_timeout: Duration,
    /// Cadence of storage/cache sweeps.
    pub sweep_period: Duration,
    /// Cadence of bucket refresh lookups.
    pub refresh_period: Duration,
    /// Cap on how long retrieved values stay cached, seconds.
    pub cache_ttl: f64,
    /// Bootstrap endpoints.
    pub bootstrap: Vec<Endpoint>,
}

impl Default for DhtNodeConfig {
    fn default() -> Self {
        Self {
            alpha: 3,
            num_workers: 8,
            lookup_timeout: Duration::from_secs(15),
            sweep_period: Duration::from_secs(60),
            refresh_period: Duration::from_secs(300),
            cache_ttl: 600.0,
            bootstrap: Vec::new(),
        }
    }
}

/// A value retrieved from the DHT (signature trailers stripped).
#[derive(Clone, Debug, PartialEq)]
pub struct FoundValue {
    /// The value.
    pub view: DhtValueView,
    /// Entry expiration.
    pub expiration_time: DhtExpiration,
}

type CacheKey = (NodeId, Option<Subkey>);

/// The DHT node.
pub struct DhtNode {
    /// Protocol layer (also the RPC servicer).
    pub protocol: Arc<DhtProtocol>,
    cfg: DhtNodeConfig,
    cache: Mutex<TimedStorage<CacheKey, FoundValue>>,
    workers: Arc<Semaphore>,
    stop_tx: watch::Sender<bool>,
}

impl DhtNode {
    /// Build the node and start its maintenance tasks.
    pub fn new(cfg: DhtNodeConfig, protocol: Arc<DhtProtocol>) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let node = Arc::new(Self {
            protocol,
            workers: Arc::new(Semaphore::new(cfg.num_workers.max(1))),
            cfg,
            cache: Mutex::new(TimedStorage::new()),
            stop_tx,
        });
        node.spawn_maintenance(stop_rx);
        node
    }

    /// Our peer id.
    pub fn peer_id(&self) -> PeerId {
        self.protocol.local_peer_id()
    }

    /// Our routing id.
    pub fn node_id(&self) -> NodeId {
        self.protocol.local_node_id()
    }

    /// Stop maintenance tasks.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Dial the configured bootstrap endpoints, then look up our own id to
    /// populate the routing table.
    pub async fn bootstrap(self: &Arc<Self>) {
        for endpoint in self.cfg.bootstrap.clone() {
            match self.protocol.ping(&endpoint).await {
                Ok((info, _rtt)) => {
                    debug!(endpoint = %endpoint, peer = ?info.peer(), "bootstrap peer answered")
                }
                Err(e) => warn!(endpoint = %endpoint, err = %e, "bootstrap ping failed"),
            }
        }
        if !self.protocol.routing_entries().is_empty() {
            let own = self.protocol.local_node_id();
            let _ = self.find_nearest(own, self.protocol.bucket_size()).await;
            info!(peers = self.protocol.routing_entries().len(), "bootstrap complete");
        }
    }

    fn merge_candidates(
        &self,
        peers: &[NodeInfoWire],
        target: &NodeId,
        candidates: &mut BTreeMap<Distance, BucketEntry>,
        seen: &mut HashSet<PeerId>,
    ) {
        for info in peers {
            let Some(peer_id) = info.peer() else { continue };
            if peer_id == self.protocol.local_peer_id() || !seen.insert(peer_id) {
                continue;
            }
            candidates.insert(
                info.node_id.distance(target),
                BucketEntry {
                    node_id: info.node_id,
                    peer_id,
                    endpoint: info.endpoint.clone(),
                },
            );
        }
    }

    /// Iterative FIND_NODE toward `target`; up to `k` closest responsive peers.
    pub async fn find_nearest(self: &Arc<Self>, target: NodeId, k: usize) -> Vec<BucketEntry> {
        let mut candidates: BTreeMap<Distance, BucketEntry> = BTreeMap::new();
        let mut seen: HashSet<PeerId> = HashSet::new();
        for entry in self
            .protocol
            .routing_closest(&target, self.protocol.bucket_size())
        {
            seen.insert(entry.peer_id);
            candidates.insert(entry.node_id.distance(&target), entry);
        }

        let mut queried: HashSet<PeerId> = HashSet::new();
        let mut responded: HashSet<PeerId> = HashSet::new();
        let deadline = Instant::now() + self.cfg.lookup_timeout;
        let mut inflight = FuturesUnordered::new();

        loop {
            while inflight.len() < self.cfg.alpha {
                let next = candidates
                    .values()
                    .find(|e| !queried.contains(&e.peer_id))
                    .cloned();
                let Some(entry) = next else { break };
                queried.insert(entry.peer_id);
                let proto = Arc::clone(&self.protocol);
                inflight.push(async move {
                    let outcome = proto.find_node(&entry.endpoint, target, k).await;
                    (entry, outcome)
                });
            }
            if inflight.is_empty() {
                break;
            }
            match tokio::time::timeout_at(deadline.into(), inflight.next()).await {
                Err(_) => {
                    debug!("lookup deadline reached; returning best-so-far");
                    break;
                }
                Ok(None) => break,
                Ok(Some((entry, Ok(peers)))) => {
                    responded.insert(entry.peer_id);
                    self.merge_candidates(&peers, &target, &mut candidates, &mut seen);
                    let top_done = candidates
                        .values()
                        .take(k)
                        .all(|e| responded.contains(&e.peer_id));
                    if top_done && inflight.is_empty() {
                        break;
                    }
                }
                Ok(Some((entry, Err(_)))) => {
                    self.protocol.demote(&entry.peer_id);
                    candidates.retain(|_, e| e.peer_id != entry.peer_id);
                }
            }
        }

        candidates
            .values()
            .filter(|e| responded.contains(&e.peer_id))
            .take(k)
            .cloned()
            .collect()
    }

    /// Iterative FIND_VALUE toward `hash(key)`; first hit wins.
    async fn lookup_value(
        self: &Arc<Self>,
        key: &[u8],
        subkey: Option<&Subkey>,
    ) -> Option<(DhtValueView, DhtExpiration)> {
        let target = NodeId::generate(key);
        let k = self.protocol.bucket_size();

        let mut candidates: BTreeMap<Distance, BucketEntry> = BTreeMap::new();
        let mut seen: HashSet<PeerId> = HashSet::new();
        for entry in self.protocol.routing_closest(&target, k) {
            seen.insert(entry.peer_id);
            candidates.insert(entry.node_id.distance(&target), entry);
        }

        let mut queried: HashSet<PeerId> = HashSet::new();
        let deadline = Instant::now() + self.cfg.lookup_timeout;
        let mut inflight = FuturesUnordered::new();

        loop {
            while inflight.len() < self.cfg.alpha {
                let next = candidates
                    .values()
                    .find(|e| !queried.contains(&e.peer_id))
                    .cloned();
                let Some(entry) = next else { break };
                queried.insert(entry.peer_id);
                let proto = Arc::clone(&self.protocol);
                let key = key.to_vec();
                let subkey = subkey.cloned();
                inflight.push(async move {
                    let outcome = proto.find_value(&entry.endpoint, &key, subkey.as_ref()).await;
                    (entry, outcome)
                });
            }
            if inflight.is_empty() {
                return None;
            }
            match tokio::time::timeout_at(deadline.into(), inflight.next()).await {
                Err(_) => {
                    debug!("value lookup deadline reached");
                    return None;
                }
                Ok(None) => return None,
                Ok(Some((_, Ok(FindResult::Value {
                    value,
                    expiration_time,
                })))) => {
                    return Some((DhtValueView::Regular(value), expiration_time));
                }
                Ok(Some((_, Ok(FindResult::Dictionary { entries })))) => {
                    let mut map = BTreeMap::new();
                    let mut max_exp: DhtExpiration = 0.0;
                    for e in entries {
                        max_exp = max_exp.max(e.expiration_time);
                        map.insert(e.subkey, (e.value, e.expiration_time));
                    }
                    if map.is_empty() {
                        continue;
                    }
                    return Some((DhtValueView::Dictionary(map), max_exp));
                }
                Ok(Some((_, Ok(FindResult::ClosestPeers { peers })))) => {
                    self.merge_candidates(&peers, &target, &mut candidates, &mut seen);
                }
                Ok(Some((entry, Err(_)))) => {
                    self.protocol.demote(&entry.peer_id);
                    candidates.retain(|_, e| e.peer_id != entry.peer_id);
                }
            }
        }
    }

    /// Store `value` under `key` (optionally as one dictionary subkey) on the
    /// closest live peers and locally. Success requires at least one
    /// acceptance.
    pub async fn store(
        self: &Arc<Self>,
        key: &[u8],
        value: Vec<u8>,
        expiration_time: DhtExpiration,
        subkey: Option<Subkey>,
    ) -> bool {
        let mut record = DhtRecord {
            key: key.to_vec(),
            subkey,
            value,
            expiration_time,
        };
        record.value = self.protocol.validators().sign_value(&record);

        let local_ok = self.protocol.store_local(&record);
        let targets = self
            .find_nearest(NodeId::generate(key), self.protocol.bucket_size())
            .await;

        let mut inflight = FuturesUnordered::new();
        for target in targets {
            let proto = Arc::clone(&self.protocol);
            let record = record.clone();
            let workers = Arc::clone(&self.workers);
            inflight.push(async move {
                let _permit = workers.acquire_owned().await;
                let outcome = proto.store(&target.endpoint, vec![record]).await;
                (target, outcome)
            });
        }

        let mut any_remote = false;
        while let Some((target, outcome)) = inflight.next().await {
            match outcome {
                Ok(flags) => {
                    if flags.iter().any(|accepted| *accepted) {
                        any_remote = true;
                    }
                }
                Err(_) => self.protocol.demote(&target.peer_id),
            }
        }
        local_ok || any_remote
    }

    /// Retrieve the freshest visible value under `key`.
    pub async fn get(self: &Arc<Self>, key: &[u8]) -> Option<FoundValue> {
        self.get_with(key, None, false).await
    }

    /// Retrieve bypassing the cache (forces a network lookup).
    pub async fn get_latest(self: &Arc<Self>, key: &[u8]) -> Option<FoundValue> {
        self.get_with(key, None, true).await
    }

    /// Retrieve with an optional subkey and cache policy.
    pub async fn get_with(
        self: &Arc<Self>,
        key: &[u8],
        subkey: Option<&Subkey>,
        latest: bool,
    ) -> Option<FoundValue> {
        let cache_key: CacheKey = (NodeId::generate(key), subkey.cloned());

        if !latest {
            if let Some(hit) = self
                .cache
                .lock()
                .expect("lookup cache lock")
                .get(&cache_key)
            {
                return Some(hit.value.clone());
            }
            if let Some((view, exp)) = self.protocol.local_get(key, subkey) {
                if let Some(found) = self.validate_view(key, subkey, view, exp) {
                    return Some(found);
                }
            }
        }

        let fetched = self.lookup_value(key, subkey).await;
        let validated = fetched.and_then(|(view, exp)| self.validate_view(key, subkey, view, exp));

        if let Some(found) = &validated {
            let ttl = found.expiration_time.min(dht_time() + self.cfg.cache_ttl);
            self.cache.lock().expect("lookup cache lock").store(
                cache_key,
                found.clone(),
                ttl,
            );
            return validated;
        }

        // Fresh lookup found nothing; a locally stored record may still be
        // the authoritative copy (we might be one of the closest nodes).
        self.protocol
            .local_get(key, subkey)
            .and_then(|(view, exp)| self.validate_view(key, subkey, view, exp))
    }

    /// Retrieve many keys concurrently, bounded by the worker pool.
    pub async fn get_many(
        self: &Arc<Self>,
        keys: &[DhtKey],
        latest: bool,
    ) -> BTreeMap<DhtKey, Option<FoundValue>> {
        let mut inflight = FuturesUnordered::new();
        for key in keys {
            let node = Arc::clone(self);
            let key = key.clone();
            let workers = Arc::clone(&self.workers);
            inflight.push(async move {
                let _permit = workers.acquire_owned().await;
                let found = node.get_with(&key, None, latest).await;
                (key, found)
            });
        }
        let mut out = BTreeMap::new();
        while let Some((key, found)) = inflight.next().await {
            out.insert(key, found);
        }
        out
    }

    /// Ping a known peer (endpoint from the routing table); smoothed RTT in
    /// seconds, `None` when unreachable.
    pub async fn ping_peer(self: &Arc<Self>, peer_id: &PeerId) -> Option<f64> {
        let endpoint = self.protocol.endpoint_for(peer_id)?;
        match self.protocol.ping(&endpoint).await {
            Ok((_, rtt)) => Some(rtt),
            Err(_) => {
                self.protocol.demote(peer_id);
                None
            }
        }
    }

    fn validate_view(
        &self,
        key: &[u8],
        subkey_query: Option<&Subkey>,
        view: DhtValueView,
        expiration_time: DhtExpiration,
    ) -> Option<FoundValue> {
        let validators = self.protocol.validators();
        match view {
            DhtValueView::Regular(value) => {
                let record = DhtRecord {
                    key: key.to_vec(),
                    subkey: subkey_query.cloned(),
                    value,
                    expiration_time,
                };
                if !validators.validate(&record, RecordRequestType::Get) {
                    debug!("dropping retrieved record that failed validation");
                    return None;
                }
                Some(FoundValue {
                    view: DhtValueView::Regular(validators.strip_value(&record)),
                    expiration_time,
                })
            }
            DhtValueView::Dictionary(map) => {
                let mut live = BTreeMap::new();
                for (subkey, (value, exp)) in map {
                    let record = DhtRecord {
                        key: key.to_vec(),
                        subkey: Some(subkey.clone()),
                        value,
                        expiration_time: exp,
                    };
                    if !validators.validate(&record, RecordRequestType::Get) {
                        debug!("dropping dictionary entry that failed validation");
                        continue;
                    }
                    live.insert(subkey, (validators.strip_value(&record), exp));
                }
                if live.is_empty() {
                    return None;
                }
                Some(FoundValue {
                    view: DhtValueView::Dictionary(live),
                    expiration_time,
                })
            }
        }
    }

    fn spawn_maintenance(self: &Arc<Self>, stop_rx: watch::Receiver<bool>) {
        // Periodic sweep of local storage and the lookup cache.
        {
            let node = Arc::clone(self);
            let mut stop = stop_rx.clone();
            tokio::spawn(async move {
                loop {
                    let sleep = tokio::time::sleep(node.cfg.sweep_period);
                    tokio::select! {
                        _ = sleep => {
                            node.protocol.sweep_storage();
                            node.cache
                                .lock()
                                .expect("lookup cache lock")
                                .evict_expired(dht_time());
                        }
                        _ = stop.changed() => {
                            if *stop.borrow() {
                                return;
                            }
                        }
                    }
                }
            });
        }
        // Periodic refresh of the stalest bucket.
        {
            let node = Arc::clone(self);
            let mut stop = stop_rx;
            tokio::spawn(async move {
                loop {
                    let sleep = tokio::time::sleep(node.cfg.refresh_period);
                    tokio::select! {
                        _ = sleep => {
                            let (prefix, depth) = node.protocol.stalest_bucket();
                            let target = NodeId::random_in_prefix(&prefix, depth);
                            let k = node.protocol.bucket_size();
                            let _ = node.find_nearest(target, k).await;
                            node.protocol.mark_refreshed(&target);
                        }
                        _ = stop.changed() => {
                            if *stop.borrow() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    }
}
