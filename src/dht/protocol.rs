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

//! The DHT protocol: PING / STORE / FIND_NODE / FIND_VALUE over the
//! authenticated transport.
//!
//! Every inbound request passes the full authorizer pipeline before anything
//! else happens; failures are dropped without a response. Every serviced verb
//! feeds the caller into the routing table, with ping-before-evict handling
//! when a bucket is full. STOREs run the record validator chain and answer
//! one boolean per record.

use crate::auth::authorizer::{Authorizer, RequestAuth, ResponseAuth};
use crate::core::identity::{peer_id_from_public_key, NodeIdentity};
use crate::core::types::{dht_time, DhtExpiration, DhtRecord, NodeId, Subkey};
use crate::dht::routing::{AddOutcome, BucketEntry, Endpoint, RoutingTable};
use crate::dht::storage::{DhtValueView, LocalStorage};
use crate::dht::transport::{RpcError, Servicer, Transport};
use crate::dht::validation::{CompositeValidator, RecordRequestType};
use crate::monitoring::metrics::Metrics;
use async_trait::async_trait;
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Size cap for a dictionary FIND_VALUE response.
const MAX_DICT_RESPONSE_BYTES: usize = 1024 * 1024;

/// A peer's self-description carried on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeInfoWire {
    /// Peer id bytes (multihash).
    pub peer_id: Vec<u8>,
    /// Routing identifier.
    pub node_id: NodeId,
    /// Dialable endpoint.
    pub endpoint: Endpoint,
}

impl NodeInfoWire {
    /// Parse the peer id.
    pub fn peer(&self) -> Option<PeerId> {
        PeerId::from_bytes(&self.peer_id).ok()
    }
}

/// Request verbs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RequestBody {
    /// Liveness probe.
    Ping,
    /// Store a batch of records; answered record-by-record.
    Store {
        /// Records to store.
        records: Vec<DhtRecord>,
    },
    /// Closest peers to `target` from the responder's routing table.
    FindNode {
        /// Lookup target.
        target: NodeId,
        /// Maximum peers to return.
        k: u32,
    },
    /// Value under `key` (or closer peers).
    FindValue {
        /// Application key bytes.
        key: Vec<u8>,
        /// Optional dictionary discriminator.
        subkey: Option<Subkey>,
    },
}

/// One dictionary entry of a FIND_VALUE response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DictEntry {
    /// Subkey.
    pub subkey: Subkey,
    /// Stored bytes.
    pub value: Vec<u8>,
    /// Entry expiration.
    pub expiration_time: DhtExpiration,
}

/// FIND_VALUE outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FindResult {
    /// Regular value (or one requested subkey).
    Value {
        /// Stored bytes.
        value: Vec<u8>,
        /// Entry expiration.
        expiration_time: DhtExpiration,
    },
    /// Full subkey map of a dictionary key (bounded by the response cap).
    Dictionary {
        /// Live entries.
        entries: Vec<DictEntry>,
    },
    /// Responder does not hold the key; closest peers it knows instead.
    ClosestPeers {
        /// Peers closer to the key.
        peers: Vec<NodeInfoWire>,
    },
}

/// Response bodies, one per verb.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResponseBody {
    /// PING answer.
    Pong {
        /// Responder's self-description.
        info: NodeInfoWire,
    },
    /// STORE answer: acceptance per record, in request order.
    Store {
        /// Acceptance flags.
        accepted: Vec<bool>,
    },
    /// FIND_NODE answer.
    FindNode {
        /// Closest known peers, XOR-ascending.
        peers: Vec<NodeInfoWire>,
    },
    /// FIND_VALUE answer.
    FindValue(FindResult),
}

/// A full request envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Authorization envelope.
    pub auth: RequestAuth,
    /// Caller's self-description.
    pub sender: NodeInfoWire,
    /// Verb.
    pub body: RequestBody,
}

/// A full response envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Authorization envelope.
    pub auth: ResponseAuth,
    /// Verb answer.
    pub body: ResponseBody,
}

/// Protocol state shared by the servicer and the client call sites.
pub struct DhtProtocol {
    identity: Arc<NodeIdentity>,
    endpoint: Endpoint,
    bucket_size: usize,
    request_timeout: Duration,
    routing: Mutex<RoutingTable>,
    storage: Mutex<LocalStorage>,
    validators: Arc<CompositeValidator>,
    authorizer: Arc<dyn Authorizer>,
    transport: Arc<dyn Transport>,
    metrics: Arc<Metrics>,
}

impl DhtProtocol {
    /// Build the protocol around an identity and its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<NodeIdentity>,
        endpoint: Endpoint,
        bucket_size: usize,
        request_timeout: Duration,
        validators: Arc<CompositeValidator>,
        authorizer: Arc<dyn Authorizer>,
        transport: Arc<dyn Transport>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let local_id = identity.node_id();
        Arc::new(Self {
            identity,
            endpoint,
            bucket_size,
            request_timeout,
            routing: Mutex::new(RoutingTable::new(local_id, bucket_size)),
            storage: Mutex::new(LocalStorage::new()),
            validators,
            authorizer,
            transport,
            metrics,
        })
    }

    /// Our peer id.
    pub fn local_peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// Our routing id.
    pub fn local_node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    /// Our announced endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Bucket width / replication factor.
    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    /// The record validator pipeline.
    pub fn validators(&self) -> &CompositeValidator {
        &self.validators
    }

    /// Our wire self-description.
    pub fn local_info(&self) -> NodeInfoWire {
        NodeInfoWire {
            peer_id: self.identity.peer_id().to_bytes(),
            node_id: self.identity.node_id(),
            endpoint: self.endpoint.clone(),
        }
    }

    /// Closest known peers to `target`.
    pub fn routing_closest(&self, target: &NodeId, n: usize) -> Vec<BucketEntry> {
        self.routing.lock().expect("routing lock").closest(target, n)
    }

    /// All resident routing entries.
    pub fn routing_entries(&self) -> Vec<BucketEntry> {
        self.routing.lock().expect("routing lock").entries()
    }

    /// Endpoint for a known peer.
    pub fn endpoint_for(&self, peer_id: &PeerId) -> Option<Endpoint> {
        self.routing
            .lock()
            .expect("routing lock")
            .get(peer_id)
            .map(|e| e.endpoint)
    }

    /// Prefix and depth of the least recently refreshed bucket.
    pub fn stalest_bucket(&self) -> (NodeId, usize) {
        self.routing.lock().expect("routing lock").stalest_bucket()
    }

    /// Record a lookup through the bucket covering `id`.
    pub fn mark_refreshed(&self, id: &NodeId) {
        self.routing.lock().expect("routing lock").mark_refreshed(id);
    }

    /// Drop a peer that failed to answer (replacement-cache promotion).
    pub fn demote(&self, peer_id: &PeerId) {
        let mut rt = self.routing.lock().expect("routing lock");
        if rt.remove(peer_id) {
            debug!(peer = %peer_id, "demoted unreachable peer");
        }
        self.metrics.dht_routing_peers.set(rt.len() as i64);
    }

    /// Validate and store one record locally. The boolean mirrors what a
    /// remote STORE would answer.
    pub fn store_local(&self, record: &DhtRecord) -> bool {
        if !self.validators.validate(record, RecordRequestType::Post) {
            self.metrics.dht_store_rejected_total.inc();
            return false;
        }
        let key_id = NodeId::generate(&record.key);
        let mut storage = self.storage.lock().expect("storage lock");
        let accepted = match &record.subkey {
            Some(subkey) => storage.store_subkey(
                key_id,
                subkey.clone(),
                record.value.clone(),
                record.expiration_time,
            ),
            None => storage.store(key_id, record.value.clone(), record.expiration_time),
        };
        if accepted {
            self.metrics.dht_store_accepted_total.inc();
        } else {
            self.metrics.dht_store_rejected_total.inc();
        }
        accepted
    }

    /// Unexpired local value under `key` (and optionally one subkey).
    pub fn local_get(
        &self,
        key: &[u8],
        subkey: Option<&Subkey>,
    ) -> Option<(DhtValueView, DhtExpiration)> {
        let key_id = NodeId::generate(key);
        let storage = self.storage.lock().expect("storage lock");
        match subkey {
            Some(sk) => storage
                .get_subkey(&key_id, sk)
                .map(|(value, exp)| (DhtValueView::Regular(value), exp)),
            None => storage.get(&key_id),
        }
    }

    /// Physically evict expired local records.
    pub fn sweep_storage(&self) {
        self.storage.lock().expect("storage lock").sweep(dht_time());
    }

    fn sender_is_authentic(request: &RpcRequest) -> bool {
        let public_key = &request.auth.client_access_token.public_key;
        let Some(peer) = peer_id_from_public_key(public_key) else {
            return false;
        };
        request.sender.peer() == Some(peer)
            && request.sender.node_id == NodeId::generate(public_key)
    }

    /// Feed a verified caller into the routing table; full buckets trigger a
    /// liveness probe of the least-recently-seen resident.
    fn touch_sender(self: &Arc<Self>, info: &NodeInfoWire) {
        let Some(peer) = info.peer() else {
            return;
        };
        if peer == self.identity.peer_id() {
            return;
        }
        let outcome = {
            let mut rt = self.routing.lock().expect("routing lock");
            let outcome = rt.add_or_update(info.node_id, peer, info.endpoint.clone());
            self.metrics.dht_routing_peers.set(rt.len() as i64);
            outcome
        };
        if let AddOutcome::PendingPing(lru) = outcome {
            let proto = Arc::clone(self);
            tokio::spawn(async move {
                match proto.ping(&lru.endpoint).await {
                    Ok(_) => {
                        proto
                            .routing
                            .lock()
                            .expect("routing lock")
                            .confirm_alive(&lru.peer_id);
                    }
                    Err(_) => proto.demote(&lru.peer_id),
                }
            });
        }
    }

    fn closest_wire(&self, target: &NodeId, n: usize) -> Vec<NodeInfoWire> {
        self.routing_closest(target, n.min(self.bucket_size))
            .into_iter()
            .map(|e| NodeInfoWire {
                peer_id: e.peer_id.to_bytes(),
                node_id: e.node_id,
                endpoint: e.endpoint,
            })
            .collect()
    }

    fn handle_find_value(&self, key: &[u8], subkey: Option<&Subkey>) -> FindResult {
        let key_id = NodeId::generate(key);
        if let Some(sk) = subkey {
            if let Some((value, expiration_time)) = self
                .storage
                .lock()
                .expect("storage lock")
                .get_subkey(&key_id, sk)
            {
                return FindResult::Value {
                    value,
                    expiration_time,
                };
            }
        } else if let Some((view, expiration_time)) =
            self.storage.lock().expect("storage lock").get(&key_id)
        {
            match view {
                DhtValueView::Regular(value) => {
                    return FindResult::Value {
                        value,
                        expiration_time,
                    }
                }
                DhtValueView::Dictionary(map) => {
                    let mut entries = Vec::new();
                    let mut total = 0usize;
                    for (sk, (value, exp)) in map {
                        total += sk.len() + value.len();
                        if total > MAX_DICT_RESPONSE_BYTES {
                            debug!("dictionary response truncated at size cap");
                            break;
                        }
                        entries.push(DictEntry {
                            subkey: sk,
                            value,
                            expiration_time: exp,
                        });
                    }
                    return FindResult::Dictionary { entries };
                }
            }
        }
        FindResult::ClosestPeers {
            peers: self.closest_wire(&key_id, self.bucket_size),
        }
    }

    async fn call(self: &Arc<Self>, endpoint: &str, body: RequestBody) -> Result<ResponseBody, RpcError> {
        let mut request = RpcRequest {
            auth: RequestAuth::default(),
            sender: self.local_info(),
            body,
        };
        self.authorizer
            .sign_request(&mut request, None)
            .await
            .map_err(|_| RpcError::Auth)?;
        let response = self
            .transport
            .call(endpoint, request.clone(), self.request_timeout)
            .await?;
        if !self.authorizer.validate_response(&response, &request).await {
            return Err(RpcError::Auth);
        }
        Ok(response.body)
    }

    /// PING a peer; returns its self-description and the round-trip time.
    pub async fn ping(self: &Arc<Self>, endpoint: &str) -> Result<(NodeInfoWire, f64), RpcError> {
        let started = Instant::now();
        match self.call(endpoint, RequestBody::Ping).await? {
            ResponseBody::Pong { info } => {
                let rtt = started.elapsed().as_secs_f64();
                self.touch_sender(&info);
                Ok((info, rtt))
            }
            _ => Err(RpcError::Codec),
        }
    }

    /// STORE records at a peer; one acceptance flag per record.
    pub async fn store(
        self: &Arc<Self>,
        endpoint: &str,
        records: Vec<DhtRecord>,
    ) -> Result<Vec<bool>, RpcError> {
        match self.call(endpoint, RequestBody::Store { records }).await? {
            ResponseBody::Store { accepted } => Ok(accepted),
            _ => Err(RpcError::Codec),
        }
    }

    /// FIND_NODE at a peer.
    pub async fn find_node(
        self: &Arc<Self>,
        endpoint: &str,
        target: NodeId,
        k: usize,
    ) -> Result<Vec<NodeInfoWire>, RpcError> {
        let body = RequestBody::FindNode {
            target,
            k: k as u32,
        };
        match self.call(endpoint, body).await? {
            ResponseBody::FindNode { peers } => Ok(peers),
            _ => Err(RpcError::Codec),
        }
    }

    /// FIND_VALUE at a peer.
    pub async fn find_value(
        self: &Arc<Self>,
        endpoint: &str,
        key: &[u8],
        subkey: Option<&Subkey>,
    ) -> Result<FindResult, RpcError> {
        let body = RequestBody::FindValue {
            key: key.to_vec(),
            subkey: subkey.cloned(),
        };
        match self.call(endpoint, body).await? {
            ResponseBody::FindValue(result) => Ok(result),
            _ => Err(RpcError::Codec),
        }
    }
}

#[async_trait]
impl Servicer for DhtProtocol {
    async fn handle(self: Arc<Self>, request: RpcRequest) -> Option<RpcResponse> {
        self.metrics.rpc_requests_total.inc();
        if !self.authorizer.validate_request(&request).await {
            self.metrics.rpc_auth_failures_total.inc();
            debug!("dropping request that failed authorization");
            return None;
        }
        if Self::sender_is_authentic(&request) {
            self.touch_sender(&request.sender);
        } else {
            debug!("sender info does not match its access token; not routing it");
        }

        let body = match &request.body {
            RequestBody::Ping => ResponseBody::Pong {
                info: self.local_info(),
            },
            RequestBody::Store { records } => ResponseBody::Store {
                accepted: records.iter().map(|r| self.store_local(r)).collect(),
            },
            RequestBody::FindNode { target, k } => ResponseBody::FindNode {
                peers: self.closest_wire(target, *k as usize),
            },
            RequestBody::FindValue { key, subkey } => {
                ResponseBody::FindValue(self.handle_find_value(key, subkey.as_ref()))
            }
        };

        let mut response = RpcResponse {
            auth: ResponseAuth::default(),
            body,
        };
        if let Err(e) = self.authorizer.sign_response(&mut response, &request).await {
            warn!(err = %e, "failed to sign response");
            return None;
        }
        Some(response)
    }
}
