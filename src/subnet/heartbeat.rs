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

//! Heartbeats: each node periodically publishes its `ServerInfo` into the DHT
//! under the well-known `"node"` key, subkeyed by its identity. Peers read
//! the dictionary to learn who is alive; absence past expiration is offline.
//!
//! The announcer also pings a small sample of recently heard peers each round
//! and reports smoothed RTTs in `next_pings`.

use crate::core::types::{
    decode_canonical_limited, dht_time, encode_canonical, heartbeat_key, DhtExpiration, Subkey,
    MAX_DHT_TIME_DISCREPANCY,
};
use crate::dht::node::DhtNode;
use crate::dht::storage::DhtValueView;
use crate::dht::validation::parse_owner_subkey;
use crate::monitoring::metrics::Metrics;
use libp2p::PeerId;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Decoded heartbeat size cap.
const MAX_SERVER_INFO_BYTES: usize = 64 * 1024;

/// Reachability state of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerState {
    /// Shutting down or gone.
    Offline,
    /// Connecting, not yet serving.
    Joining,
    /// Serving.
    Online,
}

/// Role a node plays in the subnet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Takes part in consensus.
    Validator,
    /// Serves compute only.
    Hoster,
    /// DHT entry point.
    Bootnode,
}

/// A node's self-description as published in its heartbeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Reachability state.
    pub state: ServerState,
    /// Role.
    pub role: NodeRole,
    /// Software version.
    pub version: String,
    /// Advertised throughput (role-specific units).
    pub throughput: f64,
    /// Optional operator-chosen display name.
    pub public_name: Option<String>,
    /// Whether the node is reachable only through a relay.
    pub using_relay: bool,
    /// Smoothed RTTs to recently pinged peers, keyed by peer id (base58).
    pub next_pings: BTreeMap<String, f64>,
}

impl ServerInfo {
    /// Fresh ONLINE info for this build.
    pub fn new(role: NodeRole, throughput: f64) -> Self {
        Self {
            state: ServerState::Online,
            role,
            version: env!("CARGO_PKG_VERSION").to_string(),
            throughput,
            public_name: None,
            using_relay: false,
            next_pings: BTreeMap::new(),
        }
    }
}

/// One peer's heartbeat as read back from the DHT.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeHeartbeat {
    /// Publishing peer.
    pub peer_id: PeerId,
    /// Its self-description.
    pub server: ServerInfo,
    /// Record expiration.
    pub expiration_time: DhtExpiration,
}

/// Publish `server_info` under the well-known heartbeat key.
pub async fn declare_node(
    dht: &Arc<DhtNode>,
    subkey: Subkey,
    server_info: &ServerInfo,
    expiration_time: DhtExpiration,
) -> bool {
    let Ok(payload) = encode_canonical(server_info) else {
        return false;
    };
    dht.store(&heartbeat_key(), payload, expiration_time, Some(subkey))
        .await
}

/// Enumerate validated heartbeats. With `latest`, bypasses the lookup cache.
pub async fn get_node_heartbeats(dht: &Arc<DhtNode>, latest: bool) -> Vec<NodeHeartbeat> {
    let Some(found) = dht.get_with(&heartbeat_key(), None, latest).await else {
        return Vec::new();
    };
    let DhtValueView::Dictionary(map) = found.view else {
        return Vec::new();
    };
    map.into_iter()
        .filter_map(|(subkey, (value, expiration_time))| {
            let (peer_id, _) = parse_owner_subkey(&subkey)?;
            let server: ServerInfo =
                decode_canonical_limited(&value, MAX_SERVER_INFO_BYTES).ok()?;
            Some(NodeHeartbeat {
                peer_id,
                server,
                expiration_time,
            })
        })
        .collect()
}

/// Exponentially smoothed RTTs per peer.
#[derive(Debug, Default)]
pub struct PingAggregator {
    rtts: HashMap<PeerId, f64>,
}

/// Smoothing factor for new samples.
const RTT_SMOOTHING: f64 = 0.2;

impl PingAggregator {
    /// Empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one RTT sample, seconds.
    pub fn record(&mut self, peer: PeerId, rtt: f64) {
        self.rtts
            .entry(peer)
            .and_modify(|cur| *cur = *cur * (1.0 - RTT_SMOOTHING) + rtt * RTT_SMOOTHING)
            .or_insert(rtt);
    }

    /// Snapshot keyed by base58 peer id.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        self.rtts
            .iter()
            .map(|(peer, rtt)| (peer.to_base58(), *rtt))
            .collect()
    }
}

/// Announcer configuration.
#[derive(Clone, Debug)]
pub struct HeartbeatConfig {
    /// Publish period, seconds.
    pub update_period: f64,
    /// Record lifetime, seconds (at least twice the period).
    pub expiration: f64,
    /// Peers pinged per round.
    pub max_pinged: usize,
}

impl HeartbeatConfig {
    /// Config for a publish period.
    pub fn new(update_period: f64) -> Self {
        Self {
            update_period,
            expiration: (2.0 * update_period).max(MAX_DHT_TIME_DISCREPANCY),
            max_pinged: 5,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new(60.0)
    }
}

struct HeartbeatShared {
    dht: Arc<DhtNode>,
    subkey: Subkey,
    info: Mutex<ServerInfo>,
    aggregator: Mutex<PingAggregator>,
    cfg: HeartbeatConfig,
    trigger: Notify,
    metrics: Arc<Metrics>,
}

/// Periodic heartbeat task. Publishing continues until an OFFLINE
/// announcement, which is published once before the task stops.
pub struct HeartbeatAnnouncer {
    shared: Arc<HeartbeatShared>,
    join: JoinHandle<()>,
}

impl HeartbeatAnnouncer {
    /// Start announcing.
    pub fn spawn(
        dht: Arc<DhtNode>,
        subkey: Subkey,
        server_info: ServerInfo,
        cfg: HeartbeatConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let shared = Arc::new(HeartbeatShared {
            dht,
            subkey,
            info: Mutex::new(server_info),
            aggregator: Mutex::new(PingAggregator::new()),
            cfg,
            trigger: Notify::new(),
            metrics,
        });
        let join = tokio::spawn(run_announcer(Arc::clone(&shared)));
        Self { shared, join }
    }

    /// Update the announced state; takes effect on the next round, which is
    /// triggered immediately.
    pub fn announce(&self, state: ServerState) {
        self.shared.info.lock().expect("server info lock").state = state;
        self.shared.trigger.notify_one();
    }

    /// Publish one final OFFLINE heartbeat and stop.
    pub async fn announce_offline(self) {
        self.announce(ServerState::Offline);
        let _ = self.join.await;
    }

    /// Whether the announcer task has stopped.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

async fn run_announcer(shared: Arc<HeartbeatShared>) {
    loop {
        let started = Instant::now();
        let state = shared.info.lock().expect("server info lock").state;

        if state != ServerState::Offline {
            ping_sampled_peers(&shared).await;
            let pings = shared
                .aggregator
                .lock()
                .expect("ping aggregator lock")
                .to_map();
            shared.info.lock().expect("server info lock").next_pings = pings;
        } else {
            // No need to ping peers on the way out.
            shared
                .info
                .lock()
                .expect("server info lock")
                .next_pings
                .clear();
        }

        info!("declaring node heartbeat");
        let (payload_state, snapshot) = {
            let info = shared.info.lock().expect("server info lock");
            (info.state, info.clone())
        };
        let expiration_time = dht_time() + shared.cfg.expiration;
        if declare_node(&shared.dht, shared.subkey.clone(), &snapshot, expiration_time).await {
            shared.metrics.heartbeats_published_total.inc();
        } else {
            warn!("heartbeat store was rejected");
        }

        if payload_state == ServerState::Offline {
            return;
        }

        let elapsed = started.elapsed().as_secs_f64();
        let delay = shared.cfg.update_period - elapsed;
        if delay < 0.0 {
            // Keep the schedule; the next sleep is clamped to zero.
            warn!(
                period = shared.cfg.update_period,
                elapsed, "heartbeat iteration exceeded update_period"
            );
        }
        let sleep = tokio::time::sleep(std::time::Duration::from_secs_f64(delay.max(0.0)));
        tokio::select! {
            _ = sleep => {}
            _ = shared.trigger.notified() => {}
        }
    }
}

async fn ping_sampled_peers(shared: &HeartbeatShared) {
    let heartbeats = get_node_heartbeats(&shared.dht, true).await;
    if heartbeats.is_empty() {
        return;
    }
    let own = shared.dht.peer_id();
    let peers: Vec<PeerId> = heartbeats
        .iter()
        .map(|h| h.peer_id)
        .filter(|p| *p != own)
        .collect();
    let sample: Vec<PeerId> = peers
        .choose_multiple(&mut rand::thread_rng(), shared.cfg.max_pinged)
        .copied()
        .collect();
    for peer in sample {
        match shared.dht.ping_peer(&peer).await {
            Some(rtt) => shared
                .aggregator
                .lock()
                .expect("ping aggregator lock")
                .record(peer, rtt),
            None => debug!(%peer, "heartbeat ping failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_info_codec_round_trip() {
        let mut info = ServerInfo::new(NodeRole::Validator, 1.0);
        info.next_pings.insert("peer".to_string(), 0.05);
        let bytes = encode_canonical(&info).unwrap();
        let back: ServerInfo = decode_canonical_limited(&bytes, MAX_SERVER_INFO_BYTES).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn ping_aggregator_smooths_samples() {
        let mut agg = PingAggregator::new();
        let peer = crate::core::identity::NodeIdentity::generate().peer_id();
        agg.record(peer, 0.1);
        agg.record(peer, 0.2);
        let rtt = agg.to_map()[&peer.to_base58()];
        assert!(rtt > 0.1 && rtt < 0.2);
    }

    #[test]
    fn heartbeat_config_expiration_floor() {
        let cfg = HeartbeatConfig::new(10.0);
        assert_eq!(cfg.expiration, MAX_DHT_TIME_DISCREPANCY);
        let cfg = HeartbeatConfig::new(90.0);
        assert_eq!(cfg.expiration, 180.0);
    }
}
