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

//! Multi-node DHT behavior over the in-process transport.

mod common;

use common::{build_swarm, permissive_clock};
use meshnet::core::types::dht_time;
use meshnet::dht::storage::DhtValueView;
use meshnet::dht::transport::MeshTransport;
use meshnet::subnet::heartbeat::{
    declare_node, get_node_heartbeats, NodeRole, ServerInfo, ServerState,
};

#[tokio::test]
async fn heartbeat_round_trip_across_peers() {
    let mesh = MeshTransport::new();
    let nodes = build_swarm(&mesh, Some(permissive_clock()), 4).await;

    let mut info = ServerInfo::new(NodeRole::Validator, 1.0);
    info.version = "1.0.0".to_string();
    assert_eq!(info.state, ServerState::Online);

    let publisher = &nodes[0];
    assert!(
        declare_node(
            &publisher.dht,
            publisher.validator.local_subkey(),
            &info,
            dht_time() + 300.0,
        )
        .await
    );

    let reader = &nodes[2];
    let heartbeats = get_node_heartbeats(&reader.dht, true).await;
    assert_eq!(heartbeats.len(), 1);
    assert_eq!(heartbeats[0].peer_id, publisher.identity.peer_id());
    assert_eq!(heartbeats[0].server, info);
}

#[tokio::test]
async fn store_then_get_from_another_peer() {
    let mesh = MeshTransport::new();
    let nodes = build_swarm(&mesh, None, 5).await;

    let stored = nodes[0]
        .dht
        .store(b"some-key", b"some-value".to_vec(), dht_time() + 60.0, None)
        .await;
    assert!(stored);

    for reader in &nodes[1..] {
        let found = reader.dht.get(b"some-key").await.expect("value visible");
        assert_eq!(found.view, DhtValueView::Regular(b"some-value".to_vec()));
    }
}

#[tokio::test]
async fn dictionary_key_returns_all_subkey_entries() {
    let mesh = MeshTransport::new();
    let nodes = build_swarm(&mesh, Some(permissive_clock()), 3).await;

    for node in &nodes[..2] {
        let info = ServerInfo::new(NodeRole::Hoster, 2.0);
        assert!(
            declare_node(&node.dht, node.validator.local_subkey(), &info, dht_time() + 120.0)
                .await
        );
    }

    let heartbeats = get_node_heartbeats(&nodes[2].dht, true).await;
    assert_eq!(heartbeats.len(), 2);
    let mut peers: Vec<_> = heartbeats.iter().map(|h| h.peer_id).collect();
    peers.sort();
    let mut expected = vec![nodes[0].identity.peer_id(), nodes[1].identity.peer_id()];
    expected.sort();
    assert_eq!(peers, expected);
}

#[tokio::test]
async fn latest_bypasses_the_lookup_cache() {
    use meshnet::dht::transport::Servicer;
    use std::sync::Arc;

    let mesh = MeshTransport::new();
    let nodes = build_swarm(&mesh, None, 3).await;

    assert!(
        nodes[0]
            .dht
            .store(b"k", b"v1".to_vec(), dht_time() + 60.0, None)
            .await
    );
    let first = nodes[1].dht.get_latest(b"k").await.unwrap();
    assert_eq!(first.view, DhtValueView::Regular(b"v1".to_vec()));

    // A fresher value lands network-wide while the reader is partitioned off,
    // so both its cache and its local replica stay stale.
    mesh.unregister(&nodes[1].endpoint);
    assert!(
        nodes[0]
            .dht
            .store(b"k", b"v2".to_vec(), dht_time() + 120.0, None)
            .await
    );
    mesh.register(
        nodes[1].endpoint.clone(),
        Arc::clone(&nodes[1].dht.protocol) as Arc<dyn Servicer>,
    );

    let cached = nodes[1].dht.get(b"k").await.unwrap();
    assert_eq!(cached.view, DhtValueView::Regular(b"v1".to_vec()));

    let fresh = nodes[1].dht.get_latest(b"k").await.unwrap();
    assert_eq!(fresh.view, DhtValueView::Regular(b"v2".to_vec()));

    // The fresh result overwrote the cache entry.
    let after = nodes[1].dht.get(b"k").await.unwrap();
    assert_eq!(after.view, DhtValueView::Regular(b"v2".to_vec()));
}

#[tokio::test]
async fn lookup_survives_unreachable_peers() {
    let mesh = MeshTransport::new();
    let nodes = build_swarm(&mesh, None, 5).await;

    assert!(
        nodes[0]
            .dht
            .store(b"resilient", b"payload".to_vec(), dht_time() + 60.0, None)
            .await
    );

    // One peer drops off the network entirely.
    mesh.unregister(&nodes[3].endpoint);

    let found = nodes[4].dht.get_latest(b"resilient").await;
    assert_eq!(
        found.map(|f| f.view),
        Some(DhtValueView::Regular(b"payload".to_vec()))
    );
}

#[tokio::test]
async fn get_many_resolves_each_key() {
    let mesh = MeshTransport::new();
    let nodes = build_swarm(&mesh, None, 4).await;

    for (key, value) in [(b"alpha".to_vec(), b"1"), (b"beta".to_vec(), b"2")] {
        assert!(
            nodes[0]
                .dht
                .store(&key, value.to_vec(), dht_time() + 60.0, None)
                .await
        );
    }

    let keys = vec![b"alpha".to_vec(), b"beta".to_vec(), b"missing".to_vec()];
    let found = nodes[3].dht.get_many(&keys, true).await;
    assert_eq!(
        found[&b"alpha".to_vec()].as_ref().map(|f| f.view.clone()),
        Some(DhtValueView::Regular(b"1".to_vec()))
    );
    assert_eq!(
        found[&b"beta".to_vec()].as_ref().map(|f| f.view.clone()),
        Some(DhtValueView::Regular(b"2".to_vec()))
    );
    assert!(found[&b"missing".to_vec()].is_none());
}

#[tokio::test]
async fn announcer_publishes_until_offline() {
    use meshnet::subnet::heartbeat::{HeartbeatAnnouncer, HeartbeatConfig};
    use std::sync::Arc;
    use std::time::Duration;

    let mesh = MeshTransport::new();
    let nodes = build_swarm(&mesh, Some(permissive_clock()), 3).await;

    let announcer = HeartbeatAnnouncer::spawn(
        Arc::clone(&nodes[0].dht),
        nodes[0].validator.local_subkey(),
        ServerInfo::new(NodeRole::Validator, 1.0),
        HeartbeatConfig {
            update_period: 0.1,
            expiration: 60.0,
            max_pinged: 2,
        },
        Arc::clone(&nodes[0].metrics),
    );

    // A couple of rounds go out on schedule.
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(nodes[0].metrics.heartbeats_published_total.get() >= 2);
    let live = get_node_heartbeats(&nodes[1].dht, true).await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].server.state, ServerState::Online);

    // The OFFLINE announcement is published once, then the task stops.
    announcer.announce_offline().await;
    let last = get_node_heartbeats(&nodes[1].dht, true).await;
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].server.state, ServerState::Offline);
}

#[tokio::test]
async fn stale_store_does_not_clobber_fresher_value() {
    let mesh = MeshTransport::new();
    let nodes = build_swarm(&mesh, None, 3).await;

    assert!(
        nodes[0]
            .dht
            .store(b"k2", b"new".to_vec(), dht_time() + 300.0, None)
            .await
    );
    // An older (shorter-lived) value is refused everywhere.
    assert!(
        !nodes[1]
            .dht
            .store(b"k2", b"old".to_vec(), dht_time() + 30.0, None)
            .await
    );
    let found = nodes[2].dht.get_latest(b"k2").await.unwrap();
    assert_eq!(found.view, DhtValueView::Regular(b"new".to_vec()));
}
