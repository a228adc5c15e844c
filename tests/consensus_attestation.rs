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

//! Consensus engine scenarios against the mock chain and a live swarm.

mod common;

use common::{build_swarm, TestNode};
use meshnet::chain::client::Hypertensor;
use meshnet::chain::data::{
    AttestEntry, ConsensusData, ConsensusScore, SubnetInfo, SubnetNodeClass, SubnetNodeInfo,
    SubnetState,
};
use meshnet::chain::mock::MockHypertensor;
use meshnet::core::types::dht_time;
use meshnet::monitoring::metrics::Metrics;
use meshnet::subnet::consensus::{Consensus, ConsensusConfig, ConstantScore};
use meshnet::subnet::heartbeat::{
    declare_node, get_node_heartbeats, HeartbeatAnnouncer, HeartbeatConfig, NodeRole, ServerInfo,
};
use meshnet::dht::transport::MeshTransport;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const SCORE: u128 = 1_000_000_000_000_000_000;
const SUBNET_ID: u32 = 1;

fn score(subnet_node_id: u32) -> ConsensusScore {
    ConsensusScore {
        subnet_node_id,
        score: SCORE,
    }
}

/// Chain where `nodes[i]` holds subnet node id `ids[i]` at Validator class.
fn chain_for(nodes: &[TestNode], ids: &[u32]) -> Arc<MockHypertensor> {
    let chain = Arc::new(MockHypertensor::new());
    chain.set_slot(Some(0));
    chain.set_subnet_info(Some(SubnetInfo {
        subnet_id: SUBNET_ID,
        state: SubnetState::Active,
        slot_index: Some(0),
    }));
    chain.set_nodes(
        nodes
            .iter()
            .zip(ids)
            .map(|(node, id)| SubnetNodeInfo {
                subnet_node_id: *id,
                peer_id: node.identity.peer_id().to_base58(),
                classification: SubnetNodeClass::Validator,
            })
            .collect(),
    );
    chain
}

fn consensus_entry(
    validator_id: u32,
    data: Vec<ConsensusScore>,
    attest_ids: &[u32],
    subnet_size: u32,
) -> ConsensusData {
    let mut attests = BTreeMap::new();
    for id in attest_ids {
        attests.insert(*id, AttestEntry { block: 0 });
    }
    ConsensusData {
        validator_id,
        attests,
        subnet_nodes: (1..=subnet_size)
            .map(|id| SubnetNodeInfo {
                subnet_node_id: id,
                peer_id: String::new(),
                classification: SubnetNodeClass::Validator,
            })
            .collect(),
        data,
        prioritize_queue_node_id: None,
        remove_queue_node_id: None,
    }
}

async fn declare_all(nodes: &[TestNode]) {
    for node in nodes {
        let info = ServerInfo::new(NodeRole::Validator, 1.0);
        assert!(
            declare_node(&node.dht, node.validator.local_subkey(), &info, dht_time() + 300.0)
                .await
        );
    }
}

fn engine(
    node: &TestNode,
    chain: &Arc<MockHypertensor>,
    subnet_node_id: u32,
) -> Consensus {
    Consensus::new(
        Arc::clone(&node.dht),
        Arc::clone(chain) as Arc<dyn Hypertensor>,
        ConsensusConfig {
            subnet_id: SUBNET_ID,
            subnet_node_id,
            skip_activate_subnet: false,
        },
        Arc::new(ConstantScore),
        Arc::new(Metrics::new().unwrap()),
    )
}

#[tokio::test]
async fn attestation_matches_reordered_scores_and_fires_once() {
    let mesh = MeshTransport::new();
    let nodes = build_swarm(&mesh, None, 3).await;
    declare_all(&nodes).await;

    let chain = chain_for(&nodes, &[1, 2, 3]);
    chain.set_caller_node_id(2);
    chain.set_epoch_progress(7, 0.05);
    chain.set_validator(7, 1);
    // The elected validator posted the same set, differently ordered.
    chain.insert_consensus_data(
        7,
        consensus_entry(1, vec![score(3), score(1), score(2)], &[1], 3),
    );

    let mut consensus = engine(&nodes[1], &chain, 2);
    consensus.run_consensus(7).await.unwrap();

    assert_eq!(chain.attest_calls(), vec![SUBNET_ID]);
    assert!(chain.consensus_data(7).unwrap().attests.contains_key(&2));

    // Same epoch again: we already attested, so nothing further goes on-chain.
    consensus.run_consensus(7).await.unwrap();
    assert_eq!(chain.attest_calls().len(), 1);
    assert!(chain.propose_calls().is_empty());
}

#[tokio::test]
async fn mismatch_without_fallback_skips_attestation() {
    let mesh = MeshTransport::new();
    let nodes = build_swarm(&mesh, None, 3).await;
    declare_all(&nodes).await;

    let chain = chain_for(&nodes, &[1, 2, 3]);
    chain.set_caller_node_id(2);
    chain.set_epoch_progress(9, 0.05);
    chain.set_validator(9, 1);
    // Validator scored a node we never saw; no previous epoch to fall back on.
    chain.insert_consensus_data(
        9,
        consensus_entry(1, vec![score(1), score(2), score(3), score(4)], &[1], 5),
    );

    let mut consensus = engine(&nodes[1], &chain, 2);
    consensus.run_consensus(9).await.unwrap();
    assert!(chain.attest_calls().is_empty());
}

#[tokio::test]
async fn mismatch_with_supermajority_fallback_attests() {
    let mesh = MeshTransport::new();
    let nodes = build_swarm(&mesh, None, 3).await;
    declare_all(&nodes).await;

    let chain = chain_for(&nodes, &[1, 2, 3]);
    chain.set_caller_node_id(2);
    chain.set_epoch_progress(9, 0.05);
    chain.set_validator(9, 1);
    chain.insert_consensus_data(
        9,
        consensus_entry(1, vec![score(1), score(2), score(3), score(4)], &[1], 5),
    );
    // Previous epoch's submission includes the flapping node and was attested
    // by 4 of 5 nodes (0.80 >= 0.66).
    chain.insert_consensus_data(
        8,
        consensus_entry(
            1,
            vec![score(1), score(2), score(3), score(4)],
            &[1, 2, 3, 4],
            5,
        ),
    );

    let mut consensus = engine(&nodes[1], &chain, 2);
    consensus.run_consensus(9).await.unwrap();
    assert_eq!(chain.attest_calls(), vec![SUBNET_ID]);
}

#[tokio::test]
async fn weakly_attested_fallback_is_not_trusted() {
    let mesh = MeshTransport::new();
    let nodes = build_swarm(&mesh, None, 3).await;
    declare_all(&nodes).await;

    let chain = chain_for(&nodes, &[1, 2, 3]);
    chain.set_caller_node_id(2);
    chain.set_epoch_progress(9, 0.05);
    chain.set_validator(9, 1);
    chain.insert_consensus_data(
        9,
        consensus_entry(1, vec![score(1), score(2), score(3), score(4)], &[1], 5),
    );
    // Only 2 of 4 attested last epoch (0.50 < 0.66): inadmissible fallback.
    chain.insert_consensus_data(
        8,
        consensus_entry(1, vec![score(1), score(2), score(3), score(4)], &[1, 2], 4),
    );

    let mut consensus = engine(&nodes[1], &chain, 2);
    consensus.run_consensus(9).await.unwrap();
    assert!(chain.attest_calls().is_empty());
}

#[tokio::test]
async fn queue_side_effects_suppress_attestation() {
    let mesh = MeshTransport::new();
    let nodes = build_swarm(&mesh, None, 3).await;
    declare_all(&nodes).await;

    let chain = chain_for(&nodes, &[1, 2, 3]);
    chain.set_caller_node_id(2);
    chain.set_epoch_progress(7, 0.05);
    chain.set_validator(7, 1);
    let mut entry = consensus_entry(1, vec![score(1), score(2), score(3)], &[1], 3);
    entry.prioritize_queue_node_id = Some(9);
    chain.insert_consensus_data(7, entry);

    let mut consensus = engine(&nodes[1], &chain, 2);
    consensus.run_consensus(7).await.unwrap();
    assert!(chain.attest_calls().is_empty());
}

#[tokio::test]
async fn elected_validator_proposes_once_even_with_empty_scores() {
    let mesh = MeshTransport::new();
    let nodes = build_swarm(&mesh, None, 2).await;
    // No heartbeats declared and no included nodes: nothing to score.

    let chain = chain_for(&nodes, &[]);
    chain.set_nodes(Vec::new());
    chain.set_caller_node_id(1);
    chain.set_epoch_progress(5, 0.02);
    chain.set_validator(5, 1);

    let mut consensus = engine(&nodes[0], &chain, 1);
    consensus.run_consensus(5).await.unwrap();

    // The empty vector goes through the same proposal call.
    let proposals = chain.propose_calls();
    assert_eq!(proposals.len(), 1);
    assert!(proposals[0].1.is_empty());

    // A second run in the same epoch sees the posted data and does nothing.
    consensus.run_consensus(5).await.unwrap();
    assert_eq!(chain.propose_calls().len(), 1);
}

#[tokio::test]
async fn vanished_subnet_shuts_consensus_down_but_node_stays_up() {
    let mesh = MeshTransport::new();
    let nodes = build_swarm(&mesh, None, 2).await;

    // Heartbeat keeps running throughout.
    let heartbeat = HeartbeatAnnouncer::spawn(
        Arc::clone(&nodes[0].dht),
        nodes[0].validator.local_subkey(),
        ServerInfo::new(NodeRole::Validator, 1.0),
        HeartbeatConfig {
            update_period: 0.2,
            expiration: 60.0,
            max_pinged: 2,
        },
        Arc::clone(&nodes[0].metrics),
    );

    let chain = Arc::new(MockHypertensor::new());
    chain.set_slot(Some(0));
    chain.set_block(0);
    chain.set_block_secs(0.01);
    chain.set_subnet_info(None);

    let handle = engine(&nodes[1], &chain, 2).spawn();

    // Walk the chain forward; after four consecutive unknown-subnet epochs
    // the engine gives up.
    let mut finished = false;
    for _ in 0..200 {
        if handle.is_finished() {
            finished = true;
            break;
        }
        chain.advance_blocks(25);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(finished, "consensus should shut down on a vanished subnet");
    assert!(chain.propose_calls().is_empty());
    assert!(chain.attest_calls().is_empty());

    // The heartbeat and DHT are unaffected.
    assert!(!heartbeat.is_finished());
    let before = nodes[0].metrics.heartbeats_published_total.get();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(nodes[0].metrics.heartbeats_published_total.get() > before);
    assert!(!get_node_heartbeats(&nodes[1].dht, true).await.is_empty());

    heartbeat.announce_offline().await;
}

#[tokio::test]
async fn full_lifecycle_reaches_a_proposal() {
    let mesh = MeshTransport::new();
    let nodes = build_swarm(&mesh, None, 2).await;
    declare_all(&nodes).await;

    let chain = chain_for(&nodes, &[1, 2]);
    chain.set_caller_node_id(1);
    chain.set_block(0);
    chain.set_block_secs(0.01);
    for epoch in 0..200 {
        chain.set_validator(epoch, 1);
    }

    // The engine walks WaitActive -> WaitEligible -> Epoch(..) as the chain
    // advances, then proposes as the elected validator.
    let handle = engine(&nodes[0], &chain, 1).spawn();
    let mut proposed = false;
    for _ in 0..400 {
        if !chain.propose_calls().is_empty() {
            proposed = true;
            break;
        }
        chain.advance_blocks(10);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(proposed, "elected validator should propose within the window");

    handle.shutdown(Duration::from_secs(3)).await;
}

#[tokio::test]
async fn shutdown_interrupts_long_epoch_sleep() {
    let mesh = MeshTransport::new();
    let nodes = build_swarm(&mesh, None, 2).await;

    let chain = Arc::new(MockHypertensor::new());
    chain.set_slot(Some(0));
    chain.set_subnet_info(None); // engine parks in the activation wait

    let handle = engine(&nodes[0], &chain, 1).spawn();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = std::time::Instant::now();
    handle.shutdown(Duration::from_secs(3)).await;
    assert!(started.elapsed() < Duration::from_secs(3));
}
