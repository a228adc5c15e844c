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

#![allow(dead_code)]

//! In-process swarm harness shared by the integration tests.

use meshnet::auth::authorizer::SignatureAuthorizer;
use meshnet::chain::client::EpochClock;
use meshnet::chain::data::EpochData;
use meshnet::core::identity::NodeIdentity;
use meshnet::dht::node::{DhtNode, DhtNodeConfig};
use meshnet::dht::predicate::PredicateValidator;
use meshnet::dht::protocol::DhtProtocol;
use meshnet::dht::transport::{MeshTransport, Servicer, Transport};
use meshnet::dht::validation::{CompositeValidator, RecordValidator, SignatureValidator};
use meshnet::monitoring::metrics::Metrics;
use std::sync::Arc;
use std::time::Duration;

/// One in-process node.
pub struct TestNode {
    pub identity: Arc<NodeIdentity>,
    pub validator: Arc<SignatureValidator>,
    pub dht: Arc<DhtNode>,
    pub endpoint: String,
    pub metrics: Arc<Metrics>,
}

/// Clock parked at epoch 3, 0% complete, 600 s epochs.
pub fn permissive_clock() -> EpochClock {
    EpochClock::new(EpochData::derive(300, 100, 6.0, 0))
}

/// Build `n` nodes wired through one in-process transport. With a clock, the
/// epoch admission predicate is part of every node's validator chain.
pub async fn build_swarm(
    mesh: &MeshTransport,
    clock: Option<EpochClock>,
    n: usize,
) -> Vec<TestNode> {
    let mut nodes = Vec::with_capacity(n);
    let mut first_endpoint: Option<String> = None;

    for i in 0..n {
        let identity = Arc::new(NodeIdentity::generate());
        let validator = Arc::new(SignatureValidator::new(Arc::clone(&identity)));
        let mut stages: Vec<Arc<dyn RecordValidator>> =
            vec![Arc::clone(&validator) as Arc<dyn RecordValidator>];
        if let Some(clock) = &clock {
            stages.push(Arc::new(PredicateValidator::new(clock.clone())));
        }
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        let endpoint = format!("node-{i}-{}", identity.peer_id().to_base58());

        let protocol = DhtProtocol::new(
            Arc::clone(&identity),
            endpoint.clone(),
            20,
            Duration::from_secs(1),
            Arc::new(CompositeValidator::new(stages)),
            Arc::new(SignatureAuthorizer::new(Arc::clone(&identity))),
            Arc::new(mesh.clone()) as Arc<dyn Transport>,
            Arc::clone(&metrics),
        );
        mesh.register(endpoint.clone(), Arc::clone(&protocol) as Arc<dyn Servicer>);

        let dht = DhtNode::new(
            DhtNodeConfig {
                lookup_timeout: Duration::from_secs(2),
                sweep_period: Duration::from_secs(3600),
                refresh_period: Duration::from_secs(3600),
                bootstrap: first_endpoint.clone().into_iter().collect(),
                ..DhtNodeConfig::default()
            },
            protocol,
        );
        if first_endpoint.is_none() {
            first_endpoint = Some(endpoint.clone());
        }

        nodes.push(TestNode {
            identity,
            validator,
            dht,
            endpoint,
            metrics,
        });
    }

    for node in &nodes {
        node.dht.bootstrap().await;
    }
    nodes
}
