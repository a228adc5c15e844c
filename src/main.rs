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
#![warn(missing_docs)]

//! Meshnet node entrypoint.
//!
//! Starts the DHT, heartbeat announcer, and consensus engine, then waits for
//! a shutdown signal. The chain client here is the in-memory mock (a real
//! chain transport plugs in through the same `Hypertensor` trait).

use anyhow::Context;
use meshnet::admin::serve_admin;
use meshnet::auth::authorizer::SignatureAuthorizer;
use meshnet::auth::rate_limit::{RateLimitAuthorizer, RateLimitConfig};
use meshnet::chain::client::{spawn_epoch_poller, EpochClock, Hypertensor};
use meshnet::chain::data::{SubnetInfo, SubnetNodeClass, SubnetNodeInfo, SubnetState};
use meshnet::chain::mock::MockHypertensor;
use meshnet::core::config::NodeConfig;
use meshnet::core::identity::NodeIdentity;
use meshnet::dht::node::{DhtNode, DhtNodeConfig};
use meshnet::dht::predicate::PredicateValidator;
use meshnet::dht::protocol::DhtProtocol;
use meshnet::dht::transport::{serve_tcp, Servicer, TcpTransport};
use meshnet::dht::validation::{CompositeValidator, RecordValidator, SignatureValidator};
use meshnet::monitoring::logging::init_logging;
use meshnet::monitoring::metrics::Metrics;
use meshnet::subnet::consensus::{Consensus, ConsensusConfig, ConstantScore};
use meshnet::subnet::heartbeat::{
    HeartbeatAnnouncer, HeartbeatConfig, NodeRole, ServerInfo,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

fn load_config() -> anyhow::Result<NodeConfig> {
    match std::env::var("MESH_CONFIG") {
        Ok(path) => NodeConfig::load(&path).with_context(|| format!("loading config {path}")),
        Err(_) => Ok(NodeConfig::default()),
    }
}

/// Seed the in-memory chain so a standalone node can run end to end.
fn seed_mock_chain(cfg: &NodeConfig, identity: &NodeIdentity) -> Arc<MockHypertensor> {
    let chain = Arc::new(MockHypertensor::new());
    chain.set_subnet_info(Some(SubnetInfo {
        subnet_id: cfg.subnet.subnet_id,
        state: SubnetState::Active,
        slot_index: Some(3),
    }));
    chain.set_nodes(vec![SubnetNodeInfo {
        subnet_node_id: cfg.subnet.subnet_node_id,
        peer_id: identity.peer_id().to_base58(),
        classification: SubnetNodeClass::Validator,
    }]);
    chain.set_caller_node_id(cfg.subnet.subnet_node_id);
    chain
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cfg = load_config()?;
    let metrics = Arc::new(Metrics::new().context("metrics init")?);
    let identity =
        Arc::new(NodeIdentity::load_or_create(&cfg.node.data_dir).context("node identity")?);
    info!(peer_id = %identity.peer_id(), "meshnet node starting");

    let chain: Arc<dyn Hypertensor> = seed_mock_chain(&cfg, &identity);
    let clock = EpochClock::default();

    let signature_validator = Arc::new(SignatureValidator::new(Arc::clone(&identity)));
    let validators = Arc::new(CompositeValidator::new(vec![
        Arc::clone(&signature_validator) as Arc<dyn RecordValidator>,
        Arc::new(PredicateValidator::new(clock.clone())),
    ]));
    let authorizer = Arc::new(RateLimitAuthorizer::new(
        SignatureAuthorizer::new(Arc::clone(&identity)),
        RateLimitConfig::default(),
        None,
    ));

    let listener = tokio::net::TcpListener::bind(&cfg.dht.listen_addr)
        .await
        .with_context(|| format!("binding {}", cfg.dht.listen_addr))?;
    let local_addr = listener.local_addr().context("local addr")?;
    let announce = cfg
        .dht
        .announce_addr
        .clone()
        .unwrap_or_else(|| local_addr.to_string());

    let protocol = DhtProtocol::new(
        Arc::clone(&identity),
        announce,
        cfg.dht.bucket_size,
        Duration::from_secs(5),
        validators,
        authorizer,
        Arc::new(TcpTransport::new()),
        Arc::clone(&metrics),
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(serve_tcp(
        listener,
        Arc::clone(&protocol) as Arc<dyn Servicer>,
        stop_rx.clone(),
    ));

    let dht = DhtNode::new(
        DhtNodeConfig {
            alpha: cfg.dht.alpha,
            num_workers: cfg.dht.num_workers,
            bootstrap: cfg.dht.bootstrap.clone(),
            ..DhtNodeConfig::default()
        },
        protocol,
    );
    dht.bootstrap().await;

    let slot = chain
        .get_subnet_slot(cfg.subnet.subnet_id)
        .await
        .ok()
        .flatten()
        .unwrap_or(0);
    spawn_epoch_poller(Arc::clone(&chain), slot, clock.clone(), stop_rx.clone());

    let mut server_info = ServerInfo::new(NodeRole::Validator, 1.0);
    server_info.public_name = cfg.node.public_name.clone();
    let heartbeat = HeartbeatAnnouncer::spawn(
        Arc::clone(&dht),
        signature_validator.local_subkey(),
        server_info,
        HeartbeatConfig::new(cfg.subnet.update_period),
        Arc::clone(&metrics),
    );

    let consensus = Consensus::new(
        Arc::clone(&dht),
        Arc::clone(&chain),
        ConsensusConfig {
            subnet_id: cfg.subnet.subnet_id,
            subnet_node_id: cfg.subnet.subnet_node_id,
            skip_activate_subnet: cfg.subnet.skip_activate_subnet,
        },
        Arc::new(ConstantScore),
        Arc::clone(&metrics),
    )
    .spawn();

    if cfg.admin.listen_addr.is_some() {
        let admin_cfg = cfg.admin.clone();
        let bootnodes = cfg.dht.bootstrap.clone();
        let admin_dht = Arc::clone(&dht);
        let admin_stop = stop_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_admin(admin_cfg, bootnodes, admin_dht, admin_stop).await {
                tracing::warn!(err = %e, "admin surface failed");
            }
        });
    }

    shutdown_signal().await;
    info!("shutdown signal received");

    consensus.shutdown(Duration::from_secs(3)).await;
    heartbeat.announce_offline().await;
    dht.shutdown();
    let _ = stop_tx.send(true);

    info!("meshnet node stopped");
    Ok(())
}
