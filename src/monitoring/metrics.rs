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

//! Prometheus metrics container, created once at process init and shared.

use prometheus::{IntCounter, IntGauge, Registry};
use thiserror::Error;

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus")]
    Prom,
}

/// Metrics container.
#[derive(Clone)]
pub struct Metrics {
    /// Registry.
    pub registry: Registry,

    /// RPC requests serviced.
    pub rpc_requests_total: IntCounter,
    /// Requests dropped by the authorizer pipeline.
    pub rpc_auth_failures_total: IntCounter,
    /// Records admitted into local storage.
    pub dht_store_accepted_total: IntCounter,
    /// Records rejected by the validator pipeline.
    pub dht_store_rejected_total: IntCounter,
    /// Resident routing-table peers.
    pub dht_routing_peers: IntGauge,
    /// Heartbeats published to the DHT.
    pub heartbeats_published_total: IntCounter,
    /// Successful `propose_attestation` submissions.
    pub consensus_proposals_total: IntCounter,
    /// Successful `attest` submissions.
    pub consensus_attestations_total: IntCounter,
}

impl Metrics {
    /// Create and register metrics.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let rpc_requests_total =
            IntCounter::new("meshnet_rpc_requests_total", "RPC requests serviced")
                .map_err(|_| MetricsError::Prom)?;
        let rpc_auth_failures_total = IntCounter::new(
            "meshnet_rpc_auth_failures_total",
            "Requests dropped by the authorizer pipeline",
        )
        .map_err(|_| MetricsError::Prom)?;
        let dht_store_accepted_total = IntCounter::new(
            "meshnet_dht_store_accepted_total",
            "Records admitted into local storage",
        )
        .map_err(|_| MetricsError::Prom)?;
        let dht_store_rejected_total = IntCounter::new(
            "meshnet_dht_store_rejected_total",
            "Records rejected by the validator pipeline",
        )
        .map_err(|_| MetricsError::Prom)?;
        let dht_routing_peers =
            IntGauge::new("meshnet_dht_routing_peers", "Resident routing-table peers")
                .map_err(|_| MetricsError::Prom)?;
        let heartbeats_published_total = IntCounter::new(
            "meshnet_heartbeats_published_total",
            "Heartbeats published to the DHT",
        )
        .map_err(|_| MetricsError::Prom)?;
        let consensus_proposals_total = IntCounter::new(
            "meshnet_consensus_proposals_total",
            "Successful propose_attestation submissions",
        )
        .map_err(|_| MetricsError::Prom)?;
        let consensus_attestations_total = IntCounter::new(
            "meshnet_consensus_attestations_total",
            "Successful attest submissions",
        )
        .map_err(|_| MetricsError::Prom)?;

        registry
            .register(Box::new(rpc_requests_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(rpc_auth_failures_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(dht_store_accepted_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(dht_store_rejected_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(dht_routing_peers.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(heartbeats_published_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(consensus_proposals_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(consensus_attestations_total.clone()))
            .map_err(|_| MetricsError::Prom)?;

        Ok(Self {
            registry,
            rpc_requests_total,
            rpc_auth_failures_total,
            dht_store_accepted_total,
            dht_store_rejected_total,
            dht_routing_peers,
            heartbeats_published_total,
            consensus_proposals_total,
            consensus_attestations_total,
        })
    }
}
