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

//! The chain client seam.
//!
//! Transport to the chain is out of scope; the core programs against this
//! trait. Absence (unknown subnet, unelected validator, missing consensus
//! data) is `Option`, transient transport failure is `ChainError::Transient`
//! and gets retried by callers with block-time backoff. Implementations map
//! any transport-level null sentinel to `None` before it reaches callers.

use crate::chain::data::{
    ConsensusData, ConsensusScore, EpochData, Receipt, SubnetInfo, SubnetNodeClass, SubnetNodeInfo,
};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use tracing::warn;

/// Chain client errors.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Transient RPC failure; retry with backoff.
    #[error("transient chain rpc: {0}")]
    Transient(String),
}

/// Read/write surface of the chain, as consumed by the core.
#[async_trait]
pub trait Hypertensor: Send + Sync {
    /// Current head block number.
    async fn get_block_number(&self) -> Result<u64, ChainError>;
    /// Blocks per epoch.
    async fn get_epoch_length(&self) -> Result<u64, ChainError>;
    /// Epoch data derived from the chain head.
    async fn get_epoch_data(&self) -> Result<EpochData, ChainError>;
    /// Epoch data offset by a subnet's slot.
    async fn get_subnet_epoch_data(&self, slot: u32) -> Result<EpochData, ChainError>;
    /// The subnet's slot within the chain's epoch counter.
    async fn get_subnet_slot(&self, subnet_id: u32) -> Result<Option<u32>, ChainError>;
    /// Subnet registration record.
    async fn get_formatted_subnet_info(
        &self,
        subnet_id: u32,
    ) -> Result<Option<SubnetInfo>, ChainError>;
    /// Subnet nodes of class at least `min_class` at `epoch`.
    async fn get_min_class_subnet_nodes(
        &self,
        subnet_id: u32,
        epoch: u64,
        min_class: SubnetNodeClass,
    ) -> Result<Vec<SubnetNodeInfo>, ChainError>;
    /// The elected validator for `epoch`, once chosen.
    async fn get_rewards_validator(
        &self,
        subnet_id: u32,
        epoch: u64,
    ) -> Result<Option<u32>, ChainError>;
    /// The elected validator's submission for `epoch`, once posted.
    async fn get_consensus_data(
        &self,
        subnet_id: u32,
        epoch: u64,
    ) -> Result<Option<ConsensusData>, ChainError>;
    /// Whether `peer_id` is staked on the subnet with class at least `min_class`.
    async fn proof_of_stake(
        &self,
        subnet_id: u32,
        peer_id: &str,
        min_class: SubnetNodeClass,
    ) -> Result<bool, ChainError>;
    /// Submit a score list as the elected validator.
    async fn propose_attestation(
        &self,
        subnet_id: u32,
        data: Vec<ConsensusScore>,
    ) -> Result<Receipt, ChainError>;
    /// Attest the elected validator's submission.
    async fn attest(&self, subnet_id: u32) -> Result<Receipt, ChainError>;
}

/// A shared snapshot of the subnet's epoch position, refreshed in the
/// background so synchronous consumers (the admission predicate) never block
/// on a chain round-trip.
#[derive(Clone)]
pub struct EpochClock {
    inner: Arc<RwLock<EpochData>>,
}

impl EpochClock {
    /// Clock seeded with an initial snapshot.
    pub fn new(initial: EpochData) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    /// Replace the snapshot.
    pub fn set(&self, data: EpochData) {
        if let Ok(mut guard) = self.inner.write() {
            // Epochs never move backwards; keep the freshest snapshot.
            if data.epoch > guard.epoch || (data.epoch == guard.epoch && data.block >= guard.block)
            {
                *guard = data;
            }
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> EpochData {
        self.inner.read().map(|g| *g).unwrap_or_default()
    }
}

impl Default for EpochClock {
    fn default() -> Self {
        Self::new(EpochData::default())
    }
}

/// Refresh `clock` from the chain once per block until `stop` flips.
pub fn spawn_epoch_poller(
    chain: Arc<dyn Hypertensor>,
    slot: u32,
    clock: EpochClock,
    mut stop: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match chain.get_subnet_epoch_data(slot).await {
                Ok(data) => clock.set(data),
                Err(e) => warn!(err = %e, "epoch poll failed"),
            }
            let sleep = tokio::time::sleep(std::time::Duration::from_secs_f64(
                crate::chain::data::BLOCK_SECS,
            ));
            tokio::select! {
                _ = sleep => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return;
                    }
                }
            }
        }
    })
}
