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

//! Chain-facing data shapes: epochs, subnet state, node classes, consensus
//! submissions, and transaction receipts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Chain block time, seconds.
pub const BLOCK_SECS: f64 = 6.0;

/// A snapshot of where the chain head sits inside the current epoch.
/// Monotonically non-decreasing in `epoch`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochData {
    /// Chain head block number.
    pub block: u64,
    /// Epoch index.
    pub epoch: u64,
    /// Blocks per epoch (chain-configured).
    pub block_per_epoch: u64,
    /// Seconds per epoch.
    pub seconds_per_epoch: f64,
    /// Progress through the epoch, `[0, 1]`.
    pub percent_complete: f64,
    /// Blocks elapsed in this epoch.
    pub blocks_elapsed: u64,
    /// Blocks remaining in this epoch.
    pub blocks_remaining: u64,
    /// Seconds elapsed in this epoch.
    pub seconds_elapsed: f64,
    /// Seconds remaining in this epoch.
    pub seconds_remaining: f64,
}

impl EpochData {
    /// Derive epoch data from a head block, optionally offset by a subnet's
    /// slot (the subnet's position within the chain's epoch counter).
    pub fn derive(block: u64, epoch_length: u64, block_secs: f64, slot: u64) -> Self {
        let blocks_since_start = block.saturating_sub(slot);
        let epoch = blocks_since_start / epoch_length;
        let blocks_elapsed = blocks_since_start % epoch_length;
        let blocks_remaining = epoch_length - blocks_elapsed;
        Self {
            block,
            epoch,
            block_per_epoch: epoch_length,
            seconds_per_epoch: epoch_length as f64 * block_secs,
            percent_complete: blocks_elapsed as f64 / epoch_length as f64,
            blocks_elapsed,
            blocks_remaining,
            seconds_elapsed: blocks_elapsed as f64 * block_secs,
            seconds_remaining: blocks_remaining as f64 * block_secs,
        }
    }
}

/// On-chain lifecycle state of a subnet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubnetState {
    /// Registered but not yet activated by its owner.
    Registered,
    /// Running; consensus applies.
    Active,
    /// Paused by governance.
    Paused,
}

/// Subnet registration record (fields the core consumes).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubnetInfo {
    /// Subnet id.
    pub subnet_id: u32,
    /// Lifecycle state.
    pub state: SubnetState,
    /// The subnet's slot within the chain's epoch counter.
    pub slot_index: Option<u32>,
}

/// On-chain node classification, ordered by privilege.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SubnetNodeClass {
    /// Registered, not yet activated.
    Registered,
    /// Activated, awaiting inclusion.
    Idle,
    /// Included in consensus data.
    Included,
    /// Eligible for election and attestation.
    Validator,
}

/// One subnet node as reported by the chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubnetNodeInfo {
    /// On-chain subnet node id.
    pub subnet_node_id: u32,
    /// The node's peer id, base58.
    pub peer_id: String,
    /// Classification at the queried epoch.
    pub classification: SubnetNodeClass,
}

/// One `(node_id, score)` pair of a consensus submission.
/// Canonical ordering is by `subnet_node_id` ascending.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ConsensusScore {
    /// On-chain subnet node id.
    pub subnet_node_id: u32,
    /// Deterministic score.
    pub score: u128,
}

/// A node's recorded attestation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestEntry {
    /// Block at which the attestation landed.
    pub block: u64,
}

/// The elected validator's submission for an epoch, plus attestations so far.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsensusData {
    /// Elected validator's subnet node id.
    pub validator_id: u32,
    /// Attestations keyed by subnet node id.
    pub attests: BTreeMap<u32, AttestEntry>,
    /// Subnet nodes at submission time.
    pub subnet_nodes: Vec<SubnetNodeInfo>,
    /// Submitted scores.
    pub data: Vec<ConsensusScore>,
    /// Queue-prioritization side effect, if the validator used one.
    pub prioritize_queue_node_id: Option<u32>,
    /// Queue-removal side effect, if the validator used one.
    pub remove_queue_node_id: Option<u32>,
}

impl ConsensusData {
    /// Fraction of subnet nodes that have attested.
    pub fn attestation_ratio(&self) -> f64 {
        if self.subnet_nodes.is_empty() {
            return 0.0;
        }
        self.attests.len() as f64 / self.subnet_nodes.len() as f64
    }
}

/// On-chain transaction receipt. Only these fields are observable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    /// Whether the extrinsic was accepted.
    pub is_success: bool,
    /// Failure detail, empty on success.
    pub error_message: String,
}

impl Receipt {
    /// Successful receipt.
    pub fn success() -> Self {
        Self {
            is_success: true,
            error_message: String::new(),
        }
    }

    /// Failed receipt.
    pub fn failure(msg: impl Into<String>) -> Self {
        Self {
            is_success: false,
            error_message: msg.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_data_derivation() {
        let d = EpochData::derive(190, 100, 6.0, 0);
        assert_eq!(d.epoch, 1);
        assert_eq!(d.blocks_elapsed, 90);
        assert_eq!(d.blocks_remaining, 10);
        assert!((d.percent_complete - 0.9).abs() < 1e-9);
        assert!((d.seconds_remaining - 60.0).abs() < 1e-9);
        assert!((d.seconds_per_epoch - 600.0).abs() < 1e-9);
    }

    #[test]
    fn slot_offsets_epoch_math() {
        let d = EpochData::derive(103, 100, 6.0, 3);
        assert_eq!(d.epoch, 1);
        assert_eq!(d.blocks_elapsed, 0);
    }

    #[test]
    fn attestation_ratio() {
        let mut data = ConsensusData {
            validator_id: 1,
            attests: BTreeMap::new(),
            subnet_nodes: vec![
                SubnetNodeInfo {
                    subnet_node_id: 1,
                    peer_id: String::new(),
                    classification: SubnetNodeClass::Validator,
                },
                SubnetNodeInfo {
                    subnet_node_id: 2,
                    peer_id: String::new(),
                    classification: SubnetNodeClass::Validator,
                },
            ],
            data: vec![],
            prioritize_queue_node_id: None,
            remove_queue_node_id: None,
        };
        data.attests.insert(1, AttestEntry { block: 10 });
        assert!((data.attestation_ratio() - 0.5).abs() < 1e-9);
    }
}
