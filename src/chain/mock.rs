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

//! In-memory chain used by tests and local swarms. Block number, node
//! classes, the validator schedule, and receipts are all settable; epoch
//! math matches the real chain's slot-offset derivation.

use crate::chain::client::{ChainError, Hypertensor};
use crate::chain::data::{
    AttestEntry, ConsensusData, ConsensusScore, EpochData, Receipt, SubnetInfo, SubnetNodeClass,
    SubnetNodeInfo, BLOCK_SECS,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

struct MockState {
    block: u64,
    epoch_length: u64,
    block_secs: f64,
    slot: Option<u32>,
    subnet_info: Option<SubnetInfo>,
    nodes: Vec<SubnetNodeInfo>,
    validators: BTreeMap<u64, u32>,
    consensus: BTreeMap<u64, ConsensusData>,
    caller_node_id: u32,
    stake_ok: bool,
    attest_success: bool,
    propose_calls: Vec<(u32, Vec<ConsensusScore>)>,
    attest_calls: Vec<u32>,
}

/// Settable in-memory chain.
pub struct MockHypertensor {
    state: Mutex<MockState>,
}

impl Default for MockHypertensor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHypertensor {
    /// Chain at block 100, epoch length 100, slot 3, no subnet registered.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                block: 100,
                epoch_length: 100,
                block_secs: BLOCK_SECS,
                slot: Some(3),
                subnet_info: None,
                nodes: Vec::new(),
                validators: BTreeMap::new(),
                consensus: BTreeMap::new(),
                caller_node_id: 0,
                stake_ok: true,
                attest_success: true,
                propose_calls: Vec::new(),
                attest_calls: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock chain lock")
    }

    /// Set the head block.
    pub fn set_block(&self, block: u64) {
        self.lock().block = block;
    }

    /// Advance the head by `n` blocks.
    pub fn advance_blocks(&self, n: u64) {
        self.lock().block += n;
    }

    /// Override the block time (tests use small values to avoid real sleeps).
    pub fn set_block_secs(&self, secs: f64) {
        self.lock().block_secs = secs;
    }

    /// Set the subnet's slot.
    pub fn set_slot(&self, slot: Option<u32>) {
        self.lock().slot = slot;
    }

    /// Set the subnet registration record.
    pub fn set_subnet_info(&self, info: Option<SubnetInfo>) {
        self.lock().subnet_info = info;
    }

    /// Replace the node set.
    pub fn set_nodes(&self, nodes: Vec<SubnetNodeInfo>) {
        self.lock().nodes = nodes;
    }

    /// Elect `node_id` for `epoch`.
    pub fn set_validator(&self, epoch: u64, node_id: u32) {
        self.lock().validators.insert(epoch, node_id);
    }

    /// Install consensus data for `epoch` directly.
    pub fn insert_consensus_data(&self, epoch: u64, data: ConsensusData) {
        self.lock().consensus.insert(epoch, data);
    }

    /// Identify the local caller for `propose_attestation` / `attest`.
    pub fn set_caller_node_id(&self, node_id: u32) {
        self.lock().caller_node_id = node_id;
    }

    /// Control `proof_of_stake` answers.
    pub fn set_stake_ok(&self, ok: bool) {
        self.lock().stake_ok = ok;
    }

    /// Control `attest` receipts.
    pub fn set_attest_success(&self, ok: bool) {
        self.lock().attest_success = ok;
    }

    /// Position the head inside `epoch` at `percent_complete` (subnet time).
    pub fn set_epoch_progress(&self, epoch: u64, percent_complete: f64) {
        let mut st = self.lock();
        let slot = st.slot.unwrap_or(0) as u64;
        let elapsed = (percent_complete * st.epoch_length as f64).round() as u64;
        st.block = slot + epoch * st.epoch_length + elapsed.min(st.epoch_length - 1);
    }

    /// Recorded `propose_attestation` calls.
    pub fn propose_calls(&self) -> Vec<(u32, Vec<ConsensusScore>)> {
        self.lock().propose_calls.clone()
    }

    /// Recorded `attest` calls.
    pub fn attest_calls(&self) -> Vec<u32> {
        self.lock().attest_calls.clone()
    }

    /// Consensus data for `epoch`, if any.
    pub fn consensus_data(&self, epoch: u64) -> Option<ConsensusData> {
        self.lock().consensus.get(&epoch).cloned()
    }

    fn subnet_epoch(st: &MockState) -> u64 {
        let slot = st.slot.unwrap_or(0) as u64;
        st.block.saturating_sub(slot) / st.epoch_length
    }
}

#[async_trait]
impl Hypertensor for MockHypertensor {
    async fn get_block_number(&self) -> Result<u64, ChainError> {
        Ok(self.lock().block)
    }

    async fn get_epoch_length(&self) -> Result<u64, ChainError> {
        Ok(self.lock().epoch_length)
    }

    async fn get_epoch_data(&self) -> Result<EpochData, ChainError> {
        let st = self.lock();
        Ok(EpochData::derive(st.block, st.epoch_length, st.block_secs, 0))
    }

    async fn get_subnet_epoch_data(&self, slot: u32) -> Result<EpochData, ChainError> {
        let st = self.lock();
        Ok(EpochData::derive(
            st.block,
            st.epoch_length,
            st.block_secs,
            slot as u64,
        ))
    }

    async fn get_subnet_slot(&self, _subnet_id: u32) -> Result<Option<u32>, ChainError> {
        Ok(self.lock().slot)
    }

    async fn get_formatted_subnet_info(
        &self,
        _subnet_id: u32,
    ) -> Result<Option<SubnetInfo>, ChainError> {
        Ok(self.lock().subnet_info.clone())
    }

    async fn get_min_class_subnet_nodes(
        &self,
        _subnet_id: u32,
        _epoch: u64,
        min_class: SubnetNodeClass,
    ) -> Result<Vec<SubnetNodeInfo>, ChainError> {
        Ok(self
            .lock()
            .nodes
            .iter()
            .filter(|n| n.classification >= min_class)
            .cloned()
            .collect())
    }

    async fn get_rewards_validator(
        &self,
        _subnet_id: u32,
        epoch: u64,
    ) -> Result<Option<u32>, ChainError> {
        Ok(self.lock().validators.get(&epoch).copied())
    }

    async fn get_consensus_data(
        &self,
        _subnet_id: u32,
        epoch: u64,
    ) -> Result<Option<ConsensusData>, ChainError> {
        Ok(self.lock().consensus.get(&epoch).cloned())
    }

    async fn proof_of_stake(
        &self,
        _subnet_id: u32,
        _peer_id: &str,
        _min_class: SubnetNodeClass,
    ) -> Result<bool, ChainError> {
        Ok(self.lock().stake_ok)
    }

    async fn propose_attestation(
        &self,
        subnet_id: u32,
        data: Vec<ConsensusScore>,
    ) -> Result<Receipt, ChainError> {
        let mut st = self.lock();
        let epoch = Self::subnet_epoch(&st);
        st.propose_calls.push((subnet_id, data.clone()));
        let mut attests = BTreeMap::new();
        // The proposal itself counts as the validator's attestation.
        attests.insert(st.caller_node_id, AttestEntry { block: st.block });
        let entry = ConsensusData {
            validator_id: st.caller_node_id,
            attests,
            subnet_nodes: st.nodes.clone(),
            data,
            prioritize_queue_node_id: None,
            remove_queue_node_id: None,
        };
        st.consensus.insert(epoch, entry);
        Ok(Receipt::success())
    }

    async fn attest(&self, subnet_id: u32) -> Result<Receipt, ChainError> {
        let mut st = self.lock();
        let epoch = Self::subnet_epoch(&st);
        st.attest_calls.push(subnet_id);
        if !st.attest_success {
            return Ok(Receipt::failure("attest rejected"));
        }
        let block = st.block;
        let caller = st.caller_node_id;
        if let Some(entry) = st.consensus.get_mut(&epoch) {
            entry.attests.insert(caller, AttestEntry { block });
        }
        Ok(Receipt::success())
    }
}
