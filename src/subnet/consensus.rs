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

//! The consensus engine: an epoch-driven state machine that waits for the
//! subnet to activate, waits for this node's eligibility, then once per epoch
//! either proposes a score list (when elected) or attests the elected
//! validator's submission.
//!
//! Every suspension point observes the stop signal; chain faults are retried
//! with block-time backoff, and a subnet that stays unknown for several
//! epochs shuts the engine down while the rest of the node keeps running.

use crate::chain::client::{ChainError, Hypertensor};
use crate::chain::data::{ConsensusData, ConsensusScore, SubnetNodeClass, SubnetState, BLOCK_SECS};
use crate::dht::node::DhtNode;
use crate::monitoring::metrics::Metrics;
use crate::subnet::heartbeat::get_node_heartbeats;
use libp2p::PeerId;
use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Consensus-epoch fraction after which attestors give up waiting for the
/// validator's submission.
const ATTEST_DEADLINE: f64 = 0.25;

/// Consecutive not-found epochs tolerated before shutting down.
const MAX_SUBNET_INFO_ERRORS: u32 = 3;

/// Minimum attestation ratio for the previous epoch's on-chain data to be
/// admissible as a comparison fallback.
const FALLBACK_ATTESTATION_RATIO: f64 = 0.66;

/// Unordered equality over `(node_id, score)` pairs. Order and duplicates do
/// not matter.
pub fn scores_match(a: &[ConsensusScore], b: &[ConsensusScore]) -> bool {
    let a: BTreeSet<ConsensusScore> = a.iter().copied().collect();
    let b: BTreeSet<ConsensusScore> = b.iter().copied().collect();
    a == b
}

/// Deterministic, pluggable scoring of included nodes.
pub trait ScoreStrategy: Send + Sync {
    /// Score for one included node.
    fn score(&self, subnet_node_id: u32) -> u128;
}

/// Stub strategy: a constant score per included node.
pub struct ConstantScore;

impl ScoreStrategy for ConstantScore {
    fn score(&self, _subnet_node_id: u32) -> u128 {
        1_000_000_000_000_000_000
    }
}

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct ConsensusConfig {
    /// On-chain subnet id.
    pub subnet_id: u32,
    /// Our on-chain subnet node id.
    pub subnet_node_id: u32,
    /// Skip the wait-for-subnet-active phase (testing, already-active subnets).
    pub skip_activate_subnet: bool,
}

/// Where the engine currently sits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the subnet to be activated on-chain.
    WaitActive,
    /// Waiting for this node to be classed at least Idle.
    WaitEligible,
    /// Running the per-epoch propose-or-attest cycle.
    Epoch(u64),
    /// Stopped.
    Exited,
}

/// Raised at any suspension point once the stop signal is observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stopped;

/// The consensus engine.
pub struct Consensus {
    dht: Arc<DhtNode>,
    chain: Arc<dyn Hypertensor>,
    cfg: ConsensusConfig,
    scorer: Arc<dyn ScoreStrategy>,
    metrics: Arc<Metrics>,
    stop_tx: Option<watch::Sender<bool>>,
    stop: watch::Receiver<bool>,
    slot: Option<u32>,
    previous_epoch_data: Option<BTreeSet<ConsensusScore>>,
    phase: Phase,
}

/// Handle to a spawned engine.
pub struct ConsensusHandle {
    stop_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl ConsensusHandle {
    /// Signal stop, wait out the grace period, then terminate hard.
    pub async fn shutdown(mut self, grace: Duration) {
        let _ = self.stop_tx.send(true);
        if tokio::time::timeout(grace, &mut self.join).await.is_err() {
            warn!("consensus did not stop within the grace period; aborting it the hard way");
            self.join.abort();
            let _ = self.join.await;
        }
    }

    /// Whether the engine has exited on its own.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the engine to exit.
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

impl Consensus {
    /// Build an engine.
    pub fn new(
        dht: Arc<DhtNode>,
        chain: Arc<dyn Hypertensor>,
        cfg: ConsensusConfig,
        scorer: Arc<dyn ScoreStrategy>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (stop_tx, stop) = watch::channel(false);
        Self {
            dht,
            chain,
            cfg,
            scorer,
            metrics,
            stop_tx: Some(stop_tx),
            stop,
            slot: None,
            previous_epoch_data: None,
            phase: Phase::WaitActive,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The resolved subnet slot, once known.
    pub fn slot(&self) -> Option<u32> {
        self.slot
    }

    /// Run the engine on its own task.
    pub fn spawn(mut self) -> ConsensusHandle {
        let stop_tx = self.stop_tx.take().expect("spawned once");
        let join = tokio::spawn(async move {
            self.main_loop().await;
        });
        ConsensusHandle { stop_tx, join }
    }

    async fn main_loop(&mut self) {
        self.phase = Phase::WaitActive;
        if !self.run_activate_subnet().await {
            self.phase = Phase::Exited;
            info!("consensus exited before subnet activation");
            return;
        }
        self.phase = Phase::WaitEligible;
        if !self.run_is_node_validator().await {
            self.phase = Phase::Exited;
            info!("consensus exited before eligibility");
            return;
        }
        self.run_forever().await;
        self.phase = Phase::Exited;
        info!("consensus exited");
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Sleep, returning early with `Stopped` when the stop signal fires.
    async fn sleep_or_stop(&mut self, seconds: f64) -> Result<(), Stopped> {
        if self.stopped() {
            return Err(Stopped);
        }
        let sleep = tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0)));
        tokio::select! {
            _ = sleep => Ok(()),
            changed = self.stop.changed() => {
                if changed.is_err() || *self.stop.borrow() {
                    Err(Stopped)
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn resolve_slot(&mut self) -> Result<(), Stopped> {
        while self.slot.is_none() {
            if self.stopped() {
                return Err(Stopped);
            }
            match self.chain.get_subnet_slot(self.cfg.subnet_id).await {
                Ok(Some(slot)) => {
                    info!(slot, "subnet running in slot");
                    self.slot = Some(slot);
                }
                Ok(None) => self.sleep_or_stop(BLOCK_SECS).await?,
                Err(e) => {
                    warn!(err = %e, "get_subnet_slot failed");
                    self.sleep_or_stop(BLOCK_SECS).await?;
                }
            }
        }
        Ok(())
    }

    /// Phase A: wait until the subnet is Active on-chain. Returns false when
    /// the engine should exit (stop signal, or the subnet stayed unknown).
    async fn run_activate_subnet(&mut self) -> bool {
        if self.resolve_slot().await.is_err() {
            return false;
        }
        if self.cfg.skip_activate_subnet {
            info!("skipping subnet activation check");
            return true;
        }

        let mut last_epoch: Option<u64> = None;
        let mut errors_count: u32 = 0;
        while !self.stopped() {
            let epoch_data = match self.chain.get_epoch_data().await {
                Ok(d) => d,
                Err(e) => {
                    warn!(err = %e, "get_epoch_data failed");
                    if self.sleep_or_stop(BLOCK_SECS).await.is_err() {
                        return false;
                    }
                    continue;
                }
            };
            let current_epoch = epoch_data.epoch;

            if last_epoch != Some(current_epoch) {
                match self.chain.get_formatted_subnet_info(self.cfg.subnet_id).await {
                    Ok(None) => {
                        // Unknown subnet is likely deactivation; tolerate a
                        // few epochs before giving up.
                        if errors_count >= MAX_SUBNET_INFO_ERRORS {
                            warn!(
                                subnet_id = self.cfg.subnet_id,
                                "cannot find subnet; shutting consensus down"
                            );
                            return false;
                        }
                        warn!(
                            subnet_id = self.cfg.subnet_id,
                            remaining = MAX_SUBNET_INFO_ERRORS - errors_count,
                            "cannot find subnet; will retry next epoch"
                        );
                        errors_count += 1;
                    }
                    Ok(Some(subnet_info)) => {
                        errors_count = 0;
                        if subnet_info.state == SubnetState::Active {
                            info!(
                                subnet_id = self.cfg.subnet_id,
                                "subnet is active; starting consensus"
                            );
                            return true;
                        }
                        info!(
                            subnet_id = self.cfg.subnet_id,
                            state = ?subnet_info.state,
                            "subnet is not active yet"
                        );
                    }
                    Err(e) => {
                        warn!(err = %e, "get_formatted_subnet_info failed");
                        if self.sleep_or_stop(BLOCK_SECS).await.is_err() {
                            return false;
                        }
                        continue;
                    }
                }
                last_epoch = Some(current_epoch);
            }

            info!("waiting for subnet activation; sleeping until next epoch");
            if self.sleep_or_stop(epoch_data.seconds_remaining).await.is_err() {
                return false;
            }
        }
        false
    }

    /// Phase B: wait until this node is classed at least Idle.
    async fn run_is_node_validator(&mut self) -> bool {
        let slot = match self.slot {
            Some(slot) => slot,
            None => return false,
        };
        let mut last_epoch: Option<u64> = None;
        while !self.stopped() {
            let epoch_data = match self.chain.get_subnet_epoch_data(slot).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(err = %e, "get_subnet_epoch_data failed");
                    if self.sleep_or_stop(BLOCK_SECS).await.is_err() {
                        return false;
                    }
                    continue;
                }
            };
            let current_epoch = epoch_data.epoch;

            if last_epoch != Some(current_epoch) {
                match self
                    .chain
                    .get_min_class_subnet_nodes(
                        self.cfg.subnet_id,
                        current_epoch,
                        SubnetNodeClass::Idle,
                    )
                    .await
                {
                    Ok(nodes) => {
                        let found = nodes
                            .iter()
                            .any(|n| n.subnet_node_id == self.cfg.subnet_node_id);
                        if found {
                            info!(
                                subnet_node_id = self.cfg.subnet_node_id,
                                epoch = current_epoch,
                                "node is active on-chain; starting consensus"
                            );
                            return true;
                        }
                        info!(
                            subnet_node_id = self.cfg.subnet_node_id,
                            epoch = current_epoch,
                            "node not active on this epoch; trying again next epoch"
                        );
                    }
                    Err(e) => {
                        warn!(err = %e, "get_min_class_subnet_nodes failed");
                        if self.sleep_or_stop(BLOCK_SECS).await.is_err() {
                            return false;
                        }
                        continue;
                    }
                }
                last_epoch = Some(current_epoch);
            }

            if self.sleep_or_stop(epoch_data.seconds_remaining).await.is_err() {
                return false;
            }
        }
        false
    }

    /// Phase C: once per new epoch, run the propose-or-attest cycle.
    async fn run_forever(&mut self) {
        let Some(slot) = self.slot else { return };
        let mut last_epoch: Option<u64> = None;
        let mut started = false;

        info!("about to begin consensus");
        while !self.stopped() {
            let epoch_data = match self.chain.get_subnet_epoch_data(slot).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(err = %e, "get_subnet_epoch_data failed");
                    if self.sleep_or_stop(BLOCK_SECS).await.is_err() {
                        return;
                    }
                    continue;
                }
            };

            // Start on a fresh epoch boundary.
            if !started {
                started = true;
                info!(
                    seconds = epoch_data.seconds_remaining,
                    "starting consensus on the next epoch"
                );
                if self.sleep_or_stop(epoch_data.seconds_remaining).await.is_err() {
                    return;
                }
                continue;
            }

            let current_epoch = epoch_data.epoch;
            if last_epoch != Some(current_epoch) {
                info!(epoch = current_epoch, "new epoch");
                last_epoch = Some(current_epoch);
                self.phase = Phase::Epoch(current_epoch);
                if self.run_consensus(current_epoch).await.is_err() {
                    return;
                }
            }

            let seconds_remaining = match self.chain.get_subnet_epoch_data(slot).await {
                Ok(d) => d.seconds_remaining,
                Err(e) => {
                    warn!(err = %e, "get_subnet_epoch_data failed");
                    BLOCK_SECS
                }
            };
            info!(seconds = seconds_remaining, "sleeping until next epoch");
            if self.sleep_or_stop(seconds_remaining).await.is_err() {
                return;
            }
        }
    }

    /// One epoch of consensus: collect scores, resolve the elected validator,
    /// then propose (if elected) or attest (otherwise).
    pub async fn run_consensus(&mut self, current_epoch: u64) -> Result<(), Stopped> {
        info!(epoch = current_epoch, "running consensus");

        let scores = match self.get_scores(current_epoch).await {
            Ok(scores) => scores,
            Err(e) => {
                warn!(err = %e, "score collection failed; skipping epoch");
                return Ok(());
            }
        };
        debug!(count = scores.len(), "collected scores");

        let Some(validator) = self.resolve_validator(current_epoch).await? else {
            info!(
                epoch = current_epoch,
                "no validator elected before the epoch advanced; skipping"
            );
            return Ok(());
        };
        info!(epoch = current_epoch, validator, "elected validator resolved");

        if validator == self.cfg.subnet_node_id {
            self.run_as_validator(current_epoch, scores).await;
        } else {
            self.run_as_attestor(current_epoch, scores).await?;
        }
        Ok(())
    }

    /// Poll until the elected validator is known or the epoch advances.
    async fn resolve_validator(&mut self, current_epoch: u64) -> Result<Option<u32>, Stopped> {
        let slot = self.slot.unwrap_or_default();
        while !self.stopped() {
            let validator = match self
                .chain
                .get_rewards_validator(self.cfg.subnet_id, current_epoch)
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    warn!(err = %e, "get_rewards_validator failed");
                    None
                }
            };

            let epoch_data = match self.chain.get_subnet_epoch_data(slot).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(err = %e, "get_subnet_epoch_data failed");
                    self.sleep_or_stop(BLOCK_SECS).await?;
                    continue;
                }
            };
            if epoch_data.epoch != current_epoch {
                return Ok(None);
            }
            if validator.is_some() {
                return Ok(validator);
            }
            self.sleep_or_stop(BLOCK_SECS).await?;
        }
        Err(Stopped)
    }

    async fn run_as_validator(&mut self, current_epoch: u64, scores: Vec<ConsensusScore>) {
        info!(
            epoch = current_epoch,
            "acting as elected validator; attempting to propose an attestation"
        );

        match self
            .chain
            .get_consensus_data(self.cfg.subnet_id, current_epoch)
            .await
        {
            Ok(Some(_)) => {
                info!("already submitted consensus data; moving to next epoch");
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(err = %e, "get_consensus_data failed; skipping proposal this epoch");
                return;
            }
        }

        if scores.is_empty() {
            // An empty score vector is a valid proposal: if attestors also see
            // nothing to score, the subnet (not this validator) accrues the
            // penalty. The call below is identical either way.
            info!("no scores generated; proposing an empty attestation");
        } else {
            info!(count = scores.len(), "proposing attestation");
        }
        match self
            .chain
            .propose_attestation(self.cfg.subnet_id, scores)
            .await
        {
            Ok(receipt) if receipt.is_success => {
                self.metrics.consensus_proposals_total.inc();
                info!(epoch = current_epoch, "attestation proposed");
            }
            Ok(receipt) => {
                warn!(error = %receipt.error_message, "propose_attestation rejected");
            }
            Err(e) => warn!(err = %e, "propose_attestation failed"),
        }
    }

    async fn run_as_attestor(
        &mut self,
        current_epoch: u64,
        scores: Vec<ConsensusScore>,
    ) -> Result<(), Stopped> {
        info!(epoch = current_epoch, "acting as attestor");
        let slot = self.slot.unwrap_or_default();
        let mut consensus_data: Option<ConsensusData> = None;
        let mut checked_eligibility = false;

        while !self.stopped() {
            if consensus_data.is_none() {
                consensus_data = match self
                    .chain
                    .get_consensus_data(self.cfg.subnet_id, current_epoch)
                    .await
                {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(err = %e, "get_consensus_data failed");
                        None
                    }
                };
            }

            let epoch_data = match self.chain.get_subnet_epoch_data(slot).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(err = %e, "get_subnet_epoch_data failed");
                    self.sleep_or_stop(BLOCK_SECS).await?;
                    continue;
                }
            };
            if epoch_data.epoch != current_epoch || epoch_data.percent_complete > ATTEST_DEADLINE {
                info!("skipping attestation: validator took too long or the epoch advanced");
                return Ok(());
            }

            let Some(data) = consensus_data.as_ref() else {
                info!("waiting for consensus data; checking again next block");
                self.sleep_or_stop(BLOCK_SECS).await?;
                continue;
            };

            // This subnet does not use the queue side channels; a submission
            // carrying them is never attested.
            if data.prioritize_queue_node_id.is_some() || data.remove_queue_node_id.is_some() {
                info!("skipping attestation: validator used a queue side effect");
                return Ok(());
            }

            let matches = self
                .compare_consensus_data(&scores, &data.data, current_epoch)
                .await;
            if !matches {
                info!(
                    epoch = current_epoch,
                    "scores do not match the validator's; no attestation"
                );
                return Ok(());
            }

            if !checked_eligibility {
                checked_eligibility = true;
                if !self.is_validator_or_attestor(current_epoch).await {
                    info!("not an attestor or validator; moving to next epoch");
                    return Ok(());
                }
            }

            if data.attests.contains_key(&self.cfg.subnet_node_id) {
                debug!("already attested; moving to next epoch");
                return Ok(());
            }

            info!(
                epoch = current_epoch,
                "validator's data matches; attesting"
            );
            match self.chain.attest(self.cfg.subnet_id).await {
                Ok(receipt) if receipt.is_success => {
                    self.metrics.consensus_attestations_total.inc();
                    info!(epoch = current_epoch, "attested");
                    return Ok(());
                }
                Ok(receipt) => {
                    warn!(error = %receipt.error_message, "attest rejected; retrying next block");
                    consensus_data = None;
                    self.sleep_or_stop(BLOCK_SECS).await?;
                }
                Err(e) => {
                    warn!(err = %e, "attest failed; retrying next block");
                    consensus_data = None;
                    self.sleep_or_stop(BLOCK_SECS).await?;
                }
            }
        }
        Err(Stopped)
    }

    /// Enumerate heartbeats, intersect with on-chain Included nodes, and emit
    /// a canonically ordered score list.
    pub async fn get_scores(&self, target_epoch: u64) -> Result<Vec<ConsensusScore>, ChainError> {
        let heartbeats = get_node_heartbeats(&self.dht, true).await;
        let live_peers: HashSet<PeerId> = heartbeats.iter().map(|h| h.peer_id).collect();
        debug!(count = live_peers.len(), "live heartbeat peers");

        let included = self
            .chain
            .get_min_class_subnet_nodes(self.cfg.subnet_id, target_epoch, SubnetNodeClass::Included)
            .await?;

        let mut node_ids: Vec<u32> = included
            .iter()
            .filter(|n| {
                PeerId::from_str(&n.peer_id)
                    .map(|p| live_peers.contains(&p))
                    .unwrap_or(false)
            })
            .map(|n| n.subnet_node_id)
            .collect();
        node_ids.sort_unstable();
        node_ids.dedup();

        Ok(node_ids
            .into_iter()
            .map(|subnet_node_id| ConsensusScore {
                subnet_node_id,
                score: self.scorer.score(subnet_node_id),
            })
            .collect())
    }

    /// Set equality over `(node_id, score)` pairs, with a fallback against
    /// the previous epoch's data for peers that flapped around the
    /// validator's snapshot.
    pub async fn compare_consensus_data(
        &mut self,
        my_data: &[ConsensusScore],
        validator_data: &[ConsensusScore],
        epoch: u64,
    ) -> bool {
        let my_set: BTreeSet<ConsensusScore> = my_data.iter().copied().collect();
        let validator_set: BTreeSet<ConsensusScore> = validator_data.iter().copied().collect();

        // Both sides found nothing to score: agreement.
        if my_set.is_empty() && validator_set.is_empty() {
            self.previous_epoch_data = Some(BTreeSet::new());
            return true;
        }

        let mut success = scores_match(my_data, validator_data);
        if !success {
            let dif: BTreeSet<ConsensusScore> = my_set
                .symmetric_difference(&validator_set)
                .copied()
                .collect();
            match &self.previous_epoch_data {
                Some(previous) => {
                    // A node that left or joined around the validator's
                    // snapshot shows up as a symmetric difference covered by
                    // what we compared last epoch.
                    success = dif.is_subset(previous);
                }
                None => {
                    // First epoch after a restart: fall back to the chain's
                    // previous-epoch data, but only if it was supermajority
                    // attested.
                    success = match self
                        .chain
                        .get_consensus_data(self.cfg.subnet_id, epoch.wrapping_sub(1))
                        .await
                    {
                        Ok(Some(prev)) => {
                            if prev.attestation_ratio() < FALLBACK_ATTESTATION_RATIO {
                                false
                            } else {
                                let prev_set: BTreeSet<ConsensusScore> =
                                    prev.data.iter().copied().collect();
                                dif.is_subset(&prev_set)
                            }
                        }
                        Ok(None) => false,
                        Err(e) => {
                            warn!(err = %e, "previous-epoch consensus data unavailable");
                            false
                        }
                    };
                }
            }
        }

        self.previous_epoch_data = Some(my_set);
        success
    }

    /// Whether we hold Validator class this epoch (emergency validator sets
    /// can change this mid-stream, so it is re-checked before attesting).
    async fn is_validator_or_attestor(&self, epoch: u64) -> bool {
        match self
            .chain
            .get_min_class_subnet_nodes(self.cfg.subnet_id, epoch, SubnetNodeClass::Validator)
            .await
        {
            Ok(nodes) => nodes
                .iter()
                .any(|n| n.subnet_node_id == self.cfg.subnet_node_id),
            Err(e) => {
                warn!(err = %e, "eligibility check failed");
                false
            }
        }
    }
}
