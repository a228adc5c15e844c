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

//! Epoch-phase admission predicate for DHT writes.
//!
//! Keys are tied to the subnet's epoch clock:
//!
//! - `"node"` heartbeats store at any time, expiration capped at 1.1 epochs
//! - `consensus_epoch_{E}` stores in the first 15% of epoch E
//! - `commit_epoch_{E}` stores in the (15%, 50%] window
//! - `reveal_epoch_{E}` stores in the (50%, 60%] window
//!
//! Reads always pass. Writes outside the window, over the per-peer per-epoch
//! quota, or with excessive expirations are rejected.

use crate::chain::client::EpochClock;
use crate::core::types::{commit_key, consensus_key, dht_time, heartbeat_key, reveal_key, DhtRecord};
use crate::dht::validation::{parse_owner_subkey, RecordRequestType, RecordValidator};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::debug;

/// Last epoch fraction at which consensus records may be stored.
pub const CONSENSUS_STORE_DEADLINE: f64 = 0.15;
/// Last epoch fraction at which commits may be stored.
pub const COMMIT_DEADLINE: f64 = 0.50;
/// Last epoch fraction at which reveals may be stored.
pub const REVEAL_DEADLINE: f64 = 0.60;

/// Epochs of quota accounting kept behind the current one.
pub const MAX_EPOCH_HISTORY: u64 = 5;

/// Heartbeat writes allowed per peer per epoch.
const HEARTBEAT_QUOTA: u32 = 100;
/// Consensus/commit/reveal writes allowed per peer per epoch.
const PHASE_QUOTA: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum KeyKind {
    Heartbeat,
    Consensus,
    Commit,
    Reveal,
}

type QuotaLedger = BTreeMap<u64, BTreeMap<(Vec<u8>, KeyKind), u32>>;

/// The admission predicate. Evaluated for both reads and writes; only writes
/// are ever rejected.
pub struct PredicateValidator {
    clock: EpochClock,
    quotas: Mutex<QuotaLedger>,
}

impl PredicateValidator {
    /// Predicate reading epoch position from `clock`.
    pub fn new(clock: EpochClock) -> Self {
        Self {
            clock,
            quotas: Mutex::new(BTreeMap::new()),
        }
    }

    fn classify(&self, key: &[u8], epoch: u64) -> Option<KeyKind> {
        if key == heartbeat_key().as_slice() {
            Some(KeyKind::Heartbeat)
        } else if key == consensus_key(epoch).as_slice() {
            Some(KeyKind::Consensus)
        } else if key == commit_key(epoch).as_slice() {
            Some(KeyKind::Commit)
        } else if key == reveal_key(epoch).as_slice() {
            Some(KeyKind::Reveal)
        } else {
            None
        }
    }

    /// Count one accepted write; false once the quota is exhausted.
    fn charge_quota(&self, epoch: u64, peer: Vec<u8>, kind: KeyKind) -> bool {
        let cap = match kind {
            KeyKind::Heartbeat => HEARTBEAT_QUOTA,
            _ => PHASE_QUOTA,
        };
        let mut ledger = self.quotas.lock().expect("quota ledger lock");
        let floor = epoch.saturating_sub(MAX_EPOCH_HISTORY);
        ledger.retain(|e, _| *e >= floor);
        let count = ledger
            .entry(epoch)
            .or_default()
            .entry((peer, kind))
            .or_insert(0);
        if *count >= cap {
            return false;
        }
        *count += 1;
        true
    }
}

impl RecordValidator for PredicateValidator {
    fn validate(&self, record: &DhtRecord, kind: RecordRequestType) -> bool {
        let Some(subkey) = record.subkey.as_deref() else {
            return false;
        };
        let Some((peer_id, _)) = parse_owner_subkey(subkey) else {
            return false;
        };

        if kind == RecordRequestType::Get {
            return true;
        }

        let epoch_data = self.clock.snapshot();
        let epoch = epoch_data.epoch;
        let percent = epoch_data.percent_complete;
        let epoch_secs = epoch_data.seconds_per_epoch;
        let now = dht_time();

        let Some(key_kind) = self.classify(&record.key, epoch) else {
            debug!(peer = %peer_id, "store rejected: unknown key");
            return false;
        };

        let (window_ok, max_expiration) = match key_kind {
            KeyKind::Heartbeat => (true, now + 1.1 * epoch_secs),
            KeyKind::Consensus => (percent <= CONSENSUS_STORE_DEADLINE, now + 2.0 * epoch_secs),
            KeyKind::Commit => (
                percent > CONSENSUS_STORE_DEADLINE && percent <= COMMIT_DEADLINE,
                now + 2.0 * epoch_secs,
            ),
            KeyKind::Reveal => (
                percent > COMMIT_DEADLINE && percent <= REVEAL_DEADLINE,
                now + 2.0 * epoch_secs,
            ),
        };

        if !window_ok {
            debug!(peer = %peer_id, ?key_kind, percent, "store rejected: outside phase window");
            return false;
        }
        if record.expiration_time > max_expiration {
            debug!(peer = %peer_id, ?key_kind, "store rejected: expiration too far out");
            return false;
        }
        if !self.charge_quota(epoch, peer_id.to_base58().into_bytes(), key_kind) {
            debug!(peer = %peer_id, ?key_kind, epoch, "store rejected: epoch quota exhausted");
            return false;
        }
        true
    }
}
