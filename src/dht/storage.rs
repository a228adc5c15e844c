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

//! In-memory storage with per-entry expiration.
//!
//! [`TimedStorage`] is the generic TTL map (also used for the nonce cache and
//! the lookup cache). [`LocalStorage`] layers the DHT's regular-vs-dictionary
//! value semantics on top of it: under a given key, values are either a single
//! regular entry or a `subkey -> (value, expiration)` dictionary, never mixed.

use crate::core::types::{dht_time, DhtExpiration, NodeId, Subkey};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

/// A value plus its absolute expiration.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueWithExpiration<V> {
    /// Stored value.
    pub value: V,
    /// Absolute expiration, DHT wall-clock seconds.
    pub expiration_time: DhtExpiration,
}

/// TTL map. Replacement policy: a store wins iff its expiration is greater
/// than or equal to the current entry's. Expired entries never surface from
/// `get`; physical removal is amortized and can be paused with [`freeze`].
///
/// [`freeze`]: TimedStorage::freeze
#[derive(Debug)]
pub struct TimedStorage<K: Ord + Clone, V> {
    data: BTreeMap<K, ValueWithExpiration<V>>,
    frozen: u32,
    ops_since_sweep: u32,
}

/// Sweep cadence for amortized eviction.
const SWEEP_EVERY_OPS: u32 = 128;

impl<K: Ord + Clone, V> TimedStorage<K, V> {
    /// Empty storage.
    pub fn new() -> Self {
        Self {
            data: BTreeMap::new(),
            frozen: 0,
            ops_since_sweep: 0,
        }
    }

    /// Store `value` under `key` until `expiration_time`. Returns whether the
    /// entry was accepted (rejected when already expired, or when an entry
    /// with a strictly greater expiration is present).
    pub fn store(&mut self, key: K, value: V, expiration_time: DhtExpiration) -> bool {
        if expiration_time < dht_time() {
            return false;
        }
        if let Some(cur) = self.data.get(&key) {
            if cur.expiration_time > expiration_time {
                return false;
            }
        }
        self.data.insert(
            key,
            ValueWithExpiration {
                value,
                expiration_time,
            },
        );
        self.maybe_sweep();
        true
    }

    /// Unexpired entry for `key`, if any.
    pub fn get(&self, key: &K) -> Option<&ValueWithExpiration<V>> {
        self.get_min(key, dht_time())
    }

    /// Entry for `key` whose expiration is at least `min_expiration`.
    pub fn get_min(&self, key: &K, min_expiration: DhtExpiration) -> Option<&ValueWithExpiration<V>> {
        self.data
            .get(key)
            .filter(|v| v.expiration_time >= min_expiration)
    }

    /// Mutable access to an unexpired entry.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut ValueWithExpiration<V>> {
        let now = dht_time();
        self.data
            .get_mut(key)
            .filter(|v| v.expiration_time >= now)
    }

    /// Whether an unexpired entry exists for `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Remove an entry outright.
    pub fn remove(&mut self, key: &K) -> Option<ValueWithExpiration<V>> {
        self.data.remove(key)
    }

    /// Iterate unexpired entries as of `now`.
    pub fn iter_unexpired(
        &self,
        now: DhtExpiration,
    ) -> impl Iterator<Item = (&K, &ValueWithExpiration<V>)> {
        self.data
            .iter()
            .filter(move |(_, v)| v.expiration_time >= now)
    }

    /// Physically remove entries expired as of `now`. No-op while frozen.
    pub fn evict_expired(&mut self, now: DhtExpiration) {
        if self.frozen > 0 {
            return;
        }
        self.data.retain(|_, v| v.expiration_time >= now);
        self.ops_since_sweep = 0;
    }

    /// Number of physically present entries (may include expired ones awaiting
    /// a sweep; those never surface from `get`).
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether no entries are physically present.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Scoped view that halts expiry-driven eviction for its duration.
    /// Reads still respect expiration times; only physical removal pauses,
    /// so check-then-store sequences observe a stable map.
    pub fn freeze(&mut self) -> Frozen<'_, K, V> {
        self.frozen += 1;
        Frozen { storage: self }
    }

    fn maybe_sweep(&mut self) {
        self.ops_since_sweep += 1;
        if self.ops_since_sweep >= SWEEP_EVERY_OPS {
            self.evict_expired(dht_time());
        }
    }
}

/// Guard returned by [`TimedStorage::freeze`].
pub struct Frozen<'a, K: Ord + Clone, V> {
    storage: &'a mut TimedStorage<K, V>,
}

impl<K: Ord + Clone, V> Deref for Frozen<'_, K, V> {
    type Target = TimedStorage<K, V>;
    fn deref(&self) -> &Self::Target {
        self.storage
    }
}

impl<K: Ord + Clone, V> DerefMut for Frozen<'_, K, V> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.storage
    }
}

impl<K: Ord + Clone, V> Drop for Frozen<'_, K, V> {
    fn drop(&mut self) {
        self.storage.frozen -= 1;
    }
}

/// A DHT value as read back from storage or a lookup.
#[derive(Clone, Debug, PartialEq)]
pub enum DhtValueView {
    /// Single-valued entry.
    Regular(Vec<u8>),
    /// Dictionary entry: `subkey -> (value, expiration)`.
    Dictionary(BTreeMap<Subkey, (Vec<u8>, DhtExpiration)>),
}

/// Entry kinds held by [`LocalStorage`].
#[derive(Debug)]
enum DhtEntry {
    Regular(Vec<u8>),
    Dictionary(TimedStorage<Subkey, Vec<u8>>),
}

/// The per-node DHT record store. Keys are routing ids (`hash(key_bytes)`).
#[derive(Debug)]
pub struct LocalStorage {
    inner: TimedStorage<NodeId, DhtEntry>,
}

impl LocalStorage {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            inner: TimedStorage::new(),
        }
    }

    /// Store a regular value. Rejected if the key currently holds a
    /// dictionary, or if a fresher regular value is present.
    pub fn store(&mut self, key_id: NodeId, value: Vec<u8>, expiration_time: DhtExpiration) -> bool {
        if let Some(cur) = self.inner.get(&key_id) {
            if matches!(cur.value, DhtEntry::Dictionary(_)) {
                return false;
            }
        }
        self.inner
            .store(key_id, DhtEntry::Regular(value), expiration_time)
    }

    /// Upsert one subkey of a dictionary value. Rejected if the key currently
    /// holds a regular value, or if a fresher entry exists under the subkey.
    pub fn store_subkey(
        &mut self,
        key_id: NodeId,
        subkey: Subkey,
        value: Vec<u8>,
        expiration_time: DhtExpiration,
    ) -> bool {
        if expiration_time < dht_time() {
            return false;
        }
        match self.inner.get_mut(&key_id) {
            Some(entry) => match &mut entry.value {
                DhtEntry::Regular(_) => false,
                DhtEntry::Dictionary(dict) => {
                    let stored = dict.store(subkey, value, expiration_time);
                    if stored && expiration_time > entry.expiration_time {
                        // Dictionary lifetime covers its freshest subkey.
                        entry.expiration_time = expiration_time;
                    }
                    stored
                }
            },
            None => {
                let mut dict = TimedStorage::new();
                dict.store(subkey, value, expiration_time);
                self.inner
                    .store(key_id, DhtEntry::Dictionary(dict), expiration_time)
            }
        }
    }

    /// Unexpired value under `key_id`, with the entry's overall expiration.
    /// Dictionary reads filter expired subkeys.
    pub fn get(&self, key_id: &NodeId) -> Option<(DhtValueView, DhtExpiration)> {
        let now = dht_time();
        let entry = self.inner.get(key_id)?;
        match &entry.value {
            DhtEntry::Regular(bytes) => Some((
                DhtValueView::Regular(bytes.clone()),
                entry.expiration_time,
            )),
            DhtEntry::Dictionary(dict) => {
                let live: BTreeMap<Subkey, (Vec<u8>, DhtExpiration)> = dict
                    .iter_unexpired(now)
                    .map(|(k, v)| (k.clone(), (v.value.clone(), v.expiration_time)))
                    .collect();
                if live.is_empty() {
                    return None;
                }
                Some((DhtValueView::Dictionary(live), entry.expiration_time))
            }
        }
    }

    /// Unexpired value under `(key_id, subkey)`.
    pub fn get_subkey(&self, key_id: &NodeId, subkey: &Subkey) -> Option<(Vec<u8>, DhtExpiration)> {
        let entry = self.inner.get(key_id)?;
        match &entry.value {
            DhtEntry::Regular(_) => None,
            DhtEntry::Dictionary(dict) => dict
                .get(subkey)
                .map(|v| (v.value.clone(), v.expiration_time)),
        }
    }

    /// Physically drop expired entries and subkeys.
    pub fn sweep(&mut self, now: DhtExpiration) {
        self.inner.evict_expired(now);
        let mut emptied: Vec<NodeId> = Vec::new();
        for (key, entry) in self.inner.data.iter_mut() {
            if let DhtEntry::Dictionary(dict) = &mut entry.value {
                dict.evict_expired(now);
                if dict.is_empty() {
                    emptied.push(*key);
                }
            }
        }
        for key in emptied {
            self.inner.remove(&key);
        }
    }

    /// Number of keys physically present.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
