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

//! Deterministic core types and canonical encoding helpers.
//!
//! - Canonical bincode options (fixint, size-capped decode)
//! - `NodeId`: 160-bit routing identifier with XOR metric
//! - DHT record envelope and wall-clock expirations
//! - Well-known DHT keys shared by the heartbeat and consensus layers

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Canonical serialization error.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Value could not be serialized.
    #[error("serialization")]
    Serialize,
    /// Bytes could not be deserialized.
    #[error("deserialization")]
    Deserialize,
    /// Payload exceeds the size cap.
    #[error("size limit exceeded")]
    TooLarge,
}

/// Canonical bincode options (deterministic).
fn bincode_opts() -> impl Options {
    // Fixint encoding provides a stable integer representation.
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Encode with deterministic rules. Requires deterministic container ordering (use BTreeMap/BTreeSet).
pub fn encode_canonical<T: Serialize>(v: &T) -> Result<Vec<u8>, CodecError> {
    bincode_opts()
        .serialize(v)
        .map_err(|_| CodecError::Serialize)
}

/// Decode with a hard size cap.
pub fn decode_canonical_limited<T: DeserializeOwned>(
    bytes: &[u8],
    max: usize,
) -> Result<T, CodecError> {
    if bytes.len() > max {
        return Err(CodecError::TooLarge);
    }
    // Cap inside the deserializer as well to prevent memory bombs via container lengths.
    bincode_opts()
        .with_limit(max as u64)
        .deserialize(bytes)
        .map_err(|_| CodecError::Deserialize)
}

/// DHT wall-clock time in seconds since the UNIX epoch.
///
/// Honest peers are assumed to be synchronized within
/// [`MAX_DHT_TIME_DISCREPANCY`] of each other.
pub type DhtExpiration = f64;

/// Maximum tolerated wall-clock discrepancy between honest peers, seconds.
pub const MAX_DHT_TIME_DISCREPANCY: f64 = 60.0;

/// Current DHT wall-clock time.
pub fn dht_time() -> DhtExpiration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Number of bytes in a [`NodeId`].
pub const NODE_ID_BYTES: usize = 20;

/// 160-bit routing identifier derived by hashing a source byte string.
///
/// Generated from a source (typically a peer's serialized public key or an
/// application key); never mutated afterwards.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_BYTES]);

impl NodeId {
    /// Derive an identifier from a source byte string (SHA-256, truncated to 160 bits).
    pub fn generate(source: &[u8]) -> Self {
        let digest = ring::digest::digest(&ring::digest::SHA256, source);
        let mut out = [0u8; NODE_ID_BYTES];
        out.copy_from_slice(&digest.as_ref()[..NODE_ID_BYTES]);
        Self(out)
    }

    /// Construct from raw bytes.
    pub fn from_bytes(b: [u8; NODE_ID_BYTES]) -> Self {
        Self(b)
    }

    /// Parse from a byte slice of exactly [`NODE_ID_BYTES`].
    pub fn try_from_slice(b: &[u8]) -> Option<Self> {
        if b.len() != NODE_ID_BYTES {
            return None;
        }
        let mut out = [0u8; NODE_ID_BYTES];
        out.copy_from_slice(b);
        Some(Self(out))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_BYTES] {
        &self.0
    }

    /// XOR distance to another identifier.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; NODE_ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Bit `i` (0 = most significant).
    pub fn bit(&self, i: usize) -> bool {
        let byte = self.0[i / 8];
        (byte >> (7 - (i % 8))) & 1 == 1
    }

    /// Flip bit `i` (0 = most significant), returning a new id.
    pub fn with_flipped_bit(&self, i: usize) -> Self {
        let mut out = self.0;
        out[i / 8] ^= 1 << (7 - (i % 8));
        Self(out)
    }

    /// Random identifier sharing the first `prefix_len` bits with `prefix`.
    pub fn random_in_prefix(prefix: &NodeId, prefix_len: usize) -> Self {
        use rand::RngCore;
        let mut out = [0u8; NODE_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut out);
        let mut id = Self(out);
        for i in 0..prefix_len.min(NODE_ID_BYTES * 8) {
            if id.bit(i) != prefix.bit(i) {
                id = id.with_flipped_bit(i);
            }
        }
        id
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..6]))
    }
}

/// XOR distance between two [`NodeId`]s. Orders lexicographically,
/// which is the numeric order of the 160-bit value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance(pub [u8; NODE_ID_BYTES]);

impl Distance {
    /// Whether the distance is zero (identical ids).
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(&self.0[..6]))
    }
}

/// Application-level DHT key bytes (hashed to a [`NodeId`] for routing).
pub type DhtKey = Vec<u8>;

/// Optional secondary discriminator within a dictionary value.
pub type Subkey = Vec<u8>;

/// One record as handled by storage and the validator pipeline.
///
/// `value` carries the raw stored bytes including, for signed records, the
/// detached signature trailer (see `dht::validation`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DhtRecord {
    /// Application key bytes.
    pub key: DhtKey,
    /// Optional subkey; present iff the value at `key` is a dictionary.
    pub subkey: Option<Subkey>,
    /// Stored bytes.
    pub value: Vec<u8>,
    /// Absolute expiration, DHT wall-clock seconds.
    pub expiration_time: DhtExpiration,
}

/// Well-known key under which heartbeats are published.
pub fn heartbeat_key() -> DhtKey {
    b"node".to_vec()
}

/// Well-known per-epoch consensus key (writable in the first 15% of the epoch).
pub fn consensus_key(epoch: u64) -> DhtKey {
    format!("consensus_epoch_{epoch}").into_bytes()
}

/// Well-known per-epoch commit key (writable in the 15-50% window).
pub fn commit_key(epoch: u64) -> DhtKey {
    format!("commit_epoch_{epoch}").into_bytes()
}

/// Well-known per-epoch reveal key (writable in the 50-60% window).
pub fn reveal_key(epoch: u64) -> DhtKey {
    format!("reveal_epoch_{epoch}").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_codec_round_trip() {
        let record = DhtRecord {
            key: b"node".to_vec(),
            subkey: Some(b"abc".to_vec()),
            value: vec![1, 2, 3],
            expiration_time: 123.5,
        };
        let bytes = encode_canonical(&record).unwrap();
        let back: DhtRecord = decode_canonical_limited(&bytes, 1024).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn decode_respects_size_cap() {
        let blob = vec![0u8; 64];
        let bytes = encode_canonical(&blob).unwrap();
        assert!(matches!(
            decode_canonical_limited::<Vec<u8>>(&bytes, 8),
            Err(CodecError::TooLarge)
        ));
    }

    #[test]
    fn node_id_is_deterministic_and_collision_resistant() {
        assert_eq!(NodeId::generate(b"x"), NodeId::generate(b"x"));
        assert_ne!(NodeId::generate(b"x"), NodeId::generate(b"y"));
    }

    #[test]
    fn xor_distance_laws() {
        let a = NodeId::generate(b"a");
        let b = NodeId::generate(b"b");
        assert!(a.distance(&a).is_zero());
        assert_eq!(a.distance(&b), b.distance(&a));
        assert!(!a.distance(&b).is_zero());
    }

    #[test]
    fn bit_addressing_is_msb_first() {
        let mut raw = [0u8; NODE_ID_BYTES];
        raw[0] = 0b1000_0000;
        let id = NodeId::from_bytes(raw);
        assert!(id.bit(0));
        assert!(!id.bit(1));
        assert!(!id.with_flipped_bit(0).bit(0));
    }

    #[test]
    fn random_in_prefix_keeps_prefix() {
        let prefix = NodeId::generate(b"prefix");
        for len in [0usize, 1, 7, 13, 160] {
            let id = NodeId::random_in_prefix(&prefix, len);
            for i in 0..len {
                assert_eq!(id.bit(i), prefix.bit(i));
            }
        }
    }
}
