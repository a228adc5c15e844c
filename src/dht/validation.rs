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

//! Record validators: a staged accept/reject pipeline over stored records.
//!
//! The [`SignatureValidator`] enforces record ownership: protected records use
//! `subkey = peer_b58 || serialized_public_key` and carry a detached signature
//! trailer over the canonical record bytes. Verification accepts Ed25519 and
//! RSA-SHA256 keys. Records whose subkey is not owner-formatted pass through
//! untouched (other stages decide their fate).

use crate::core::identity::{verify_signature, NodeIdentity};
use crate::core::types::{encode_canonical, DhtRecord};
use libp2p::identity::PublicKey;
use libp2p::PeerId;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Whether a record is being read or written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordRequestType {
    /// FIND_VALUE path.
    Get,
    /// STORE path.
    Post,
}

/// One stage of the record admission pipeline.
pub trait RecordValidator: Send + Sync {
    /// Accept or reject a record.
    fn validate(&self, record: &DhtRecord, kind: RecordRequestType) -> bool;

    /// Transform an outgoing value before it is stored (e.g. append a
    /// signature trailer). Default: identity.
    fn sign_value(&self, record: &DhtRecord) -> Vec<u8> {
        record.value.clone()
    }

    /// Inverse of [`sign_value`] for values returned to the application.
    ///
    /// [`sign_value`]: RecordValidator::sign_value
    fn strip_value(&self, record: &DhtRecord) -> Vec<u8> {
        record.value.clone()
    }
}

/// Runs every stage; a record is admitted only if all stages accept.
pub struct CompositeValidator {
    validators: Vec<Arc<dyn RecordValidator>>,
}

impl CompositeValidator {
    /// Compose stages in evaluation order.
    pub fn new(validators: Vec<Arc<dyn RecordValidator>>) -> Self {
        Self { validators }
    }

    /// All stages must accept.
    pub fn validate(&self, record: &DhtRecord, kind: RecordRequestType) -> bool {
        self.validators.iter().all(|v| v.validate(record, kind))
    }

    /// Fold the value through every stage's `sign_value`.
    pub fn sign_value(&self, record: &DhtRecord) -> Vec<u8> {
        let mut current = record.clone();
        for v in &self.validators {
            current.value = v.sign_value(&current);
        }
        current.value
    }

    /// Fold the value through every stage's `strip_value` (reverse order).
    pub fn strip_value(&self, record: &DhtRecord) -> Vec<u8> {
        let mut current = record.clone();
        for v in self.validators.iter().rev() {
            current.value = v.strip_value(&current);
        }
        current.value
    }
}

const SIGNATURE_MARKER: &[u8] = b"[signature:";
const RECORD_DOMAIN: &[u8] = b"Meshnet-Record-v1";

/// Parse an owner-formatted subkey: `peer_b58 || serialized_public_key`,
/// where the peer id must commit to the embedded key.
pub fn parse_owner_subkey(subkey: &[u8]) -> Option<(PeerId, Vec<u8>)> {
    // Peer ids are base58 text; scan for the split point where the prefix is
    // a valid id and the remainder a public key the id commits to.
    for split in (1..subkey.len()).rev() {
        let Ok(prefix) = std::str::from_utf8(&subkey[..split]) else {
            continue;
        };
        let Ok(peer_id) = PeerId::from_str(prefix) else {
            continue;
        };
        let key_bytes = &subkey[split..];
        let Ok(public_key) = PublicKey::try_decode_protobuf(key_bytes) else {
            continue;
        };
        if public_key.to_peer_id() == peer_id {
            return Some((peer_id, key_bytes.to_vec()));
        }
    }
    None
}

/// Canonical bytes a record signature commits to (payload excludes the trailer).
fn record_signing_bytes(record: &DhtRecord, payload: &[u8]) -> Option<Vec<u8>> {
    let body = encode_canonical(&(
        &record.key,
        record.subkey.as_deref().unwrap_or(&[]),
        payload,
        record.expiration_time,
    ))
    .ok()?;
    let mut out = Vec::with_capacity(RECORD_DOMAIN.len() + body.len());
    out.extend_from_slice(RECORD_DOMAIN);
    out.extend_from_slice(&body);
    Some(out)
}

fn split_trailer(value: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = value
        .windows(SIGNATURE_MARKER.len())
        .rposition(|w| w == SIGNATURE_MARKER)?;
    Some((&value[..pos], &value[pos + SIGNATURE_MARKER.len()..]))
}

/// Enforces ownership of protected records (invariant: a signed record's
/// signature verifies under the public key embedded in its subkey).
pub struct SignatureValidator {
    identity: Arc<NodeIdentity>,
    local_subkey: Vec<u8>,
}

impl SignatureValidator {
    /// Validator bound to this node's identity.
    pub fn new(identity: Arc<NodeIdentity>) -> Self {
        let mut local_subkey = identity.peer_id().to_base58().into_bytes();
        local_subkey.extend_from_slice(identity.public_key_bytes());
        Self {
            identity,
            local_subkey,
        }
    }

    /// The subkey under which this node publishes protected records.
    pub fn local_subkey(&self) -> Vec<u8> {
        self.local_subkey.clone()
    }
}

impl RecordValidator for SignatureValidator {
    fn validate(&self, record: &DhtRecord, _kind: RecordRequestType) -> bool {
        let Some(subkey) = record.subkey.as_deref() else {
            return true; // unprotected record; not this stage's concern
        };
        let Some((peer_id, public_key)) = parse_owner_subkey(subkey) else {
            return true;
        };
        let Some((payload, sig)) = split_trailer(&record.value) else {
            debug!(peer = %peer_id, "owner-formatted record without signature trailer");
            return false;
        };
        let Some(msg) = record_signing_bytes(record, payload) else {
            return false;
        };
        if !verify_signature(&public_key, &msg, sig) {
            debug!(peer = %peer_id, "record signature verification failed");
            return false;
        }
        true
    }

    fn sign_value(&self, record: &DhtRecord) -> Vec<u8> {
        if record.subkey.as_deref() != Some(self.local_subkey.as_slice()) {
            return record.value.clone();
        }
        let Some(msg) = record_signing_bytes(record, &record.value) else {
            return record.value.clone();
        };
        let Ok(sig) = self.identity.sign(&msg) else {
            return record.value.clone();
        };
        let mut out = record.value.clone();
        out.extend_from_slice(SIGNATURE_MARKER);
        out.extend_from_slice(&sig);
        out
    }

    fn strip_value(&self, record: &DhtRecord) -> Vec<u8> {
        let Some(subkey) = record.subkey.as_deref() else {
            return record.value.clone();
        };
        if parse_owner_subkey(subkey).is_none() {
            return record.value.clone();
        }
        match split_trailer(&record.value) {
            Some((payload, _)) => payload.to_vec(),
            None => record.value.clone(),
        }
    }
}
