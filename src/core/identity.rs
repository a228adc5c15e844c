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

//! Node identity: persisted Ed25519 keypair, libp2p-style `PeerId`, and
//! signature verification for both Ed25519 and RSA-SHA256 public keys.

use crate::core::types::NodeId;
use libp2p::identity::{Keypair, PublicKey};
use libp2p::PeerId;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use thiserror::Error;
use zeroize::Zeroize;

/// Identity errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Filesystem failure.
    #[error("io")]
    Io,
    /// Key material could not be decoded.
    #[error("invalid key encoding")]
    Decode,
    /// Signing failed.
    #[error("signing")]
    Signing,
}

impl From<std::io::Error> for IdentityError {
    fn from(_: std::io::Error) -> Self {
        IdentityError::Io
    }
}

/// A node's long-lived keypair plus derived identifiers.
///
/// The public key travels on the wire in its protobuf encoding, which is the
/// same byte string the `PeerId` multihash commits to.
pub struct NodeIdentity {
    keypair: Keypair,
    peer_id: PeerId,
    public_key_bytes: Vec<u8>,
    node_id: NodeId,
}

impl NodeIdentity {
    /// Wrap an existing keypair.
    pub fn from_keypair(keypair: Keypair) -> Self {
        let public = keypair.public();
        let peer_id = public.to_peer_id();
        let public_key_bytes = public.encode_protobuf();
        let node_id = NodeId::generate(&public_key_bytes);
        Self {
            keypair,
            peer_id,
            public_key_bytes,
            node_id,
        }
    }

    /// Generate a fresh in-memory Ed25519 identity (tests, ephemeral nodes).
    pub fn generate() -> Self {
        Self::from_keypair(Keypair::generate_ed25519())
    }

    /// Load an existing keypair from `data_dir/identity.key`, or create a new
    /// one and persist it (write to tmp, then rename).
    pub fn load_or_create(data_dir: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir)?;

        let path: PathBuf = dir.join("identity.key");
        if path.exists() {
            let bytes = fs::read(&path)?;
            let kp = Keypair::from_protobuf_encoding(&bytes).map_err(|_| IdentityError::Decode)?;
            return Ok(Self::from_keypair(kp));
        }

        let kp = Keypair::generate_ed25519();
        let mut bytes = kp
            .to_protobuf_encoding()
            .map_err(|_| IdentityError::Decode)?;

        let tmp = dir.join("identity.key.tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        set_private_perms_best_effort(&tmp);
        fs::rename(&tmp, &path)?;
        set_private_perms_best_effort(&path);
        bytes.zeroize();

        Ok(Self::from_keypair(kp))
    }

    /// Our peer id.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Our routing identifier (hash of the serialized public key).
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Serialized (protobuf) public key bytes.
    pub fn public_key_bytes(&self) -> &[u8] {
        &self.public_key_bytes
    }

    /// Sign a message with the node key.
    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, IdentityError> {
        self.keypair.sign(msg).map_err(|_| IdentityError::Signing)
    }
}

fn set_private_perms_best_effort(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
}

/// Verify `sig` over `msg` under a serialized (protobuf) public key.
/// Supports Ed25519 and RSA-SHA256 keys.
pub fn verify_signature(public_key_bytes: &[u8], msg: &[u8], sig: &[u8]) -> bool {
    match PublicKey::try_decode_protobuf(public_key_bytes) {
        Ok(pk) => pk.verify(msg, sig),
        Err(_) => false,
    }
}

/// Derive the peer id committed to by a serialized public key.
pub fn peer_id_from_public_key(public_key_bytes: &[u8]) -> Option<PeerId> {
    PublicKey::try_decode_protobuf(public_key_bytes)
        .ok()
        .map(|pk| pk.to_peer_id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let id = NodeIdentity::generate();
        let sig = id.sign(b"hello").unwrap();
        assert!(verify_signature(id.public_key_bytes(), b"hello", &sig));
        assert!(!verify_signature(id.public_key_bytes(), b"hellx", &sig));
    }

    #[test]
    fn peer_id_matches_public_key() {
        let id = NodeIdentity::generate();
        assert_eq!(
            peer_id_from_public_key(id.public_key_bytes()),
            Some(id.peer_id())
        );
    }

    #[test]
    fn persisted_identity_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let first = NodeIdentity::load_or_create(dir.path()).unwrap();
        let second = NodeIdentity::load_or_create(dir.path()).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
        assert_eq!(first.node_id(), second.node_id());
    }
}
