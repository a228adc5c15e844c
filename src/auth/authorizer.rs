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

//! Per-RPC authorization: the [`Authorizer`] capability set and the baseline
//! [`SignatureAuthorizer`] (signature + clock skew + nonce replay cache).
//!
//! Every RPC carries an auth envelope: a client access token, an optional
//! pinned service key, a wall-clock timestamp, an 8-byte nonce, and a
//! signature over the full serialized request. Nonces are remembered for
//! three times the tolerated clock skew.

use crate::core::identity::NodeIdentity;
use crate::core::types::{dht_time, encode_canonical, DhtExpiration, MAX_DHT_TIME_DISCREPANCY};
use crate::dht::protocol::{RpcRequest, RpcResponse};
use crate::dht::storage::TimedStorage;
use async_trait::async_trait;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

/// Authorization errors (signing side; validation returns booleans).
#[derive(Debug, Error)]
pub enum AuthError {
    /// Serialization failed.
    #[error("codec")]
    Codec,
    /// Key operation failed.
    #[error("signing")]
    Signing,
}

/// Tolerated |sender clock - local clock| for incoming RPCs, seconds.
pub const MAX_CLIENT_SERVICER_TIME_DIFF: f64 = MAX_DHT_TIME_DISCREPANCY;

/// Nonce retention window.
const NONCE_RETENTION: f64 = MAX_CLIENT_SERVICER_TIME_DIFF * 3.0;

/// Nonce length, bytes.
const NONCE_LEN: usize = 8;

/// A short-lived capability naming the caller's public key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessToken {
    /// Serialized public key of the holder.
    pub public_key: Vec<u8>,
    /// Token expiration, DHT wall-clock seconds.
    pub expiration_time: DhtExpiration,
    /// Signature over the token fields.
    pub signature: Vec<u8>,
}

/// Auth envelope of a request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestAuth {
    /// Caller's access token.
    pub client_access_token: AccessToken,
    /// When non-empty, the request is only valid at the service holding this key.
    pub service_public_key: Vec<u8>,
    /// Sender wall-clock at signing time.
    pub time: DhtExpiration,
    /// Random anti-replay nonce.
    pub nonce: Vec<u8>,
    /// Signature over the full serialized request (with this field empty).
    pub signature: Vec<u8>,
}

/// Auth envelope of a response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseAuth {
    /// Responder's access token.
    pub service_access_token: AccessToken,
    /// Echo of the request nonce.
    pub nonce: Vec<u8>,
    /// Signature over the full serialized response (with this field empty).
    pub signature: Vec<u8>,
}

/// The authorization capability set. Composable: wrappers add stake or rate
/// gates around an inner signature authorizer.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Fill and sign the request's auth envelope.
    async fn sign_request(
        &self,
        request: &mut RpcRequest,
        service_public_key: Option<&[u8]>,
    ) -> Result<(), AuthError>;

    /// Whether an incoming request passes every gate.
    async fn validate_request(&self, request: &RpcRequest) -> bool;

    /// Fill and sign the response's auth envelope.
    async fn sign_response(
        &self,
        response: &mut RpcResponse,
        request: &RpcRequest,
    ) -> Result<(), AuthError>;

    /// Whether a response is authentic and belongs to `request`.
    async fn validate_response(&self, response: &RpcResponse, request: &RpcRequest) -> bool;
}

const TOKEN_DOMAIN: &[u8] = b"Meshnet-Access-Token-v1";
const REQUEST_DOMAIN: &[u8] = b"Meshnet-Rpc-Request-v1";
const RESPONSE_DOMAIN: &[u8] = b"Meshnet-Rpc-Response-v1";

fn token_signing_bytes(token: &AccessToken) -> Result<Vec<u8>, AuthError> {
    let body = encode_canonical(&(&token.public_key, token.expiration_time))
        .map_err(|_| AuthError::Codec)?;
    let mut out = Vec::with_capacity(TOKEN_DOMAIN.len() + body.len());
    out.extend_from_slice(TOKEN_DOMAIN);
    out.extend_from_slice(&body);
    Ok(out)
}

fn request_signing_bytes(request: &RpcRequest) -> Result<Vec<u8>, AuthError> {
    let mut unsigned = request.clone();
    unsigned.auth.signature.clear();
    let body = encode_canonical(&unsigned).map_err(|_| AuthError::Codec)?;
    let mut out = Vec::with_capacity(REQUEST_DOMAIN.len() + body.len());
    out.extend_from_slice(REQUEST_DOMAIN);
    out.extend_from_slice(&body);
    Ok(out)
}

fn response_signing_bytes(response: &RpcResponse) -> Result<Vec<u8>, AuthError> {
    let mut unsigned = response.clone();
    unsigned.auth.signature.clear();
    let body = encode_canonical(&unsigned).map_err(|_| AuthError::Codec)?;
    let mut out = Vec::with_capacity(RESPONSE_DOMAIN.len() + body.len());
    out.extend_from_slice(RESPONSE_DOMAIN);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Baseline authorizer: per-message signatures, pinned-service check, clock
/// skew bound, and a nonce replay cache.
pub struct SignatureAuthorizer {
    identity: Arc<NodeIdentity>,
    recent_nonces: Mutex<TimedStorage<Vec<u8>, ()>>,
    rng: SystemRandom,
}

impl SignatureAuthorizer {
    /// Authorizer signing with this node's identity.
    pub fn new(identity: Arc<NodeIdentity>) -> Self {
        Self {
            identity,
            recent_nonces: Mutex::new(TimedStorage::new()),
            rng: SystemRandom::new(),
        }
    }

    /// Our serialized public key.
    pub fn local_public_key(&self) -> Vec<u8> {
        self.identity.public_key_bytes().to_vec()
    }

    fn make_token(&self) -> Result<AccessToken, AuthError> {
        let mut token = AccessToken {
            public_key: self.identity.public_key_bytes().to_vec(),
            expiration_time: dht_time() + MAX_CLIENT_SERVICER_TIME_DIFF,
            signature: Vec::new(),
        };
        let msg = token_signing_bytes(&token)?;
        token.signature = self.identity.sign(&msg).map_err(|_| AuthError::Signing)?;
        Ok(token)
    }

    /// Verify only the request signature, returning the caller's serialized
    /// public key. Used by wrappers that need the caller identity before
    /// committing the nonce.
    pub(crate) fn verify_request_signature(&self, request: &RpcRequest) -> Option<Vec<u8>> {
        let msg = request_signing_bytes(request).ok()?;
        let public_key = &request.auth.client_access_token.public_key;
        if !crate::core::identity::verify_signature(public_key, &msg, &request.auth.signature) {
            debug!("request has invalid signature");
            return None;
        }
        Some(public_key.clone())
    }

    /// Skew and replay checks; on success the nonce is recorded.
    fn check_freshness_and_nonce(&self, auth: &RequestAuth) -> bool {
        let mut cache = self.recent_nonces.lock().expect("nonce cache lock");
        let mut frozen = cache.freeze();
        let current_time = dht_time();
        if (auth.time - current_time).abs() > MAX_CLIENT_SERVICER_TIME_DIFF {
            debug!("clocks are not synchronized or an old request is replayed");
            return false;
        }
        if frozen.contains(&auth.nonce) {
            debug!("previous request is replayed again");
            return false;
        }
        frozen.store(auth.nonce.clone(), (), current_time + NONCE_RETENTION);
        true
    }
}

#[async_trait]
impl Authorizer for SignatureAuthorizer {
    async fn sign_request(
        &self,
        request: &mut RpcRequest,
        service_public_key: Option<&[u8]>,
    ) -> Result<(), AuthError> {
        request.auth.client_access_token = self.make_token()?;
        request.auth.service_public_key = service_public_key.unwrap_or(&[]).to_vec();
        request.auth.time = dht_time();
        let mut nonce = vec![0u8; NONCE_LEN];
        self.rng.fill(&mut nonce).map_err(|_| AuthError::Signing)?;
        request.auth.nonce = nonce;
        request.auth.signature.clear();
        let msg = request_signing_bytes(request)?;
        request.auth.signature = self.identity.sign(&msg).map_err(|_| AuthError::Signing)?;
        Ok(())
    }

    async fn validate_request(&self, request: &RpcRequest) -> bool {
        if self.verify_request_signature(request).is_none() {
            return false;
        }
        let auth = &request.auth;
        if !auth.service_public_key.is_empty()
            && auth.service_public_key != self.identity.public_key_bytes()
        {
            debug!("request is pinned to a different service key");
            return false;
        }
        self.check_freshness_and_nonce(auth)
    }

    async fn sign_response(
        &self,
        response: &mut RpcResponse,
        request: &RpcRequest,
    ) -> Result<(), AuthError> {
        response.auth.service_access_token = self.make_token()?;
        response.auth.nonce = request.auth.nonce.clone();
        response.auth.signature.clear();
        let msg = response_signing_bytes(response)?;
        response.auth.signature = self.identity.sign(&msg).map_err(|_| AuthError::Signing)?;
        Ok(())
    }

    async fn validate_response(&self, response: &RpcResponse, request: &RpcRequest) -> bool {
        let Ok(msg) = response_signing_bytes(response) else {
            return false;
        };
        let public_key = &response.auth.service_access_token.public_key;
        if !crate::core::identity::verify_signature(public_key, &msg, &response.auth.signature) {
            debug!("response has invalid signature");
            return false;
        }
        if response.auth.nonce != request.auth.nonce {
            debug!("response was generated for another request");
            return false;
        }
        true
    }
}
