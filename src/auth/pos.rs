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

//! Proof-of-stake gate around the signature authorizer: callers (and
//! responders) must be staked on the subnet at a minimum class. Chain
//! answers are cached briefly.

use crate::auth::authorizer::{AuthError, Authorizer, SignatureAuthorizer};
use crate::chain::client::Hypertensor;
use crate::chain::data::SubnetNodeClass;
use crate::core::identity::peer_id_from_public_key;
use crate::core::types::dht_time;
use crate::dht::protocol::{RpcRequest, RpcResponse};
use crate::dht::storage::TimedStorage;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// How long a stake answer stays fresh, seconds.
const STAKE_CACHE_SECS: f64 = 60.0;

/// Signature authorizer plus an on-chain stake lookup.
pub struct ProofOfStakeAuthorizer {
    inner: SignatureAuthorizer,
    chain: Arc<dyn Hypertensor>,
    subnet_id: u32,
    min_class: SubnetNodeClass,
    cache: Mutex<TimedStorage<Vec<u8>, bool>>,
}

impl ProofOfStakeAuthorizer {
    /// Gate requiring stake of at least `min_class` on `subnet_id`.
    pub fn new(
        inner: SignatureAuthorizer,
        chain: Arc<dyn Hypertensor>,
        subnet_id: u32,
        min_class: SubnetNodeClass,
    ) -> Self {
        Self {
            inner,
            chain,
            subnet_id,
            min_class,
            cache: Mutex::new(TimedStorage::new()),
        }
    }

    async fn check_stake(&self, public_key: &[u8]) -> bool {
        if let Some(hit) = self
            .cache
            .lock()
            .expect("stake cache lock")
            .get(&public_key.to_vec())
        {
            return hit.value;
        }
        let Some(peer_id) = peer_id_from_public_key(public_key) else {
            debug!("stake check failed: public key does not map to a peer id");
            return false;
        };
        match self
            .chain
            .proof_of_stake(self.subnet_id, &peer_id.to_base58(), self.min_class)
            .await
        {
            Ok(staked) => {
                self.cache.lock().expect("stake cache lock").store(
                    public_key.to_vec(),
                    staked,
                    dht_time() + STAKE_CACHE_SECS,
                );
                staked
            }
            Err(e) => {
                debug!(err = %e, "proof of stake lookup failed");
                false
            }
        }
    }
}

#[async_trait]
impl Authorizer for ProofOfStakeAuthorizer {
    async fn sign_request(
        &self,
        request: &mut RpcRequest,
        service_public_key: Option<&[u8]>,
    ) -> Result<(), AuthError> {
        self.inner.sign_request(request, service_public_key).await
    }

    async fn validate_request(&self, request: &RpcRequest) -> bool {
        let Some(public_key) = self.inner.verify_request_signature(request) else {
            return false;
        };
        if !self.check_stake(&public_key).await {
            debug!("request rejected: caller is not staked");
            return false;
        }
        self.inner.validate_request(request).await
    }

    async fn sign_response(
        &self,
        response: &mut RpcResponse,
        request: &RpcRequest,
    ) -> Result<(), AuthError> {
        self.inner.sign_response(response, request).await
    }

    async fn validate_response(&self, response: &RpcResponse, request: &RpcRequest) -> bool {
        if !self.inner.validate_response(response, request).await {
            return false;
        }
        let public_key = &response.auth.service_access_token.public_key;
        if !self.check_stake(public_key).await {
            debug!("response rejected: responder is not staked");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::authorizer::RequestAuth;
    use crate::chain::mock::MockHypertensor;
    use crate::core::identity::NodeIdentity;
    use crate::core::types::NodeId;
    use crate::dht::protocol::{NodeInfoWire, RequestBody};

    fn signed_ping(client: &SignatureAuthorizer, identity: &NodeIdentity) -> RpcRequest {
        let mut request = RpcRequest {
            auth: RequestAuth::default(),
            sender: NodeInfoWire {
                peer_id: identity.peer_id().to_bytes(),
                node_id: NodeId::generate(identity.public_key_bytes()),
                endpoint: "127.0.0.1:0".to_string(),
            },
            body: RequestBody::Ping,
        };
        futures::executor::block_on(client.sign_request(&mut request, None)).unwrap();
        request
    }

    fn gate(chain: Arc<MockHypertensor>) -> ProofOfStakeAuthorizer {
        ProofOfStakeAuthorizer::new(
            SignatureAuthorizer::new(Arc::new(NodeIdentity::generate())),
            chain as Arc<dyn Hypertensor>,
            1,
            SubnetNodeClass::Idle,
        )
    }

    #[tokio::test]
    async fn staked_caller_is_accepted() {
        let client_identity = Arc::new(NodeIdentity::generate());
        let client = SignatureAuthorizer::new(Arc::clone(&client_identity));
        let chain = Arc::new(MockHypertensor::new());
        chain.set_stake_ok(true);

        let pos = gate(chain);
        let request = signed_ping(&client, &client_identity);
        assert!(pos.validate_request(&request).await);
    }

    #[tokio::test]
    async fn unstaked_caller_is_rejected() {
        let client_identity = Arc::new(NodeIdentity::generate());
        let client = SignatureAuthorizer::new(Arc::clone(&client_identity));
        let chain = Arc::new(MockHypertensor::new());
        chain.set_stake_ok(false);

        let pos = gate(chain);
        let request = signed_ping(&client, &client_identity);
        assert!(!pos.validate_request(&request).await);
    }

    #[tokio::test]
    async fn stake_answers_are_cached() {
        let client_identity = Arc::new(NodeIdentity::generate());
        let client = SignatureAuthorizer::new(Arc::clone(&client_identity));
        let chain = Arc::new(MockHypertensor::new());
        chain.set_stake_ok(true);

        let pos = gate(Arc::clone(&chain));
        let request = signed_ping(&client, &client_identity);
        assert!(pos.validate_request(&request).await);

        // Chain flips, but the cached positive answer is still honored for a
        // fresh (different-nonce) request from the same key.
        chain.set_stake_ok(false);
        let request = signed_ping(&client, &client_identity);
        assert!(pos.validate_request(&request).await);
    }
}
