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

//! Replay protection exercised through the full RPC servicer: a captured
//! signed request is answered once, then dropped by the nonce cache.

mod common;

use common::build_swarm;
use meshnet::auth::authorizer::{Authorizer, RequestAuth, SignatureAuthorizer};
use meshnet::core::identity::NodeIdentity;
use meshnet::dht::protocol::{RequestBody, RpcRequest};
use meshnet::dht::transport::{MeshTransport, Servicer};
use std::sync::Arc;

#[tokio::test]
async fn captured_request_is_not_answered_twice() {
    let mesh = MeshTransport::new();
    let nodes = build_swarm(&mesh, None, 2).await;

    // An attacker captures a fully signed request from a fresh client.
    let client_identity = Arc::new(NodeIdentity::generate());
    let client_auth = SignatureAuthorizer::new(Arc::clone(&client_identity));
    let mut request = RpcRequest {
        auth: RequestAuth::default(),
        sender: meshnet::dht::protocol::NodeInfoWire {
            peer_id: client_identity.peer_id().to_bytes(),
            node_id: client_identity.node_id(),
            endpoint: "nowhere".to_string(),
        },
        body: RequestBody::Ping,
    };
    client_auth.sign_request(&mut request, None).await.unwrap();

    let servicer = Arc::clone(&nodes[0].dht.protocol);
    let first = Arc::clone(&servicer).handle(request.clone()).await;
    assert!(first.is_some(), "original request is serviced");

    // Replay ten seconds later (well inside the nonce window): dropped.
    let second = Arc::clone(&servicer).handle(request.clone()).await;
    assert!(second.is_none(), "replayed request is dropped");

    // And the response to the original is bound to the original's nonce.
    let response = first.unwrap();
    assert_eq!(response.auth.nonce, request.auth.nonce);
}

#[tokio::test]
async fn response_validation_is_symmetric() {
    let mesh = MeshTransport::new();
    let nodes = build_swarm(&mesh, None, 2).await;

    let client_identity = Arc::new(NodeIdentity::generate());
    let client_auth = SignatureAuthorizer::new(Arc::clone(&client_identity));
    let mut request = RpcRequest {
        auth: RequestAuth::default(),
        sender: meshnet::dht::protocol::NodeInfoWire {
            peer_id: client_identity.peer_id().to_bytes(),
            node_id: client_identity.node_id(),
            endpoint: "nowhere".to_string(),
        },
        body: RequestBody::Ping,
    };
    client_auth.sign_request(&mut request, None).await.unwrap();

    let servicer = Arc::clone(&nodes[1].dht.protocol);
    let response = Arc::clone(&servicer)
        .handle(request.clone())
        .await
        .expect("serviced");

    assert!(client_auth.validate_response(&response, &request).await);

    // A response with a doctored body no longer verifies.
    let mut tampered = response.clone();
    tampered.body = meshnet::dht::protocol::ResponseBody::Store {
        accepted: vec![true],
    };
    assert!(!client_auth.validate_response(&tampered, &request).await);
}
