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

//! RPC transport seam.
//!
//! [`TcpTransport`] speaks u32-length-prefixed canonical bincode frames, one
//! request/response exchange per connection. [`MeshTransport`] wires servicers
//! together in-process for swarm tests. Requests the servicer drops (failed
//! authorization) close the connection without a response.

use crate::core::types::{decode_canonical_limited, encode_canonical};
use crate::dht::protocol::{RpcRequest, RpcResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Maximum frame size on the wire.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// RPC failure as seen by callers.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Peer did not answer in time.
    #[error("timeout")]
    Timeout,
    /// Connection failed or was closed mid-exchange.
    #[error("io")]
    Io,
    /// Request or response failed authorization.
    #[error("auth")]
    Auth,
    /// Frame could not be decoded.
    #[error("codec")]
    Codec,
    /// No route to the endpoint (in-process transport only).
    #[error("no route")]
    NoRoute,
}

/// Client side of the transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request and await its response.
    async fn call(
        &self,
        endpoint: &str,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse, RpcError>;
}

/// Server side: one handler per inbound request. `None` drops the request
/// without answering (authorization failures).
#[async_trait]
pub trait Servicer: Send + Sync {
    /// Service a request.
    async fn handle(self: Arc<Self>, request: RpcRequest) -> Option<RpcResponse>;
}

async fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> Result<(), RpcError> {
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(RpcError::Codec);
    }
    stream
        .write_all(&(bytes.len() as u32).to_be_bytes())
        .await
        .map_err(|_| RpcError::Io)?;
    stream.write_all(bytes).await.map_err(|_| RpcError::Io)?;
    stream.flush().await.map_err(|_| RpcError::Io)?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, RpcError> {
    let mut len_bytes = [0u8; 4];
    stream
        .read_exact(&mut len_bytes)
        .await
        .map_err(|_| RpcError::Io)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(RpcError::Codec);
    }
    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|_| RpcError::Io)?;
    Ok(buf)
}

/// TCP transport: connect, one exchange, close.
#[derive(Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    /// New transport.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(
        &self,
        endpoint: &str,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse, RpcError> {
        let exchange = async {
            let mut stream = TcpStream::connect(endpoint)
                .await
                .map_err(|_| RpcError::Io)?;
            let bytes = encode_canonical(&request).map_err(|_| RpcError::Codec)?;
            write_frame(&mut stream, &bytes).await?;
            let reply = read_frame(&mut stream).await?;
            decode_canonical_limited::<RpcResponse>(&reply, MAX_FRAME_BYTES)
                .map_err(|_| RpcError::Codec)
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| RpcError::Timeout)?
    }
}

/// Accept loop: one spawned task per connection until `stop` flips.
pub async fn serve_tcp(
    listener: TcpListener,
    servicer: Arc<dyn Servicer>,
    mut stop: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "dht rpc listening");
    }
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let servicer = servicer.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, servicer).await {
                                debug!(err = ?e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(err = %e, "accept failed");
                    }
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    info!("dht rpc listener stopping");
                    return;
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    servicer: Arc<dyn Servicer>,
) -> Result<(), RpcError> {
    let bytes = read_frame(&mut stream).await?;
    let request =
        decode_canonical_limited::<RpcRequest>(&bytes, MAX_FRAME_BYTES).map_err(|_| RpcError::Codec)?;
    match servicer.handle(request).await {
        Some(response) => {
            let reply = encode_canonical(&response).map_err(|_| RpcError::Codec)?;
            write_frame(&mut stream, &reply).await
        }
        None => Ok(()), // dropped by the authorizer; close without answering
    }
}

/// In-process transport: endpoints map straight to servicers. Used to build
/// multi-node swarms inside one process (tests, local tooling).
#[derive(Clone, Default)]
pub struct MeshTransport {
    registry: Arc<Mutex<HashMap<String, Arc<dyn Servicer>>>>,
}

impl MeshTransport {
    /// Empty mesh.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Attach a servicer at `endpoint`.
    pub fn register(&self, endpoint: impl Into<String>, servicer: Arc<dyn Servicer>) {
        self.registry
            .lock()
            .expect("mesh registry lock")
            .insert(endpoint.into(), servicer);
    }

    /// Detach an endpoint (simulates an unreachable peer).
    pub fn unregister(&self, endpoint: &str) {
        self.registry
            .lock()
            .expect("mesh registry lock")
            .remove(endpoint);
    }
}

#[async_trait]
impl Transport for MeshTransport {
    async fn call(
        &self,
        endpoint: &str,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse, RpcError> {
        let servicer = self
            .registry
            .lock()
            .expect("mesh registry lock")
            .get(endpoint)
            .cloned()
            .ok_or(RpcError::NoRoute)?;
        // Round-trip through the codec so in-process calls exercise the same
        // wire representation as TCP.
        let bytes = encode_canonical(&request).map_err(|_| RpcError::Codec)?;
        let request = decode_canonical_limited::<RpcRequest>(&bytes, MAX_FRAME_BYTES)
            .map_err(|_| RpcError::Codec)?;
        let outcome = tokio::time::timeout(timeout, servicer.handle(request))
            .await
            .map_err(|_| RpcError::Timeout)?;
        outcome.ok_or(RpcError::Auth)
    }
}
