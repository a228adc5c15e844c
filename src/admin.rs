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

//! Read-only HTTP admin surface for bootnodes.
//!
//! Endpoints: `/v1/get_heartbeat`, `/v1/get_bootnodes`, `/v1/get_peers_info`.
//! Every request needs a valid `X-API-Key` (compared in constant time) and is
//! budgeted per IP and per key.

use crate::core::config::AdminSettings;
use crate::dht::node::DhtNode;
use crate::subnet::heartbeat::{get_node_heartbeats, ServerInfo};
use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

/// Admin surface errors.
#[derive(Debug, Error)]
pub enum AdminError {
    /// Could not bind the listen address.
    #[error("bind")]
    Bind,
    /// Server terminated with an error.
    #[error("serve")]
    Serve,
}

struct AdminContext {
    dht: Arc<DhtNode>,
    settings: AdminSettings,
    bootnodes: Vec<String>,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

#[derive(Serialize)]
struct HeartbeatEntry {
    peer_id: String,
    server: ServerInfo,
    expiration_time: f64,
}

#[derive(Serialize)]
struct PeerEntry {
    peer_id: String,
    node_id: String,
    endpoint: String,
}

type Rejection = (StatusCode, &'static str);

impl AdminContext {
    fn check_api_key(&self, headers: &HeaderMap) -> Result<String, Rejection> {
        let presented = headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .ok_or((StatusCode::UNAUTHORIZED, "missing api key"))?;
        for key in &self.settings.api_keys {
            if key.len() == presented.len()
                && key.as_bytes().ct_eq(presented.as_bytes()).into()
            {
                return Ok(key.clone());
            }
        }
        Err((StatusCode::UNAUTHORIZED, "invalid api key"))
    }

    fn allow(&self, bucket: String) -> bool {
        let mut hits = self.hits.lock().expect("admin rate lock");
        let window = Duration::from_secs(60);
        let now = Instant::now();
        let entry = hits.entry(bucket).or_default();
        while entry.front().is_some_and(|t| now.duration_since(*t) > window) {
            entry.pop_front();
        }
        if entry.len() >= self.settings.rate_limit_per_min as usize {
            return false;
        }
        entry.push_back(now);
        true
    }

    fn guard(&self, addr: &SocketAddr, headers: &HeaderMap) -> Result<(), Rejection> {
        let key = self.check_api_key(headers)?;
        if !self.allow(format!("ip:{}", addr.ip())) || !self.allow(format!("key:{key}")) {
            return Err((StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded"));
        }
        Ok(())
    }
}

async fn get_heartbeat(
    State(ctx): State<Arc<AdminContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Vec<HeartbeatEntry>>, Rejection> {
    ctx.guard(&addr, &headers)?;
    let heartbeats = get_node_heartbeats(&ctx.dht, false).await;
    Ok(Json(
        heartbeats
            .into_iter()
            .map(|h| HeartbeatEntry {
                peer_id: h.peer_id.to_base58(),
                server: h.server,
                expiration_time: h.expiration_time,
            })
            .collect(),
    ))
}

async fn get_bootnodes(
    State(ctx): State<Arc<AdminContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Vec<String>>, Rejection> {
    ctx.guard(&addr, &headers)?;
    Ok(Json(ctx.bootnodes.clone()))
}

async fn get_peers_info(
    State(ctx): State<Arc<AdminContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Vec<PeerEntry>>, Rejection> {
    ctx.guard(&addr, &headers)?;
    Ok(Json(
        ctx.dht
            .protocol
            .routing_entries()
            .into_iter()
            .map(|e| PeerEntry {
                peer_id: e.peer_id.to_base58(),
                node_id: hex::encode(e.node_id.as_bytes()),
                endpoint: e.endpoint,
            })
            .collect(),
    ))
}

/// Serve the admin surface until `stop` flips.
pub async fn serve_admin(
    settings: AdminSettings,
    bootnodes: Vec<String>,
    dht: Arc<DhtNode>,
    mut stop: watch::Receiver<bool>,
) -> Result<(), AdminError> {
    let Some(listen_addr) = settings.listen_addr.clone() else {
        return Ok(());
    };
    let ctx = Arc::new(AdminContext {
        dht,
        settings,
        bootnodes,
        hits: Mutex::new(HashMap::new()),
    });

    let app = Router::new()
        .route("/v1/get_heartbeat", get(get_heartbeat))
        .route("/v1/get_bootnodes", get(get_bootnodes))
        .route("/v1/get_peers_info", get(get_peers_info))
        .with_state(ctx);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .map_err(|_| AdminError::Bind)?;
    info!(addr = %listen_addr, "admin surface listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        while stop.changed().await.is_ok() {
            if *stop.borrow() {
                break;
            }
        }
    })
    .await
    .map_err(|_| AdminError::Serve)
}
