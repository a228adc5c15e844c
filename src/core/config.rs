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

//! Node configuration (TOML).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read.
    #[error("io")]
    Io,
    /// TOML parse failure.
    #[error("parse")]
    Parse,
}

/// Node configuration root.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node settings.
    #[serde(default)]
    pub node: NodeSettings,
    /// DHT settings.
    #[serde(default)]
    pub dht: DhtSettings,
    /// Subnet / consensus settings.
    #[serde(default)]
    pub subnet: SubnetSettings,
    /// Optional admin HTTP surface (bootnodes).
    #[serde(default)]
    pub admin: AdminSettings,
}

/// Node settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Human-readable name.
    pub name: String,
    /// Data directory (identity key).
    pub data_dir: String,
    /// Public name reported in heartbeats.
    #[serde(default)]
    pub public_name: Option<String>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            name: "meshnet-node".to_string(),
            data_dir: "./data".to_string(),
            public_name: None,
        }
    }
}

/// DHT settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DhtSettings {
    /// Listen address, e.g. `0.0.0.0:31330`.
    pub listen_addr: String,
    /// Endpoint announced to peers (defaults to `listen_addr`).
    #[serde(default)]
    pub announce_addr: Option<String>,
    /// Bootstrap endpoints (`host:port`).
    #[serde(default)]
    pub bootstrap: Vec<String>,
    /// Bucket width / replication factor.
    #[serde(default = "default_bucket_size")]
    pub bucket_size: usize,
    /// Lookup concurrency.
    #[serde(default = "default_alpha")]
    pub alpha: usize,
    /// Bound on concurrent outbound RPC workers.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
}

fn default_bucket_size() -> usize {
    20
}
fn default_alpha() -> usize {
    3
}
fn default_num_workers() -> usize {
    8
}

impl Default for DhtSettings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:31330".to_string(),
            announce_addr: None,
            bootstrap: Vec::new(),
            bucket_size: default_bucket_size(),
            alpha: default_alpha(),
            num_workers: default_num_workers(),
        }
    }
}

/// Subnet / consensus settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubnetSettings {
    /// On-chain subnet id.
    pub subnet_id: u32,
    /// Our on-chain subnet node id.
    pub subnet_node_id: u32,
    /// Heartbeat period, seconds.
    #[serde(default = "default_update_period")]
    pub update_period: f64,
    /// Skip the wait-for-subnet-active phase (testing).
    #[serde(default)]
    pub skip_activate_subnet: bool,
}

fn default_update_period() -> f64 {
    60.0
}

impl Default for SubnetSettings {
    fn default() -> Self {
        Self {
            subnet_id: 1,
            subnet_node_id: 0,
            update_period: default_update_period(),
            skip_activate_subnet: false,
        }
    }
}

/// Admin HTTP settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminSettings {
    /// Listen address; `None` disables the surface.
    #[serde(default)]
    pub listen_addr: Option<String>,
    /// Accepted API keys for `X-API-Key`.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Per-IP and per-key request budget per minute.
    #[serde(default = "default_admin_rate")]
    pub rate_limit_per_min: u32,
}

fn default_admin_rate() -> u32 {
    5
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            listen_addr: None,
            api_keys: Vec::new(),
            rate_limit_per_min: default_admin_rate(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
        toml::from_str(&raw).map_err(|_| ConfigError::Parse)
    }
}
