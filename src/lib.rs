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
#![warn(missing_docs)]

//! Meshnet - coordination substrate for a chain-anchored compute subnet.
//!
//! This crate provides:
//! - A Kademlia-style DHT with signed records, pluggable record validators,
//!   and an authenticated RPC transport
//! - Per-message authorization: signatures, anti-replay nonces, rate
//!   limiting, and on-chain proof-of-stake gates
//! - An epoch-synchronized consensus engine that proposes or attests score
//!   lists against the external chain
//! - A heartbeat announcer publishing each node's reachability into the DHT
//! - Monitoring via Prometheus metrics and structured logging

/// Read-only HTTP admin surface (bootnodes).
pub mod admin;
/// RPC authorization: signatures, stake and rate gates.
pub mod auth;
/// Chain-facing types, the client seam, and the in-memory mock.
pub mod chain;
/// Core primitives (types, identity, configuration).
pub mod core;
/// The DHT: routing, storage, validation, protocol, node.
pub mod dht;
/// Observability (metrics, structured logging helpers).
pub mod monitoring;
/// Subnet behavior: heartbeats and consensus.
pub mod subnet;
