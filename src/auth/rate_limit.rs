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

//! Rate-limiting gate around the signature authorizer.
//!
//! Request timestamps are tracked per peer over 1 s / 60 s / 3600 s windows
//! and mapped to a five-level threat ladder. Escalation is monotonic while a
//! block is active; CRITICAL hands the peer to an IP-ban hook when one is
//! configured, otherwise blocks for 24 hours.

use crate::auth::authorizer::{AuthError, Authorizer, SignatureAuthorizer};
use crate::core::identity::peer_id_from_public_key;
use crate::core::types::dht_time;
use crate::dht::protocol::{RpcRequest, RpcResponse};
use async_trait::async_trait;
use libp2p::PeerId;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Threat levels for progressive response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreatLevel {
    /// Baseline.
    Normal,
    /// Burst or unusual pattern; log only.
    Suspicious,
    /// Sustained high rate; temporary block.
    Moderate,
    /// Severe violation; extended block.
    High,
    /// Extreme violation; IP ban or 24 h block.
    Critical,
}

/// Rate limiting configuration.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    /// Sustained requests per second.
    pub max_requests_per_second: u32,
    /// Requests per minute.
    pub max_requests_per_minute: u32,
    /// Requests per hour.
    pub max_requests_per_hour: u32,
    /// Burst size tolerated within one second.
    pub max_burst: u32,
    /// Multiplier over `max_requests_per_second` that reads as suspicious.
    pub suspicious_threshold: f64,
    /// Multiplier that triggers an extended block.
    pub blocking_threshold: f64,
    /// Multiplier that triggers an IP ban.
    pub ip_ban_threshold: f64,
    /// Temporary block duration, seconds.
    pub temp_block_duration: f64,
    /// Extended block duration, seconds.
    pub extended_block_duration: f64,
    /// Whether CRITICAL escalates to the IP-ban hook.
    pub enable_ip_banning: bool,
    /// Violation count that reads as CRITICAL.
    pub ip_ban_violation_count: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: 10,
            max_requests_per_minute: 100,
            max_requests_per_hour: 1000,
            max_burst: 20,
            suspicious_threshold: 1.5,
            blocking_threshold: 3.0,
            ip_ban_threshold: 5.0,
            temp_block_duration: 300.0,
            extended_block_duration: 3600.0,
            enable_ip_banning: false,
            ip_ban_violation_count: 10,
        }
    }
}

const SHORT_WINDOW: f64 = 1.0;
const MEDIUM_WINDOW: f64 = 60.0;
const LONG_WINDOW: f64 = 3600.0;
const CRITICAL_BLOCK: f64 = 86_400.0;

/// Callback invoked when a peer crosses the CRITICAL threshold with IP
/// banning enabled.
#[async_trait]
pub trait IpBanHook: Send + Sync {
    /// Ban `peer` at the network layer.
    async fn ban(&self, peer: &PeerId, reason: &str);
}

#[derive(Default)]
struct RateState {
    requests: HashMap<PeerId, VecDeque<f64>>,
    threat_levels: HashMap<PeerId, ThreatLevel>,
    blocked_until: HashMap<PeerId, f64>,
    violations: HashMap<PeerId, u32>,
    ip_banned: HashSet<PeerId>,
    total_requests: u64,
    blocked_requests: u64,
}

/// Signature authorizer plus the per-peer threat ladder.
pub struct RateLimitAuthorizer {
    inner: SignatureAuthorizer,
    config: RateLimitConfig,
    state: Mutex<RateState>,
    ban_hook: Option<Arc<dyn IpBanHook>>,
}

impl RateLimitAuthorizer {
    /// Gate with the given configuration and optional ban hook.
    pub fn new(
        inner: SignatureAuthorizer,
        config: RateLimitConfig,
        ban_hook: Option<Arc<dyn IpBanHook>>,
    ) -> Self {
        Self {
            inner,
            config,
            state: Mutex::new(RateState::default()),
            ban_hook,
        }
    }

    /// Current threat level for `peer`.
    pub async fn threat_level(&self, peer: &PeerId) -> ThreatLevel {
        self.state
            .lock()
            .await
            .threat_levels
            .get(peer)
            .copied()
            .unwrap_or(ThreatLevel::Normal)
    }

    /// Whether `peer` currently sits behind a block or ban.
    pub async fn is_blocked(&self, peer: &PeerId) -> bool {
        let st = self.state.lock().await;
        st.ip_banned.contains(peer)
            || st
                .blocked_until
                .get(peer)
                .is_some_and(|until| *until > dht_time())
    }

    /// Totals of (accepted, blocked) requests across all peers.
    pub async fn stats(&self) -> (u64, u64) {
        let st = self.state.lock().await;
        (st.total_requests, st.blocked_requests)
    }

    pub(crate) async fn check_rate_limit_at(&self, peer: PeerId, now: f64) -> Result<(), String> {
        let mut st = self.state.lock().await;

        if st.ip_banned.contains(&peer) {
            st.blocked_requests += 1;
            return Err("peer is banned at IP level".to_string());
        }

        if let Some(&until) = st.blocked_until.get(&peer) {
            if now < until {
                st.blocked_requests += 1;
                return Err(format!("peer blocked for {} more seconds", (until - now) as u64));
            }
            st.blocked_until.remove(&peer);
            debug!(%peer, "unblocked peer");
        }

        let requests = st.requests.entry(peer).or_default();
        let cutoff = now - LONG_WINDOW;
        while requests.front().is_some_and(|t| *t < cutoff) {
            requests.pop_front();
        }

        let short = requests.iter().filter(|t| **t > now - SHORT_WINDOW).count() as u32;
        let medium = requests.iter().filter(|t| **t > now - MEDIUM_WINDOW).count() as u32;
        let long = requests.len() as u32;

        if let Some((reason, level)) = self.detect_threat(&st, &peer, short, medium, long) {
            self.handle_threat(&mut st, peer, level, &reason, now).await;
            return Err(reason);
        }

        st.requests.entry(peer).or_default().push_back(now);
        st.total_requests += 1;
        Ok(())
    }

    fn detect_threat(
        &self,
        st: &RateState,
        peer: &PeerId,
        short: u32,
        medium: u32,
        long: u32,
    ) -> Option<(String, ThreatLevel)> {
        let max_rate = self.config.max_requests_per_second as f64;
        let violations = st.violations.get(peer).copied().unwrap_or(0);

        if short as f64 > max_rate * self.config.ip_ban_threshold
            || violations >= self.config.ip_ban_violation_count
        {
            return Some((format!("critical: {short} req/s"), ThreatLevel::Critical));
        }
        if short as f64 > max_rate * self.config.blocking_threshold {
            return Some((format!("severe: {short} req/s"), ThreatLevel::High));
        }
        if medium >= self.config.max_requests_per_minute {
            return Some((format!("exceeded: {medium} req/min"), ThreatLevel::Moderate));
        }
        if long >= self.config.max_requests_per_hour {
            return Some((format!("exceeded: {long} req/hour"), ThreatLevel::Moderate));
        }
        if short >= self.config.max_burst {
            return Some((format!("burst: {short} req/s"), ThreatLevel::Suspicious));
        }
        if short as f64 > max_rate * self.config.suspicious_threshold {
            return Some(("suspicious pattern".to_string(), ThreatLevel::Suspicious));
        }
        None
    }

    async fn handle_threat(
        &self,
        st: &mut RateState,
        peer: PeerId,
        level: ThreatLevel,
        reason: &str,
        now: f64,
    ) {
        let current = st
            .threat_levels
            .get(&peer)
            .copied()
            .unwrap_or(ThreatLevel::Normal);
        // Escalate only; the level never decreases during an active block.
        if level > current {
            st.threat_levels.insert(peer, level);
            warn!(%peer, from = ?current, to = ?level, "threat escalated");
        }
        *st.violations.entry(peer).or_insert(0) += 1;

        match level {
            ThreatLevel::Normal => {}
            ThreatLevel::Suspicious => {
                warn!(%peer, reason, "suspicious request pattern");
            }
            ThreatLevel::Moderate => {
                st.blocked_until
                    .insert(peer, now + self.config.temp_block_duration);
                warn!(%peer, reason, secs = self.config.temp_block_duration, "temporary block");
            }
            ThreatLevel::High => {
                st.blocked_until
                    .insert(peer, now + self.config.extended_block_duration);
                error!(%peer, reason, secs = self.config.extended_block_duration, "extended block");
            }
            ThreatLevel::Critical => {
                if self.config.enable_ip_banning && self.ban_hook.is_some() {
                    if st.ip_banned.insert(peer) {
                        error!(%peer, reason, "banning peer at IP level");
                        if let Some(hook) = &self.ban_hook {
                            hook.ban(&peer, reason).await;
                        }
                    }
                } else {
                    st.blocked_until.insert(peer, now + CRITICAL_BLOCK);
                    error!(%peer, reason, "critical threat; 24h block");
                }
            }
        }
    }

    async fn record_violation(&self, peer: PeerId, reason: &str, now: f64) {
        let mut st = self.state.lock().await;
        let count = {
            let entry = st.violations.entry(peer).or_insert(0);
            *entry += 1;
            *entry
        };
        if count >= 5 {
            self.handle_threat(
                &mut st,
                peer,
                ThreatLevel::Suspicious,
                &format!("repeated violations: {reason}"),
                now,
            )
            .await;
        }
    }
}

#[async_trait]
impl Authorizer for RateLimitAuthorizer {
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
        let Some(peer) = peer_id_from_public_key(&public_key) else {
            debug!("rate limit: public key does not map to a peer id");
            return false;
        };

        let now = dht_time();
        if let Err(reason) = self.check_rate_limit_at(peer, now).await {
            warn!(%peer, reason, "rate limit blocked request");
            self.record_violation(peer, &reason, now).await;
            return false;
        }

        if !self.inner.validate_request(request).await {
            self.record_violation(peer, "authentication failed", now).await;
            return false;
        }
        true
    }

    async fn sign_response(
        &self,
        response: &mut RpcResponse,
        request: &RpcRequest,
    ) -> Result<(), AuthError> {
        self.inner.sign_response(response, request).await
    }

    async fn validate_response(&self, response: &RpcResponse, request: &RpcRequest) -> bool {
        // No rate limiting on incoming responses; we are the client.
        self.inner.validate_response(response, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::NodeIdentity;

    fn authorizer(config: RateLimitConfig) -> RateLimitAuthorizer {
        RateLimitAuthorizer::new(
            SignatureAuthorizer::new(Arc::new(NodeIdentity::generate())),
            config,
            None,
        )
    }

    #[tokio::test]
    async fn steady_traffic_is_allowed() {
        let auth = authorizer(RateLimitConfig::default());
        let peer = crate::core::identity::NodeIdentity::generate().peer_id();
        let base = dht_time();
        for i in 0..5 {
            assert!(auth
                .check_rate_limit_at(peer, base + i as f64)
                .await
                .is_ok());
        }
        assert_eq!(auth.threat_level(&peer).await, ThreatLevel::Normal);
    }

    #[tokio::test]
    async fn burst_escalates_to_suspicious_without_block() {
        let auth = authorizer(RateLimitConfig::default());
        let peer = crate::core::identity::NodeIdentity::generate().peer_id();
        let base = dht_time();
        let mut rejected = false;
        for i in 0..25 {
            if auth
                .check_rate_limit_at(peer, base + i as f64 * 0.01)
                .await
                .is_err()
            {
                rejected = true;
                break;
            }
        }
        assert!(rejected);
        assert_eq!(auth.threat_level(&peer).await, ThreatLevel::Suspicious);
        assert!(!auth.is_blocked(&peer).await);
    }

    #[tokio::test]
    async fn sustained_rate_triggers_temp_block() {
        let auth = authorizer(RateLimitConfig {
            max_requests_per_minute: 30,
            ..RateLimitConfig::default()
        });
        let peer = crate::core::identity::NodeIdentity::generate().peer_id();
        let base = dht_time();
        let mut blocked_at = None;
        for i in 0..40 {
            // Spread over the minute so per-second checks stay quiet.
            let t = base + i as f64 * 1.5;
            if auth.check_rate_limit_at(peer, t).await.is_err() {
                blocked_at = Some(t);
                break;
            }
        }
        let t = blocked_at.expect("rpm cap should trip");
        assert_eq!(auth.threat_level(&peer).await, ThreatLevel::Moderate);
        // Still blocked before the temp block elapses, clear afterwards.
        assert!(auth.check_rate_limit_at(peer, t + 10.0).await.is_err());
        assert!(auth
            .check_rate_limit_at(peer, t + 400.0)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn extreme_rate_is_critical_and_long_blocked() {
        let auth = authorizer(RateLimitConfig::default());
        let peer = crate::core::identity::NodeIdentity::generate().peer_id();
        let base = dht_time();
        let mut hit = false;
        for i in 0..60 {
            if auth
                .check_rate_limit_at(peer, base + i as f64 * 0.001)
                .await
                .is_err()
            {
                hit = true;
            }
        }
        assert!(hit);
        // 51+ req/s crosses the ip-ban multiplier; without a hook this is a 24h block.
        assert_eq!(auth.threat_level(&peer).await, ThreatLevel::Critical);
        assert!(auth.is_blocked(&peer).await);
    }

    #[tokio::test]
    async fn validates_signed_requests_end_to_end() {
        use crate::auth::authorizer::RequestAuth;
        use crate::core::types::NodeId;
        use crate::dht::protocol::{NodeInfoWire, RequestBody, RpcRequest};

        let auth = authorizer(RateLimitConfig::default());
        let client_identity = Arc::new(crate::core::identity::NodeIdentity::generate());
        let client = SignatureAuthorizer::new(Arc::clone(&client_identity));

        let mut request = RpcRequest {
            auth: RequestAuth::default(),
            sender: NodeInfoWire {
                peer_id: client_identity.peer_id().to_bytes(),
                node_id: NodeId::generate(client_identity.public_key_bytes()),
                endpoint: "127.0.0.1:0".to_string(),
            },
            body: RequestBody::Ping,
        };
        client.sign_request(&mut request, None).await.unwrap();

        assert!(auth.validate_request(&request).await);
        // The replayed request fails the inner authorizer and is counted as a
        // violation for the peer.
        assert!(!auth.validate_request(&request).await);
        let peer = client_identity.peer_id();
        let st = auth.state.lock().await;
        assert!(st.violations.get(&peer).copied().unwrap_or(0) >= 1);
    }

    #[tokio::test]
    async fn escalation_is_monotonic() {
        let auth = authorizer(RateLimitConfig::default());
        let peer = crate::core::identity::NodeIdentity::generate().peer_id();
        let base = dht_time();
        for i in 0..60 {
            let _ = auth.check_rate_limit_at(peer, base + i as f64 * 0.001).await;
        }
        let peak = auth.threat_level(&peer).await;
        // Calm traffic afterwards never lowers the recorded level.
        let _ = auth.check_rate_limit_at(peer, base + 90_000.0).await;
        assert!(auth.threat_level(&peer).await >= peak);
    }
}
