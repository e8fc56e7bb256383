// SPDX-License-Identifier: MIT OR Apache-2.0
//! Agent identity resolution and trust scoring (C11).
//!
//! The router needs exactly three operations: [`TrustNetwork::resolve`]
//! turns an API key or bare agent-id header into a resolved identity,
//! [`TrustNetwork::record_activity`] folds an invocation outcome into an
//! agent's trust score, and [`TrustNetwork::has_access`] gates confidential
//! capabilities on a trust tier. Everything else (endorsements,
//! violations, registration) exists to keep that score honest.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use cgr_core::TrustLevel;
use serde::{Deserialize, Serialize};

/// Errors raised while registering or looking up an identity.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// `register` was called with an `api_key` already bound to another agent.
    #[error("api key already bound to agent '{0}'")]
    ApiKeyInUse(String),
    /// The referenced agent id has no record.
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),
}

/// What an invocation outcome contributes to an agent's trust record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// A capability invocation completed (successfully or not).
    Invocation,
}

/// `{agent_id, trust_level}` as returned by [`TrustNetwork::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    /// Stable agent identifier.
    pub agent_id: String,
    /// Trust tier at resolution time.
    pub trust_level: TrustLevel,
}

#[derive(Debug, Clone)]
struct AgentRecord {
    baseline_trust_level: TrustLevel,
    endorsements: u32,
    successful_invocations: u64,
    failed_invocations: u64,
    violations: u32,
    capabilities_used: HashSet<String>,
    registered_at: DateTime<Utc>,
    score: f64,
}

impl AgentRecord {
    fn new(baseline_trust_level: TrustLevel) -> Self {
        let score = baseline_for(baseline_trust_level);
        Self {
            baseline_trust_level,
            endorsements: 0,
            successful_invocations: 0,
            failed_invocations: 0,
            violations: 0,
            capabilities_used: HashSet::new(),
            registered_at: Utc::now(),
            score,
        }
    }

    fn recompute_score(&mut self) {
        let baseline = baseline_for(self.baseline_trust_level);
        let endorsement_term = ENDORSEMENT_WEIGHT * f64::from(self.endorsements);
        let success_term = SUCCESS_WEIGHT * (self.successful_invocations as f64).ln_1p();
        let diversity_term = DIVERSITY_WEIGHT * self.capabilities_used.len() as f64;
        let violation_penalty = VIOLATION_PENALTY * f64::from(self.violations);
        self.score = (baseline + endorsement_term + success_term + diversity_term
            - violation_penalty)
            .clamp(0.0, 100.0);
    }

    fn trust_level(&self) -> TrustLevel {
        TrustLevel::from_score(self.score)
    }
}

/// Trust score contribution per endorsement.
const ENDORSEMENT_WEIGHT: f64 = 2.0;
/// Trust score contribution per `ln(1 + successful_invocations)`.
const SUCCESS_WEIGHT: f64 = 4.0;
/// Trust score contribution per distinct capability invoked.
const DIVERSITY_WEIGHT: f64 = 1.0;
/// Trust score penalty per recorded violation.
const VIOLATION_PENALTY: f64 = 15.0;

/// Starting score for a freshly registered agent at `level`, matching the
/// same thresholds [`TrustLevel::from_score`] classifies against.
fn baseline_for(level: TrustLevel) -> f64 {
    match level {
        TrustLevel::Anonymous => 0.0,
        TrustLevel::Verified => 20.0,
        TrustLevel::Trusted => 60.0,
        TrustLevel::Premium => 85.0,
    }
}

/// Point-in-time view of an agent's trust record, for introspection/export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustSnapshot {
    /// Stable agent identifier.
    pub agent_id: String,
    /// Current trust score in `[0, 100]`.
    pub score: f64,
    /// Current trust tier, derived from `score`.
    pub trust_level: TrustLevel,
    /// Endorsements received.
    pub endorsements: u32,
    /// Successful invocations recorded.
    pub successful_invocations: u64,
    /// Failed invocations recorded.
    pub failed_invocations: u64,
    /// Violations recorded.
    pub violations: u32,
    /// Number of distinct capabilities invoked.
    pub capabilities_used: usize,
    /// When the agent was registered.
    pub registered_at: DateTime<Utc>,
}

/// Identity resolution and trust scoring, keyed by agent id with a
/// secondary index from API key to agent id.
pub struct TrustNetwork {
    agents: RwLock<HashMap<String, AgentRecord>>,
    api_keys: RwLock<HashMap<String, String>>,
}

impl TrustNetwork {
    /// Empty network.
    #[must_use]
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            api_keys: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new agent at a baseline trust level, optionally bound to
    /// an API key.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::ApiKeyInUse`] if `api_key` is already bound
    /// to a different agent.
    pub fn register(
        &self,
        agent_id: impl Into<String>,
        api_key: Option<&str>,
        baseline_trust_level: TrustLevel,
    ) -> Result<(), IdentityError> {
        let agent_id = agent_id.into();

        if let Some(key) = api_key {
            let mut keys = self.api_keys.write().unwrap();
            if let Some(existing) = keys.get(key) {
                if existing != &agent_id {
                    return Err(IdentityError::ApiKeyInUse(existing.clone()));
                }
            } else {
                keys.insert(key.to_string(), agent_id.clone());
            }
        }

        self.agents
            .write()
            .unwrap()
            .entry(agent_id)
            .or_insert_with(|| AgentRecord::new(baseline_trust_level));
        Ok(())
    }

    /// Resolve an `api_key` or bare `agent_id_header` to `{agent_id,
    /// trust_level}`. An API key takes precedence when both are supplied.
    /// Returns `None` for an unrecognized credential — the caller of
    /// [`Self::resolve`] treats that as `anonymous`, per spec §4.8 step 1.
    #[must_use]
    pub fn resolve(
        &self,
        api_key: Option<&str>,
        agent_id_header: Option<&str>,
    ) -> Option<ResolvedIdentity> {
        let agent_id = if let Some(key) = api_key {
            self.api_keys.read().unwrap().get(key).cloned()?
        } else {
            agent_id_header?.to_string()
        };

        let agents = self.agents.read().unwrap();
        let record = agents.get(&agent_id)?;
        Some(ResolvedIdentity {
            agent_id,
            trust_level: record.trust_level(),
        })
    }

    /// Fold an invocation outcome into `agent_id`'s trust record: updates
    /// the success/failure counters and capability diversity set, then
    /// recomputes the score. A no-op for an unregistered agent — the
    /// router only calls this for resolved (non-anonymous) callers.
    pub fn record_activity(
        &self,
        agent_id: &str,
        kind: ActivityKind,
        success: bool,
        capability_id: &str,
    ) {
        let ActivityKind::Invocation = kind;
        let mut agents = self.agents.write().unwrap();
        let Some(record) = agents.get_mut(agent_id) else {
            return;
        };
        if success {
            record.successful_invocations += 1;
        } else {
            record.failed_invocations += 1;
        }
        record.capabilities_used.insert(capability_id.to_string());
        record.recompute_score();
    }

    /// Record an endorsement from another agent or an operator, nudging
    /// the score upward.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::UnknownAgent`] if `agent_id` is unregistered.
    pub fn endorse(&self, agent_id: &str) -> Result<(), IdentityError> {
        let mut agents = self.agents.write().unwrap();
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| IdentityError::UnknownAgent(agent_id.to_string()))?;
        record.endorsements += 1;
        record.recompute_score();
        Ok(())
    }

    /// Record a policy violation, penalizing the score.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::UnknownAgent`] if `agent_id` is unregistered.
    pub fn record_violation(&self, agent_id: &str) -> Result<(), IdentityError> {
        let mut agents = self.agents.write().unwrap();
        let record = agents
            .get_mut(agent_id)
            .ok_or_else(|| IdentityError::UnknownAgent(agent_id.to_string()))?;
        record.violations += 1;
        record.recompute_score();
        Ok(())
    }

    /// Whether `agent_id`'s current trust level is at least `tier`.
    /// An unregistered agent never has access to anything above anonymous.
    #[must_use]
    pub fn has_access(&self, agent_id: &str, tier: TrustLevel) -> bool {
        self.agents
            .read()
            .unwrap()
            .get(agent_id)
            .is_some_and(|record| record.trust_level() >= tier)
    }

    /// Snapshot of one agent's trust record, if registered.
    #[must_use]
    pub fn snapshot(&self, agent_id: &str) -> Option<TrustSnapshot> {
        let agents = self.agents.read().unwrap();
        let record = agents.get(agent_id)?;
        Some(TrustSnapshot {
            agent_id: agent_id.to_string(),
            score: record.score,
            trust_level: record.trust_level(),
            endorsements: record.endorsements,
            successful_invocations: record.successful_invocations,
            failed_invocations: record.failed_invocations,
            violations: record.violations,
            capabilities_used: record.capabilities_used.len(),
            registered_at: record.registered_at,
        })
    }
}

impl Default for TrustNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_agent_resolves_to_none() {
        let network = TrustNetwork::new();
        assert!(network.resolve(None, Some("ghost")).is_none());
    }

    #[test]
    fn resolve_by_agent_id_header() {
        let network = TrustNetwork::new();
        network
            .register("agent-1", None, TrustLevel::Anonymous)
            .unwrap();
        let resolved = network.resolve(None, Some("agent-1")).unwrap();
        assert_eq!(resolved.agent_id, "agent-1");
        assert_eq!(resolved.trust_level, TrustLevel::Anonymous);
    }

    #[test]
    fn resolve_by_api_key_takes_precedence() {
        let network = TrustNetwork::new();
        network
            .register("agent-1", Some("key-1"), TrustLevel::Verified)
            .unwrap();
        let resolved = network.resolve(Some("key-1"), Some("agent-2")).unwrap();
        assert_eq!(resolved.agent_id, "agent-1");
    }

    #[test]
    fn duplicate_api_key_for_different_agent_is_rejected() {
        let network = TrustNetwork::new();
        network
            .register("agent-1", Some("key-1"), TrustLevel::Anonymous)
            .unwrap();
        let err = network
            .register("agent-2", Some("key-1"), TrustLevel::Anonymous)
            .unwrap_err();
        assert!(matches!(err, IdentityError::ApiKeyInUse(_)));
    }

    #[test]
    fn baseline_score_matches_registered_level() {
        let network = TrustNetwork::new();
        network
            .register("agent-1", None, TrustLevel::Trusted)
            .unwrap();
        let snapshot = network.snapshot("agent-1").unwrap();
        assert!((snapshot.score - 60.0).abs() < 1e-9);
        assert_eq!(snapshot.trust_level, TrustLevel::Trusted);
    }

    #[test]
    fn successful_invocations_raise_score() {
        let network = TrustNetwork::new();
        network
            .register("agent-1", None, TrustLevel::Anonymous)
            .unwrap();
        for _ in 0..20 {
            network.record_activity("agent-1", ActivityKind::Invocation, true, "cap.a");
        }
        let snapshot = network.snapshot("agent-1").unwrap();
        assert!(snapshot.score > 0.0);
        assert_eq!(snapshot.successful_invocations, 20);
    }

    #[test]
    fn violations_lower_score() {
        let network = TrustNetwork::new();
        network
            .register("agent-1", None, TrustLevel::Trusted)
            .unwrap();
        network.record_violation("agent-1").unwrap();
        let snapshot = network.snapshot("agent-1").unwrap();
        assert!(snapshot.score < 60.0);
    }

    #[test]
    fn endorsements_raise_score_without_invocations() {
        let network = TrustNetwork::new();
        network
            .register("agent-1", None, TrustLevel::Anonymous)
            .unwrap();
        network.endorse("agent-1").unwrap();
        network.endorse("agent-1").unwrap();
        let snapshot = network.snapshot("agent-1").unwrap();
        assert!((snapshot.score - 4.0).abs() < 1e-9);
    }

    #[test]
    fn has_access_respects_tier_ordering() {
        let network = TrustNetwork::new();
        network
            .register("agent-1", None, TrustLevel::Verified)
            .unwrap();
        assert!(network.has_access("agent-1", TrustLevel::Anonymous));
        assert!(network.has_access("agent-1", TrustLevel::Verified));
        assert!(!network.has_access("agent-1", TrustLevel::Trusted));
    }

    #[test]
    fn has_access_denies_unregistered_agent_above_anonymous() {
        let network = TrustNetwork::new();
        assert!(!network.has_access("ghost", TrustLevel::Verified));
    }

    #[test]
    fn capability_diversity_contributes_to_score() {
        let network = TrustNetwork::new();
        network
            .register("agent-1", None, TrustLevel::Anonymous)
            .unwrap();
        network.record_activity("agent-1", ActivityKind::Invocation, true, "cap.a");
        network.record_activity("agent-1", ActivityKind::Invocation, true, "cap.b");
        network.record_activity("agent-1", ActivityKind::Invocation, true, "cap.a");
        let snapshot = network.snapshot("agent-1").unwrap();
        assert_eq!(snapshot.capabilities_used, 2);
    }

    #[test]
    fn record_activity_on_unknown_agent_is_a_no_op() {
        let network = TrustNetwork::new();
        network.record_activity("ghost", ActivityKind::Invocation, true, "cap.a");
        assert!(network.snapshot("ghost").is_none());
    }

    #[test]
    fn score_never_exceeds_bounds() {
        let network = TrustNetwork::new();
        network
            .register("agent-1", None, TrustLevel::Premium)
            .unwrap();
        for _ in 0..1000 {
            network.endorse("agent-1").unwrap();
        }
        let snapshot = network.snapshot("agent-1").unwrap();
        assert!(snapshot.score <= 100.0);
    }
}
