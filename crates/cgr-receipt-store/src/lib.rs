// SPDX-License-Identifier: MIT OR Apache-2.0
//! Usage metadata stream and reputation scoring (C9, usage half).
//!
//! [`UsageMeta`] is the detached, lighter-weight sibling of a receipt:
//! no inputs/outputs hashes, just enough to drive reputation and
//! analytics. [`EwmaReputationScorer`] is the default consumer of that
//! stream — one EWMA score per capability, exportable as a base64 blob so
//! agents can exchange reputations peer-to-peer without a shared store.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::sync::RwLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use cgr_core::ExecutionMode;
use serde::{Deserialize, Serialize};

/// Errors raised while exporting or merging reputation scores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The exported blob was not valid base64.
    #[error("invalid reputation export: {0}")]
    Base64(#[from] base64::DecodeError),
    /// The decoded blob was not valid JSON.
    #[error("invalid reputation export: {0}")]
    Json(#[from] serde_json::Error),
}

/// Detached usage record emitted once per invocation, per spec §4.9.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageMeta {
    /// Capability invoked.
    pub capability_id: String,
    /// Whether the invocation succeeded.
    pub success: bool,
    /// Wall-clock execution time.
    pub latency_ms: u64,
    /// Executor that served the request.
    pub executor_id: String,
    /// Public or confidential.
    pub privacy_level: ExecutionMode,
    /// Type of proof attached, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof_type: Option<String>,
    /// Actual cost charged.
    pub cost: f64,
    /// When the invocation completed.
    pub timestamp: DateTime<Utc>,
    /// Resolved caller identity, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// A pluggable consumer of the usage metadata stream that scores
/// capability reliability.
pub trait ReputationScorer: Send + Sync {
    /// Fold one usage record into the running score for its capability.
    fn record(&self, usage: &UsageMeta);

    /// Current score for `capability_id`, or `None` if never recorded.
    fn score(&self, capability_id: &str) -> Option<f64>;
}

/// EWMA reputation scorer: `score' = alpha * signal + (1 - alpha) * score`,
/// where `signal` is 1 on success and 0 on failure. Seeded at the first
/// observed signal for a capability rather than an arbitrary prior.
pub struct EwmaReputationScorer {
    alpha: f64,
    scores: RwLock<BTreeMap<String, f64>>,
}

impl EwmaReputationScorer {
    /// Default smoothing factor per spec §4.9.
    pub const DEFAULT_ALPHA: f64 = 0.1;

    /// Create a scorer with the default smoothing factor.
    #[must_use]
    pub fn new() -> Self {
        Self::with_alpha(Self::DEFAULT_ALPHA)
    }

    /// Create a scorer with a custom smoothing factor in `(0.0, 1.0]`.
    #[must_use]
    pub fn with_alpha(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(f64::MIN_POSITIVE, 1.0),
            scores: RwLock::new(BTreeMap::new()),
        }
    }

    /// Snapshot of every tracked capability's current score.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.scores.read().unwrap().clone()
    }

    /// Serialize the current score table as a base64-encoded JSON blob,
    /// suitable for peer-to-peer exchange.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the score table cannot be serialized.
    pub fn export(&self) -> Result<String, StoreError> {
        let scores = self.scores.read().unwrap();
        let json = serde_json::to_vec(&*scores)?;
        Ok(BASE64.encode(json))
    }

    /// Merge a remote export into the local score table with a weighted
    /// average: `local' = weight * remote + (1 - weight) * local`. A
    /// capability only known locally, or only known remotely, is taken
    /// as-is rather than blended against a fabricated counterpart.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if `blob` is not a valid export produced by
    /// [`EwmaReputationScorer::export`].
    pub fn merge(&self, blob: &str, weight: f64) -> Result<(), StoreError> {
        let weight = weight.clamp(0.0, 1.0);
        let bytes = BASE64.decode(blob)?;
        let remote: BTreeMap<String, f64> = serde_json::from_slice(&bytes)?;
        let mut scores = self.scores.write().unwrap();
        for (capability_id, remote_score) in remote {
            scores
                .entry(capability_id)
                .and_modify(|local| *local = weight * remote_score + (1.0 - weight) * *local)
                .or_insert(remote_score);
        }
        Ok(())
    }
}

impl Default for EwmaReputationScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReputationScorer for EwmaReputationScorer {
    fn record(&self, usage: &UsageMeta) {
        let signal = if usage.success { 1.0 } else { 0.0 };
        let mut scores = self.scores.write().unwrap();
        scores
            .entry(usage.capability_id.clone())
            .and_modify(|score| *score = self.alpha * signal + (1.0 - self.alpha) * *score)
            .or_insert(signal);
        tracing::info!(
            capability_id = %usage.capability_id,
            success = usage.success,
            latency_ms = usage.latency_ms,
            "usage recorded"
        );
    }

    fn score(&self, capability_id: &str) -> Option<f64> {
        self.scores.read().unwrap().get(capability_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(capability_id: &str, success: bool) -> UsageMeta {
        UsageMeta {
            capability_id: capability_id.to_string(),
            success,
            latency_ms: 10,
            executor_id: "public-executor".to_string(),
            privacy_level: ExecutionMode::Public,
            proof_type: None,
            cost: 0.001,
            timestamp: Utc::now(),
            agent_id: None,
        }
    }

    #[test]
    fn first_record_seeds_the_score() {
        let scorer = EwmaReputationScorer::new();
        scorer.record(&usage("cap.a", true));
        assert_eq!(scorer.score("cap.a"), Some(1.0));
    }

    #[test]
    fn ewma_moves_toward_new_signal() {
        let scorer = EwmaReputationScorer::with_alpha(0.1);
        scorer.record(&usage("cap.a", true));
        scorer.record(&usage("cap.a", false));
        let score = scorer.score("cap.a").unwrap();
        assert!((score - 0.9).abs() < 1e-9, "got {score}");
    }

    #[test]
    fn unknown_capability_has_no_score() {
        let scorer = EwmaReputationScorer::new();
        assert_eq!(scorer.score("cap.ghost"), None);
    }

    #[test]
    fn export_and_merge_round_trip() {
        let a = EwmaReputationScorer::new();
        a.record(&usage("cap.a", true));
        let blob = a.export().unwrap();

        let b = EwmaReputationScorer::new();
        b.merge(&blob, 1.0).unwrap();
        assert_eq!(b.score("cap.a"), Some(1.0));
    }

    #[test]
    fn merge_blends_with_existing_score() {
        let local = EwmaReputationScorer::new();
        local.record(&usage("cap.a", false));
        assert_eq!(local.score("cap.a"), Some(0.0));

        let remote = EwmaReputationScorer::new();
        remote.record(&usage("cap.a", true));
        let blob = remote.export().unwrap();

        local.merge(&blob, 0.5).unwrap();
        let score = local.score("cap.a").unwrap();
        assert!((score - 0.5).abs() < 1e-9, "got {score}");
    }

    #[test]
    fn merge_rejects_invalid_base64() {
        let scorer = EwmaReputationScorer::new();
        let err = scorer.merge("not base64 at all!!", 1.0).unwrap_err();
        assert!(matches!(err, StoreError::Base64(_)));
    }
}
