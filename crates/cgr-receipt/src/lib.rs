// SPDX-License-Identifier: MIT OR Apache-2.0
//! Receipt canonicalization, content hashing, and offline verification (C9,
//! receipt half).
//!
//! A [`Receipt`] is the verifiable, content-hashed record of one
//! invocation: `inputs_hash`/`outputs_hash` are SHA-256 digests of the
//! **canonical** JSON encoding of the original inputs/outputs (sorted
//! keys, no insignificant whitespace), and `receipt_id` is
//! `sha256(receipt_canonical)[:16]` — the canonical form of the receipt
//! itself with `receipt_id` nulled out, so the id does not depend on
//! itself. Signing is optional per spec §4.9/§9; this crate only commits
//! to the content hash. [`verify`] re-canonicalizes supplied materials and
//! compares hashes, exactly as an offline verifier would.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod builder;

pub use builder::ReceiptBuilder;

use chrono::{DateTime, Utc};
use cgr_core::{canonical_json, sha256_hex, CoreError, ExecutionMode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Errors raised while hashing or canonicalizing receipt materials.
#[derive(Debug, thiserror::Error)]
pub enum ReceiptError {
    /// A value could not be canonicalized to JSON.
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Immutable, content-hashed record of one capability invocation.
///
/// Matches spec §3's Receipt shape, plus `cache_hit` and `partial_outputs`
/// — both named explicitly by spec §4.8's tie-break rules even though §3's
/// field list omits them (see `DESIGN.md`'s open-question notes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    /// `sha256(receipt_canonical)[:16]`, computed with this field null.
    pub receipt_id: String,
    /// Capability invoked.
    pub capability_id: String,
    /// `sha256(canonical_json(inputs))`.
    pub inputs_hash: String,
    /// `sha256(canonical_json(outputs))`. Computed over the empty object
    /// when the invocation failed and produced no outputs.
    pub outputs_hash: String,
    /// Executor that served the request, or that was selected before failing.
    pub executor_id: String,
    /// Public or confidential, echoing the descriptor's execution mode.
    pub privacy_level: ExecutionMode,
    /// Wall-clock execution time, excluding queue wait.
    pub duration_ms: u64,
    /// Whether the invocation succeeded.
    pub success: bool,
    /// Opaque proof blob, present when the executor attached one. Reused
    /// verbatim on cache-hit receipts per spec §4.8.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<serde_json::Value>,
    /// Actual cost charged.
    pub cost_actual: f64,
    /// Resolved caller identity, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// When the receipt was emitted.
    pub timestamp: DateTime<Utc>,
    /// Whether this invocation was served from cache.
    pub cache_hit: bool,
    /// Retained for post-hoc debugging when the executor returned both an
    /// error and partial outputs; never surfaced in the reply body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_outputs: Option<serde_json::Value>,
}

/// Compute `sha256(canonical_json(value))`.
///
/// # Errors
///
/// Returns [`ReceiptError`] if `value` cannot be canonicalized.
pub fn hash_value(value: &serde_json::Value) -> Result<String, ReceiptError> {
    Ok(sha256_hex(canonical_json(value)?.as_bytes()))
}

/// Canonical JSON form of a receipt, with `receipt_id` forced to an empty
/// string so the encoding does not depend on the id it is used to derive.
///
/// # Errors
///
/// Returns [`ReceiptError`] if the receipt cannot be serialized.
pub fn canonicalize(receipt: &Receipt) -> Result<String, ReceiptError> {
    let mut value = serde_json::to_value(receipt).map_err(CoreError::Json)?;
    if let serde_json::Value::Object(map) = &mut value {
        map.insert(
            "receipt_id".to_string(),
            serde_json::Value::String(String::new()),
        );
    }
    Ok(serde_json::to_string(&value).map_err(CoreError::Json)?)
}

/// Compute the 16-hex-character receipt id: the first 16 characters of
/// `sha256(canonicalize(receipt))`.
///
/// # Errors
///
/// Returns [`ReceiptError`] if the receipt cannot be canonicalized.
pub fn compute_receipt_id(receipt: &Receipt) -> Result<String, ReceiptError> {
    let canonical = canonicalize(receipt)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    Ok(digest[..16].to_string())
}

/// Outcome of [`verify`]: which parts of a receipt could be independently
/// recomputed and whether they matched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VerifyReport {
    /// Whether `receipt_id` matches the recomputed content hash.
    pub receipt_id_valid: bool,
    /// Whether the supplied original inputs hash to `inputs_hash`, if supplied.
    pub inputs_hash_valid: Option<bool>,
    /// Whether the supplied original outputs hash to `outputs_hash`, if supplied.
    pub outputs_hash_valid: Option<bool>,
}

impl VerifyReport {
    /// `true` only if every check that was performed passed.
    #[must_use]
    pub fn all_valid(&self) -> bool {
        self.receipt_id_valid
            && self.inputs_hash_valid.unwrap_or(true)
            && self.outputs_hash_valid.unwrap_or(true)
    }
}

/// Verify a receipt's `receipt_id`, and optionally its `inputs_hash` /
/// `outputs_hash` against supplied original materials.
///
/// Re-canonicalizes whichever materials are supplied and compares hashes;
/// this is the offline verification path a third party (no access to the
/// router's internal state) would use. If the receipt carries a signature
/// in `proof`, a caller performing signature verification on top of this
/// should use [`constant_time_eq`] for the comparison.
#[must_use]
pub fn verify(
    receipt: &Receipt,
    inputs: Option<&serde_json::Value>,
    outputs: Option<&serde_json::Value>,
) -> VerifyReport {
    let receipt_id_valid = compute_receipt_id(receipt)
        .map(|recomputed| constant_time_eq(recomputed.as_bytes(), receipt.receipt_id.as_bytes()))
        .unwrap_or(false);

    let inputs_hash_valid = inputs.map(|v| {
        hash_value(v)
            .map(|h| constant_time_eq(h.as_bytes(), receipt.inputs_hash.as_bytes()))
            .unwrap_or(false)
    });
    let outputs_hash_valid = outputs.map(|v| {
        hash_value(v)
            .map(|h| constant_time_eq(h.as_bytes(), receipt.outputs_hash.as_bytes()))
            .unwrap_or(false)
    });

    VerifyReport {
        receipt_id_valid,
        inputs_hash_valid,
        outputs_hash_valid,
    }
}

/// Constant-time byte comparison, for use when verifying an optional
/// signature attached to a receipt's `proof`. Unequal lengths short-circuit
/// (length is not considered secret here — only content is).
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
