// SPDX-License-Identifier: MIT OR Apache-2.0
//! cgr-core
//!
//! Stable domain types shared by every crate in the capability routing
//! gateway: the capability descriptor, invocation request/result shapes,
//! priority levels, and the canonical-JSON hashing helpers used to build
//! verifiable receipts.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Errors raised by the canonicalization and hashing helpers in this crate.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A value could not be serialized to JSON.
    #[error("json encode/decode failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Execution mode of a capability's backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Any registered executor, including third-party ones, may serve it.
    Public,
    /// Only an executor declared confidential-capable may serve it.
    Confidential,
}

/// Relative latency class used to derive a default execution deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LatencyHint {
    /// Default timeout 2 seconds.
    Low,
    /// Default timeout 10 seconds.
    Medium,
    /// Default timeout 60 seconds.
    High,
}

impl LatencyHint {
    /// The default per-invocation deadline implied by this hint.
    #[must_use]
    pub fn default_timeout(self) -> std::time::Duration {
        match self {
            LatencyHint::Low => std::time::Duration::from_secs(2),
            LatencyHint::Medium => std::time::Duration::from_secs(10),
            LatencyHint::High => std::time::Duration::from_secs(60),
        }
    }
}

/// Payment-signal sub-block of a descriptor's economics section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
pub struct PaymentSignal {
    /// Whether this capability can advertise a payment requirement at all.
    pub enabled: bool,
    /// Accepted settlement methods, e.g. `"x402"`, `"invoice"`.
    pub methods: Vec<String>,
    /// Whether settlement is optional (capability still runs without it).
    pub settlement_optional: bool,
}

/// Economics metadata of a capability descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
pub struct Economics {
    /// Indicative cost in `currency`, not a binding quote.
    pub cost_hint: f64,
    /// ISO 4217 code or token symbol the cost hint is denominated in.
    pub currency: String,
    /// Payment-signal configuration.
    pub payment_signal: PaymentSignal,
}

/// Performance metadata of a capability descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Performance {
    /// Coarse latency bucket used for default deadlines.
    pub latency_hint: LatencyHint,
    /// Historical or asserted reliability in `[0, 1]`.
    pub reliability_hint: f64,
    /// Maximum sustained requests per second the backend claims to support.
    pub throughput_limit: Option<u32>,
}

/// Execution metadata of a capability descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionSpec {
    /// Public or confidential.
    pub mode: ExecutionMode,
    /// Explicit executor id to prefer, bypassing descriptor-set matching.
    pub executor_hint: Option<String>,
    /// Type of proof the executor is expected to attach, if any.
    pub proof_type: Option<String>,
}

/// Free-form descriptor metadata: tags, provider hints, deprecation flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
pub struct DescriptorMetadata {
    /// Tags used by registry filtering and summaries.
    pub tags: Vec<String>,
    /// Opaque hints about the providers able to serve this capability.
    pub provider_hints: Vec<String>,
}

/// Immutable capability descriptor.
///
/// IDs MUST match `^cap\.[a-z0-9._-]+\.v\d+$`. Descriptors are registered
/// once at startup and never mutated; supersession means registering a new
/// id with a higher version suffix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CapabilityDescriptor {
    /// Lowercase dotted id, e.g. `cap.price.lookup.v1`.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Semantic version string of the capability contract.
    pub version: String,
    /// JSON Schema describing accepted inputs.
    pub inputs_schema: serde_json::Value,
    /// JSON Schema describing returned outputs.
    pub outputs_schema: serde_json::Value,
    /// Execution mode and hints.
    pub execution: ExecutionSpec,
    /// Cost and payment metadata.
    pub economics: Economics,
    /// Latency/reliability/throughput metadata.
    pub performance: Performance,
    /// Whether this capability may appear as a step in a `compose` request.
    pub composable: bool,
    /// Tags and provider hints.
    pub metadata: DescriptorMetadata,
    /// Whether this capability is deprecated (still served, with a warning).
    pub deprecated: bool,
}

/// Regex-free validity check for the capability id shape required by the wire format.
#[must_use]
pub fn is_valid_capability_id(id: &str) -> bool {
    let Some(rest) = id.strip_prefix("cap.") else {
        return false;
    };
    let Some((body, version)) = rest.rsplit_once('.') else {
        return false;
    };
    if !version.starts_with('v')
        || version.len() < 2
        || !version[1..].chars().all(|c| c.is_ascii_digit())
    {
        return false;
    }
    !body.is_empty()
        && body
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
}

/// Discrete trust tier assigned to a caller identity.
///
/// Determines the per-identity rate-limit ceiling and cost multiplier
/// (`cgr-ratelimit`) and gates access to confidential capabilities
/// (`cgr-identity`). Ordered `Anonymous < Verified < Trusted < Premium`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// No resolved identity, or a score below the `verified` threshold.
    #[default]
    Anonymous,
    /// Score `>= 20`.
    Verified,
    /// Score `>= 60`.
    Trusted,
    /// Score `>= 85`.
    Premium,
}

impl TrustLevel {
    /// Classify a `[0, 100]` trust score into a level per spec §4.11's
    /// default thresholds: newcomer < 20, verified >= 20, trusted >= 60,
    /// premium >= 85.
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score >= 85.0 {
            TrustLevel::Premium
        } else if score >= 60.0 {
            TrustLevel::Trusted
        } else if score >= 20.0 {
            TrustLevel::Verified
        } else {
            TrustLevel::Anonymous
        }
    }

    /// Stable machine-readable tag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TrustLevel::Anonymous => "anonymous",
            TrustLevel::Verified => "verified",
            TrustLevel::Trusted => "trusted",
            TrustLevel::Premium => "premium",
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority level of an invocation request. Ordered `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Lowest priority; default per-level concurrency 4.
    Low,
    /// Default priority; default per-level concurrency 32.
    #[default]
    Normal,
    /// Elevated priority; default per-level concurrency 8.
    High,
    /// Highest priority; default per-level concurrency 16.
    Critical,
}

/// Caller-supplied invocation request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InvocationRequest {
    /// Id of the capability to invoke.
    pub capability_id: String,
    /// Free-form input map, validated against the descriptor's schema by the router.
    pub inputs: serde_json::Value,
    /// Optional executor/caching preferences.
    #[serde(default)]
    pub preferences: serde_json::Value,
    /// Caller identity, if resolved by transport (API key, agent id header).
    #[serde(default)]
    pub caller_identity: Option<String>,
    /// Queueing priority; defaults to `Normal`.
    #[serde(default)]
    pub priority: Priority,
    /// Caller-supplied dedup key; derived from canonical inputs when absent.
    #[serde(default)]
    pub dedup_key: Option<String>,
    /// Skip the cache probe for this request.
    #[serde(default)]
    pub no_cache: bool,
}

/// Outcome of a single invocation, as returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InvocationResult {
    /// Whether the invocation succeeded.
    pub success: bool,
    /// Outputs, present only on success (partial outputs on failure are not surfaced here).
    pub outputs: Option<serde_json::Value>,
    /// Classified error, present only on failure.
    pub error: Option<InvocationErrorView>,
    /// The receipt emitted for this invocation.
    pub receipt: serde_json::Value,
    /// Actual cost charged by the executor.
    pub cost_actual: f64,
    /// Wall-clock execution time in milliseconds (excludes queue wait).
    pub execution_ms: u64,
}

/// Minimal, wire-serializable view of an error attached to an [`InvocationResult`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InvocationErrorView {
    /// Canonical error kind, see `cgr-error`.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Structured details.
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Per-in-flight-request observability record. Retained only in ring buffers.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InvocationRecord {
    /// Opaque, time-ordered request id.
    pub request_id: Uuid,
    /// Capability invoked.
    pub capability_id: String,
    /// Resolved caller identity (or `"anonymous"`).
    pub caller_identity: String,
    /// When admission began.
    pub started_at: DateTime<Utc>,
    /// Whether the result was served from cache.
    pub cache_hit: bool,
    /// Time spent waiting in the queue, in milliseconds.
    pub queue_wait_ms: u64,
    /// Time spent executing, in milliseconds.
    pub execution_ms: u64,
    /// Executor that served the request, if any was reached.
    pub executor_id: Option<String>,
    /// Whether the invocation succeeded.
    pub success: bool,
    /// Classified error kind, if it failed.
    pub error_kind: Option<String>,
    /// Actual cost charged.
    pub cost_actual: f64,
}

/// Produce a deterministic JSON string for hashing: lexicographically
/// sorted object keys (guaranteed by `serde_json::Value`'s `BTreeMap`
/// backing) and no insignificant whitespace.
///
/// # Errors
///
/// Returns [`CoreError::Json`] if `value` cannot be serialized.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, CoreError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Compute the content-derived dedup/inflight key for a capability invocation:
/// `sha256(capability_id || canonical_inputs_json)`.
///
/// # Errors
///
/// Returns [`CoreError::Json`] if `inputs` cannot be canonicalized.
pub fn inflight_key(capability_id: &str, inputs: &serde_json::Value) -> Result<String, CoreError> {
    let canonical = canonical_json(inputs)?;
    let mut buf = Vec::with_capacity(capability_id.len() + canonical.len());
    buf.extend_from_slice(capability_id.as_bytes());
    buf.extend_from_slice(canonical.as_bytes());
    Ok(sha256_hex(&buf))
}

/// Cell kept per capability in the metrics/circuit/cache/registry subsystems,
/// keyed by descriptor id.
pub type ById<T> = BTreeMap<String, T>;
