// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fluent builder for constructing [`Receipt`]s.

use chrono::Utc;
use cgr_core::ExecutionMode;

use crate::{compute_receipt_id, Receipt};

/// Fluent builder for constructing [`Receipt`]s ergonomically.
///
/// # Examples
///
/// ```
/// use cgr_receipt::ReceiptBuilder;
///
/// let receipt = ReceiptBuilder::new("cap.example.v1", "public-executor")
///     .success(true)
///     .build();
///
/// assert_eq!(receipt.capability_id, "cap.example.v1");
/// assert!(receipt.success);
/// ```
#[derive(Debug, Clone)]
pub struct ReceiptBuilder {
    capability_id: String,
    inputs_hash: String,
    outputs_hash: String,
    executor_id: String,
    privacy_level: ExecutionMode,
    duration_ms: u64,
    success: bool,
    proof: Option<serde_json::Value>,
    cost_actual: f64,
    agent_id: Option<String>,
    cache_hit: bool,
    partial_outputs: Option<serde_json::Value>,
}

impl ReceiptBuilder {
    /// Start building a receipt for `capability_id`, served by `executor_id`.
    #[must_use]
    pub fn new(capability_id: impl Into<String>, executor_id: impl Into<String>) -> Self {
        Self {
            capability_id: capability_id.into(),
            inputs_hash: String::new(),
            outputs_hash: String::new(),
            executor_id: executor_id.into(),
            privacy_level: ExecutionMode::Public,
            duration_ms: 0,
            success: false,
            proof: None,
            cost_actual: 0.0,
            agent_id: None,
            cache_hit: false,
            partial_outputs: None,
        }
    }

    /// Set the inputs hash, normally produced by [`crate::hash_value`].
    #[must_use]
    pub fn inputs_hash(mut self, hash: impl Into<String>) -> Self {
        self.inputs_hash = hash.into();
        self
    }

    /// Set the outputs hash, normally produced by [`crate::hash_value`].
    #[must_use]
    pub fn outputs_hash(mut self, hash: impl Into<String>) -> Self {
        self.outputs_hash = hash.into();
        self
    }

    /// Set the descriptor's execution mode.
    #[must_use]
    pub fn privacy_level(mut self, mode: ExecutionMode) -> Self {
        self.privacy_level = mode;
        self
    }

    /// Set measured execution duration.
    #[must_use]
    pub fn duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Mark the invocation as succeeded or failed.
    #[must_use]
    pub fn success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    /// Attach an executor-provided proof blob.
    #[must_use]
    pub fn proof(mut self, proof: Option<serde_json::Value>) -> Self {
        self.proof = proof;
        self
    }

    /// Set actual cost charged.
    #[must_use]
    pub fn cost_actual(mut self, cost_actual: f64) -> Self {
        self.cost_actual = cost_actual;
        self
    }

    /// Attach the resolved caller identity.
    #[must_use]
    pub fn agent_id(mut self, agent_id: Option<String>) -> Self {
        self.agent_id = agent_id;
        self
    }

    /// Mark this receipt as served from cache.
    #[must_use]
    pub fn cache_hit(mut self, cache_hit: bool) -> Self {
        self.cache_hit = cache_hit;
        self
    }

    /// Retain partial outputs from a failed invocation, for debugging only.
    #[must_use]
    pub fn partial_outputs(mut self, partial_outputs: Option<serde_json::Value>) -> Self {
        self.partial_outputs = partial_outputs;
        self
    }

    /// Assemble the receipt and compute its content-hashed `receipt_id`.
    #[must_use]
    pub fn build(self) -> Receipt {
        let mut receipt = Receipt {
            receipt_id: String::new(),
            capability_id: self.capability_id,
            inputs_hash: self.inputs_hash,
            outputs_hash: self.outputs_hash,
            executor_id: self.executor_id,
            privacy_level: self.privacy_level,
            duration_ms: self.duration_ms,
            success: self.success,
            proof: self.proof,
            cost_actual: self.cost_actual,
            agent_id: self.agent_id,
            timestamp: Utc::now(),
            cache_hit: self.cache_hit,
            partial_outputs: self.partial_outputs,
        };
        // Only fails if the receipt can't serialize, which can't happen for
        // a type made entirely of plain data.
        receipt.receipt_id = compute_receipt_id(&receipt).unwrap_or_default();
        receipt
    }
}
