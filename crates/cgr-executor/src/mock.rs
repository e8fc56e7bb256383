//! Mock executors used by tests and local development.

use async_trait::async_trait;
use cgr_core::CapabilityDescriptor;
use cgr_error::GatewayError;

use crate::{Executor, ExecutorOutput};

/// Deterministic public executor: echoes inputs back under an `echo` key
/// and charges the descriptor's cost hint.
#[derive(Debug, Clone)]
pub struct MockPublicExecutor {
    id: String,
    pub(crate) declared: Vec<String>,
}

impl MockPublicExecutor {
    /// Create a mock public executor with no declared capability set
    /// (only reachable via hint or public fallback).
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            declared: Vec::new(),
        }
    }
}

#[async_trait]
impl Executor for MockPublicExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    fn declared_capabilities(&self) -> &[String] {
        &self.declared
    }

    async fn execute(
        &self,
        descriptor: &CapabilityDescriptor,
        inputs: serde_json::Value,
    ) -> Result<ExecutorOutput, GatewayError> {
        Ok(ExecutorOutput {
            outputs: serde_json::json!({ "echo": inputs }),
            cost_actual: descriptor.economics.cost_hint,
            proof: None,
            executor_id: self.id.clone(),
        })
    }
}

/// Deterministic confidential-capable executor for declared capability ids.
#[derive(Debug, Clone)]
pub struct MockConfidentialExecutor {
    id: String,
    declared: Vec<String>,
}

impl MockConfidentialExecutor {
    /// Create a mock confidential executor serving exactly `declared`.
    #[must_use]
    pub fn new(id: impl Into<String>, declared: Vec<String>) -> Self {
        Self {
            id: id.into(),
            declared,
        }
    }
}

#[async_trait]
impl Executor for MockConfidentialExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_confidential_capable(&self) -> bool {
        true
    }

    fn declared_capabilities(&self) -> &[String] {
        &self.declared
    }

    async fn execute(
        &self,
        descriptor: &CapabilityDescriptor,
        inputs: serde_json::Value,
    ) -> Result<ExecutorOutput, GatewayError> {
        let proof_type = descriptor.execution.proof_type.clone();
        Ok(ExecutorOutput {
            outputs: serde_json::json!({ "echo": inputs, "confidential": true }),
            cost_actual: descriptor.economics.cost_hint,
            proof: proof_type.map(|t| serde_json::json!({ "type": t, "blob": "mock-proof" })),
            executor_id: self.id.clone(),
        })
    }
}
