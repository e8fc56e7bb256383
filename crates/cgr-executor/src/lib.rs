// SPDX-License-Identifier: MIT OR Apache-2.0
//! Executor trait and selection logic (C7).
//!
//! An [`Executor`] performs the work of one or more capability ids. The
//! [`ExecutorRegistry`] picks which one serves a given invocation: an
//! explicit `executor_hint` wins outright, then the first registered
//! executor whose declared set contains the capability id, then
//! `public-executor` as a last resort — but only for capabilities whose
//! [`ExecutionMode`](cgr_core::ExecutionMode) is `Public`. A confidential
//! capability with no confidential-capable executor fails closed.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod mock;

pub use mock::{MockConfidentialExecutor, MockPublicExecutor};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cgr_core::{CapabilityDescriptor, ExecutionMode};
use cgr_error::GatewayError;

/// Output of a successful execution.
#[derive(Debug, Clone)]
pub struct ExecutorOutput {
    /// Capability outputs, validated by the router against the descriptor's schema.
    pub outputs: serde_json::Value,
    /// Actual cost charged for this invocation.
    pub cost_actual: f64,
    /// Opaque proof blob, present when the descriptor requested one.
    pub proof: Option<serde_json::Value>,
    /// Id of the executor that served the request.
    pub executor_id: String,
}

/// A pluggable backend capable of serving some set of capability ids.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Stable id used for `executor_hint` matching and receipts.
    fn id(&self) -> &str;

    /// Whether this executor is permitted to serve confidential capabilities.
    fn is_confidential_capable(&self) -> bool {
        false
    }

    /// Capability ids this executor declares it can serve. An empty set
    /// means "matches nothing by declaration" — the executor can still be
    /// reached via `executor_hint` or as the public fallback.
    fn declared_capabilities(&self) -> &[String];

    /// Execute one invocation. `inputs` have already been schema-validated
    /// by the router. Implementations should respect cancellation by
    /// racing their work against `cancelled`.
    async fn execute(
        &self,
        descriptor: &CapabilityDescriptor,
        inputs: serde_json::Value,
    ) -> Result<ExecutorOutput, GatewayError>;
}

/// Holds registered executors and implements the selection order from
/// spec §4.7: hint, then declared-set match, then public fallback.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: Vec<Arc<dyn Executor>>,
    by_id: HashMap<String, usize>,
}

impl ExecutorRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor. Later registrations with a duplicate id
    /// replace earlier ones.
    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        let id = executor.id().to_string();
        if let Some(&idx) = self.by_id.get(&id) {
            self.executors[idx] = executor;
        } else {
            self.by_id.insert(id, self.executors.len());
            self.executors.push(executor);
        }
    }

    /// Select the executor that should serve `descriptor`, honoring an
    /// optional `executor_hint` from the request's execution preferences.
    ///
    /// Returns `ServiceUnavailable` if no eligible executor exists, and
    /// refuses to route a confidential descriptor to any executor that
    /// isn't confidential-capable even via an explicit hint.
    pub fn select(
        &self,
        descriptor: &CapabilityDescriptor,
        executor_hint: Option<&str>,
    ) -> Result<Arc<dyn Executor>, GatewayError> {
        let confidential = descriptor.execution.mode == ExecutionMode::Confidential;

        if let Some(hint) = executor_hint {
            if let Some(&idx) = self.by_id.get(hint) {
                let candidate = &self.executors[idx];
                if confidential && !candidate.is_confidential_capable() {
                    return Err(GatewayError::service_unavailable(format!(
                        "executor_hint '{hint}' is not confidential-capable for {}",
                        descriptor.id
                    )));
                }
                return Ok(candidate.clone());
            }
            return Err(GatewayError::service_unavailable(format!(
                "executor_hint '{hint}' is not registered"
            )));
        }

        for candidate in &self.executors {
            if confidential && !candidate.is_confidential_capable() {
                continue;
            }
            if candidate
                .declared_capabilities()
                .iter()
                .any(|id| id == &descriptor.id)
            {
                return Ok(candidate.clone());
            }
        }

        if !confidential {
            if let Some(&idx) = self.by_id.get("public-executor") {
                return Ok(self.executors[idx].clone());
            }
        }

        Err(GatewayError::service_unavailable(format!(
            "no eligible executor for {}",
            descriptor.id
        )))
    }

    /// Number of registered executors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.executors.len()
    }

    /// Whether no executors are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgr_core::{DescriptorMetadata, Economics, ExecutionSpec, LatencyHint, Performance};

    fn descriptor(id: &str, mode: ExecutionMode) -> CapabilityDescriptor {
        CapabilityDescriptor {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            version: "1.0.0".to_string(),
            inputs_schema: serde_json::json!({}),
            outputs_schema: serde_json::json!({}),
            execution: ExecutionSpec {
                mode,
                executor_hint: None,
                proof_type: None,
            },
            economics: Economics::default(),
            performance: Performance {
                latency_hint: LatencyHint::Low,
                reliability_hint: 1.0,
                throughput_limit: None,
            },
            composable: true,
            metadata: DescriptorMetadata::default(),
            deprecated: false,
        }
    }

    #[tokio::test]
    async fn falls_back_to_public_executor_for_public_capability() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(MockPublicExecutor::new("public-executor")));
        let desc = descriptor("cap.example.v1", ExecutionMode::Public);
        let chosen = registry.select(&desc, None).unwrap();
        assert_eq!(chosen.id(), "public-executor");
    }

    #[tokio::test]
    async fn confidential_capability_never_routes_to_public_executor() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(MockPublicExecutor::new("public-executor")));
        let desc = descriptor("cap.example.v1", ExecutionMode::Confidential);
        let err = registry.select(&desc, None).unwrap_err();
        assert_eq!(err.kind, cgr_error::ErrorKind::ServiceUnavailable);
    }

    #[tokio::test]
    async fn confidential_capability_routes_to_confidential_executor() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(MockPublicExecutor::new("public-executor")));
        registry.register(Arc::new(MockConfidentialExecutor::new(
            "secure-enclave",
            vec!["cap.example.v1".to_string()],
        )));
        let desc = descriptor("cap.example.v1", ExecutionMode::Confidential);
        let chosen = registry.select(&desc, None).unwrap();
        assert_eq!(chosen.id(), "secure-enclave");
    }

    #[tokio::test]
    async fn explicit_hint_wins_over_declared_set_match() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(MockPublicExecutor::new("public-executor")));
        registry.register(Arc::new(MockConfidentialExecutor::new(
            "alt",
            vec!["cap.example.v1".to_string()],
        )));
        let desc = descriptor("cap.example.v1", ExecutionMode::Public);
        let chosen = registry.select(&desc, Some("public-executor")).unwrap();
        assert_eq!(chosen.id(), "public-executor");
    }

    #[tokio::test]
    async fn unknown_hint_is_service_unavailable() {
        let registry = ExecutorRegistry::new();
        let desc = descriptor("cap.example.v1", ExecutionMode::Public);
        let err = registry.select(&desc, Some("ghost")).unwrap_err();
        assert_eq!(err.kind, cgr_error::ErrorKind::ServiceUnavailable);
    }

    #[tokio::test]
    async fn declared_set_match_takes_priority_over_public_fallback() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(MockPublicExecutor::new("public-executor")));
        let mut specialized = MockPublicExecutor::new("specialized");
        specialized.declared = vec!["cap.example.v1".to_string()];
        registry.register(Arc::new(specialized));
        let desc = descriptor("cap.example.v1", ExecutionMode::Public);
        let chosen = registry.select(&desc, None).unwrap();
        assert_eq!(chosen.id(), "specialized");
    }
}
