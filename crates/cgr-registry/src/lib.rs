// SPDX-License-Identifier: MIT OR Apache-2.0
//! Immutable capability descriptor registry (C1).
//!
//! Descriptors are registered once at startup ([`Registry::register`]);
//! duplicate ids at registration time are a fatal configuration error.
//! After startup the registry is read-mostly: lookups are O(1), list
//! filters iterate the full set.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;

use cgr_core::CapabilityDescriptor;
use cgr_error::GatewayError;
use serde::{Deserialize, Serialize};

/// Error raised when a descriptor cannot be registered.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A descriptor with this id was already registered.
    #[error("duplicate capability id: {id}")]
    Duplicate {
        /// The offending id.
        id: String,
    },
    /// The descriptor id does not match the required wire format.
    #[error("invalid capability id: {id}")]
    InvalidId {
        /// The offending id.
        id: String,
    },
}

impl From<RegistryError> for GatewayError {
    fn from(err: RegistryError) -> Self {
        match &err {
            RegistryError::Duplicate { id } | RegistryError::InvalidId { id } => {
                GatewayError::internal(err.to_string())
                    .with_details(serde_json::json!({ "capability_id": id }))
            }
        }
    }
}

/// Filter applied to [`Registry::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Only include descriptors carrying this tag.
    pub tag: Option<String>,
    /// Only include descriptors with this execution mode (`"public"` / `"confidential"`).
    pub mode: Option<String>,
}

/// Aggregate counts returned by [`Registry::summary`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistrySummary {
    /// Total registered descriptors.
    pub total: usize,
    /// Count with `execution.mode == public`.
    pub public_count: usize,
    /// Count with `execution.mode == confidential`.
    pub confidential_count: usize,
    /// Histogram of tag -> descriptor count.
    pub by_tag: BTreeMap<String, usize>,
}

/// Immutable capability descriptor registry.
///
/// Frozen after startup: all mutation happens through [`Registry::register`]
/// during composition-root setup; there is no runtime `unregister`.
#[derive(Debug, Default)]
pub struct Registry {
    descriptors: BTreeMap<String, CapabilityDescriptor>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. Startup only: a duplicate id is a fatal
    /// configuration error, not a runtime-recoverable one.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidId`] if `descriptor.id` does not
    /// match `^cap\.[a-z0-9._-]+\.v\d+$`, or [`RegistryError::Duplicate`]
    /// if the id is already registered.
    pub fn register(&mut self, descriptor: CapabilityDescriptor) -> Result<(), RegistryError> {
        if !cgr_core::is_valid_capability_id(&descriptor.id) {
            return Err(RegistryError::InvalidId { id: descriptor.id });
        }
        if self.descriptors.contains_key(&descriptor.id) {
            return Err(RegistryError::Duplicate { id: descriptor.id });
        }
        self.descriptors.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    /// Look up a descriptor by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&CapabilityDescriptor> {
        self.descriptors.get(id)
    }

    /// List descriptors matching the given tag/mode filters.
    #[must_use]
    pub fn list(&self, filter: &ListFilter) -> Vec<&CapabilityDescriptor> {
        self.descriptors
            .values()
            .filter(|d| {
                filter
                    .tag
                    .as_ref()
                    .is_none_or(|t| d.metadata.tags.iter().any(|tag| tag == t))
            })
            .filter(|d| {
                filter.mode.as_ref().is_none_or(|m| match d.execution.mode {
                    cgr_core::ExecutionMode::Public => m == "public",
                    cgr_core::ExecutionMode::Confidential => m == "confidential",
                })
            })
            .collect()
    }

    /// Number of registered descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether the registry has no descriptors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Aggregate summary: totals, public/confidential split, tag histogram.
    #[must_use]
    pub fn summary(&self) -> RegistrySummary {
        let mut summary = RegistrySummary {
            total: self.descriptors.len(),
            ..Default::default()
        };
        for descriptor in self.descriptors.values() {
            match descriptor.execution.mode {
                cgr_core::ExecutionMode::Public => summary.public_count += 1,
                cgr_core::ExecutionMode::Confidential => summary.confidential_count += 1,
            }
            for tag in &descriptor.metadata.tags {
                *summary.by_tag.entry(tag.clone()).or_insert(0) += 1;
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgr_core::{
        DescriptorMetadata, Economics, ExecutionMode, ExecutionSpec, LatencyHint, Performance,
    };

    fn descriptor(id: &str, mode: ExecutionMode, tags: &[&str]) -> CapabilityDescriptor {
        CapabilityDescriptor {
            id: id.into(),
            name: id.into(),
            description: "test".into(),
            version: "1.0.0".into(),
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
            metadata: DescriptorMetadata {
                tags: tags.iter().map(|t| t.to_string()).collect(),
                provider_hints: vec![],
            },
            deprecated: false,
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = Registry::new();
        registry
            .register(descriptor("cap.price.lookup.v1", ExecutionMode::Public, &["price"]))
            .unwrap();
        assert!(registry.get("cap.price.lookup.v1").is_some());
        assert!(registry.get("cap.unknown.v1").is_none());
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut registry = Registry::new();
        registry
            .register(descriptor("cap.price.lookup.v1", ExecutionMode::Public, &[]))
            .unwrap();
        let err = registry
            .register(descriptor("cap.price.lookup.v1", ExecutionMode::Public, &[]))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate { .. }));
    }

    #[test]
    fn invalid_id_is_rejected() {
        let mut registry = Registry::new();
        let err = registry
            .register(descriptor("price.lookup", ExecutionMode::Public, &[]))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidId { .. }));
    }

    #[test]
    fn list_filters_by_tag_and_mode() {
        let mut registry = Registry::new();
        registry
            .register(descriptor("cap.price.lookup.v1", ExecutionMode::Public, &["price"]))
            .unwrap();
        registry
            .register(descriptor("cap.cspl.wrap.v1", ExecutionMode::Confidential, &["wrap"]))
            .unwrap();

        let priced = registry.list(&ListFilter {
            tag: Some("price".into()),
            mode: None,
        });
        assert_eq!(priced.len(), 1);
        assert_eq!(priced[0].id, "cap.price.lookup.v1");

        let confidential = registry.list(&ListFilter {
            tag: None,
            mode: Some("confidential".into()),
        });
        assert_eq!(confidential.len(), 1);
        assert_eq!(confidential[0].id, "cap.cspl.wrap.v1");
    }

    #[test]
    fn summary_counts_modes_and_tags() {
        let mut registry = Registry::new();
        registry
            .register(descriptor("cap.a.v1", ExecutionMode::Public, &["x", "y"]))
            .unwrap();
        registry
            .register(descriptor("cap.b.v1", ExecutionMode::Confidential, &["x"]))
            .unwrap();
        let summary = registry.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.public_count, 1);
        assert_eq!(summary.confidential_count, 1);
        assert_eq!(summary.by_tag["x"], 2);
        assert_eq!(summary.by_tag["y"], 1);
    }
}
