// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared command implementations for the gateway CLI.
//!
//! These functions are library-level so they can be tested without
//! spawning the binary.

use std::path::Path;

use anyhow::{Context, Result};
use cgr_config::GatewayConfig;
use cgr_core::{CapabilityDescriptor, InvocationRequest};
use cgr_receipt::{verify, Receipt, VerifyReport};
use schemars::schema_for;

/// Schema types that can be printed by the `schema` subcommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    /// JSON schema for [`CapabilityDescriptor`].
    Descriptor,
    /// JSON schema for [`InvocationRequest`].
    Request,
    /// JSON schema for [`Receipt`].
    Receipt,
    /// JSON schema for [`GatewayConfig`].
    Config,
}

/// Return the JSON schema string for the given kind.
///
/// # Errors
///
/// Returns an error if the schema cannot be serialized.
pub fn schema_json(kind: SchemaKind) -> Result<String> {
    let value = match kind {
        SchemaKind::Descriptor => serde_json::to_value(schema_for!(CapabilityDescriptor))?,
        SchemaKind::Request => serde_json::to_value(schema_for!(InvocationRequest))?,
        SchemaKind::Receipt => serde_json::to_value(schema_for!(Receipt))?,
        SchemaKind::Config => serde_json::to_value(schema_for!(GatewayConfig))?,
    };
    serde_json::to_string_pretty(&value).context("serialize schema")
}

/// The detected type of a validated JSON file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatedType {
    /// The file is a valid [`CapabilityDescriptor`].
    Descriptor,
    /// The file is a valid [`Receipt`].
    Receipt,
}

/// Validate a JSON file, auto-detecting whether it is a [`CapabilityDescriptor`]
/// or a [`Receipt`].
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid JSON, or
/// matches neither shape.
pub fn validate_file(path: &Path) -> Result<ValidatedType> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("read file '{}'", path.display()))?;

    let value: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("parse JSON from '{}'", path.display()))?;

    if serde_json::from_value::<CapabilityDescriptor>(value.clone()).is_ok() {
        return Ok(ValidatedType::Descriptor);
    }
    if serde_json::from_value::<Receipt>(value).is_ok() {
        return Ok(ValidatedType::Receipt);
    }

    anyhow::bail!(
        "file '{}' is not a valid capability descriptor or receipt",
        path.display()
    )
}

/// Validate a JSON file against the [`CapabilityDescriptor`] shape, including
/// the `cap.<name>.v<N>` id format enforced by the registry.
///
/// # Errors
///
/// Returns an error describing why the file does not validate.
pub fn validate_descriptor_file(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read descriptor file '{}'", path.display()))?;

    let value: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("parse JSON from '{}'", path.display()))?;

    let descriptor: CapabilityDescriptor = serde_json::from_value(value)
        .with_context(|| format!("validate descriptor from '{}'", path.display()))?;

    if !cgr_core::is_valid_capability_id(&descriptor.id) {
        anyhow::bail!(
            "descriptor id '{}' does not match cap.<name>.v<N>",
            descriptor.id
        );
    }

    Ok(())
}

/// Inspect a receipt file: deserialize it and report whether its `receipt_id`
/// recomputes to the same value, without access to the original inputs or
/// outputs.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a valid receipt.
pub fn inspect_receipt_file(path: &Path) -> Result<(Receipt, VerifyReport)> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read receipt file '{}'", path.display()))?;
    let receipt: Receipt = serde_json::from_str(&content)
        .with_context(|| format!("parse receipt from '{}'", path.display()))?;
    let report = verify(&receipt, None, None);
    Ok((receipt, report))
}

/// Verify a receipt file's hashes against the original inputs and/or outputs,
/// when supplied.
///
/// # Errors
///
/// Returns an error if any of the files cannot be read or parsed.
pub fn verify_receipt_file(
    receipt_path: &Path,
    inputs_path: Option<&Path>,
    outputs_path: Option<&Path>,
) -> Result<(Receipt, VerifyReport)> {
    let content = std::fs::read_to_string(receipt_path)
        .with_context(|| format!("read receipt file '{}'", receipt_path.display()))?;
    let receipt: Receipt = serde_json::from_str(&content)
        .with_context(|| format!("parse receipt from '{}'", receipt_path.display()))?;

    let inputs = inputs_path
        .map(|p| read_json(p))
        .transpose()?;
    let outputs = outputs_path
        .map(|p| read_json(p))
        .transpose()?;

    let report = verify(&receipt, inputs.as_ref(), outputs.as_ref());
    Ok((receipt, report))
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read file '{}'", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parse JSON from '{}'", path.display()))
}

/// Load a TOML config override file (if given) onto [`GatewayConfig::default`]
/// and validate it.
///
/// Returns a list of human-readable diagnostic messages (errors and warnings).
///
/// # Errors
///
/// Returns an error only if the file exists but cannot be read.
pub fn config_check(path: Option<&Path>) -> Result<Vec<String>> {
    let mut diagnostics = Vec::new();

    let config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p)
                .with_context(|| format!("read config file '{}'", p.display()))?;
            match toml::from_str::<GatewayConfig>(&content) {
                Ok(c) => c,
                Err(e) => {
                    diagnostics.push(format!("error: failed to parse '{}': {e}", p.display()));
                    return Ok(diagnostics);
                }
            }
        }
        None => GatewayConfig::default(),
    };

    match config.validate() {
        Ok(()) => diagnostics.push("config: ok".into()),
        Err(e) => diagnostics.push(format!("error: {e}")),
    }
    for warning in config.warnings() {
        diagnostics.push(format!("warning: {warning}"));
    }

    Ok(diagnostics)
}

/// Diff two receipt files, returning a human-readable summary of differences.
///
/// # Errors
///
/// Returns an error if either file cannot be read or parsed.
pub fn receipt_diff(path1: &Path, path2: &Path) -> Result<String> {
    let content1 = std::fs::read_to_string(path1)
        .with_context(|| format!("read receipt file '{}'", path1.display()))?;
    let content2 = std::fs::read_to_string(path2)
        .with_context(|| format!("read receipt file '{}'", path2.display()))?;

    let r1: Receipt = serde_json::from_str(&content1)
        .with_context(|| format!("parse receipt from '{}'", path1.display()))?;
    let r2: Receipt = serde_json::from_str(&content2)
        .with_context(|| format!("parse receipt from '{}'", path2.display()))?;

    let mut diffs = Vec::new();

    if r1.capability_id != r2.capability_id {
        diffs.push(format!(
            "capability_id: {} -> {}",
            r1.capability_id, r2.capability_id
        ));
    }
    if r1.executor_id != r2.executor_id {
        diffs.push(format!("executor_id: {} -> {}", r1.executor_id, r2.executor_id));
    }
    if r1.success != r2.success {
        diffs.push(format!("success: {} -> {}", r1.success, r2.success));
    }
    if r1.duration_ms != r2.duration_ms {
        diffs.push(format!("duration_ms: {} -> {}", r1.duration_ms, r2.duration_ms));
    }
    if (r1.cost_actual - r2.cost_actual).abs() > f64::EPSILON {
        diffs.push(format!("cost_actual: {} -> {}", r1.cost_actual, r2.cost_actual));
    }
    if r1.cache_hit != r2.cache_hit {
        diffs.push(format!("cache_hit: {} -> {}", r1.cache_hit, r2.cache_hit));
    }
    if r1.receipt_id != r2.receipt_id {
        diffs.push(format!("receipt_id: {} -> {}", r1.receipt_id, r2.receipt_id));
    }

    if diffs.is_empty() {
        Ok("no differences".to_string())
    } else {
        Ok(diffs.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgr_core::{
        DescriptorMetadata, Economics, ExecutionMode, ExecutionSpec, LatencyHint, Performance,
    };
    use cgr_receipt::ReceiptBuilder;

    fn descriptor() -> CapabilityDescriptor {
        CapabilityDescriptor {
            id: "cap.price.lookup.v1".into(),
            name: "Price Lookup".into(),
            description: "test".into(),
            version: "1.0.0".into(),
            inputs_schema: serde_json::json!({}),
            outputs_schema: serde_json::json!({}),
            execution: ExecutionSpec {
                mode: ExecutionMode::Public,
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

    #[test]
    fn schema_descriptor_is_valid_json() {
        let s = schema_json(SchemaKind::Descriptor).unwrap();
        let v: serde_json::Value = serde_json::from_str(&s).unwrap();
        assert!(v.get("properties").is_some() || v.get("$defs").is_some());
    }

    #[test]
    fn schema_request_is_valid_json() {
        let s = schema_json(SchemaKind::Request).unwrap();
        let _: serde_json::Value = serde_json::from_str(&s).unwrap();
    }

    #[test]
    fn schema_receipt_is_valid_json() {
        let s = schema_json(SchemaKind::Receipt).unwrap();
        let _: serde_json::Value = serde_json::from_str(&s).unwrap();
    }

    #[test]
    fn schema_config_is_valid_json() {
        let s = schema_json(SchemaKind::Config).unwrap();
        let _: serde_json::Value = serde_json::from_str(&s).unwrap();
    }

    #[test]
    fn validate_descriptor_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(validate_descriptor_file(&path).is_err());
    }

    #[test]
    fn validate_descriptor_rejects_bad_id() {
        let mut d = descriptor();
        d.id = "not-a-valid-id".into();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad_id.json");
        std::fs::write(&path, serde_json::to_string_pretty(&d).unwrap()).unwrap();
        assert!(validate_descriptor_file(&path).is_err());
    }

    #[test]
    fn validate_descriptor_accepts_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("valid.json");
        std::fs::write(&path, serde_json::to_string_pretty(&descriptor()).unwrap()).unwrap();
        validate_descriptor_file(&path).unwrap();
    }

    #[test]
    fn validate_file_detects_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.json");
        std::fs::write(&path, serde_json::to_string_pretty(&descriptor()).unwrap()).unwrap();
        assert_eq!(validate_file(&path).unwrap(), ValidatedType::Descriptor);
    }

    #[test]
    fn validate_file_detects_receipt() {
        let receipt = ReceiptBuilder::new("cap.price.lookup.v1", "public-executor")
            .success(true)
            .build();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receipt.json");
        std::fs::write(&path, serde_json::to_string_pretty(&receipt).unwrap()).unwrap();
        assert_eq!(validate_file(&path).unwrap(), ValidatedType::Receipt);
    }

    #[test]
    fn validate_file_rejects_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unknown.json");
        std::fs::write(&path, r#"{"foo": "bar"}"#).unwrap();
        assert!(validate_file(&path).is_err());
    }

    #[test]
    fn inspect_receipt_valid_id() {
        let receipt = ReceiptBuilder::new("cap.price.lookup.v1", "public-executor")
            .success(true)
            .build();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receipt.json");
        std::fs::write(&path, serde_json::to_string_pretty(&receipt).unwrap()).unwrap();

        let (r, report) = inspect_receipt_file(&path).unwrap();
        assert!(report.receipt_id_valid);
        assert_eq!(r.receipt_id, receipt.receipt_id);
    }

    #[test]
    fn inspect_receipt_tampered_id() {
        let mut receipt = ReceiptBuilder::new("cap.price.lookup.v1", "public-executor")
            .success(true)
            .build();
        receipt.receipt_id = "0000000000000000".into();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receipt.json");
        std::fs::write(&path, serde_json::to_string_pretty(&receipt).unwrap()).unwrap();

        let (_r, report) = inspect_receipt_file(&path).unwrap();
        assert!(!report.receipt_id_valid);
    }

    #[test]
    fn verify_receipt_checks_supplied_inputs() {
        let inputs = serde_json::json!({"base_token": "SOL"});
        let receipt = ReceiptBuilder::new("cap.price.lookup.v1", "public-executor")
            .inputs_hash(cgr_receipt::hash_value(&inputs).unwrap())
            .success(true)
            .build();

        let dir = tempfile::tempdir().unwrap();
        let receipt_path = dir.path().join("receipt.json");
        let inputs_path = dir.path().join("inputs.json");
        std::fs::write(&receipt_path, serde_json::to_string_pretty(&receipt).unwrap()).unwrap();
        std::fs::write(&inputs_path, serde_json::to_string_pretty(&inputs).unwrap()).unwrap();

        let (_r, report) =
            verify_receipt_file(&receipt_path, Some(&inputs_path), None).unwrap();
        assert_eq!(report.inputs_hash_valid, Some(true));
    }

    #[test]
    fn receipt_diff_no_differences() {
        let receipt = ReceiptBuilder::new("cap.price.lookup.v1", "public-executor")
            .success(true)
            .build();
        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("r1.json");
        let p2 = dir.path().join("r2.json");
        let json = serde_json::to_string_pretty(&receipt).unwrap();
        std::fs::write(&p1, &json).unwrap();
        std::fs::write(&p2, &json).unwrap();
        assert_eq!(receipt_diff(&p1, &p2).unwrap(), "no differences");
    }

    #[test]
    fn receipt_diff_shows_changes() {
        let r1 = ReceiptBuilder::new("cap.price.lookup.v1", "public-executor")
            .success(true)
            .build();
        let r2 = ReceiptBuilder::new("cap.other.v1", "other-executor")
            .success(false)
            .build();
        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("r1.json");
        let p2 = dir.path().join("r2.json");
        std::fs::write(&p1, serde_json::to_string_pretty(&r1).unwrap()).unwrap();
        std::fs::write(&p2, serde_json::to_string_pretty(&r2).unwrap()).unwrap();
        let diff = receipt_diff(&p1, &p2).unwrap();
        assert!(diff.contains("capability_id"));
        assert!(diff.contains("executor_id"));
        assert!(diff.contains("success"));
    }

    #[test]
    fn config_check_defaults_ok() {
        let diags = config_check(None).unwrap();
        assert!(diags.iter().any(|d| d.contains("ok")));
    }

    #[test]
    fn config_check_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "not valid [toml =").unwrap();
        let diags = config_check(Some(&path)).unwrap();
        assert!(diags.iter().any(|d| d.starts_with("error:")));
    }
}
