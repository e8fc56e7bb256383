// SPDX-License-Identifier: MIT OR Apache-2.0
//! Batch and compose operations layered on top of [`crate::Services::invoke`].
//!
//! Batch runs an unordered set of independent invocations and reports one
//! outcome per item, never failing the whole request because one item
//! failed. Compose runs an ordered chain of invocations, threading each
//! step's outputs into the next step's inputs under a fixed key, and stops
//! at the first failure unless told otherwise.

use cgr_core::{InvocationRequest, InvocationResult, Priority};
use cgr_error::{GatewayError, GatewayErrorDto};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Services;

/// Upper bound on items per `batch` or steps per `compose` call.
pub const MAX_BATCH_SIZE: usize = 10;

/// Key under which a compose step's predecessor outputs are merged into its
/// inputs, when the step's inputs are a JSON object.
const PREVIOUS_OUTPUTS_KEY: &str = "$previous";

/// Outcome of one item within a [`BatchResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemOutcome {
    /// Capability the item targeted.
    pub capability_id: String,
    /// Whether this item's invocation succeeded.
    pub success: bool,
    /// The invocation result, present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<InvocationResult>,
    /// The rejection or failure, present on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GatewayErrorDto>,
}

/// Response to a `batch` call: one outcome per submitted item, in the same order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    /// Per-item outcomes, positionally aligned with the request.
    pub outcomes: Vec<BatchItemOutcome>,
}

/// One step of a `compose` chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeStep {
    /// Capability to invoke for this step.
    pub capability_id: String,
    /// Inputs for this step. If this is a JSON object, the previous step's
    /// outputs are merged in under `"$previous"` before invoking (absent on
    /// the first step).
    #[serde(default)]
    pub inputs: Value,
    /// Caller identity to attribute this step to, if any.
    #[serde(default)]
    pub caller_identity: Option<String>,
    /// Scheduling priority for this step.
    #[serde(default)]
    pub priority: Priority,
}

fn default_stop_on_error() -> bool {
    true
}

/// A `compose` request: an ordered chain of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeRequest {
    /// Steps to run in order.
    pub steps: Vec<ComposeStep>,
    /// Stop the chain at the first failed step. Defaults to `true`.
    #[serde(default = "default_stop_on_error")]
    pub stop_on_error: bool,
}

/// Outcome of one step within a [`ComposeResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeStepOutcome {
    /// Capability this step invoked.
    pub capability_id: String,
    /// Whether this step succeeded.
    pub success: bool,
    /// This step's outputs, present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    /// This step's receipt, present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<Value>,
    /// This step's rejection or failure, present on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<GatewayErrorDto>,
}

/// Response to a `compose` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeResponse {
    /// Outcomes of every step that actually ran.
    pub steps: Vec<ComposeStepOutcome>,
    /// `true` if the chain stopped before running every step, because a
    /// step failed under `stop_on_error`.
    pub stopped_early: bool,
}

impl Services {
    /// Run `requests` independently and report one outcome per item. Items
    /// do not share dedup keys or ordering guarantees with each other; a
    /// failure in one item never aborts the others.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::validation`] if `requests` is empty or
    /// exceeds [`MAX_BATCH_SIZE`].
    pub async fn batch(&self, requests: Vec<InvocationRequest>) -> Result<BatchResponse, GatewayError> {
        if requests.is_empty() {
            return Err(GatewayError::validation("batch requires at least one request"));
        }
        if requests.len() > MAX_BATCH_SIZE {
            return Err(GatewayError::validation(format!(
                "batch accepts at most {MAX_BATCH_SIZE} requests, got {}",
                requests.len()
            )));
        }

        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            let capability_id = request.capability_id.clone();
            match self.invoke(request).await {
                Ok(result) => outcomes.push(BatchItemOutcome {
                    capability_id,
                    success: result.success,
                    result: Some(result),
                    error: None,
                }),
                Err(err) => outcomes.push(BatchItemOutcome {
                    capability_id,
                    success: false,
                    result: None,
                    error: Some(err.to_dto()),
                }),
            }
        }
        Ok(BatchResponse { outcomes })
    }

    /// Run an ordered chain of invocations, merging each step's outputs into
    /// the next step's inputs under `"$previous"`. Stops at the first
    /// failure when `stop_on_error` is `true` (the default).
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::validation`] if `steps` is empty, exceeds
    /// [`MAX_BATCH_SIZE`], or names a capability that is not composable.
    pub async fn compose(&self, request: ComposeRequest) -> Result<ComposeResponse, GatewayError> {
        if request.steps.is_empty() {
            return Err(GatewayError::validation("compose requires at least one step"));
        }
        if request.steps.len() > MAX_BATCH_SIZE {
            return Err(GatewayError::validation(format!(
                "compose accepts at most {MAX_BATCH_SIZE} steps, got {}",
                request.steps.len()
            )));
        }
        for step in &request.steps {
            match self.registry().get(&step.capability_id) {
                None => return Err(GatewayError::not_found(&step.capability_id)),
                Some(descriptor) if !descriptor.composable => {
                    return Err(GatewayError::validation(format!(
                        "capability '{}' is not composable",
                        step.capability_id
                    )))
                }
                Some(_) => {}
            }
        }

        let mut outcomes = Vec::with_capacity(request.steps.len());
        let mut previous_outputs: Option<Value> = None;
        let mut stopped_early = false;

        for step in request.steps {
            let inputs = match (&previous_outputs, step.inputs.clone()) {
                (Some(previous), Value::Object(mut map)) => {
                    map.insert(PREVIOUS_OUTPUTS_KEY.to_string(), previous.clone());
                    Value::Object(map)
                }
                (_, inputs) => inputs,
            };

            let invocation = InvocationRequest {
                capability_id: step.capability_id.clone(),
                inputs,
                preferences: Value::Null,
                caller_identity: step.caller_identity.clone(),
                priority: step.priority,
                dedup_key: None,
                no_cache: false,
            };

            match self.invoke(invocation).await {
                Ok(result) => {
                    previous_outputs = result.outputs.clone();
                    outcomes.push(ComposeStepOutcome {
                        capability_id: step.capability_id,
                        success: result.success,
                        outputs: result.outputs,
                        receipt: Some(result.receipt),
                        error: None,
                    });
                    if !result.success && request.stop_on_error {
                        stopped_early = true;
                        break;
                    }
                }
                Err(err) => {
                    outcomes.push(ComposeStepOutcome {
                        capability_id: step.capability_id,
                        success: false,
                        outputs: None,
                        receipt: None,
                        error: Some(err.to_dto()),
                    });
                    if request.stop_on_error {
                        stopped_early = true;
                        break;
                    }
                }
            }
        }

        Ok(ComposeResponse { steps: outcomes, stopped_early })
    }
}
