// SPDX-License-Identifier: MIT OR Apache-2.0
//! Axum HTTP surface for the capability routing gateway.
//!
//! Thin routing layer over [`cgr_router::Services`]: every handler parses
//! the request body, calls straight through to `Services`, and maps the
//! result onto the wire shapes in [`crate::api`]. No business logic lives
//! here — gates, dedup, breaker state, and receipt assembly all happen in
//! `cgr-router`.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod api;

use std::sync::Arc;

use axum::extract::{Path as AxPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cgr_core::{CapabilityDescriptor, InvocationRequest};
use cgr_error::GatewayError;
use cgr_router::{BatchResponse, ComposeRequest, ComposeResponse, Services};
use serde::Deserialize;
use serde_json::{json, Value};

use api::{ErrorBody, ListQuery, MetricsQuery};

/// Shared application state handed to every Axum handler.
#[derive(Clone)]
pub struct AppState {
    /// The composition root: one [`Services`] instance for the process lifetime.
    pub services: Arc<Services>,
}

impl IntoResponse for GatewayErrorWrapper {
    fn into_response(self) -> Response {
        let dto = self.0.to_dto();
        let status =
            StatusCode::from_u16(self.0.kind.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorBody::from(dto))).into_response()
    }
}

/// Newtype so [`GatewayError`] (defined in another crate) can implement
/// [`IntoResponse`] here without violating the orphan rule.
pub struct GatewayErrorWrapper(pub GatewayError);

impl From<GatewayError> for GatewayErrorWrapper {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

/// Build the Axum router with every route from spec §6's external interfaces.
#[must_use]
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(cmd_health))
        .route("/invoke", post(cmd_invoke))
        .route("/queued_invoke", post(cmd_invoke))
        .route("/batch", post(cmd_batch))
        .route("/compose", post(cmd_compose))
        .route("/capabilities", get(cmd_list_capabilities))
        .route("/capabilities/summary", get(cmd_capabilities_summary))
        .route("/capabilities/{id}", get(cmd_get_capability))
        .route("/circuit_breakers/{id}/reset", post(cmd_reset_circuit_breaker))
        .route("/metrics", get(cmd_metrics))
        .route("/system/health", get(cmd_system_health))
        .route("/receipts/verify", post(cmd_verify_receipt))
        .with_state(state)
}

async fn cmd_health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "time": chrono::Utc::now().to_rfc3339() }))
}

async fn cmd_invoke(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InvocationRequest>,
) -> Result<Json<cgr_core::InvocationResult>, GatewayErrorWrapper> {
    let result = state.services.invoke(request).await?;
    Ok(Json(result))
}

async fn cmd_batch(
    State(state): State<Arc<AppState>>,
    Json(requests): Json<Vec<InvocationRequest>>,
) -> Result<Json<BatchResponse>, GatewayErrorWrapper> {
    let response = state.services.batch(requests).await?;
    Ok(Json(response))
}

async fn cmd_compose(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ComposeRequest>,
) -> Result<Json<ComposeResponse>, GatewayErrorWrapper> {
    let response = state.services.compose(request).await?;
    Ok(Json(response))
}

async fn cmd_list_capabilities(
    Query(params): Query<ListQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let filter = cgr_registry::ListFilter {
        tag: params.tag,
        mode: params.mode,
    };
    Json(state.services.list_capabilities(&filter))
}

async fn cmd_capabilities_summary(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.services.capabilities_summary())
}

async fn cmd_get_capability(
    AxPath(id): AxPath<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<cgr_router::CapabilityView>, GatewayErrorWrapper> {
    state
        .services
        .get_capability(&id)
        .map(Json)
        .ok_or_else(|| GatewayError::not_found(id).into())
}

async fn cmd_reset_circuit_breaker(
    AxPath(id): AxPath<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    state.services.reset_circuit_breaker(&id);
    Json(json!({ "capability_id": id, "reset": true }))
}

async fn cmd_metrics(
    Query(params): Query<MetricsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.services.get_metrics(params.capability_id.as_deref()))
}

async fn cmd_system_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.services.system_health())
}

#[derive(Debug, Deserialize)]
struct VerifyReceiptRequest {
    receipt: Value,
    inputs: Option<Value>,
    outputs: Option<Value>,
}

async fn cmd_verify_receipt(
    Json(body): Json<VerifyReceiptRequest>,
) -> Result<Json<cgr_receipt::VerifyReport>, GatewayErrorWrapper> {
    let receipt: cgr_receipt::Receipt = serde_json::from_value(body.receipt)
        .map_err(|e| GatewayError::validation(format!("malformed receipt: {e}")))?;
    let report = cgr_receipt::verify(&receipt, body.inputs.as_ref(), body.outputs.as_ref());
    Ok(Json(report))
}

/// Register every descriptor in `descriptors` with `services`, stopping at
/// the first failure — mirrors the startup-only contract on
/// [`Services::register_capability`].
///
/// # Errors
///
/// Returns the first [`GatewayError`] encountered.
pub fn register_descriptors(
    services: &mut Services,
    descriptors: Vec<CapabilityDescriptor>,
) -> Result<(), GatewayError> {
    for descriptor in descriptors {
        services.register_capability(descriptor)?;
    }
    Ok(())
}
