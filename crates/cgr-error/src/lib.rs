// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy for the capability routing gateway.
//!
//! Every rejection carries an [`ErrorKind`] (one of the nine canonical
//! kinds), a human-readable message, and structured `details`. Use the
//! constructors on [`GatewayError`] (`GatewayError::rate_limited(..)`,
//! `GatewayError::not_found(..)`, ...) to build errors fluently; call
//! `.status()` to get the HTTP status code a transport layer should use.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Canonical error kind, per the gateway's error handling design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request.
    ValidationError,
    /// No valid identity when one was required.
    Unauthorized,
    /// Identity lacks access to the tier/capability.
    Forbidden,
    /// Capability id unknown.
    NotFound,
    /// Global or identity rate-limit window exhausted.
    RateLimited,
    /// Circuit open, queue saturated, no eligible executor, or memory pressure.
    ServiceUnavailable,
    /// Deadline elapsed.
    Timeout,
    /// Executor returned a domain error.
    ExecutorError,
    /// A precondition was violated.
    InternalError,
}

impl ErrorKind {
    /// HTTP status code this kind maps onto.
    #[must_use]
    pub fn status(self) -> u16 {
        match self {
            ErrorKind::ValidationError => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::RateLimited => 429,
            ErrorKind::ServiceUnavailable => 503,
            ErrorKind::Timeout => 504,
            ErrorKind::ExecutorError => 502,
            ErrorKind::InternalError => 500,
        }
    }

    /// Whether the circuit breaker should be charged a failure for this kind.
    ///
    /// Per the propagation policy: `ExecutorError` and `Timeout` charge the
    /// breaker; every other kind does not.
    #[must_use]
    pub fn charges_circuit_breaker(self) -> bool {
        matches!(self, ErrorKind::ExecutorError | ErrorKind::Timeout)
    }

    /// Stable machine-readable tag, e.g. for logs and metrics labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ExecutorError => "executor_error",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified, user-facing gateway error.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct GatewayError {
    /// Canonical kind.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Structured context, e.g. the offending capability id.
    pub details: serde_json::Value,
    /// Populated on `RateLimited`: seconds until the window resets.
    pub retry_after: Option<Duration>,
    /// Populated on queue-saturation `ServiceUnavailable`: suggested retry delay.
    pub retry_after_ms: Option<u64>,
    /// Underlying cause, if any (not serialized to the wire).
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl GatewayError {
    /// Construct a bare error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: serde_json::Value::Null,
            retry_after: None,
            retry_after_ms: None,
            source: None,
        }
    }

    /// Attach structured details.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// `ValidationError` for a malformed request.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    /// `NotFound` for an unknown capability id.
    #[must_use]
    pub fn not_found(capability_id: impl Into<String>) -> Self {
        let id = capability_id.into();
        Self::new(ErrorKind::NotFound, format!("capability not found: {id}"))
            .with_details(serde_json::json!({ "capability_id": id }))
    }

    /// `Forbidden` for an identity lacking access.
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    /// `Unauthorized` for a missing/invalid identity.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    /// `RateLimited`, carrying the retry delay.
    #[must_use]
    pub fn rate_limited(retry_after: Duration) -> Self {
        Self::new(ErrorKind::RateLimited, "rate limit exceeded").with_retry_after(retry_after)
    }

    /// Attach `retry_after` (seconds) for a `RateLimited` error.
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// `ServiceUnavailable`, optionally carrying a millisecond retry hint.
    #[must_use]
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }

    /// Attach `retry_after_ms` for a queue-saturation `ServiceUnavailable`.
    #[must_use]
    pub fn with_retry_after_ms(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    /// `Timeout` for an expired deadline.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// `ExecutorError` wrapping a domain error returned by an executor.
    #[must_use]
    pub fn executor(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExecutorError, message)
    }

    /// `InternalError` for a violated precondition.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    /// Produce the serializable DTO shape sent over the wire.
    #[must_use]
    pub fn to_dto(&self) -> GatewayErrorDto {
        GatewayErrorDto {
            kind: self.kind,
            message: self.message.clone(),
            details: self.details.clone(),
            retry_after: self.retry_after.map(|d| d.as_secs()),
            retry_after_ms: self.retry_after_ms,
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::validation(format!("malformed json: {err}"))
    }
}

/// Wire shape of a [`GatewayError`]: `{kind, message, details, retry_after?, retry_after_ms?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayErrorDto {
    /// Canonical kind.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub details: serde_json::Value,
    /// Seconds until the rate-limit window resets, for `RateLimited`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Suggested retry delay in milliseconds, for queue-saturation `ServiceUnavailable`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl From<&GatewayError> for GatewayErrorDto {
    fn from(err: &GatewayError) -> Self {
        err.to_dto()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_KINDS: &[ErrorKind] = &[
        ErrorKind::ValidationError,
        ErrorKind::Unauthorized,
        ErrorKind::Forbidden,
        ErrorKind::NotFound,
        ErrorKind::RateLimited,
        ErrorKind::ServiceUnavailable,
        ErrorKind::Timeout,
        ErrorKind::ExecutorError,
        ErrorKind::InternalError,
    ];

    #[test]
    fn every_kind_has_a_status() {
        for kind in ALL_KINDS {
            assert!(kind.status() >= 400);
        }
    }

    #[test]
    fn only_executor_and_timeout_charge_breaker() {
        for kind in ALL_KINDS {
            let expects = matches!(kind, ErrorKind::ExecutorError | ErrorKind::Timeout);
            assert_eq!(kind.charges_circuit_breaker(), expects, "{kind:?}");
        }
    }

    #[test]
    fn not_found_carries_capability_id() {
        let err = GatewayError::not_found("cap.price.lookup.v1");
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.details["capability_id"], "cap.price.lookup.v1");
    }

    #[test]
    fn rate_limited_serializes_retry_after() {
        let err = GatewayError::rate_limited(Duration::from_secs(5));
        let dto = err.to_dto();
        let json = serde_json::to_value(&dto).unwrap();
        assert_eq!(json["kind"], "rate_limited");
        assert_eq!(json["retry_after"], 5);
        assert!(json.get("retry_after_ms").is_none());
    }

    #[test]
    fn kind_display_matches_as_str() {
        for kind in ALL_KINDS {
            assert_eq!(kind.to_string(), kind.as_str());
        }
    }
}
