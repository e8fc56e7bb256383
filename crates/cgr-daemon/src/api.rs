// SPDX-License-Identifier: MIT OR Apache-2.0
//! Wire-facing request/response shapes for the daemon's HTTP surface.
//!
//! Everything domain-specific (capability descriptors, invocation results,
//! receipts) already has a serializable shape in `cgr-core`/`cgr-router`/
//! `cgr-receipt`; this module only adds the thin query-string and
//! error-envelope types Axum needs at the edge.

use cgr_error::GatewayErrorDto;
use serde::{Deserialize, Serialize};

/// Query parameters accepted by `GET /capabilities`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    /// Only include descriptors carrying this tag.
    pub tag: Option<String>,
    /// Only include descriptors with this execution mode (`"public"` / `"confidential"`).
    pub mode: Option<String>,
}

/// Query parameters accepted by `GET /metrics`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsQuery {
    /// Scope the response to one capability; omit for the system-wide summary.
    pub capability_id: Option<String>,
}

/// Error envelope returned for every non-2xx response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    /// The classified error.
    pub error: GatewayErrorDto,
}

impl From<GatewayErrorDto> for ErrorBody {
    fn from(error: GatewayErrorDto) -> Self {
        Self { error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_query_defaults_to_no_filters() {
        let query: ListQuery = serde_json::from_str("{}").unwrap();
        assert!(query.tag.is_none());
        assert!(query.mode.is_none());
    }
}
