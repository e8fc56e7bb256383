// SPDX-License-Identifier: MIT OR Apache-2.0
//! Windowed rate limiting (C4): a global/IP scope and a per-identity scope,
//! both governed by an adaptive load factor that shrinks every limit under
//! memory or latency pressure.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use cgr_core::TrustLevel;
use cgr_error::GatewayError;
use serde::{Deserialize, Serialize};

/// Which scope a rate-limit check applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Fixed window keyed by caller IP (or "global" when unknown).
    Global,
    /// Fixed window keyed by resolved agent id, sized by trust level.
    Identity,
}

/// Outcome of [`RateLimiter::check_and_consume`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the request is admitted.
    pub allowed: bool,
    /// Remaining quota in the current window after this check.
    pub remaining: u32,
    /// Seconds until the window resets.
    pub reset_at_secs: u64,
    /// Cost multiplier in effect for the caller's trust level.
    pub cost_multiplier: f64,
}

struct Cell {
    window_end: Instant,
    count: u32,
}

/// Adaptive multiplier applied to every limit in effect for the current
/// window, recomputed from observed heap/latency pressure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadFactor(f64);

impl LoadFactor {
    /// Recompute the load factor from heap percentage and average latency,
    /// per spec §4.4: `0.5` if heap > 85% or latency > 1000ms, `0.75` if
    /// heap > 70% or latency > 500ms, else `1.0`.
    #[must_use]
    pub fn compute(heap_pct: f64, avg_latency_ms: f64) -> Self {
        if heap_pct > 85.0 || avg_latency_ms > 1000.0 {
            LoadFactor(0.5)
        } else if heap_pct > 70.0 || avg_latency_ms > 500.0 {
            LoadFactor(0.75)
        } else {
            LoadFactor(1.0)
        }
    }

    /// The raw multiplier, one of `1.0`, `0.75`, `0.5`.
    #[must_use]
    pub fn value(self) -> f64 {
        self.0
    }
}

impl Default for LoadFactor {
    fn default() -> Self {
        LoadFactor(1.0)
    }
}

/// Per-trust-level ceiling and cost multiplier for the identity scope.
#[derive(Debug, Clone, Copy)]
pub struct IdentityLimits {
    /// Requests admitted per window at this trust level.
    pub max_requests: u32,
    /// Multiplier applied to a capability's `cost_hint` for callers at this level.
    pub cost_multiplier: f64,
}

fn limits_for(level: TrustLevel) -> IdentityLimits {
    match level {
        TrustLevel::Anonymous => IdentityLimits {
            max_requests: 20,
            cost_multiplier: 1.5,
        },
        TrustLevel::Verified => IdentityLimits {
            max_requests: 100,
            cost_multiplier: 1.0,
        },
        TrustLevel::Trusted => IdentityLimits {
            max_requests: 500,
            cost_multiplier: 0.75,
        },
        TrustLevel::Premium => IdentityLimits {
            max_requests: 2000,
            cost_multiplier: 0.5,
        },
    }
}

/// Global + per-identity windowed rate limiter with an adaptive load factor.
pub struct RateLimiter {
    global_max: u32,
    window: Duration,
    global_cells: Mutex<HashMap<String, Cell>>,
    identity_cells: Mutex<HashMap<String, Cell>>,
    load_factor: RwLock<LoadFactor>,
    max_tracked_entries: usize,
}

impl RateLimiter {
    /// Create a limiter with the given global ceiling and window.
    #[must_use]
    pub fn new(global_max: u32, window: Duration) -> Self {
        Self {
            global_max,
            window,
            global_cells: Mutex::new(HashMap::new()),
            identity_cells: Mutex::new(HashMap::new()),
            load_factor: RwLock::new(LoadFactor::default()),
            max_tracked_entries: 100_000,
        }
    }

    /// Recompute the adaptive load factor from current pressure signals.
    pub fn update_load(&self, heap_pct: f64, avg_latency_ms: f64) {
        *self.load_factor.write().unwrap() = LoadFactor::compute(heap_pct, avg_latency_ms);
    }

    /// Current load factor.
    #[must_use]
    pub fn load_factor(&self) -> LoadFactor {
        *self.load_factor.read().unwrap()
    }

    /// Check and, if admitted, consume one unit of quota for `identifier`
    /// under `scope`. `trust_level` only matters for [`Scope::Identity`].
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::RateLimited`] carrying `retry_after` if the
    /// window's quota (`limit * load_factor`) is already exhausted.
    pub fn check_and_consume(
        &self,
        scope: Scope,
        identifier: &str,
        trust_level: TrustLevel,
    ) -> Result<Decision, GatewayError> {
        let load_factor = self.load_factor();
        let (base_limit, cost_multiplier) = match scope {
            Scope::Global => (self.global_max, 1.0),
            Scope::Identity => {
                let limits = limits_for(trust_level);
                (limits.max_requests, limits.cost_multiplier)
            }
        };
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let effective_limit = ((base_limit as f64) * load_factor.value()).floor() as u32;
        let effective_limit = effective_limit.max(1);

        let cells = match scope {
            Scope::Global => &self.global_cells,
            Scope::Identity => &self.identity_cells,
        };
        let mut cells = cells.lock().unwrap();
        self.sweep_if_needed(&mut cells);

        let now = Instant::now();
        let cell = cells.entry(identifier.to_string()).or_insert_with(|| Cell {
            window_end: now + self.window,
            count: 0,
        });
        if now >= cell.window_end {
            cell.window_end = now + self.window;
            cell.count = 0;
        }

        let reset_at_secs = cell.window_end.saturating_duration_since(now).as_secs();

        if cell.count >= effective_limit {
            return Err(GatewayError::rate_limited(Duration::from_secs(reset_at_secs))
                .with_details(serde_json::json!({
                    "scope": match scope { Scope::Global => "global", Scope::Identity => "identity" },
                    "identifier": identifier,
                    "limit": effective_limit,
                })));
        }

        cell.count += 1;
        Ok(Decision {
            allowed: true,
            remaining: effective_limit - cell.count,
            reset_at_secs,
            cost_multiplier,
        })
    }

    /// Bound total tracked entries: drop expired cells first, then the
    /// coldest (lowest count) survivors, until under the cap.
    fn sweep_if_needed(&self, cells: &mut HashMap<String, Cell>) {
        if cells.len() <= self.max_tracked_entries {
            return;
        }
        let now = Instant::now();
        cells.retain(|_, cell| now < cell.window_end);
        if cells.len() > self.max_tracked_entries {
            let mut keys: Vec<(String, u32)> =
                cells.iter().map(|(k, c)| (k.clone(), c.count)).collect();
            keys.sort_by_key(|(_, count)| *count);
            let overflow = cells.len() - self.max_tracked_entries;
            for (key, _) in keys.into_iter().take(overflow) {
                cells.remove(&key);
            }
        }
    }
}
