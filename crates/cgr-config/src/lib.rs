// SPDX-License-Identifier: MIT OR Apache-2.0
//! Environment-driven runtime configuration for the capability routing gateway.
//!
//! [`GatewayConfig::from_env`] is the single entry point: it starts from
//! [`GatewayConfig::default`] and overlays every recognised environment
//! variable, returning advisory [`ConfigWarning`]s alongside hard
//! [`ConfigError`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Per-priority-level settings, used for queue depth and concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PerPriority<T> {
    /// Critical level value.
    pub critical: T,
    /// High level value.
    pub high: T,
    /// Normal level value.
    pub normal: T,
    /// Low level value.
    pub low: T,
}

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed as the expected type.
    #[error("failed to parse {var}: {reason}")]
    ParseError {
        /// Name of the offending variable.
        var: String,
        /// Human-readable parse error detail.
        reason: String,
    },
    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory-level issues that do not prevent startup but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A rate-limit window shorter than one second was configured.
    ShortWindow {
        /// The configured window, in milliseconds.
        window_ms: u64,
    },
    /// A queue depth for some priority level is unusually small.
    SmallQueueDepth {
        /// Which level.
        level: &'static str,
        /// The configured depth.
        depth: u32,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::ShortWindow { window_ms } => {
                write!(f, "rate limit window is unusually short ({window_ms}ms)")
            }
            ConfigWarning::SmallQueueDepth { level, depth } => {
                write!(f, "queue depth for '{level}' is unusually small ({depth})")
            }
        }
    }
}

/// Top-level runtime configuration for the gateway, per spec §6's
/// "Environment configuration" table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    /// `ROUTER_PORT`, default 3001.
    pub router_port: u16,
    /// `HOST`, default `0.0.0.0`.
    pub host: String,
    /// `LOG_LEVEL`, default `info`.
    pub log_level: String,
    /// `RATE_LIMIT_GLOBAL_MAX`, default 100.
    pub rate_limit_global_max: u32,
    /// `RATE_LIMIT_WINDOW_MS`, default 60000.
    pub rate_limit_window_ms: u64,
    /// `QUEUE_MAX_DEPTH_{CRITICAL,HIGH,NORMAL,LOW}`.
    pub queue_max_depth: PerPriority<u32>,
    /// `CIRCUIT_FAILURE_THRESHOLD`, default 5.
    pub circuit_failure_threshold: u32,
    /// `CIRCUIT_COOLDOWN_MS`, default 30000.
    pub circuit_cooldown_ms: u64,
    /// `CACHE_MAX_ENTRIES`, default 10000.
    pub cache_max_entries: usize,
    /// `CACHE_DEFAULT_TTL_MS`, default 30000.
    pub cache_default_ttl_ms: u64,
    /// `ACTIVITY_MAX_EVENTS`, default 10000.
    pub activity_max_events: usize,
    /// `ACTIVITY_TTL_MS`, default 86400000 (24h).
    pub activity_ttl_ms: u64,
    /// Whether a cache hit still consumes the caller's rate-limit quota.
    ///
    /// Open question in the design spec; defaults to `true` but is exposed
    /// as config per the spec's own recommendation.
    pub cache_hits_consume_quota: bool,
    /// Starvation guard for queue fairness, in seconds. Not independently
    /// configurable via an environment variable in spec §6, kept as a
    /// constant default matching §4.6's `S = 5s`.
    pub queue_starvation_guard_secs: u64,
}

const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            router_port: 3001,
            host: "0.0.0.0".into(),
            log_level: "info".into(),
            rate_limit_global_max: 100,
            rate_limit_window_ms: 60_000,
            queue_max_depth: PerPriority {
                critical: 256,
                high: 256,
                normal: 512,
                low: 128,
            },
            circuit_failure_threshold: 5,
            circuit_cooldown_ms: 30_000,
            cache_max_entries: 10_000,
            cache_default_ttl_ms: 30_000,
            activity_max_events: 10_000,
            activity_ttl_ms: 86_400_000,
            cache_hits_consume_quota: true,
            queue_starvation_guard_secs: 5,
        }
    }
}

fn env_u16(name: &str, current: u16) -> Result<u16, ConfigError> {
    env_parse(name, current)
}
fn env_u32(name: &str, current: u32) -> Result<u32, ConfigError> {
    env_parse(name, current)
}
fn env_u64(name: &str, current: u64) -> Result<u64, ConfigError> {
    env_parse(name, current)
}
fn env_usize(name: &str, current: usize) -> Result<usize, ConfigError> {
    env_parse(name, current)
}

fn env_parse<T: std::str::FromStr>(name: &str, current: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(val) => val.parse::<T>().map_err(|_| ConfigError::ParseError {
            var: name.into(),
            reason: format!("'{val}' is not a valid value"),
        }),
        Err(_) => Ok(current),
    }
}

impl GatewayConfig {
    /// Load configuration starting from [`GatewayConfig::default`] and
    /// overlaying every recognised environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] if a variable is present but
    /// cannot be parsed, or [`ConfigError::ValidationError`] if the
    /// resulting configuration fails [`GatewayConfig::validate`].
    pub fn from_env() -> Result<(Self, Vec<ConfigWarning>), ConfigError> {
        let mut cfg = Self::default();

        cfg.router_port = env_u16("ROUTER_PORT", cfg.router_port)?;
        if let Ok(v) = std::env::var("HOST") {
            cfg.host = v;
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            cfg.log_level = v;
        }
        cfg.rate_limit_global_max = env_u32("RATE_LIMIT_GLOBAL_MAX", cfg.rate_limit_global_max)?;
        cfg.rate_limit_window_ms = env_u64("RATE_LIMIT_WINDOW_MS", cfg.rate_limit_window_ms)?;
        cfg.queue_max_depth.critical =
            env_u32("QUEUE_MAX_DEPTH_CRITICAL", cfg.queue_max_depth.critical)?;
        cfg.queue_max_depth.high = env_u32("QUEUE_MAX_DEPTH_HIGH", cfg.queue_max_depth.high)?;
        cfg.queue_max_depth.normal = env_u32("QUEUE_MAX_DEPTH_NORMAL", cfg.queue_max_depth.normal)?;
        cfg.queue_max_depth.low = env_u32("QUEUE_MAX_DEPTH_LOW", cfg.queue_max_depth.low)?;
        cfg.circuit_failure_threshold =
            env_u32("CIRCUIT_FAILURE_THRESHOLD", cfg.circuit_failure_threshold)?;
        cfg.circuit_cooldown_ms = env_u64("CIRCUIT_COOLDOWN_MS", cfg.circuit_cooldown_ms)?;
        cfg.cache_max_entries = env_usize("CACHE_MAX_ENTRIES", cfg.cache_max_entries)?;
        cfg.cache_default_ttl_ms = env_u64("CACHE_DEFAULT_TTL_MS", cfg.cache_default_ttl_ms)?;
        cfg.activity_max_events = env_usize("ACTIVITY_MAX_EVENTS", cfg.activity_max_events)?;
        cfg.activity_ttl_ms = env_u64("ACTIVITY_TTL_MS", cfg.activity_ttl_ms)?;
        if let Ok(v) = std::env::var("CACHE_HITS_CONSUME_QUOTA") {
            cfg.cache_hits_consume_quota = v != "0" && v.to_lowercase() != "false";
        }

        cfg.validate()?;
        let warnings = cfg.warnings();
        Ok((cfg, warnings))
    }

    /// Validate hard constraints, returning every violation found.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if any constraint fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            errors.push(format!("invalid log_level '{}'", self.log_level));
        }
        if self.cache_max_entries == 0 {
            errors.push("cache_max_entries must be > 0".into());
        }
        if self.rate_limit_global_max == 0 {
            errors.push("rate_limit_global_max must be > 0".into());
        }
        if self.rate_limit_window_ms == 0 {
            errors.push("rate_limit_window_ms must be > 0".into());
        }
        if self.circuit_failure_threshold == 0 {
            errors.push("circuit_failure_threshold must be > 0".into());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationError { reasons: errors })
        }
    }

    /// Advisory warnings that do not block startup.
    #[must_use]
    pub fn warnings(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        if self.rate_limit_window_ms < 1_000 {
            warnings.push(ConfigWarning::ShortWindow {
                window_ms: self.rate_limit_window_ms,
            });
        }
        for (level, depth) in [
            ("critical", self.queue_max_depth.critical),
            ("high", self.queue_max_depth.high),
            ("normal", self.queue_max_depth.normal),
            ("low", self.queue_max_depth.low),
        ] {
            if depth < 4 {
                warnings.push(ConfigWarning::SmallQueueDepth { level, depth });
            }
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn default_config_is_valid() {
        let cfg = GatewayConfig::default();
        cfg.validate().expect("default config should validate");
        assert_eq!(cfg.router_port, 3001);
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.activity_ttl_ms, 86_400_000);
    }

    #[test]
    fn invalid_log_level_is_rejected() {
        let mut cfg = GatewayConfig::default();
        cfg.log_level = "verbose".into();
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn zero_cache_entries_is_rejected() {
        let mut cfg = GatewayConfig::default();
        cfg.cache_max_entries = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn short_window_produces_warning() {
        let mut cfg = GatewayConfig::default();
        cfg.rate_limit_window_ms = 500;
        let warnings = cfg.warnings();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::ShortWindow { .. })));
    }

    #[test]
    fn env_override_applies() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("ROUTER_PORT", "9999");
        std::env::set_var("CACHE_HITS_CONSUME_QUOTA", "false");
        let (cfg, _warnings) = GatewayConfig::from_env().unwrap();
        assert_eq!(cfg.router_port, 9999);
        assert!(!cfg.cache_hits_consume_quota);
        std::env::remove_var("ROUTER_PORT");
        std::env::remove_var("CACHE_HITS_CONSUME_QUOTA");
    }

    #[test]
    fn bad_env_value_is_a_parse_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("ROUTER_PORT", "not-a-port");
        let err = GatewayConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
        std::env::remove_var("ROUTER_PORT");
    }
}
