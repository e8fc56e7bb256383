// SPDX-License-Identifier: MIT OR Apache-2.0
//! Structured log ring buffer (C12).
//!
//! Every call to [`LogRing::log`] both appends to a bounded in-memory ring
//! (for `/health`-style introspection without a log aggregator) and echoes
//! through `tracing`, so the same entry reaches stdout/whatever exporter
//! is configured at the process level.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    /// Routine operational detail.
    Info,
    /// Recoverable anomaly worth a human's attention.
    Warn,
    /// Failure.
    Error,
}

/// One ring entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Severity.
    pub level: Level,
    /// Emitting component, e.g. `"router"`, `"circuit_breaker"`.
    pub component: String,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub meta: serde_json::Value,
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
}

/// Counts of retained entries per level.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LevelStats {
    /// Retained `info` entries.
    pub info: usize,
    /// Retained `warn` entries.
    pub warn: usize,
    /// Retained `error` entries.
    pub error: usize,
}

/// Bounded structured-log ring buffer.
pub struct LogRing {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl LogRing {
    /// Create a ring retaining at most `capacity` entries (spec default 1000).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Append an entry and echo it through `tracing` at the matching level.
    pub fn log(&self, level: Level, component: &str, message: &str, meta: serde_json::Value) {
        let entry = LogEntry {
            level,
            component: component.to_string(),
            message: message.to_string(),
            meta: meta.clone(),
            timestamp: Utc::now(),
        };

        match level {
            Level::Info => tracing::info!(component, %meta, "{message}"),
            Level::Warn => tracing::warn!(component, %meta, "{message}"),
            Level::Error => tracing::error!(component, %meta, "{message}"),
        }

        let mut entries = self.entries.lock().unwrap();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// Retrieve the most recent `limit` entries, newest first, optionally
    /// filtered by level.
    #[must_use]
    pub fn recent(&self, level: Option<Level>, limit: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .rev()
            .filter(|e| level.is_none_or(|l| e.level == l))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Counts of currently retained entries per level.
    #[must_use]
    pub fn stats(&self) -> LevelStats {
        let entries = self.entries.lock().unwrap();
        let mut stats = LevelStats::default();
        for entry in entries.iter() {
            match entry.level {
                Level::Info => stats.info += 1,
                Level::Warn => stats.warn += 1,
                Level::Error => stats.error += 1,
            }
        }
        stats
    }
}
