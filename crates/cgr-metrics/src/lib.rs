// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-capability metrics (C2): counters, latency aggregates, a per-minute
//! rate window, and a system-wide summary.
//!
//! Each capability's cell is guarded independently
//! (`Arc<std::sync::Mutex<MetricsCell>>`) so that concurrent `Record` calls
//! for different capabilities never contend on a single global lock; only
//! the top-level map (read-mostly after warm-up) takes a shared lock to
//! find or insert a cell.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const RPM_WINDOW: Duration = Duration::from_secs(60);

/// Running latency aggregate for one capability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Latency {
    /// Running average, in milliseconds.
    pub avg: f64,
    /// Minimum observed latency.
    pub min: u64,
    /// Maximum observed latency.
    pub max: u64,
}

impl Default for Latency {
    fn default() -> Self {
        Self {
            avg: 0.0,
            min: u64::MAX,
            max: 0,
        }
    }
}

/// Snapshot of one capability's metrics cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsCell {
    /// Capability id.
    pub capability_id: String,
    /// Total invocations recorded.
    pub total: u64,
    /// Successful invocations.
    pub success: u64,
    /// Failed invocations.
    pub failed: u64,
    /// Latency aggregate.
    pub latency: Latency,
    /// Sum of `cost_actual` across all recorded invocations.
    pub cost_sum: f64,
    /// Timestamp of the most recent recording.
    pub last_seen: DateTime<Utc>,
    #[serde(skip)]
    recent: Vec<Instant>,
}

impl MetricsCell {
    fn new(capability_id: String) -> Self {
        Self {
            capability_id,
            total: 0,
            success: 0,
            failed: 0,
            latency: Latency::default(),
            cost_sum: 0.0,
            last_seen: Utc::now(),
            recent: Vec::new(),
        }
    }

    fn record(&mut self, success: bool, latency_ms: u64, cost: f64) {
        self.total += 1;
        if success {
            self.success += 1;
        } else {
            self.failed += 1;
        }
        // avg' = avg + (x - avg) / n
        self.latency.avg += (latency_ms as f64 - self.latency.avg) / self.total as f64;
        self.latency.min = self.latency.min.min(latency_ms);
        self.latency.max = self.latency.max.max(latency_ms);
        self.cost_sum += cost;
        self.last_seen = Utc::now();

        let now = Instant::now();
        self.recent.push(now);
        self.recent.retain(|t| now.duration_since(*t) <= RPM_WINDOW);
    }

    fn rpm(&self) -> usize {
        let now = Instant::now();
        self.recent
            .iter()
            .filter(|t| now.duration_since(**t) <= RPM_WINDOW)
            .count()
    }
}

/// System-wide metrics summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSummary {
    /// Milliseconds since the collector was created.
    pub uptime_ms: u64,
    /// Total invocations across all capabilities.
    pub total: u64,
    /// Requests recorded in the last 60 seconds, across all capabilities.
    pub rpm: usize,
    /// Number of distinct capabilities with at least one recorded invocation.
    pub capabilities: usize,
}

/// Shared, thread-safe metrics collector.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    cells: Arc<RwLock<BTreeMap<String, Arc<Mutex<MetricsCell>>>>>,
    created_at: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Create an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cells: Arc::new(RwLock::new(BTreeMap::new())),
            created_at: Instant::now(),
        }
    }

    fn cell_for(&self, capability_id: &str) -> Arc<Mutex<MetricsCell>> {
        if let Some(cell) = self.cells.read().unwrap().get(capability_id) {
            return cell.clone();
        }
        let mut cells = self.cells.write().unwrap();
        cells
            .entry(capability_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(MetricsCell::new(capability_id.to_string()))))
            .clone()
    }

    /// Record one invocation outcome for `capability_id`.
    pub fn record(&self, capability_id: &str, success: bool, latency_ms: u64, cost: f64) {
        let cell = self.cell_for(capability_id);
        cell.lock().unwrap().record(success, latency_ms, cost);
        tracing::debug!(
            capability_id,
            success,
            latency_ms,
            cost,
            "recorded invocation metrics"
        );
    }

    /// Snapshot the cell for one capability, if it has ever been recorded.
    #[must_use]
    pub fn get(&self, capability_id: &str) -> Option<MetricsCell> {
        self.cells
            .read()
            .unwrap()
            .get(capability_id)
            .map(|c| c.lock().unwrap().clone())
    }

    fn all_snapshots(&self) -> Vec<MetricsCell> {
        self.cells
            .read()
            .unwrap()
            .values()
            .map(|c| c.lock().unwrap().clone())
            .collect()
    }

    /// Top `n` capabilities by total invocation count, descending.
    #[must_use]
    pub fn top(&self, n: usize) -> Vec<MetricsCell> {
        let mut cells = self.all_snapshots();
        cells.sort_by(|a, b| b.total.cmp(&a.total));
        cells.truncate(n);
        cells
    }

    /// Slowest `n` capabilities by average latency, descending, filtering
    /// out any with zero recorded invocations.
    #[must_use]
    pub fn slowest(&self, n: usize) -> Vec<MetricsCell> {
        let mut cells: Vec<_> = self.all_snapshots().into_iter().filter(|c| c.total > 0).collect();
        cells.sort_by(|a, b| b.latency.avg.partial_cmp(&a.latency.avg).unwrap());
        cells.truncate(n);
        cells
    }

    /// System-wide summary: uptime, total invocations, requests-per-minute,
    /// number of distinct capabilities seen.
    #[must_use]
    pub fn system(&self) -> SystemSummary {
        let cells = self.all_snapshots();
        let total: u64 = cells.iter().map(|c| c.total).sum();
        let rpm: usize = self
            .cells
            .read()
            .unwrap()
            .values()
            .map(|c| c.lock().unwrap().rpm())
            .sum();
        SystemSummary {
            uptime_ms: self.created_at.elapsed().as_millis() as u64,
            total,
            rpm,
            capabilities: cells.len(),
        }
    }

    /// System-wide average latency across every capability, weighted by
    /// each capability's invocation count. `0.0` if nothing has been
    /// recorded yet. Feeds the memory supervisor's pressure sample.
    #[must_use]
    pub fn avg_latency_ms(&self) -> f64 {
        let cells = self.all_snapshots();
        let total: u64 = cells.iter().map(|c| c.total).sum();
        if total == 0 {
            return 0.0;
        }
        let weighted: f64 = cells.iter().map(|c| c.latency.avg * c.total as f64).sum();
        weighted / total as f64
    }

    /// Remove every recorded cell. Used by tests and admin reset tooling.
    pub fn clear(&self) {
        self.cells.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn record_and_get() {
        let metrics = MetricsCollector::new();
        metrics.record("cap.price.lookup.v1", true, 10, 0.01);
        metrics.record("cap.price.lookup.v1", true, 20, 0.01);
        let cell = metrics.get("cap.price.lookup.v1").unwrap();
        assert_eq!(cell.total, 2);
        assert_eq!(cell.success, 2);
        assert_eq!(cell.failed, 0);
        assert!((cell.latency.avg - 15.0).abs() < 1e-9);
        assert_eq!(cell.latency.min, 10);
        assert_eq!(cell.latency.max, 20);
    }

    #[test]
    fn unknown_capability_returns_none() {
        let metrics = MetricsCollector::new();
        assert!(metrics.get("cap.unknown.v1").is_none());
    }

    #[test]
    fn top_orders_by_total_descending() {
        let metrics = MetricsCollector::new();
        metrics.record("cap.a.v1", true, 1, 0.0);
        metrics.record("cap.b.v1", true, 1, 0.0);
        metrics.record("cap.b.v1", true, 1, 0.0);
        let top = metrics.top(1);
        assert_eq!(top[0].capability_id, "cap.b.v1");
    }

    #[test]
    fn slowest_filters_zero_total_and_orders_descending() {
        let metrics = MetricsCollector::new();
        metrics.record("cap.fast.v1", true, 5, 0.0);
        metrics.record("cap.slow.v1", true, 500, 0.0);
        let slowest = metrics.slowest(5);
        assert_eq!(slowest[0].capability_id, "cap.slow.v1");
        assert!(slowest.iter().all(|c| c.total > 0));
    }

    #[test]
    fn system_reports_totals() {
        let metrics = MetricsCollector::new();
        metrics.record("cap.a.v1", true, 1, 1.0);
        metrics.record("cap.b.v1", false, 2, 2.0);
        let system = metrics.system();
        assert_eq!(system.total, 2);
        assert_eq!(system.capabilities, 2);
        assert_eq!(system.rpm, 2);
    }

    #[test]
    fn avg_latency_ms_weights_by_invocation_count() {
        let metrics = MetricsCollector::new();
        assert_eq!(metrics.avg_latency_ms(), 0.0);
        metrics.record("cap.a.v1", true, 10, 0.0);
        metrics.record("cap.b.v1", true, 100, 0.0);
        metrics.record("cap.b.v1", true, 100, 0.0);
        // cap.a: avg 10 over 1 call, cap.b: avg 100 over 2 calls.
        // weighted = (10*1 + 100*2) / 3 = 70.
        assert!((metrics.avg_latency_ms() - 70.0).abs() < 1e-9);
    }

    #[test]
    fn concurrent_recording_is_thread_safe() {
        let metrics = MetricsCollector::new();
        let mut handles = vec![];
        for _ in 0..8 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    m.record("cap.shared.v1", true, 1, 0.0);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(metrics.get("cap.shared.v1").unwrap().total, 400);
    }
}
