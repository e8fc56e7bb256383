// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded priority admission queue (C6): four levels, strict-priority
//! drain with a per-level starvation guard, and inflight deduplication so
//! concurrent identical invocations collapse onto one execution.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cgr_core::Priority;
use cgr_error::GatewayError;
use tokio::sync::{broadcast, oneshot, Notify};

/// Per-priority-level settings: concurrency cap and maximum waiting depth.
#[derive(Debug, Clone, Copy)]
pub struct LevelConfig {
    /// Maximum number of entries from this level executing concurrently.
    pub concurrency: usize,
    /// Maximum number of entries waiting for admission at this level.
    pub max_depth: usize,
}

/// Full queue configuration: one [`LevelConfig`] per priority, plus the
/// starvation guard duration (spec §4.6's `S`, default 5s).
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Settings for the `critical` level.
    pub critical: LevelConfig,
    /// Settings for the `high` level.
    pub high: LevelConfig,
    /// Settings for the `normal` level.
    pub normal: LevelConfig,
    /// Settings for the `low` level.
    pub low: LevelConfig,
    /// No level may wait longer than this before being force-served out
    /// of strict priority order.
    pub starvation_guard: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            critical: LevelConfig {
                concurrency: 16,
                max_depth: 256,
            },
            high: LevelConfig {
                concurrency: 8,
                max_depth: 256,
            },
            normal: LevelConfig {
                concurrency: 32,
                max_depth: 512,
            },
            low: LevelConfig {
                concurrency: 4,
                max_depth: 128,
            },
            starvation_guard: Duration::from_secs(5),
        }
    }
}

/// Levels in strict-priority dequeue order: critical first, low last.
const STRICT_ORDER: [Priority; 4] = [
    Priority::Critical,
    Priority::High,
    Priority::Normal,
    Priority::Low,
];

/// Levels in the order the starvation guard checks them: lowest priority
/// (most likely to starve) first.
const STARVATION_ORDER: [Priority; 4] = [
    Priority::Low,
    Priority::Normal,
    Priority::High,
    Priority::Critical,
];

fn level_config(cfg: &QueueConfig, priority: Priority) -> LevelConfig {
    match priority {
        Priority::Critical => cfg.critical,
        Priority::High => cfg.high,
        Priority::Normal => cfg.normal,
        Priority::Low => cfg.low,
    }
}

struct Waiter {
    enqueued_at: Instant,
    grant: Option<oneshot::Sender<Instant>>,
}

struct LevelState {
    in_use: usize,
    waiting: VecDeque<Waiter>,
}

impl LevelState {
    fn new() -> Self {
        Self {
            in_use: 0,
            waiting: VecDeque::new(),
        }
    }
}

struct SchedulerState {
    levels: HashMap<Priority, LevelState>,
}

impl SchedulerState {
    fn new() -> Self {
        let mut levels = HashMap::new();
        for p in STRICT_ORDER {
            levels.insert(p, LevelState::new());
        }
        Self { levels }
    }
}

/// A held admission slot. Dropping it releases the level's concurrency
/// slot and wakes the dispatcher.
pub struct AdmissionTicket {
    priority: Priority,
    inner: Arc<Inner>,
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.inner.release(self.priority);
    }
}

struct Inner {
    config: QueueConfig,
    state: Mutex<SchedulerState>,
    notify: Notify,
}

impl Inner {
    fn dispatch_locked(&self, state: &mut SchedulerState) {
        let now = Instant::now();

        for priority in STARVATION_ORDER {
            let cfg = level_config(&self.config, priority);
            let level = state.levels.get_mut(&priority).unwrap();
            let starved = level
                .waiting
                .front()
                .is_some_and(|w| now.duration_since(w.enqueued_at) >= self.config.starvation_guard);
            if starved && level.in_use < cfg.concurrency {
                if let Some(mut waiter) = level.waiting.pop_front() {
                    level.in_use += 1;
                    if let Some(tx) = waiter.grant.take() {
                        let _ = tx.send(Instant::now());
                    }
                }
            }
        }

        for priority in STRICT_ORDER {
            let cfg = level_config(&self.config, priority);
            let level = state.levels.get_mut(&priority).unwrap();
            while level.in_use < cfg.concurrency {
                let Some(mut waiter) = level.waiting.pop_front() else {
                    break;
                };
                level.in_use += 1;
                if let Some(tx) = waiter.grant.take() {
                    let _ = tx.send(Instant::now());
                }
            }
        }
    }

    fn release(&self, priority: Priority) {
        let mut state = self.state.lock().unwrap();
        if let Some(level) = state.levels.get_mut(&priority) {
            level.in_use = level.in_use.saturating_sub(1);
        }
        self.dispatch_locked(&mut state);
        drop(state);
        self.notify.notify_waiters();
    }
}

/// Outcome of deduplicated admission into a dedup bucket.
pub enum DedupOutcome<T> {
    /// The caller is first for this key: owns execution and must call
    /// [`DedupGuard::complete`] exactly once.
    Lead(DedupGuard<T>),
    /// Another caller is already executing this key; await the receiver
    /// for the shared result.
    Follow(broadcast::Receiver<T>),
}

/// Held by the winner of a dedup race. Completing it fans the result out
/// to every attached follower and clears the bucket.
pub struct DedupGuard<T> {
    key: String,
    dedup: Arc<Mutex<HashMap<String, broadcast::Sender<T>>>>,
    tx: broadcast::Sender<T>,
}

impl<T: Clone> DedupGuard<T> {
    /// Publish the result to every follower and clear this key's bucket.
    pub fn complete(self, value: T) {
        let _ = self.tx.send(value);
        self.dedup.lock().unwrap().remove(&self.key);
    }
}

impl<T> Drop for DedupGuard<T> {
    fn drop(&mut self) {
        // If the leader panicked or returned early without completing,
        // drop the bucket so followers don't hang forever; their `recv`
        // will observe the channel closing.
        self.dedup.lock().unwrap().remove(&self.key);
    }
}

/// Bounded priority admission queue with inflight deduplication.
///
/// `T` is the execution outcome type shared with followers of a
/// deduplicated invocation (typically the router's execution result).
pub struct Queue<T> {
    inner: Arc<Inner>,
    dedup: Arc<Mutex<HashMap<String, broadcast::Sender<T>>>>,
    next_id: AtomicU64,
}

impl<T: Clone> Queue<T> {
    /// Create a queue with the given per-level configuration.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(SchedulerState::new()),
                notify: Notify::new(),
            }),
            dedup: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Monotonic id useful for correlating log lines with an admission.
    #[must_use]
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Enter the dedup bucket for `inflight_key`. The first caller for a
    /// key becomes [`DedupOutcome::Lead`]; concurrent callers with the
    /// same key become [`DedupOutcome::Follow`] and must not also call
    /// [`Queue::admit`] — they skip straight to awaiting the result.
    pub fn dedup_enter(&self, inflight_key: &str) -> DedupOutcome<T> {
        let mut dedup = self.dedup.lock().unwrap();
        if let Some(tx) = dedup.get(inflight_key) {
            return DedupOutcome::Follow(tx.subscribe());
        }
        let (tx, _rx) = broadcast::channel(1);
        dedup.insert(inflight_key.to_string(), tx.clone());
        DedupOutcome::Lead(DedupGuard {
            key: inflight_key.to_string(),
            dedup: Arc::clone(&self.dedup),
            tx,
        })
    }

    /// Wait for an admission slot at `priority`, honoring the starvation
    /// guard and strict-priority drain order. Returns the ticket and the
    /// time spent waiting.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::ServiceUnavailable`] if the level's waiting
    /// queue is already at `max_depth`, or [`GatewayError::Timeout`] if
    /// `cancel` resolves before an admission slot is granted.
    pub async fn admit(
        &self,
        priority: Priority,
        cancel: impl std::future::Future<Output = ()>,
    ) -> Result<(AdmissionTicket, Duration), GatewayError> {
        let enqueued_at = Instant::now();
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().unwrap();
            let cfg = level_config(&self.inner.config, priority);
            let level = state.levels.get_mut(&priority).unwrap();
            if level.waiting.len() >= cfg.max_depth {
                let shortest = Duration::from_millis(100);
                return Err(GatewayError::service_unavailable("queue at capacity")
                    .with_retry_after_ms(shortest.as_millis() as u64)
                    .with_details(serde_json::json!({ "priority": format!("{priority:?}") })));
            }
            level.waiting.push_back(Waiter {
                enqueued_at,
                grant: Some(tx),
            });
            self.inner.dispatch_locked(&mut state);
        }

        tokio::select! {
            granted = rx => {
                match granted {
                    Ok(granted_at) => {
                        let wait = granted_at.saturating_duration_since(enqueued_at);
                        Ok((
                            AdmissionTicket {
                                priority,
                                inner: Arc::clone(&self.inner),
                            },
                            wait,
                        ))
                    }
                    Err(_) => Err(GatewayError::internal("admission channel closed")),
                }
            }
            () = cancel => {
                self.remove_waiter(priority, enqueued_at);
                Err(GatewayError::timeout("invocation cancelled while queued"))
            }
        }
    }

    fn remove_waiter(&self, priority: Priority, enqueued_at: Instant) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(level) = state.levels.get_mut(&priority) {
            if let Some(pos) = level
                .waiting
                .iter()
                .position(|w| w.enqueued_at == enqueued_at)
            {
                level.waiting.remove(pos);
            }
        }
    }

    /// Snapshot of waiting-entry counts per level, for `/health`-style reporting.
    #[must_use]
    pub fn depths(&self) -> [(Priority, usize); 4] {
        let state = self.inner.state.lock().unwrap();
        [
            (Priority::Critical, state.levels[&Priority::Critical].waiting.len()),
            (Priority::High, state.levels[&Priority::High].waiting.len()),
            (Priority::Normal, state.levels[&Priority::Normal].waiting.len()),
            (Priority::Low, state.levels[&Priority::Low].waiting.len()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;

    fn tiny_config() -> QueueConfig {
        QueueConfig {
            critical: LevelConfig { concurrency: 1, max_depth: 10 },
            high: LevelConfig { concurrency: 1, max_depth: 10 },
            normal: LevelConfig { concurrency: 1, max_depth: 10 },
            low: LevelConfig { concurrency: 1, max_depth: 10 },
            starvation_guard: Duration::from_millis(40),
        }
    }

    #[tokio::test]
    async fn admits_immediately_when_capacity_free() {
        let queue: Queue<()> = Queue::new(tiny_config());
        let (ticket, wait) = queue.admit(Priority::Normal, pending()).await.unwrap();
        assert!(wait < Duration::from_millis(50));
        drop(ticket);
    }

    #[tokio::test]
    async fn dedup_follower_receives_leader_result() {
        let queue: Queue<u32> = Queue::new(tiny_config());
        let lead = match queue.dedup_enter("k1") {
            DedupOutcome::Lead(g) => g,
            DedupOutcome::Follow(_) => panic!("expected lead"),
        };
        let mut follower_rx = match queue.dedup_enter("k1") {
            DedupOutcome::Follow(rx) => rx,
            DedupOutcome::Lead(_) => panic!("expected follow"),
        };
        lead.complete(42);
        assert_eq!(follower_rx.recv().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn dedup_bucket_clears_after_completion() {
        let queue: Queue<u32> = Queue::new(tiny_config());
        let lead = match queue.dedup_enter("k1") {
            DedupOutcome::Lead(g) => g,
            DedupOutcome::Follow(_) => panic!("expected lead"),
        };
        lead.complete(1);
        match queue.dedup_enter("k1") {
            DedupOutcome::Lead(_) => {}
            DedupOutcome::Follow(_) => panic!("bucket should have cleared"),
        }
    }

    #[tokio::test]
    async fn queue_at_max_depth_is_rejected() {
        // Fill the one waiting slot with a pending admit, then a second
        // should be rejected for capacity.
        let queue: Queue<()> = Queue::new(QueueConfig {
            critical: LevelConfig { concurrency: 0, max_depth: 1 },
            high: LevelConfig { concurrency: 1, max_depth: 10 },
            normal: LevelConfig { concurrency: 1, max_depth: 10 },
            low: LevelConfig { concurrency: 1, max_depth: 10 },
            starvation_guard: Duration::from_secs(5),
        });
        let queue = Arc::new(queue);
        let q2 = Arc::clone(&queue);
        tokio::spawn(async move {
            let _ = q2.admit(Priority::Critical, pending()).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = queue.admit(Priority::Critical, pending()).await.unwrap_err();
        assert_eq!(err.kind, cgr_error::ErrorKind::ServiceUnavailable);
    }

    #[tokio::test]
    async fn starvation_guard_admits_low_despite_busy_higher_levels() {
        let config = QueueConfig {
            critical: LevelConfig { concurrency: 1, max_depth: 1000 },
            high: LevelConfig { concurrency: 1, max_depth: 1000 },
            normal: LevelConfig { concurrency: 1, max_depth: 1000 },
            low: LevelConfig { concurrency: 1, max_depth: 1000 },
            starvation_guard: Duration::from_millis(30),
        };
        let queue: Arc<Queue<()>> = Arc::new(Queue::new(config));

        // Occupy the critical slot so it never frees during this test.
        let (_holder, _wait) = queue.admit(Priority::Critical, pending()).await.unwrap();

        // Queue a low-priority waiter, then keep critical demand coming.
        let low_queue = Arc::clone(&queue);
        let low_task = tokio::spawn(async move {
            let start = Instant::now();
            let (_t, _wait) = low_queue.admit(Priority::Low, pending()).await.unwrap();
            start.elapsed()
        });

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(15)).await;
            let cq = Arc::clone(&queue);
            tokio::spawn(async move {
                let _ = cq.admit(Priority::Critical, pending()).await;
            });
        }

        let elapsed = tokio::time::timeout(Duration::from_millis(500), low_task)
            .await
            .expect("low priority request starved past the guard window")
            .unwrap();
        assert!(elapsed < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn cancellation_before_admission_removes_waiter() {
        let config = LevelConfig { concurrency: 0, max_depth: 10 };
        let queue: Queue<()> = Queue::new(QueueConfig {
            critical: config,
            high: config,
            normal: config,
            low: config,
            starvation_guard: Duration::from_secs(999),
        });
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let cancel = async move {
            let _ = cancel_rx.await;
        };
        cancel_tx.send(()).unwrap();
        let err = queue.admit(Priority::Normal, cancel).await.unwrap_err();
        assert_eq!(err.kind, cgr_error::ErrorKind::Timeout);
        assert_eq!(queue.depths()[2].1, 0);
    }
}
