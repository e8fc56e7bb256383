// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only activity feed (C10): a bounded ring of [`ActivityEvent`]s
//! with broadcast fan-out to live subscribers, modeled on the runtime's
//! broadcast event bus but adding TTL/count bounds and query filters.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Kind of activity recorded on the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A capability invocation completed (success or failure).
    CapabilityInvoked,
    /// A capability invocation was rejected before execution.
    CapabilityRejected,
    /// A circuit breaker opened for a capability.
    CircuitOpened,
    /// A circuit breaker closed for a capability.
    CircuitClosed,
    /// A caller was rate limited.
    RateLimited,
    /// An agent identity was endorsed by another party.
    AgentEndorsed,
    /// An agent identity recorded a policy violation.
    AgentViolation,
}

/// Who may see an event in feed queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Visible to any caller.
    #[default]
    Public,
    /// Visible only to the agent the event concerns.
    Private,
    /// Visible to other agents in the caller's trust network, but not the public feed.
    Network,
}

/// One recorded activity event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Unique event id.
    pub id: Uuid,
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Agent the event concerns, if any.
    pub agent_id: Option<String>,
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Free-form event payload.
    pub data: serde_json::Value,
    /// Visibility tier.
    pub visibility: Visibility,
}

/// Filter applied to both live subscriptions and [`ActivityFeed::query`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events concerning this agent.
    pub agent_id: Option<String>,
    /// Only events of these kinds.
    pub types: Option<Vec<EventType>>,
    /// Only events at or after this timestamp.
    pub since: Option<DateTime<Utc>>,
    /// Only events visible at this tier or more permissive; defaults to
    /// `Public` when unset, matching the query surface's default.
    pub visibility: Option<Visibility>,
}

impl EventFilter {
    fn matches(&self, event: &ActivityEvent) -> bool {
        if let Some(agent_id) = &self.agent_id {
            if event.agent_id.as_deref() != Some(agent_id.as_str()) {
                return false;
            }
        }
        if let Some(types) = &self.types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        let required = self.visibility.unwrap_or(Visibility::Public);
        if required == Visibility::Public && event.visibility != Visibility::Public {
            return false;
        }
        true
    }
}

/// A live handle receiving events matching a filter.
pub struct Subscription {
    rx: broadcast::Receiver<ActivityEvent>,
    filter: EventFilter,
}

impl Subscription {
    /// Receive the next matching event, waiting asynchronously.
    ///
    /// Returns `None` only when the feed itself is dropped.
    pub async fn recv(&mut self) -> Option<ActivityEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

struct Inner {
    ring: Mutex<VecDeque<ActivityEvent>>,
    max_events: usize,
    ttl: ChronoDuration,
    tx: broadcast::Sender<ActivityEvent>,
    published: AtomicU64,
}

/// Append-only, bounded activity feed with subscriber fan-out.
#[derive(Clone)]
pub struct ActivityFeed {
    inner: Arc<Inner>,
}

impl ActivityFeed {
    /// Create a feed bounded by `max_events` entries and `ttl_ms`
    /// milliseconds of age (spec §6 defaults: 10 000 / 24h).
    #[must_use]
    pub fn new(max_events: usize, ttl_ms: u64) -> Self {
        let (tx, _rx) = broadcast::channel(1024.max(max_events.min(4096)));
        Self {
            inner: Arc::new(Inner {
                ring: Mutex::new(VecDeque::new()),
                max_events: max_events.max(1),
                ttl: ChronoDuration::milliseconds(ttl_ms as i64),
                tx,
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Record a new event, stamping id/timestamp, evicting expired and
    /// over-capacity entries, and fanning the event out to subscribers.
    pub fn record(
        &self,
        event_type: EventType,
        agent_id: Option<String>,
        data: serde_json::Value,
        visibility: Visibility,
    ) -> ActivityEvent {
        let event = ActivityEvent {
            id: Uuid::new_v4(),
            event_type,
            agent_id,
            timestamp: Utc::now(),
            data,
            visibility,
        };

        {
            let mut ring = self.inner.ring.lock().unwrap();
            let cutoff = Utc::now() - self.inner.ttl;
            while ring.front().is_some_and(|e| e.timestamp < cutoff) {
                ring.pop_front();
            }
            ring.push_back(event.clone());
            while ring.len() > self.inner.max_events {
                ring.pop_front();
            }
        }
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        let _ = self.inner.tx.send(event.clone());
        event
    }

    /// Subscribe to future events matching `filter`.
    #[must_use]
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        Subscription {
            rx: self.inner.tx.subscribe(),
            filter,
        }
    }

    /// Query the retained ring for events matching `filter`, newest
    /// first, capped at `limit`.
    #[must_use]
    pub fn query(&self, filter: &EventFilter, limit: usize) -> Vec<ActivityEvent> {
        let ring = self.inner.ring.lock().unwrap();
        ring.iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Total events ever published (not bounded by the ring).
    #[must_use]
    pub fn total_published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Current retained ring size.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.ring.lock().unwrap().len()
    }

    /// Whether the ring currently holds no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
