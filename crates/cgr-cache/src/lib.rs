// SPDX-License-Identifier: MIT OR Apache-2.0
//! TTL + LRU response cache (C3), keyed by `(capability_id, sha256(canonical_inputs))`.
//!
//! Concurrent `get`s are lock-free beyond the map's own read lock.
//! Concurrent `set`s for the same key may overwrite arbitrarily — last
//! writer wins; callers that need build-once semantics use the queue's
//! dedup instead (see `cgr-queue`).
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use cgr_core::{canonical_json, sha256_hex};
use serde::{Deserialize, Serialize};

/// Key identifying one cache slot: a capability id plus a content hash of
/// its canonicalized inputs. The key implies its `capability_id` — it is
/// never reused to store a value for a different capability.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Capability the cached value belongs to.
    pub capability_id: String,
    /// `sha256` of the canonical-JSON-encoded inputs.
    pub inputs_hash: String,
}

impl CacheKey {
    /// Build a key from a capability id and a raw inputs value.
    ///
    /// # Errors
    ///
    /// Returns an error if `inputs` cannot be canonicalized to JSON.
    pub fn new(capability_id: &str, inputs: &serde_json::Value) -> Result<Self, cgr_core::CoreError> {
        let canonical = canonical_json(inputs)?;
        Ok(Self {
            capability_id: capability_id.to_string(),
            inputs_hash: sha256_hex(canonical.as_bytes()),
        })
    }

    fn cache_map_key(&self) -> String {
        format!("{}:{}", self.capability_id, self.inputs_hash)
    }
}

struct Entry {
    value: serde_json::Value,
    inserted_at: Instant,
    ttl: Duration,
    hits: u64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) > self.ttl
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Total `get` calls that found a live entry.
    pub hits: u64,
    /// Total `get` calls that found nothing (absent or expired).
    pub misses: u64,
    /// Current number of live entries.
    pub size: usize,
    /// Entries evicted by LRU pressure, cumulative.
    pub lru_evictions: u64,
    /// Entries evicted by TTL expiry (lazily, on access), cumulative.
    pub ttl_evictions: u64,
}

struct StatsInner {
    hits: u64,
    misses: u64,
    lru_evictions: u64,
    ttl_evictions: u64,
}

/// TTL + LRU cache shared across invocations of the router.
pub struct Cache {
    entries: RwLock<HashMap<String, Entry>>,
    lru: Mutex<Vec<String>>,
    stats: Mutex<StatsInner>,
    max_entries: usize,
}

impl Cache {
    /// Create a cache holding at most `max_entries` live entries.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            lru: Mutex::new(Vec::new()),
            stats: Mutex::new(StatsInner {
                hits: 0,
                misses: 0,
                lru_evictions: 0,
                ttl_evictions: 0,
            }),
            max_entries: max_entries.max(1),
        }
    }

    /// Fetch a live value for `key`, applying lazy TTL expiry.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<serde_json::Value> {
        let map_key = key.cache_map_key();
        let now = Instant::now();

        // Fast path: check without taking the write lock.
        let expired = {
            let entries = self.entries.read().unwrap();
            match entries.get(&map_key) {
                Some(entry) if entry.is_expired(now) => true,
                Some(entry) => {
                    let value = entry.value.clone();
                    drop(entries);
                    self.record_hit(&map_key);
                    return Some(value);
                }
                None => {
                    self.record_miss();
                    return None;
                }
            }
        };

        if expired {
            let mut entries = self.entries.write().unwrap();
            entries.remove(&map_key);
            self.lru.lock().unwrap().retain(|k| k != &map_key);
            let mut stats = self.stats.lock().unwrap();
            stats.misses += 1;
            stats.ttl_evictions += 1;
        }
        None
    }

    fn record_hit(&self, map_key: &str) {
        {
            let mut entries = self.entries.write().unwrap();
            if let Some(entry) = entries.get_mut(map_key) {
                entry.hits += 1;
            }
        }
        self.touch(map_key);
        self.stats.lock().unwrap().hits += 1;
    }

    fn record_miss(&self) {
        self.stats.lock().unwrap().misses += 1;
    }

    fn touch(&self, map_key: &str) {
        let mut lru = self.lru.lock().unwrap();
        lru.retain(|k| k != map_key);
        lru.push(map_key.to_string());
    }

    /// Insert or overwrite a value with the given TTL, evicting the
    /// least-recently-used entry if the cache is already at capacity.
    pub fn set(&self, key: &CacheKey, value: serde_json::Value, ttl: Duration) {
        let map_key = key.cache_map_key();
        let mut entries = self.entries.write().unwrap();
        let is_new = !entries.contains_key(&map_key);
        entries.insert(
            map_key.clone(),
            Entry {
                value,
                inserted_at: Instant::now(),
                ttl,
                hits: 0,
            },
        );

        if is_new && entries.len() > self.max_entries {
            let mut lru = self.lru.lock().unwrap();
            if let Some(victim) = lru.first().cloned() {
                lru.remove(0);
                entries.remove(&victim);
                self.stats.lock().unwrap().lru_evictions += 1;
            }
        }
        drop(entries);
        self.touch(&map_key);
    }

    /// Remove a single key, if present.
    pub fn invalidate(&self, key: &CacheKey) {
        let map_key = key.cache_map_key();
        self.entries.write().unwrap().remove(&map_key);
        self.lru.lock().unwrap().retain(|k| k != &map_key);
    }

    /// Remove every entry for which `predicate` returns `true`, given the
    /// entry's `capability_id`.
    pub fn invalidate_where(&self, predicate: impl Fn(&str) -> bool) {
        let mut entries = self.entries.write().unwrap();
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(k, _)| predicate(capability_id_of(k)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            entries.remove(key);
        }
        drop(entries);
        let mut lru = self.lru.lock().unwrap();
        lru.retain(|k| !doomed.contains(k));
    }

    /// Snapshot hit/miss/size/eviction counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let stats = self.stats.lock().unwrap();
        CacheStats {
            hits: stats.hits,
            misses: stats.misses,
            size: self.entries.read().unwrap().len(),
            lru_evictions: stats.lru_evictions,
            ttl_evictions: stats.ttl_evictions,
        }
    }
}

fn capability_id_of(map_key: &str) -> &str {
    map_key.split_once(':').map_or(map_key, |(id, _)| id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(cap: &str, inputs: serde_json::Value) -> CacheKey {
        CacheKey::new(cap, &inputs).unwrap()
    }

    #[test]
    fn set_then_get_within_ttl_returns_value() {
        let cache = Cache::new(10);
        let k = key("cap.price.lookup.v1", serde_json::json!({"a": 1}));
        cache.set(&k, serde_json::json!({"price": 1}), Duration::from_secs(30));
        assert_eq!(cache.get(&k), Some(serde_json::json!({"price": 1})));
    }

    #[test]
    fn expired_entry_is_absent() {
        let cache = Cache::new(10);
        let k = key("cap.price.lookup.v1", serde_json::json!({"a": 1}));
        cache.set(&k, serde_json::json!({"price": 1}), Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.get(&k), None);
    }

    #[test]
    fn lru_evicts_oldest_on_overflow() {
        let cache = Cache::new(2);
        let a = key("cap.a.v1", serde_json::json!({}));
        let b = key("cap.b.v1", serde_json::json!({}));
        let c = key("cap.c.v1", serde_json::json!({}));
        cache.set(&a, serde_json::json!(1), Duration::from_secs(60));
        cache.set(&b, serde_json::json!(2), Duration::from_secs(60));
        cache.set(&c, serde_json::json!(3), Duration::from_secs(60));
        assert_eq!(cache.get(&a), None);
        assert!(cache.get(&b).is_some());
        assert!(cache.get(&c).is_some());
    }

    #[test]
    fn invalidate_removes_single_key() {
        let cache = Cache::new(10);
        let k = key("cap.a.v1", serde_json::json!({}));
        cache.set(&k, serde_json::json!(1), Duration::from_secs(60));
        cache.invalidate(&k);
        assert_eq!(cache.get(&k), None);
    }

    #[test]
    fn invalidate_where_matches_capability_id() {
        let cache = Cache::new(10);
        let a = key("cap.a.v1", serde_json::json!({}));
        let b = key("cap.b.v1", serde_json::json!({}));
        cache.set(&a, serde_json::json!(1), Duration::from_secs(60));
        cache.set(&b, serde_json::json!(2), Duration::from_secs(60));
        cache.invalidate_where(|id| id == "cap.a.v1");
        assert_eq!(cache.get(&a), None);
        assert!(cache.get(&b).is_some());
    }

    #[test]
    fn key_is_stable_regardless_of_field_order() {
        let k1 = key("cap.a.v1", serde_json::json!({"x": 1, "y": 2}));
        let k2 = key("cap.a.v1", serde_json::json!({"y": 2, "x": 1}));
        assert_eq!(k1, k2);
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let cache = Cache::new(10);
        let k = key("cap.a.v1", serde_json::json!({}));
        assert!(cache.get(&k).is_none());
        cache.set(&k, serde_json::json!(1), Duration::from_secs(60));
        assert!(cache.get(&k).is_some());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }
}
