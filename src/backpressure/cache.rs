// SPDX-License-Identifier: MIT
//! Severity-indexed TTL cache with event-driven invalidation.
//!
//! Entries carry a priority and a TTL; critical events sweep the cache in a
//! single pass per shard (critical/high entries dropped, stale medium
//! entries dropped, low entries kept). Shards keyed by key hash keep the
//! sweep short and the lock fine-grained.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

/// Event kinds that trigger an invalidation sweep.
pub const CRITICAL_EVENT_KINDS: [&str; 7] = [
    "PROVIDER_HEALTH_DEGRADING",
    "PROVIDER_HEALTH_RECOVERING",
    "QUEUE_UTILIZATION_SPIKE",
    "RATE_LIMIT_APPROACHING",
    "PREDICTIVE_HEALTH_ALERT",
    "DROPPED",
    "QUEUE_FULL",
];

/// Medium-priority entries older than this are dropped on a critical sweep.
const MEDIUM_STALE_AFTER_MS: i64 = 30_000;

const SHARD_COUNT: usize = 16;

/// Cache entry priority. Declaration order is the eviction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePriority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    priority: CachePriority,
    inserted_at: DateTime<Utc>,
    ttl_ms: i64,
}

impl CacheEntry {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        (now - self.inserted_at).num_milliseconds() >= self.ttl_ms
    }

    /// Past half its TTL — a candidate for background refresh.
    fn refresh_due(&self, now: DateTime<Utc>) -> bool {
        (now - self.inserted_at).num_milliseconds() * 2 >= self.ttl_ms
    }
}

/// What one invalidation sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationStats {
    pub dropped_high: usize,
    pub dropped_stale_medium: usize,
}

impl InvalidationStats {
    pub fn total(&self) -> usize {
        self.dropped_high + self.dropped_stale_medium
    }
}

pub struct InvalidatingCache {
    shards: Vec<Mutex<HashMap<String, CacheEntry>>>,
}

impl Default for InvalidatingCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InvalidatingCache {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, CacheEntry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    pub fn insert(
        &self,
        key: impl Into<String>,
        value: Vec<u8>,
        priority: CachePriority,
        ttl: Duration,
        now: DateTime<Utc>,
    ) {
        let key = key.into();
        let entry = CacheEntry {
            value,
            priority,
            inserted_at: now,
            ttl_ms: ttl.num_milliseconds(),
        };
        self.shard(&key)
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, entry);
    }

    /// Fetch a live value; an expired entry reads as absent and is removed.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<Vec<u8>> {
        let mut shard = self.shard(key).lock().unwrap_or_else(|e| e.into_inner());
        match shard.get(key) {
            Some(entry) if entry.expired(now) => {
                shard.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.shard(key)
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep on a critical event: drop critical+high entries, drop medium
    /// entries older than 30 s, keep low. A non-critical kind is a no-op.
    ///
    /// One O(n) pass per shard; each shard lock is held only for its own
    /// retain.
    pub fn invalidate_on_critical_change(&self, kind: &str, now: DateTime<Utc>) -> InvalidationStats {
        if !CRITICAL_EVENT_KINDS.contains(&kind) {
            return InvalidationStats::default();
        }

        let mut stats = InvalidationStats::default();
        for shard in &self.shards {
            let mut map = shard.lock().unwrap_or_else(|e| e.into_inner());
            map.retain(|_, entry| match entry.priority {
                CachePriority::Critical | CachePriority::High => {
                    stats.dropped_high += 1;
                    false
                }
                CachePriority::Medium => {
                    if (now - entry.inserted_at).num_milliseconds() > MEDIUM_STALE_AFTER_MS {
                        stats.dropped_stale_medium += 1;
                        false
                    } else {
                        true
                    }
                }
                CachePriority::Low => true,
            });
        }
        if stats.total() > 0 {
            tracing::debug!(kind, dropped = stats.total(), "cache invalidation sweep");
        }
        stats
    }

    /// Keys past 50 % of their TTL. The core only signals; the caller owns
    /// the actual refresh.
    pub fn refresh_candidates(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due = Vec::new();
        for shard in &self.shards {
            let map = shard.lock().unwrap_or_else(|e| e.into_inner());
            for (key, entry) in map.iter() {
                if !entry.expired(now) && entry.refresh_due(now) {
                    due.push(key.clone());
                }
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> InvalidatingCache {
        InvalidatingCache::new()
    }

    #[test]
    fn get_honors_ttl() {
        let c = cache();
        let now = Utc::now();
        c.insert("k", b"v".to_vec(), CachePriority::Low, Duration::seconds(10), now);

        assert_eq!(c.get("k", now + Duration::seconds(5)), Some(b"v".to_vec()));
        assert_eq!(c.get("k", now + Duration::seconds(11)), None);
        // Expired entry is gone for good.
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn non_critical_kind_is_noop() {
        let c = cache();
        let now = Utc::now();
        c.insert("k", vec![1], CachePriority::Critical, Duration::seconds(60), now);
        let stats = c.invalidate_on_critical_change("ALLOWED", now);
        assert_eq!(stats.total(), 0);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn critical_sweep_drops_by_priority() {
        let c = cache();
        let now = Utc::now();
        c.insert("crit", vec![1], CachePriority::Critical, Duration::minutes(5), now);
        c.insert("high", vec![2], CachePriority::High, Duration::minutes(5), now);
        c.insert(
            "med-old",
            vec![3],
            CachePriority::Medium,
            Duration::minutes(5),
            now - Duration::seconds(45),
        );
        c.insert("med-fresh", vec![4], CachePriority::Medium, Duration::minutes(5), now);
        c.insert("low", vec![5], CachePriority::Low, Duration::minutes(5), now);

        let stats = c.invalidate_on_critical_change("DROPPED", now);
        assert_eq!(stats.dropped_high, 2);
        assert_eq!(stats.dropped_stale_medium, 1);

        assert!(c.get("crit", now).is_none());
        assert!(c.get("high", now).is_none());
        assert!(c.get("med-old", now).is_none());
        assert!(c.get("med-fresh", now).is_some());
        assert!(c.get("low", now).is_some());
    }

    #[test]
    fn every_critical_kind_triggers() {
        for kind in CRITICAL_EVENT_KINDS {
            let c = cache();
            let now = Utc::now();
            c.insert("k", vec![1], CachePriority::High, Duration::minutes(5), now);
            assert_eq!(
                c.invalidate_on_critical_change(kind, now).total(),
                1,
                "kind {kind} must sweep"
            );
        }
    }

    #[test]
    fn refresh_candidates_past_half_ttl() {
        let c = cache();
        let now = Utc::now();
        c.insert("young", vec![1], CachePriority::Low, Duration::seconds(100), now);
        c.insert(
            "aging",
            vec![2],
            CachePriority::Low,
            Duration::seconds(100),
            now - Duration::seconds(60),
        );
        c.insert(
            "dead",
            vec![3],
            CachePriority::Low,
            Duration::seconds(100),
            now - Duration::seconds(200),
        );

        let due = c.refresh_candidates(now);
        assert_eq!(due, vec!["aging".to_string()]);
    }

    #[test]
    fn sweep_is_fast_for_ten_thousand_entries() {
        let c = cache();
        let now = Utc::now();
        for i in 0..10_000 {
            let priority = match i % 4 {
                0 => CachePriority::Low,
                1 => CachePriority::Medium,
                2 => CachePriority::High,
                _ => CachePriority::Critical,
            };
            c.insert(format!("k{i}"), vec![0u8; 64], priority, Duration::minutes(5), now);
        }
        let started = std::time::Instant::now();
        let stats = c.invalidate_on_critical_change("QUEUE_FULL", now);
        let elapsed = started.elapsed();
        assert_eq!(stats.dropped_high, 5_000);
        assert!(
            elapsed.as_millis() <= 100,
            "sweep took {}ms for 10k entries",
            elapsed.as_millis()
        );
    }
}
