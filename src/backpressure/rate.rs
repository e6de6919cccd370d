//! Per-provider leaky-bucket rate limiting.
//!
//! Each provider owns one bucket behind its own lock — the limiter as a
//! whole is never a single hot mutex. All time-dependent methods take an
//! explicit `now` so tests drive the clock.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Bucket parameters.
#[derive(Debug, Clone, Copy)]
pub struct RateBucketConfig {
    pub capacity: f64,
    /// Tokens regained per second.
    pub refill_per_sec: f64,
}

impl Default for RateBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_per_sec: 1.0,
        }
    }
}

/// Outcome of a consumption attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    Allowed {
        /// Fraction of capacity consumed after this take, 0..1.
        utilization: f64,
    },
    Limited {
        /// Time until one full token is available.
        wait_ms: u64,
    },
}

impl RateDecision {
    pub fn allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }

    pub fn wait_ms(&self) -> u64 {
        match self {
            RateDecision::Allowed { .. } => 0,
            RateDecision::Limited { wait_ms } => *wait_ms,
        }
    }
}

/// Non-mutating view of a bucket.
#[derive(Debug, Clone, Copy)]
pub struct BucketStatus {
    pub level: f64,
    pub capacity: f64,
    pub refill_per_sec: f64,
    /// Consumed fraction of capacity, 0..1.
    pub utilization: f64,
}

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    refill_per_sec: f64,
    level: f64,
    last_refill: DateTime<Utc>,
}

impl Bucket {
    fn new(config: RateBucketConfig, now: DateTime<Utc>) -> Self {
        Self {
            capacity: config.capacity,
            refill_per_sec: config.refill_per_sec,
            level: config.capacity,
            last_refill: now,
        }
    }

    /// Advance the bucket to `now`, crediting elapsed refill.
    fn refill(&mut self, now: DateTime<Utc>) {
        let elapsed_ms = (now - self.last_refill).num_milliseconds();
        if elapsed_ms <= 0 {
            return;
        }
        let credit = (elapsed_ms as f64 / 1000.0) * self.refill_per_sec;
        self.level = (self.level + credit).min(self.capacity);
        self.last_refill = now;
    }

    fn projected_level(&self, now: DateTime<Utc>) -> f64 {
        let elapsed_ms = (now - self.last_refill).num_milliseconds().max(0);
        let credit = (elapsed_ms as f64 / 1000.0) * self.refill_per_sec;
        (self.level + credit).min(self.capacity)
    }

    fn try_consume(&mut self, now: DateTime<Utc>) -> RateDecision {
        self.refill(now);
        if self.level >= 1.0 {
            self.level -= 1.0;
            RateDecision::Allowed {
                utilization: 1.0 - self.level / self.capacity,
            }
        } else {
            let deficit = 1.0 - self.level;
            let wait_ms = if self.refill_per_sec > 0.0 {
                (deficit / self.refill_per_sec * 1000.0).ceil() as u64
            } else {
                u64::MAX
            };
            RateDecision::Limited { wait_ms }
        }
    }
}

/// Leaky-bucket limiter over all providers. Buckets appear lazily with the
/// default config on first reference.
pub struct RateLimiter {
    buckets: RwLock<HashMap<String, Arc<Mutex<Bucket>>>>,
    default_config: RateBucketConfig,
}

impl RateLimiter {
    pub fn new(default_config: RateBucketConfig) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            default_config,
        }
    }

    async fn bucket(&self, provider: &str, now: DateTime<Utc>) -> Arc<Mutex<Bucket>> {
        if let Some(b) = self.buckets.read().await.get(provider) {
            return Arc::clone(b);
        }
        let mut map = self.buckets.write().await;
        Arc::clone(
            map.entry(provider.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Bucket::new(self.default_config, now)))),
        )
    }

    /// Take one token, or report how long until one is available.
    pub async fn try_consume(&self, provider: &str, now: DateTime<Utc>) -> RateDecision {
        let bucket = self.bucket(provider, now).await;
        let mut b = bucket.lock().await;
        b.try_consume(now)
    }

    /// Peek without mutation.
    pub async fn status(&self, provider: &str, now: DateTime<Utc>) -> BucketStatus {
        let bucket = self.bucket(provider, now).await;
        let b = bucket.lock().await;
        let level = b.projected_level(now);
        BucketStatus {
            level,
            capacity: b.capacity,
            refill_per_sec: b.refill_per_sec,
            utilization: 1.0 - level / b.capacity,
        }
    }

    /// Change a bucket's parameters in place. Shrinking the capacity
    /// truncates the current level to the new cap.
    pub async fn update_config(
        &self,
        provider: &str,
        config: RateBucketConfig,
        now: DateTime<Utc>,
    ) {
        let bucket = self.bucket(provider, now).await;
        let mut b = bucket.lock().await;
        b.refill(now);
        b.capacity = config.capacity;
        b.refill_per_sec = config.refill_per_sec;
        b.level = b.level.min(b.capacity);
    }

    /// Consume one token from each provider as a group: either every
    /// provider is charged or none is. Per-provider outcomes are returned
    /// either way. Duplicate names are collapsed to one charge.
    pub async fn try_consume_batch(
        &self,
        providers: &[&str],
        now: DateTime<Utc>,
    ) -> BatchDecision {
        // Deterministic lock order prevents deadlock against a concurrent batch.
        let mut names: Vec<&str> = providers.to_vec();
        names.sort_unstable();
        names.dedup();

        let handles: Vec<(String, Arc<Mutex<Bucket>>)> = {
            let mut hs = Vec::with_capacity(names.len());
            for name in &names {
                hs.push((name.to_string(), self.bucket(name, now).await));
            }
            hs
        };

        let mut guards = Vec::with_capacity(handles.len());
        for (name, bucket) in &handles {
            guards.push((name.clone(), bucket.lock().await));
        }

        // First pass: project each outcome without charging.
        let mut outcomes = Vec::with_capacity(guards.len());
        let mut all_allowed = true;
        for (name, guard) in guards.iter_mut() {
            guard.refill(now);
            if guard.level >= 1.0 {
                outcomes.push((
                    name.clone(),
                    RateDecision::Allowed {
                        utilization: 1.0 - (guard.level - 1.0) / guard.capacity,
                    },
                ));
            } else {
                all_allowed = false;
                let deficit = 1.0 - guard.level;
                let wait_ms = if guard.refill_per_sec > 0.0 {
                    (deficit / guard.refill_per_sec * 1000.0).ceil() as u64
                } else {
                    u64::MAX
                };
                outcomes.push((name.clone(), RateDecision::Limited { wait_ms }));
            }
        }

        // Second pass: charge only when the whole group fits.
        if all_allowed {
            for (_, guard) in guards.iter_mut() {
                guard.level -= 1.0;
            }
        }

        BatchDecision {
            allowed: all_allowed,
            outcomes,
        }
    }
}

/// Result of [`RateLimiter::try_consume_batch`].
#[derive(Debug)]
pub struct BatchDecision {
    /// Whether the group was charged.
    pub allowed: bool,
    pub outcomes: Vec<(String, RateDecision)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn limiter(capacity: f64, refill: f64) -> RateLimiter {
        RateLimiter::new(RateBucketConfig {
            capacity,
            refill_per_sec: refill,
        })
    }

    #[tokio::test]
    async fn consumes_until_empty_then_limits() {
        let rl = limiter(3.0, 1.0);
        let now = Utc::now();
        for _ in 0..3 {
            assert!(rl.try_consume("p", now).await.allowed());
        }
        let decision = rl.try_consume("p", now).await;
        assert!(!decision.allowed());
        // Empty bucket, 1 token/s: about a second until a full token.
        assert!((900..=1100).contains(&decision.wait_ms()), "{decision:?}");
    }

    #[tokio::test]
    async fn refills_over_time() {
        let rl = limiter(2.0, 1.0);
        let now = Utc::now();
        assert!(rl.try_consume("p", now).await.allowed());
        assert!(rl.try_consume("p", now).await.allowed());
        assert!(!rl.try_consume("p", now).await.allowed());

        let later = now + Duration::milliseconds(1500);
        assert!(rl.try_consume("p", later).await.allowed());
        // Only 1.5 tokens refilled, 1 consumed — 0.5 left is not enough.
        assert!(!rl.try_consume("p", later).await.allowed());
    }

    #[tokio::test]
    async fn refill_caps_at_capacity() {
        let rl = limiter(2.0, 100.0);
        let now = Utc::now();
        rl.try_consume("p", now).await;
        let later = now + Duration::seconds(60);
        let status = rl.status("p", later).await;
        assert!((status.level - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn status_does_not_mutate() {
        let rl = limiter(5.0, 1.0);
        let now = Utc::now();
        rl.try_consume("p", now).await;
        let s1 = rl.status("p", now).await;
        let s2 = rl.status("p", now).await;
        assert_eq!(s1.level, s2.level);
        assert!((s1.utilization - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn shrinking_capacity_truncates_level() {
        let rl = limiter(10.0, 1.0);
        let now = Utc::now();
        rl.try_consume("p", now).await; // level 9
        rl.update_config(
            "p",
            RateBucketConfig {
                capacity: 4.0,
                refill_per_sec: 1.0,
            },
            now,
        )
        .await;
        let status = rl.status("p", now).await;
        assert!((status.level - 4.0).abs() < 1e-9);
        assert!((status.capacity - 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn batch_charges_all_or_none() {
        let rl = limiter(1.0, 0.5);
        let now = Utc::now();
        // Drain q so the batch cannot fit as a group.
        assert!(rl.try_consume("q", now).await.allowed());

        let batch = rl.try_consume_batch(&["p", "q"], now).await;
        assert!(!batch.allowed);
        // p was NOT charged even though it individually had room.
        let p = rl.status("p", now).await;
        assert!((p.level - 1.0).abs() < 1e-9, "no partial charge: {p:?}");
        let q_outcome = batch
            .outcomes
            .iter()
            .find(|(name, _)| name == "q")
            .unwrap();
        assert!(!q_outcome.1.allowed());
    }

    #[tokio::test]
    async fn batch_charges_when_group_fits() {
        let rl = limiter(2.0, 1.0);
        let now = Utc::now();
        let batch = rl.try_consume_batch(&["a", "b", "a"], now).await;
        assert!(batch.allowed);
        assert_eq!(batch.outcomes.len(), 2, "duplicates collapse");
        assert!((rl.status("a", now).await.level - 1.0).abs() < 1e-9);
        assert!((rl.status("b", now).await.level - 1.0).abs() < 1e-9);
    }
}
