// SPDX-License-Identifier: MIT
//! Bounded retry with exponential backoff for transient infrastructure
//! errors.
//!
//! Store contention and quota-oracle timeouts are recovered locally with a
//! bounded number of attempts; policy rejections are decisions, not errors,
//! and never pass through here. Every retry loop passes a key naming what
//! it is retrying for (task id, agent id, provider) — delays are spread per
//! key, so many loops hitting the same hiccup fan out instead of waking in
//! lockstep.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for [`retry_with_backoff`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first try).
    ///
    /// Default: 3
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub base_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_ms: u64,
    /// Growth factor applied to the delay per attempt.
    pub multiplier: f64,
    /// Width of the per-key spread window as a fraction of the delay
    /// (0.0–1.0).
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_ms: 100,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter_fraction: 0.25,
        }
    }
}

impl RetryConfig {
    /// A config suitable for quick unit tests (no real waiting).
    pub fn instant() -> Self {
        Self {
            max_attempts: 3,
            base_ms: 1,
            max_ms: 10,
            multiplier: 2.0,
            jitter_fraction: 0.0,
        }
    }

    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_ms: 0,
            max_ms: 0,
            multiplier: 1.0,
            jitter_fraction: 0.0,
        }
    }
}

/// Map a retry key and attempt number onto `[0, 1)`.
///
/// Hash-derived: stable for a given key (tests can pin it) while distinct
/// tasks and agents land at different points of the spread window.
pub(crate) fn spread_unit(key: &str, attempt: u32) -> f64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    attempt.hash(&mut hasher);
    // Keep 53 bits — the full precision of an f64 mantissa.
    (hasher.finish() >> 11) as f64 / (1u64 << 53) as f64
}

/// Delay before retry number `attempt` (0-indexed) of the work named by
/// `key`.
///
/// The nominal delay grows by `multiplier` per attempt and saturates at
/// `max_ms`. The result is then displaced within a window of
/// `±(delay × jitter_fraction / 2)` centered on the nominal value, where
/// the displacement is the key's spread position — never below zero.
pub fn next_backoff(key: &str, attempt: u32, config: &RetryConfig) -> Duration {
    let cap = config.max_ms as f64;
    let mut nominal = (config.base_ms as f64).min(cap);
    for _ in 0..attempt {
        nominal *= config.multiplier;
        if nominal >= cap {
            nominal = cap;
            break;
        }
    }

    let window = nominal * config.jitter_fraction;
    let displaced = nominal - window / 2.0 + spread_unit(key, attempt) * window;
    Duration::from_millis(displaced.max(0.0) as u64)
}

/// Retry an async operation with exponential backoff.
///
/// Calls `f()` up to `config.max_attempts` times, sleeping the computed
/// backoff between attempts. `key` names the work being retried and anchors
/// its spread position. Returns `Ok` on the first success or the last error
/// once attempts are exhausted.
///
/// # Panics
/// Panics if `config.max_attempts` is 0 (would never attempt the operation).
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    key: &str,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
{
    assert!(
        config.max_attempts > 0,
        "RetryConfig.max_attempts must be at least 1"
    );

    let mut last_err = None;
    for attempt in 0..config.max_attempts {
        match f().await {
            Ok(v) => {
                if attempt > 0 {
                    debug!(key, attempt, "operation succeeded after retry");
                }
                return Ok(v);
            }
            Err(e) => {
                if attempt + 1 < config.max_attempts {
                    let delay = next_backoff(key, attempt, config);
                    warn!(key, attempt, delay_ms = delay.as_millis() as u64, err = ?e, "transient failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err.expect("at least one attempt was made"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_increases_with_attempt() {
        let cfg = RetryConfig::default();
        let b0 = next_backoff("t1", 0, &cfg);
        let b5 = next_backoff("t1", 5, &cfg);
        assert!(
            b5 > b0,
            "attempt 5 should back off longer than attempt 0 ({:?} vs {:?})",
            b5,
            b0
        );
    }

    #[test]
    fn backoff_capped_at_max() {
        let cfg = RetryConfig::default();
        let b = next_backoff("t1", 100, &cfg);
        let bound = cfg.max_ms + (cfg.max_ms as f64 * cfg.jitter_fraction / 2.0) as u64;
        assert!(b.as_millis() as u64 <= bound);
    }

    #[test]
    fn distinct_keys_spread_across_the_window() {
        let cfg = RetryConfig::default();
        let mut delays: Vec<u64> = (0..8)
            .map(|i| next_backoff(&format!("task-{i}"), 4, &cfg).as_millis() as u64)
            .collect();
        delays.sort_unstable();
        delays.dedup();
        assert!(
            delays.len() > 1,
            "eight keys should not all land on the same delay: {delays:?}"
        );
    }

    #[test]
    fn same_key_is_deterministic() {
        let cfg = RetryConfig::default();
        assert_eq!(
            next_backoff("task-9", 2, &cfg),
            next_backoff("task-9", 2, &cfg)
        );
    }

    proptest::proptest! {
        #[test]
        fn backoff_never_exceeds_cap_plus_half_window(
            attempt in 0u32..64,
            base in 1u64..5_000,
            max in 1u64..60_000,
            key in "[a-z0-9-]{1,24}",
        ) {
            let cfg = RetryConfig {
                max_attempts: 3,
                base_ms: base,
                max_ms: max,
                multiplier: 2.0,
                jitter_fraction: 0.25,
            };
            let bound = max + (max as f64 * cfg.jitter_fraction / 2.0) as u64 + 1;
            let backoff = next_backoff(&key, attempt, &cfg);
            proptest::prop_assert!(backoff.as_millis() as u64 <= bound);
        }

        #[test]
        fn spread_unit_stays_in_unit_range(
            key in "[a-z0-9-]{0,32}",
            attempt in proptest::prelude::any::<u32>(),
        ) {
            let value = spread_unit(&key, attempt);
            proptest::prop_assert!((0.0..1.0).contains(&value));
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> =
            retry_with_backoff(&RetryConfig::instant(), "op", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("not yet")
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn returns_last_error_when_exhausted() {
        let result: Result<(), String> =
            retry_with_backoff(&RetryConfig::instant(), "op", || async {
                Err("always".to_string())
            })
            .await;
        assert_eq!(result.unwrap_err(), "always");
    }

    #[tokio::test]
    async fn no_retry_attempts_once() {
        let calls = AtomicU32::new(0);
        let _: Result<(), &str> = retry_with_backoff(&RetryConfig::no_retry(), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("nope")
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
