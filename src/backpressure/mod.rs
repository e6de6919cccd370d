//! Backpressure pipeline: decide, per submission, whether a task is routed,
//! throttled, queued, deferred, or dropped.
//!
//! `submit` runs a fixed sequence of stages over a request-scoped context:
//! predict → rate → quota → decide → transition detection → apply → spike
//! detection → cache invalidation → metrics. Stages record events into a
//! pending list that is flushed once every lock is released — event emission
//! can never re-enter the pipeline.

pub mod cache;
pub mod predict;
pub mod queue;
pub mod rate;

pub use cache::{CachePriority, InvalidatingCache};
pub use predict::{PredictiveHealth, PredictiveHealthIndicator, Trend, TrendChannel};
pub use queue::{EnqueueOutcome, QueueItem, QueueManager};
pub use rate::{BucketStatus, RateBucketConfig, RateDecision, RateLimiter};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::cancel::CancelToken;
use crate::config::CoordinatorConfig;
use crate::events::{
    DropReason, EventKind, EventLog, ProviderHealth, QueuePriority, SYSTEM_TASK,
};
use crate::quota::{self, QuotaOracle, QuotaSnapshot};
use predict::PredictConfig;

/// Submissions per provider within this window before a spike fires.
const SPIKE_WINDOW_MS: i64 = 10_000;
const SPIKE_SUBMISSION_LIMIT: usize = 5;
/// Utilization history retention.
const UTILIZATION_HISTORY_MS: i64 = 60_000;
/// Utilization rise within the spike window that fires a spike.
const SPIKE_UTILIZATION_RISE: f64 = 0.05;
/// Bucket utilization at which RATE_LIMIT_APPROACHING fires.
const RATE_APPROACH_UTILIZATION: f64 = 0.4;

// ─── Request / decision ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub task_id: String,
    pub provider: String,
    pub priority: QueuePriority,
    pub estimated_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackpressureAction {
    Route,
    Throttle,
    Defer,
    Drop,
}

/// The pipeline's answer. Policy rejections are values, not errors.
#[derive(Debug, Clone, Serialize)]
pub struct BackpressureDecision {
    pub action: BackpressureAction,
    pub reason: Option<DropReason>,
    pub wait_time_ms: Option<u64>,
    pub provider_health: ProviderHealth,
}

/// A queued task handed back to the scheduler loop.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub item: QueueItem,
    pub provider: String,
    pub priority: QueuePriority,
    pub wait_time_ms: u64,
}

// ─── Metrics ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderMetrics {
    pub submitted: u64,
    pub routed: u64,
    pub throttled: u64,
    pub deferred: u64,
    pub dropped: u64,
    /// Running mean of throttle wait times.
    pub avg_wait_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PredictiveMetrics {
    pub accuracy: f64,
    pub alerts_generated: u64,
    pub alerts_resolved: u64,
    pub false_positive_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackpressureMetrics {
    pub submitted: u64,
    pub routed: u64,
    pub throttled: u64,
    pub deferred: u64,
    pub dropped: u64,
    pub providers: HashMap<String, ProviderMetrics>,
    pub predictive: PredictiveMetrics,
}

#[derive(Default)]
struct MetricsInner {
    submitted: u64,
    routed: u64,
    throttled: u64,
    deferred: u64,
    dropped: u64,
    providers: HashMap<String, ProviderMetrics>,
    alerts_generated: u64,
    alerts_resolved: u64,
    false_positives: u64,
    /// Outstanding alert per provider: (predicted severity, observed yet).
    outstanding_alerts: HashMap<String, (ProviderHealth, bool)>,
}

#[derive(Default)]
struct ProviderWindow {
    /// Submission timestamps (epoch ms) within the spike window.
    submissions: VecDeque<i64>,
    /// (epoch ms, total queue utilization) samples.
    utilization: VecDeque<(i64, f64)>,
}

// ─── Manager ──────────────────────────────────────────────────────────────────

pub struct BackpressureManager {
    rate: RateLimiter,
    queue: QueueManager,
    predict: PredictiveHealth,
    cache: InvalidatingCache,
    oracle: Arc<dyn QuotaOracle>,
    events: EventLog,
    windows: Mutex<HashMap<String, ProviderWindow>>,
    metrics: Mutex<MetricsInner>,
    overload_drop_window_ms: i64,
}

impl BackpressureManager {
    pub fn new(
        cfg: &CoordinatorConfig,
        events: EventLog,
        oracle: Arc<dyn QuotaOracle>,
    ) -> Self {
        Self {
            rate: RateLimiter::new(RateBucketConfig {
                capacity: cfg.bucket_capacity,
                refill_per_sec: cfg.bucket_refill_per_sec,
            }),
            queue: QueueManager::new(
                events.clone(),
                cfg.queue_cap_high,
                cfg.queue_cap_medium,
                cfg.queue_cap_low,
                cfg.wait_estimate_depth,
            ),
            predict: PredictiveHealth::new(
                PredictConfig {
                    horizon_ms: cfg.prediction_horizon_ms,
                    alert_confidence_threshold: cfg.alert_confidence_threshold,
                },
                events.clone(),
            ),
            cache: InvalidatingCache::new(),
            oracle,
            events,
            windows: Mutex::new(HashMap::new()),
            metrics: Mutex::new(MetricsInner::default()),
            overload_drop_window_ms: cfg.overload_drop_window_ms,
        }
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate
    }

    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    pub fn predictive(&self) -> &PredictiveHealth {
        &self.predict
    }

    pub fn cache(&self) -> &InvalidatingCache {
        &self.cache
    }

    // ─── submit pipeline ──────────────────────────────────────────────────────

    pub async fn submit(
        &self,
        req: SubmitRequest,
        cancel: &CancelToken,
    ) -> Result<BackpressureDecision> {
        cancel.check()?;
        let now = Utc::now();
        // (task_id, event) pairs flushed after all locks are released.
        let mut pending: Vec<(String, EventKind)> = Vec::new();
        // Kinds incurred this submission, for the cache invalidation stage.
        let mut incurred: Vec<&'static str> = Vec::new();

        // 1. Predict — make sure the indicator exists before scoring.
        let _ = self.predict.indicator(&req.provider).await;

        // 2. Rate.
        let rate = self.rate.try_consume(&req.provider, now).await;
        if let RateDecision::Allowed { utilization } = rate {
            if utilization >= RATE_APPROACH_UTILIZATION {
                pending.push((
                    SYSTEM_TASK.to_string(),
                    EventKind::RateLimitApproaching {
                        provider: req.provider.clone(),
                        utilization,
                    },
                ));
            }
        }

        // 3. Quota (fail-open on oracle error).
        cancel.check()?;
        let (quota_snapshot, oracle_warning) =
            quota::fetch_snapshot(self.oracle.as_ref(), &req.provider).await;
        if let Some(warning) = oracle_warning {
            pending.push((SYSTEM_TASK.to_string(), warning));
        }

        // Predictive re-score with the fresh rate + quota signals.
        let update = self
            .predict
            .update(&req.provider, &rate, &quota_snapshot, now)
            .await?;
        if let Some(alert) = update.alert.clone() {
            self.note_alert(&req.provider, update.indicator.predicted).await;
            pending.push((SYSTEM_TASK.to_string(), alert));
        }

        // 4. Decide.
        let tier_utilization = self.queue.utilization(req.priority).await;
        let total_utilization = self.queue.total_utilization().await;
        let mut decision = decide(
            &req,
            &rate,
            &quota_snapshot,
            &update.indicator,
            tier_utilization,
            total_utilization,
            self.overload_drop_window_ms,
        );

        // 5. Transition detection.
        if let Some(event) = transition_event(
            &req.provider,
            update.previous,
            update.indicator.current,
        ) {
            pending.push((SYSTEM_TASK.to_string(), event));
        }

        // 6. Apply.
        match decision.action {
            BackpressureAction::Route => {
                pending.push((
                    req.task_id.clone(),
                    EventKind::Allowed {
                        provider: req.provider.clone(),
                        priority: req.priority,
                        wait_time_ms: 0,
                    },
                ));
            }
            BackpressureAction::Throttle => {
                pending.push((
                    req.task_id.clone(),
                    EventKind::Throttled {
                        provider: req.provider.clone(),
                        priority: req.priority,
                        wait_time_ms: decision.wait_time_ms.unwrap_or(0),
                    },
                ));
            }
            BackpressureAction::Drop => {
                pending.push((
                    req.task_id.clone(),
                    EventKind::Dropped {
                        provider: req.provider.clone(),
                        priority: req.priority,
                        reason: decision.reason.unwrap_or(DropReason::SystemOverloaded),
                    },
                ));
            }
            BackpressureAction::Defer => {
                let item = QueueItem::new(
                    req.task_id.clone(),
                    req.provider.clone(),
                    req.priority,
                    req.estimated_duration_ms,
                    now,
                );
                // The queue emits QUEUED / DEFERRED / DROPPED itself.
                let outcome = self.queue.enqueue(item).await;
                match outcome {
                    EnqueueOutcome::Queued { .. } => {
                        incurred.push("QUEUED");
                        decision.wait_time_ms = Some(self.queue.wait_time(req.priority).await);
                    }
                    EnqueueOutcome::Deferred { .. } => {
                        incurred.push("DEFERRED");
                        decision.wait_time_ms =
                            Some(self.queue.wait_time(QueuePriority::Low).await);
                    }
                    EnqueueOutcome::Rejected { .. } => {
                        incurred.push("QUEUE_FULL");
                        incurred.push("DROPPED");
                        decision = BackpressureDecision {
                            action: BackpressureAction::Drop,
                            reason: Some(DropReason::QueueFull),
                            wait_time_ms: None,
                            provider_health: decision.provider_health,
                        };
                    }
                }
            }
        }

        // 7. Spike detection.
        let total_after = self.queue.total_utilization().await;
        for spike in self
            .record_and_detect_spikes(&req.provider, total_after, now)
            .await
        {
            pending.push((SYSTEM_TASK.to_string(), spike));
        }

        // 8. Cache invalidation — every kind this submission incurred.
        for (_, event) in &pending {
            incurred.push(event.kind_str());
        }
        for kind in &incurred {
            self.cache.invalidate_on_critical_change(kind, now);
        }

        // 9. Metrics.
        self.record_metrics(&req, &decision, &update.indicator).await;

        // Flush events outside every lock.
        for (task_id, event) in pending {
            if let Err(e) = self.events.emit(&task_id, event).await {
                tracing::warn!(err = %e, "backpressure event emission failed");
            }
        }

        tracing::debug!(
            task_id = %req.task_id,
            provider = %req.provider,
            action = ?decision.action,
            reason = ?decision.reason,
            "submit decided"
        );
        Ok(decision)
    }

    /// Pop the next queued task (high → medium → low).
    pub async fn next_scheduled(&self) -> Option<ScheduledTask> {
        let (item, waited_ms) = self.queue.dequeue(Utc::now()).await?;
        Some(ScheduledTask {
            provider: item.provider.clone(),
            priority: item.priority,
            wait_time_ms: waited_ms,
            item,
        })
    }

    pub async fn metrics(&self) -> BackpressureMetrics {
        let m = self.metrics.lock().await;
        let false_positive_rate = if m.alerts_generated > 0 {
            m.false_positives as f64 / m.alerts_generated as f64
        } else {
            0.0
        };
        BackpressureMetrics {
            submitted: m.submitted,
            routed: m.routed,
            throttled: m.throttled,
            deferred: m.deferred,
            dropped: m.dropped,
            providers: m.providers.clone(),
            predictive: PredictiveMetrics {
                accuracy: 1.0 - false_positive_rate,
                alerts_generated: m.alerts_generated,
                alerts_resolved: m.alerts_resolved,
                false_positive_rate,
            },
        }
    }

    // ─── internals ────────────────────────────────────────────────────────────

    async fn record_and_detect_spikes(
        &self,
        provider: &str,
        total_utilization: f64,
        now: DateTime<Utc>,
    ) -> Vec<EventKind> {
        let now_ms = now.timestamp_millis();
        let mut spikes = Vec::new();
        let mut windows = self.windows.lock().await;
        let window = windows.entry(provider.to_string()).or_default();

        // Submission-count spike.
        window.submissions.push_back(now_ms);
        while window
            .submissions
            .front()
            .is_some_and(|t| now_ms - t > SPIKE_WINDOW_MS)
        {
            window.submissions.pop_front();
        }
        if window.submissions.len() > SPIKE_SUBMISSION_LIMIT {
            spikes.push(EventKind::QueueUtilizationSpike {
                provider: provider.to_string(),
                submissions_in_window: window.submissions.len() as u32,
                utilization_rise: None,
            });
        }

        // Utilization-rise spike: compare against the oldest sample still
        // inside the spike window.
        while window
            .utilization
            .front()
            .is_some_and(|(t, _)| now_ms - t > UTILIZATION_HISTORY_MS)
        {
            window.utilization.pop_front();
        }
        let reference = window
            .utilization
            .iter()
            .find(|(t, _)| now_ms - t <= SPIKE_WINDOW_MS)
            .map(|(_, u)| *u);
        if let Some(previous) = reference {
            let rise = total_utilization - previous;
            if rise > SPIKE_UTILIZATION_RISE {
                spikes.push(EventKind::QueueUtilizationSpike {
                    provider: provider.to_string(),
                    submissions_in_window: window.submissions.len() as u32,
                    utilization_rise: Some(rise),
                });
            }
        }
        window.utilization.push_back((now_ms, total_utilization));

        spikes
    }

    async fn record_metrics(
        &self,
        req: &SubmitRequest,
        decision: &BackpressureDecision,
        indicator: &PredictiveHealthIndicator,
    ) {
        let mut m = self.metrics.lock().await;
        m.submitted += 1;
        match decision.action {
            BackpressureAction::Route => {
                m.routed += 1;
            }
            BackpressureAction::Throttle => {
                m.throttled += 1;
            }
            BackpressureAction::Defer => {
                m.deferred += 1;
            }
            BackpressureAction::Drop => {
                m.dropped += 1;
            }
        }
        let provider = m.providers.entry(req.provider.clone()).or_default();
        provider.submitted += 1;

        match decision.action {
            BackpressureAction::Route => {
                provider.routed += 1;
            }
            BackpressureAction::Throttle => {
                provider.throttled += 1;
                let wait = decision.wait_time_ms.unwrap_or(0) as f64;
                let n = provider.throttled as f64;
                provider.avg_wait_ms += (wait - provider.avg_wait_ms) / n;
            }
            BackpressureAction::Defer => {
                provider.deferred += 1;
            }
            BackpressureAction::Drop => {
                provider.dropped += 1;
            }
        }

        // Predictive bookkeeping: track each alert until the provider
        // returns to healthy; an alert that resolves without the predicted
        // severity ever being observed counts as a false positive.
        if indicator.current >= ProviderHealth::Warning {
            if let Some((predicted, hit)) = m.outstanding_alerts.get_mut(&req.provider) {
                if indicator.current >= *predicted {
                    *hit = true;
                }
            }
        }
        if indicator.current == ProviderHealth::Healthy {
            if let Some((_, hit)) = m.outstanding_alerts.remove(&req.provider) {
                m.alerts_resolved += 1;
                if !hit {
                    m.false_positives += 1;
                }
            }
        }
    }

    /// Record that an alert event was emitted for `provider`.
    async fn note_alert(&self, provider: &str, predicted: ProviderHealth) {
        let mut m = self.metrics.lock().await;
        m.alerts_generated += 1;
        m.outstanding_alerts
            .entry(provider.to_string())
            .or_insert((predicted, false));
    }
}

// ─── Decision rules ───────────────────────────────────────────────────────────

/// Combined routing rules, evaluated in order.
fn decide(
    req: &SubmitRequest,
    rate: &RateDecision,
    quota: &QuotaSnapshot,
    indicator: &PredictiveHealthIndicator,
    tier_utilization: f64,
    total_utilization: f64,
    overload_drop_window_ms: i64,
) -> BackpressureDecision {
    let provider_health = indicator.current;
    let decision = |action, reason, wait_time_ms| BackpressureDecision {
        action,
        reason,
        wait_time_ms,
        provider_health,
    };

    if !quota.within_quota {
        return decision(BackpressureAction::Drop, Some(DropReason::QuotaExceeded), None);
    }

    let predicted_critical_soon = indicator.predicted >= ProviderHealth::Critical
        && indicator.time_to_predicted_ms <= overload_drop_window_ms;
    if predicted_critical_soon && req.priority != QueuePriority::High {
        return decision(
            BackpressureAction::Drop,
            Some(DropReason::SystemOverloaded),
            None,
        );
    }

    if let RateDecision::Limited { wait_ms } = rate {
        let throttle = match req.priority {
            QueuePriority::High => *wait_ms < 5_000,
            QueuePriority::Medium => *wait_ms < 10_000,
            QueuePriority::Low => false,
        };
        return if throttle {
            decision(BackpressureAction::Throttle, None, Some(*wait_ms))
        } else {
            decision(
                BackpressureAction::Drop,
                Some(DropReason::RateLimited),
                None,
            )
        };
    }

    if total_utilization > 0.9 && req.priority == QueuePriority::Low {
        return decision(
            BackpressureAction::Drop,
            Some(DropReason::SystemOverloaded),
            None,
        );
    }

    if tier_utilization > 0.8 && req.priority != QueuePriority::High {
        return decision(BackpressureAction::Defer, None, None);
    }

    decision(BackpressureAction::Route, None, None)
}

/// Health transition events: any worsening degrades, any return to healthy
/// recovers.
fn transition_event(
    provider: &str,
    previous: ProviderHealth,
    current: ProviderHealth,
) -> Option<EventKind> {
    if current > previous {
        Some(EventKind::ProviderHealthDegrading {
            provider: provider.to_string(),
            previous,
            current,
        })
    } else if current == ProviderHealth::Healthy && previous > ProviderHealth::Healthy {
        Some(EventKind::ProviderHealthRecovering {
            provider: provider.to_string(),
            previous,
            current,
        })
    } else {
        None
    }
}
