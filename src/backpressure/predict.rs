// SPDX-License-Identifier: MIT
//! Per-provider predictive health scoring.
//!
//! Indicators are created lazily on first reference and updated on every
//! routing decision from the trailing five minutes of that provider's
//! events. The output feeds the submit pipeline's decision rules and, when
//! a degradation is near and confidence is high, a PREDICTIVE_HEALTH_ALERT.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::events::{Event, EventKind, EventLog, ProviderHealth};
use crate::quota::QuotaSnapshot;

use super::rate::RateDecision;

/// Window the trend channels are computed over.
const TREND_WINDOW_MS: i64 = 5 * 60 * 1000;
/// Re-alert suppression: one alert per provider per this interval.
const ALERT_SUPPRESSION_MS: i64 = 30_000;
/// Alert when predicted CRITICAL is at most this close.
const CRITICAL_ALERT_TTP_MS: i64 = 300_000;
/// Alert when predicted WARNING is at most this close.
const WARNING_ALERT_TTP_MS: i64 = 180_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

/// The four trend channels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrendSet {
    pub rate_limit: Trend,
    pub queue_utilization: Trend,
    /// Reserved: stays stable unless fed via [`PredictiveHealth::feed_trend`].
    pub error_rate: Trend,
    /// Reserved: stays stable unless fed via [`PredictiveHealth::feed_trend`].
    pub quota_utilization: Trend,
}

impl TrendSet {
    fn stable() -> Self {
        Self {
            rate_limit: Trend::Stable,
            queue_utilization: Trend::Stable,
            error_rate: Trend::Stable,
            quota_utilization: Trend::Stable,
        }
    }

    pub fn degrading_count(&self) -> usize {
        [
            self.rate_limit,
            self.queue_utilization,
            self.error_rate,
            self.quota_utilization,
        ]
        .iter()
        .filter(|t| **t == Trend::Degrading)
        .count()
    }

    pub fn improving_count(&self) -> usize {
        [
            self.rate_limit,
            self.queue_utilization,
            self.error_rate,
            self.quota_utilization,
        ]
        .iter()
        .filter(|t| **t == Trend::Improving)
        .count()
    }
}

/// Externally fed trend channels (the two reserved ones).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendChannel {
    ErrorRate,
    QuotaUtilization,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictiveHealthIndicator {
    pub provider: String,
    pub current: ProviderHealth,
    pub predicted: ProviderHealth,
    pub time_to_predicted_ms: i64,
    /// 0..1 internally; presentation layers may scale.
    pub confidence: f64,
    pub trends: TrendSet,
    pub last_updated: DateTime<Utc>,
}

impl PredictiveHealthIndicator {
    fn initial(provider: &str, horizon_ms: i64, now: DateTime<Utc>) -> Self {
        Self {
            provider: provider.to_string(),
            current: ProviderHealth::Healthy,
            predicted: ProviderHealth::Healthy,
            time_to_predicted_ms: (horizon_ms as f64 * 0.8) as i64,
            confidence: 0.5,
            trends: TrendSet::stable(),
            last_updated: now,
        }
    }
}

/// Result of one update pass; the caller owns event emission.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub previous: ProviderHealth,
    pub indicator: PredictiveHealthIndicator,
    pub alert: Option<EventKind>,
}

#[derive(Debug, Clone)]
pub struct PredictConfig {
    pub horizon_ms: i64,
    pub alert_confidence_threshold: f64,
}

struct IndicatorState {
    indicator: PredictiveHealthIndicator,
    fed_error_rate: Trend,
    fed_quota_utilization: Trend,
    last_alert_at: Option<DateTime<Utc>>,
}

pub struct PredictiveHealth {
    cfg: PredictConfig,
    events: EventLog,
    indicators: RwLock<HashMap<String, IndicatorState>>,
}

impl PredictiveHealth {
    pub fn new(cfg: PredictConfig, events: EventLog) -> Self {
        Self {
            cfg,
            events,
            indicators: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch (lazily creating) the provider's indicator.
    pub async fn indicator(&self, provider: &str) -> PredictiveHealthIndicator {
        let now = Utc::now();
        if let Some(state) = self.indicators.read().await.get(provider) {
            return state.indicator.clone();
        }
        let mut map = self.indicators.write().await;
        map.entry(provider.to_string())
            .or_insert_with(|| IndicatorState {
                indicator: PredictiveHealthIndicator::initial(provider, self.cfg.horizon_ms, now),
                fed_error_rate: Trend::Stable,
                fed_quota_utilization: Trend::Stable,
                last_alert_at: None,
            })
            .indicator
            .clone()
    }

    /// Feed an explicit signal into one of the reserved trend channels.
    pub async fn feed_trend(&self, provider: &str, channel: TrendChannel, trend: Trend) {
        self.indicator(provider).await; // ensure present
        let mut map = self.indicators.write().await;
        if let Some(state) = map.get_mut(provider) {
            match channel {
                TrendChannel::ErrorRate => state.fed_error_rate = trend,
                TrendChannel::QuotaUtilization => state.fed_quota_utilization = trend,
            }
        }
    }

    /// Recompute the provider's indicator from recent events plus the fresh
    /// rate and quota results. Returns the previous current-health (for
    /// transition detection) and an alert event when one is due.
    pub async fn update(
        &self,
        provider: &str,
        rate: &RateDecision,
        quota: &QuotaSnapshot,
        now: DateTime<Utc>,
    ) -> anyhow::Result<UpdateOutcome> {
        // Event window scan happens outside the indicator lock.
        let window = self
            .events
            .provider_events_within(provider, Duration::milliseconds(TREND_WINDOW_MS), now)
            .await?;

        let previous = self.indicator(provider).await.current;

        let (fed_error, fed_quota) = {
            let map = self.indicators.read().await;
            let state = map.get(provider);
            (
                state.map_or(Trend::Stable, |s| s.fed_error_rate),
                state.map_or(Trend::Stable, |s| s.fed_quota_utilization),
            )
        };

        let trends = TrendSet {
            rate_limit: fraction_trend(kind_fraction(&window, "THROTTLED"), 0.3, 0.1),
            queue_utilization: fraction_trend(kind_fraction(&window, "DROPPED"), 0.1, 0.05),
            error_rate: fed_error,
            quota_utilization: fed_quota,
        };

        let dropped_last_minute = window
            .iter()
            .filter(|e| e.kind == "DROPPED" && e.ts_ms >= (now - Duration::seconds(60)).timestamp_millis())
            .count();

        let current = evaluate_current(rate, quota, dropped_last_minute);
        let predicted = predict(current, &trends);
        let time_to_predicted_ms = time_to_predicted(self.cfg.horizon_ms, &trends);
        let confidence = confidence(&window);

        let indicator = PredictiveHealthIndicator {
            provider: provider.to_string(),
            current,
            predicted,
            time_to_predicted_ms,
            confidence,
            trends,
            last_updated: now,
        };

        let mut alert = None;
        {
            let mut map = self.indicators.write().await;
            let state = map
                .entry(provider.to_string())
                .or_insert_with(|| IndicatorState {
                    indicator: indicator.clone(),
                    fed_error_rate: fed_error,
                    fed_quota_utilization: fed_quota,
                    last_alert_at: None,
                });
            state.indicator = indicator.clone();

            if alert_due(&indicator, &self.cfg) {
                let suppressed = state
                    .last_alert_at
                    .is_some_and(|at| (now - at).num_milliseconds() < ALERT_SUPPRESSION_MS);
                if !suppressed {
                    state.last_alert_at = Some(now);
                    alert = Some(EventKind::PredictiveHealthAlert {
                        provider: provider.to_string(),
                        predicted: indicator.predicted,
                        time_to_predicted_ms: indicator.time_to_predicted_ms,
                        confidence: indicator.confidence,
                    });
                }
            }
        }

        Ok(UpdateOutcome {
            previous,
            indicator,
            alert,
        })
    }
}

// ─── Scoring ──────────────────────────────────────────────────────────────────

fn kind_fraction(window: &[Event], kind: &str) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let hits = window.iter().filter(|e| e.kind == kind).count();
    hits as f64 / window.len() as f64
}

fn fraction_trend(fraction: f64, degrading_above: f64, stable_above: f64) -> Trend {
    if fraction > degrading_above {
        Trend::Degrading
    } else if fraction > stable_above {
        Trend::Stable
    } else {
        Trend::Improving
    }
}

/// Current health from the freshest rate-limit result and quota snapshot.
fn evaluate_current(
    rate: &RateDecision,
    quota: &QuotaSnapshot,
    dropped_last_minute: usize,
) -> ProviderHealth {
    if !quota.within_quota {
        return if quota.usage.max_usage() > 120.0 {
            ProviderHealth::Unavailable
        } else {
            ProviderHealth::Critical
        };
    }
    if !rate.allowed() && rate.wait_ms() > 10_000 {
        return ProviderHealth::Critical;
    }
    if (!rate.allowed() && rate.wait_ms() > 2_000) || quota.usage.daily > 70.0 {
        return ProviderHealth::Warning;
    }
    if dropped_last_minute > 3 {
        return ProviderHealth::Warning;
    }
    ProviderHealth::Healthy
}

/// Predicted health: two degrading trends push one level worse, two
/// improving trends recover one level toward healthy.
fn predict(current: ProviderHealth, trends: &TrendSet) -> ProviderHealth {
    use ProviderHealth::*;
    if trends.degrading_count() >= 2 {
        match current {
            Healthy => Warning,
            Warning => Critical,
            worse => worse,
        }
    } else if trends.improving_count() >= 2 {
        match current {
            Unavailable => Critical,
            Critical => Warning,
            _ => Healthy,
        }
    } else {
        current
    }
}

/// Time to the predicted state shrinks as more channels degrade, bounded to
/// 30–80 % of the configured horizon.
fn time_to_predicted(horizon_ms: i64, trends: &TrendSet) -> i64 {
    let factor = (0.8 - 0.2 * trends.degrading_count() as f64).clamp(0.3, 0.8);
    (horizon_ms as f64 * factor) as i64
}

/// Confidence base per event kind; the dominant kind in the window sets the
/// base, historical frequency adds a consistency bonus.
fn kind_confidence_base(kind: &str) -> f64 {
    match kind {
        "DROPPED" => 0.8,
        "QUEUE_FULL" | "QUEUE_UTILIZATION_SPIKE" => 0.75,
        "THROTTLED" => 0.7,
        _ => 0.6,
    }
}

fn confidence(window: &[Event]) -> f64 {
    if window.is_empty() {
        return 0.5;
    }
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for event in window {
        *counts.entry(event.kind.as_str()).or_default() += 1;
    }
    let dominant = counts
        .iter()
        .max_by_key(|(_, n)| **n)
        .map(|(kind, _)| *kind)
        .unwrap_or("");
    let base = kind_confidence_base(dominant);
    let consistency_bonus = (window.len() as f64 * 0.01).min(0.2);
    (base + consistency_bonus).clamp(0.0, 0.95)
}

fn alert_due(indicator: &PredictiveHealthIndicator, cfg: &PredictConfig) -> bool {
    match indicator.predicted {
        ProviderHealth::Critical | ProviderHealth::Unavailable => {
            indicator.time_to_predicted_ms <= CRITICAL_ALERT_TTP_MS
                && indicator.confidence > cfg.alert_confidence_threshold
        }
        ProviderHealth::Warning => {
            indicator.time_to_predicted_ms <= WARNING_ALERT_TTP_MS
                && indicator.confidence > 0.9 * cfg.alert_confidence_threshold
        }
        ProviderHealth::Healthy => false,
    }
}
