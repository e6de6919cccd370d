//! Quota oracle boundary.
//!
//! The oracle is an external collaborator; the coordinator consumes three
//! calls and normalizes everything at this boundary: presentation-level
//! "health emoji" strings become [`ProviderHealth`] before any core code
//! sees them, and an oracle failure fails OPEN (yellow, within quota) with
//! a warning event so a dead oracle cannot stall the fleet.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::{EventKind, ProviderHealth};

/// Coarse provider indicator as reported by the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthIndicator {
    Green,
    Yellow,
    Red,
    Emergency,
}

impl HealthIndicator {
    pub fn to_provider_health(self) -> ProviderHealth {
        match self {
            HealthIndicator::Green => ProviderHealth::Healthy,
            HealthIndicator::Yellow => ProviderHealth::Warning,
            HealthIndicator::Red => ProviderHealth::Critical,
            HealthIndicator::Emergency => ProviderHealth::Unavailable,
        }
    }
}

/// Usage percentages (0–100, may exceed 100 when over quota).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub daily: f64,
    pub weekly: f64,
    pub monthly: f64,
}

impl QuotaUsage {
    /// The worst of the three buckets.
    pub fn max_usage(&self) -> f64 {
        self.daily.max(self.weekly).max(self.monthly)
    }
}

/// Raw oracle answer for `quota_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub usage: QuotaUsage,
    /// Presentation-level health string, e.g. an emoji. Mapped to
    /// [`ProviderHealth`] by [`map_health_label`] and never used raw.
    pub health: String,
    pub last_calculated: Option<DateTime<Utc>>,
}

/// Map the oracle's presentation health label to the internal enum.
///
/// Unknown labels are treated as warning — the oracle said *something*
/// non-green and we should not assume the best.
pub fn map_health_label(label: &str) -> ProviderHealth {
    match label {
        "🟢" | "green" | "healthy" => ProviderHealth::Healthy,
        "🟡" | "yellow" | "warning" => ProviderHealth::Warning,
        "🔴" | "red" | "critical" => ProviderHealth::Critical,
        "🚨" | "emergency" | "unavailable" => ProviderHealth::Unavailable,
        _ => ProviderHealth::Warning,
    }
}

/// External quota oracle contract. Timeouts are the caller's responsibility.
#[async_trait]
pub trait QuotaOracle: Send + Sync {
    async fn quota_status(&self, provider: &str) -> Result<Option<QuotaStatus>>;
    async fn health_indicator(&self, provider: &str) -> Result<HealthIndicator>;
    async fn is_within_quota(&self, provider: &str) -> Result<bool>;
}

/// Normalized oracle answer used by the submit pipeline.
#[derive(Debug, Clone)]
pub struct QuotaSnapshot {
    pub within_quota: bool,
    pub health: ProviderHealth,
    pub usage: QuotaUsage,
}

impl QuotaSnapshot {
    /// The fail-open snapshot used when the oracle errors.
    fn fail_open() -> Self {
        Self {
            within_quota: true,
            health: ProviderHealth::Warning,
            usage: QuotaUsage::default(),
        }
    }
}

/// Consult the oracle, failing open on error.
///
/// Returns the snapshot plus an optional warning event the caller should
/// emit (the snapshot itself never carries side effects).
pub async fn fetch_snapshot(
    oracle: &dyn QuotaOracle,
    provider: &str,
) -> (QuotaSnapshot, Option<EventKind>) {
    let combined: Result<QuotaSnapshot> = async {
        let within_quota = oracle.is_within_quota(provider).await?;
        let indicator = oracle.health_indicator(provider).await?;
        let status = oracle.quota_status(provider).await?;

        let (usage, health) = match status {
            Some(s) => {
                let mapped = map_health_label(&s.health);
                // Trust the worse of the two signals.
                (s.usage, mapped.max(indicator.to_provider_health()))
            }
            None => (QuotaUsage::default(), indicator.to_provider_health()),
        };
        Ok(QuotaSnapshot {
            within_quota,
            health,
            usage,
        })
    }
    .await;

    match combined {
        Ok(snapshot) => (snapshot, None),
        Err(e) => {
            tracing::warn!(provider, err = %e, "quota oracle unavailable — failing open");
            let event = EventKind::QuotaOracleUnavailable {
                provider: provider.to_string(),
                error: crate::redact::redact(&e.to_string()),
            };
            (QuotaSnapshot::fail_open(), Some(event))
        }
    }
}

// ─── Static oracle ────────────────────────────────────────────────────────────

/// Fixed-answer oracle for tests, demos, and single-provider deployments
/// without a real quota service.
#[derive(Default)]
pub struct StaticOracle {
    inner: tokio::sync::RwLock<std::collections::HashMap<String, StaticQuota>>,
}

#[derive(Debug, Clone)]
pub struct StaticQuota {
    pub within_quota: bool,
    pub indicator: HealthIndicator,
    pub usage: QuotaUsage,
}

impl Default for StaticQuota {
    fn default() -> Self {
        Self {
            within_quota: true,
            indicator: HealthIndicator::Green,
            usage: QuotaUsage::default(),
        }
    }
}

impl StaticOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, provider: &str, quota: StaticQuota) {
        self.inner.write().await.insert(provider.to_string(), quota);
    }

    async fn get(&self, provider: &str) -> StaticQuota {
        self.inner
            .read()
            .await
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl QuotaOracle for StaticOracle {
    async fn quota_status(&self, provider: &str) -> Result<Option<QuotaStatus>> {
        let q = self.get(provider).await;
        Ok(Some(QuotaStatus {
            usage: q.usage,
            health: match q.indicator {
                HealthIndicator::Green => "green".to_string(),
                HealthIndicator::Yellow => "yellow".to_string(),
                HealthIndicator::Red => "red".to_string(),
                HealthIndicator::Emergency => "emergency".to_string(),
            },
            last_calculated: Some(Utc::now()),
        }))
    }

    async fn health_indicator(&self, provider: &str) -> Result<HealthIndicator> {
        Ok(self.get(provider).await.indicator)
    }

    async fn is_within_quota(&self, provider: &str) -> Result<bool> {
        Ok(self.get(provider).await.within_quota)
    }
}
