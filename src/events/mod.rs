//! Typed event model — the coordinator's observability wire contract.
//!
//! Every observable fact is one [`EventKind`] variant owning its payload
//! schema; ad-hoc string keys do not exist. The store persists the kind tag
//! and payload in separate columns so consumers can query by kind without
//! parsing payloads.

pub mod log;

pub use log::EventLog;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Task id used for events not tied to any task (agent liveness, config
/// changes, oracle failures).
pub const SYSTEM_TASK: &str = "system";

// ─── Shared wire enums ────────────────────────────────────────────────────────

/// Event severity. Declaration order is the escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "error" => Some(Severity::Error),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// Submission priority tier for the backpressure queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePriority {
    High,
    Medium,
    Low,
}

impl QueuePriority {
    pub const ALL: [QueuePriority; 3] =
        [QueuePriority::High, QueuePriority::Medium, QueuePriority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueuePriority::High => "high",
            QueuePriority::Medium => "medium",
            QueuePriority::Low => "low",
        }
    }
}

impl std::fmt::Display for QueuePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a submission was rejected by the backpressure pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DropReason {
    QuotaExceeded,
    SystemOverloaded,
    RateLimited,
    QueueFull,
}

/// Provider availability state, shared by the quota boundary and the
/// predictive health scorer. Declaration order is worst-last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderHealth {
    Healthy,
    Warning,
    Critical,
    Unavailable,
}

impl ProviderHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderHealth::Healthy => "healthy",
            ProviderHealth::Warning => "warning",
            ProviderHealth::Critical => "critical",
            ProviderHealth::Unavailable => "unavailable",
        }
    }
}

// ─── Event kinds ──────────────────────────────────────────────────────────────

/// All distinct event kinds the coordinator can record.
///
/// The serde tag is the wire kind string (e.g. `CLAIMED`); the remaining
/// fields are the kind-specific `data` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    // ── Task lifecycle ───────────────────────────────────────────────────────
    Claimed {
        agent_id: String,
        attempt: i64,
    },
    Running,
    Verifying,
    Committed,
    Error {
        /// Sanitized (secret-redacted) error message.
        message: String,
        /// Error type name, e.g. `"TransitionError"`.
        name: String,
        context: Value,
    },
    // ── Liveness ─────────────────────────────────────────────────────────────
    HeartbeatRenewFailure {
        agent_id: String,
        /// Lease identity — the task id the lease is bound to.
        lease_id: String,
        error: String,
        retry_count: u32,
    },
    HeartbeatMissed {
        agent_id: String,
        consecutive_failures: u32,
    },
    LeaseExpired {
        agent_id: String,
        lease_duration_ms: i64,
        expiry_time: i64,
    },
    AgentHealthCheck {
        agent_id: String,
        /// Resident set size; `None` for a bare liveness probe.
        rss_bytes: Option<u64>,
        cpu_percent: Option<f32>,
        active_leases: u32,
    },
    // ── Backpressure ─────────────────────────────────────────────────────────
    Allowed {
        provider: String,
        priority: QueuePriority,
        wait_time_ms: u64,
    },
    Throttled {
        provider: String,
        priority: QueuePriority,
        wait_time_ms: u64,
    },
    Queued {
        provider: String,
        priority: QueuePriority,
        depth: u32,
    },
    Deferred {
        provider: String,
        original_priority: QueuePriority,
        new_priority: QueuePriority,
    },
    Dropped {
        provider: String,
        priority: QueuePriority,
        reason: DropReason,
    },
    QueueFull {
        provider: String,
        priority: QueuePriority,
        depth: u32,
        capacity: u32,
    },
    RateLimitApproaching {
        provider: String,
        /// Bucket utilization in 0..1 at the time of the check.
        utilization: f64,
    },
    ProviderHealthDegrading {
        provider: String,
        previous: ProviderHealth,
        current: ProviderHealth,
    },
    ProviderHealthRecovering {
        provider: String,
        previous: ProviderHealth,
        current: ProviderHealth,
    },
    QueueUtilizationSpike {
        provider: String,
        submissions_in_window: u32,
        /// Set when the spike was detected from the utilization history
        /// rather than the submission count.
        utilization_rise: Option<f64>,
    },
    PredictiveHealthAlert {
        provider: String,
        predicted: ProviderHealth,
        time_to_predicted_ms: i64,
        confidence: f64,
    },
    // ── Configuration / oracle ───────────────────────────────────────────────
    LimitConfigChanged {
        /// What was reconfigured, e.g. `"queue.medium"` or `"bucket.openai"`.
        scope: String,
        config: Value,
    },
    QuotaOracleUnavailable {
        provider: String,
        error: String,
    },
}

impl EventKind {
    /// Every kind string, for generic consumers that iterate all variants.
    pub const ALL: [&'static str; 22] = [
        "CLAIMED",
        "RUNNING",
        "VERIFYING",
        "COMMITTED",
        "ERROR",
        "HEARTBEAT_RENEW_FAILURE",
        "HEARTBEAT_MISSED",
        "LEASE_EXPIRED",
        "AGENT_HEALTH_CHECK",
        "ALLOWED",
        "THROTTLED",
        "QUEUED",
        "DEFERRED",
        "DROPPED",
        "QUEUE_FULL",
        "RATE_LIMIT_APPROACHING",
        "PROVIDER_HEALTH_DEGRADING",
        "PROVIDER_HEALTH_RECOVERING",
        "QUEUE_UTILIZATION_SPIKE",
        "PREDICTIVE_HEALTH_ALERT",
        "LIMIT_CONFIG_CHANGED",
        "QUOTA_ORACLE_UNAVAILABLE",
    ];

    /// The wire kind string (the serde tag).
    pub fn kind_str(&self) -> &'static str {
        match self {
            EventKind::Claimed { .. } => "CLAIMED",
            EventKind::Running => "RUNNING",
            EventKind::Verifying => "VERIFYING",
            EventKind::Committed => "COMMITTED",
            EventKind::Error { .. } => "ERROR",
            EventKind::HeartbeatRenewFailure { .. } => "HEARTBEAT_RENEW_FAILURE",
            EventKind::HeartbeatMissed { .. } => "HEARTBEAT_MISSED",
            EventKind::LeaseExpired { .. } => "LEASE_EXPIRED",
            EventKind::AgentHealthCheck { .. } => "AGENT_HEALTH_CHECK",
            EventKind::Allowed { .. } => "ALLOWED",
            EventKind::Throttled { .. } => "THROTTLED",
            EventKind::Queued { .. } => "QUEUED",
            EventKind::Deferred { .. } => "DEFERRED",
            EventKind::Dropped { .. } => "DROPPED",
            EventKind::QueueFull { .. } => "QUEUE_FULL",
            EventKind::RateLimitApproaching { .. } => "RATE_LIMIT_APPROACHING",
            EventKind::ProviderHealthDegrading { .. } => "PROVIDER_HEALTH_DEGRADING",
            EventKind::ProviderHealthRecovering { .. } => "PROVIDER_HEALTH_RECOVERING",
            EventKind::QueueUtilizationSpike { .. } => "QUEUE_UTILIZATION_SPIKE",
            EventKind::PredictiveHealthAlert { .. } => "PREDICTIVE_HEALTH_ALERT",
            EventKind::LimitConfigChanged { .. } => "LIMIT_CONFIG_CHANGED",
            EventKind::QuotaOracleUnavailable { .. } => "QUOTA_ORACLE_UNAVAILABLE",
        }
    }

    /// Default severity for this kind.
    pub fn severity(&self) -> Severity {
        match self {
            EventKind::Claimed { .. }
            | EventKind::Running
            | EventKind::Verifying
            | EventKind::Committed
            | EventKind::Allowed { .. }
            | EventKind::Queued { .. }
            | EventKind::AgentHealthCheck { .. }
            | EventKind::ProviderHealthRecovering { .. }
            | EventKind::LimitConfigChanged { .. } => Severity::Info,
            EventKind::Throttled { .. }
            | EventKind::Deferred { .. }
            | EventKind::Dropped { .. }
            | EventKind::QueueFull { .. }
            | EventKind::RateLimitApproaching { .. }
            | EventKind::ProviderHealthDegrading { .. }
            | EventKind::QueueUtilizationSpike { .. }
            | EventKind::LeaseExpired { .. }
            | EventKind::HeartbeatRenewFailure { .. }
            | EventKind::QuotaOracleUnavailable { .. } => Severity::Warning,
            EventKind::Error { .. } | EventKind::HeartbeatMissed { .. } => Severity::Error,
            EventKind::PredictiveHealthAlert { .. } => Severity::Critical,
        }
    }

    /// Serialize the payload without the kind tag (stored in its own column).
    pub fn data_value(&self) -> Value {
        let mut v = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Value::Object(ref mut map) = v {
            map.remove("kind");
        }
        v
    }

    /// Reassemble a kind from its column parts. `None` if the payload does
    /// not match the kind's schema (corrupt row).
    pub fn from_parts(kind: &str, data: &Value) -> Option<Self> {
        let mut v = data.clone();
        match v {
            Value::Object(ref mut map) => {
                map.insert("kind".into(), Value::String(kind.to_string()));
            }
            Value::Null => {
                v = serde_json::json!({ "kind": kind });
            }
            _ => return None,
        }
        serde_json::from_value(v).ok()
    }
}

// ─── Persisted event ──────────────────────────────────────────────────────────

/// One row of the append-only event table, payload left as raw JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub task_id: String,
    /// Epoch milliseconds.
    pub ts_ms: i64,
    pub kind: String,
    pub severity: Severity,
    pub data: Value,
}

impl Event {
    pub fn ts(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.ts_ms)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Decode the typed kind, or `None` when the payload is corrupt.
    pub fn decode(&self) -> Option<EventKind> {
        EventKind::from_parts(&self.kind, &self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tag_matches_kind_str() {
        let kinds = vec![
            EventKind::Claimed {
                agent_id: "a1".into(),
                attempt: 1,
            },
            EventKind::Running,
            EventKind::Dropped {
                provider: "openai".into(),
                priority: QueuePriority::Low,
                reason: DropReason::RateLimited,
            },
            EventKind::PredictiveHealthAlert {
                provider: "openai".into(),
                predicted: ProviderHealth::Critical,
                time_to_predicted_ms: 48_000,
                confidence: 0.85,
            },
        ];
        for kind in kinds {
            let v = serde_json::to_value(&kind).unwrap();
            assert_eq!(v["kind"].as_str().unwrap(), kind.kind_str());
        }
    }

    #[test]
    fn data_value_strips_tag() {
        let kind = EventKind::Claimed {
            agent_id: "a1".into(),
            attempt: 2,
        };
        let data = kind.data_value();
        assert!(data.get("kind").is_none());
        assert_eq!(data["agent_id"], "a1");
        assert_eq!(data["attempt"], 2);
    }

    #[test]
    fn from_parts_round_trips() {
        let kind = EventKind::Deferred {
            provider: "anthropic".into(),
            original_priority: QueuePriority::Medium,
            new_priority: QueuePriority::Low,
        };
        let back = EventKind::from_parts(kind.kind_str(), &kind.data_value()).unwrap();
        match back {
            EventKind::Deferred {
                original_priority, ..
            } => assert_eq!(original_priority, QueuePriority::Medium),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn from_parts_rejects_corrupt_payload() {
        assert!(EventKind::from_parts("CLAIMED", &serde_json::json!({"bogus": true})).is_none());
        assert!(EventKind::from_parts("NO_SUCH_KIND", &serde_json::json!({})).is_none());
    }

    #[test]
    fn unit_kinds_round_trip_with_null_data() {
        let back = EventKind::from_parts("RUNNING", &Value::Null).unwrap();
        assert!(matches!(back, EventKind::Running));
    }

    #[test]
    fn severity_ordering_escalates() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }

    #[test]
    fn provider_health_ordering_is_worst_last() {
        assert!(ProviderHealth::Healthy < ProviderHealth::Warning);
        assert!(ProviderHealth::Critical < ProviderHealth::Unavailable);
    }
}
