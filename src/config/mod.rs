use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_LEASE_TTL_MS: i64 = 60_000;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;
const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 30_000;
const DEFAULT_RENEWAL_FAILURE_LIMIT: u32 = 3;
const DEFAULT_QUEUE_CAP_HIGH: usize = 100;
const DEFAULT_QUEUE_CAP_MEDIUM: usize = 200;
const DEFAULT_QUEUE_CAP_LOW: usize = 400;
const DEFAULT_BUCKET_CAPACITY: f64 = 10.0;
const DEFAULT_BUCKET_REFILL_PER_SEC: f64 = 1.0;
const DEFAULT_PREDICTION_HORIZON_MS: i64 = 600_000;
const DEFAULT_ALERT_CONFIDENCE_THRESHOLD: f64 = 0.7;
const DEFAULT_OVERLOAD_DROP_WINDOW_MS: i64 = 60_000;
const DEFAULT_EVENT_RETENTION_DAYS: u32 = 14;
const DEFAULT_ESCALATION_THRESHOLD: u32 = 3;
const DEFAULT_WAIT_ESTIMATE_DEPTH: usize = 10;
const DEFAULT_OP_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RECLAIM_INTERVAL_MS: u64 = 5_000;
const DEFAULT_CACHE_REFRESH_INTERVAL_MS: u64 = 30_000;
const DEFAULT_METRICS_FLUSH_INTERVAL_MS: u64 = 60_000;
const DEFAULT_PRUNE_INTERVAL_MS: u64 = 3_600_000;

/// Environment variable overriding the review-gate escalation threshold.
pub const ESCALATION_THRESHOLD_ENV: &str = "FLEETD_ESCALATION_THRESHOLD";

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/fleetd.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Log level filter string, e.g. "debug", "info,fleetd=trace" (default: "info").
    log: Option<String>,
    /// Retry policy: attempts before a retryable error becomes terminal (default: 3).
    max_retries: Option<u32>,
    /// Lease lifetime in milliseconds (default: 60 000).
    lease_ttl_ms: Option<i64>,
    /// Lease renewal period; must stay under a third of the ttl (default: ttl/4).
    lease_renewal_interval_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    health_check_interval_ms: Option<u64>,
    /// Consecutive renewal failures before HEARTBEAT_MISSED (default: 3).
    renewal_failure_limit: Option<u32>,
    queue_cap_high: Option<usize>,
    queue_cap_medium: Option<usize>,
    queue_cap_low: Option<usize>,
    bucket_capacity: Option<f64>,
    bucket_refill_per_sec: Option<f64>,
    prediction_horizon_ms: Option<i64>,
    alert_confidence_threshold: Option<f64>,
    /// How close predicted-CRITICAL must be before non-high submissions drop
    /// (default: 60 000).
    overload_drop_window_ms: Option<i64>,
    event_retention_days: Option<u32>,
    /// Review cycles before recommending escalation (default: 3).
    escalation_threshold: Option<u32>,
    /// Queue items summed for wait-time estimates (default: 10).
    wait_estimate_depth: Option<usize>,
    /// Default deadline applied to externally exposed operations (default: 30 000).
    default_op_timeout_ms: Option<u64>,
    reclaim_interval_ms: Option<u64>,
    cache_refresh_interval_ms: Option<u64>,
    metrics_flush_interval_ms: Option<u64>,
    prune_interval_ms: Option<u64>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("fleetd.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse fleetd.toml — using defaults");
            None
        }
    }
}

// ─── CoordinatorConfig ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub data_dir: PathBuf,
    pub log: String,
    /// Retry policy: a retryable error re-runs until `attempts >= max_retries`.
    pub max_retries: u32,
    pub lease_ttl_ms: i64,
    pub lease_renewal_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub renewal_failure_limit: u32,
    pub queue_cap_high: usize,
    pub queue_cap_medium: usize,
    pub queue_cap_low: usize,
    pub bucket_capacity: f64,
    pub bucket_refill_per_sec: f64,
    pub prediction_horizon_ms: i64,
    pub alert_confidence_threshold: f64,
    pub overload_drop_window_ms: i64,
    pub event_retention_days: u32,
    /// Review cycles before `escalation_recommended` flips true.
    /// Overridable via `FLEETD_ESCALATION_THRESHOLD`.
    pub escalation_threshold: u32,
    pub wait_estimate_depth: usize,
    pub default_op_timeout_ms: u64,
    pub reclaim_interval_ms: u64,
    pub cache_refresh_interval_ms: u64,
    pub metrics_flush_interval_ms: u64,
    pub prune_interval_ms: u64,
}

impl CoordinatorConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/fleetd.toml`
    ///   3. Built-in defaults
    pub fn new(data_dir: Option<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let lease_ttl_ms = toml.lease_ttl_ms.unwrap_or(DEFAULT_LEASE_TTL_MS).max(1_000);

        // Renewal must fire well inside the ttl or leases expire mid-flight.
        let max_renewal = (lease_ttl_ms as u64 / 3).saturating_sub(1).max(1);
        let mut lease_renewal_interval_ms = toml
            .lease_renewal_interval_ms
            .unwrap_or(lease_ttl_ms as u64 / 4);
        if lease_renewal_interval_ms > max_renewal {
            warn!(
                configured = lease_renewal_interval_ms,
                clamped = max_renewal,
                "lease_renewal_interval_ms must stay under lease_ttl/3 — clamping"
            );
            lease_renewal_interval_ms = max_renewal;
        }

        let escalation_threshold = std::env::var(ESCALATION_THRESHOLD_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .or(toml.escalation_threshold)
            .unwrap_or(DEFAULT_ESCALATION_THRESHOLD);

        Self {
            data_dir,
            log,
            max_retries: toml.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            lease_ttl_ms,
            lease_renewal_interval_ms,
            heartbeat_interval_ms: toml
                .heartbeat_interval_ms
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS),
            health_check_interval_ms: toml
                .health_check_interval_ms
                .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL_MS),
            renewal_failure_limit: toml
                .renewal_failure_limit
                .unwrap_or(DEFAULT_RENEWAL_FAILURE_LIMIT),
            queue_cap_high: toml.queue_cap_high.unwrap_or(DEFAULT_QUEUE_CAP_HIGH),
            queue_cap_medium: toml.queue_cap_medium.unwrap_or(DEFAULT_QUEUE_CAP_MEDIUM),
            queue_cap_low: toml.queue_cap_low.unwrap_or(DEFAULT_QUEUE_CAP_LOW),
            bucket_capacity: toml.bucket_capacity.unwrap_or(DEFAULT_BUCKET_CAPACITY),
            bucket_refill_per_sec: toml
                .bucket_refill_per_sec
                .unwrap_or(DEFAULT_BUCKET_REFILL_PER_SEC),
            prediction_horizon_ms: toml
                .prediction_horizon_ms
                .unwrap_or(DEFAULT_PREDICTION_HORIZON_MS),
            alert_confidence_threshold: toml
                .alert_confidence_threshold
                .unwrap_or(DEFAULT_ALERT_CONFIDENCE_THRESHOLD),
            overload_drop_window_ms: toml
                .overload_drop_window_ms
                .unwrap_or(DEFAULT_OVERLOAD_DROP_WINDOW_MS),
            event_retention_days: toml
                .event_retention_days
                .unwrap_or(DEFAULT_EVENT_RETENTION_DAYS),
            escalation_threshold,
            wait_estimate_depth: toml
                .wait_estimate_depth
                .unwrap_or(DEFAULT_WAIT_ESTIMATE_DEPTH),
            default_op_timeout_ms: toml
                .default_op_timeout_ms
                .unwrap_or(DEFAULT_OP_TIMEOUT_MS),
            reclaim_interval_ms: toml
                .reclaim_interval_ms
                .unwrap_or(DEFAULT_RECLAIM_INTERVAL_MS),
            cache_refresh_interval_ms: toml
                .cache_refresh_interval_ms
                .unwrap_or(DEFAULT_CACHE_REFRESH_INTERVAL_MS),
            metrics_flush_interval_ms: toml
                .metrics_flush_interval_ms
                .unwrap_or(DEFAULT_METRICS_FLUSH_INTERVAL_MS),
            prune_interval_ms: toml.prune_interval_ms.unwrap_or(DEFAULT_PRUNE_INTERVAL_MS),
        }
    }

    /// Defaults with an explicit data dir — the integration-test entry point.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self::new(Some(data_dir.into()), None)
    }

    pub fn queue_cap(&self, priority: crate::events::QueuePriority) -> usize {
        use crate::events::QueuePriority::*;
        match priority {
            High => self.queue_cap_high,
            Medium => self.queue_cap_medium,
            Low => self.queue_cap_low,
        }
    }
}

fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FLEETD_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs_fallback().join("fleetd")
}

/// `$XDG_DATA_HOME` or `~/.local/share`, without a platform-dirs dependency.
fn dirs_fallback() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(xdg);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".local/share")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CoordinatorConfig::for_data_dir(dir.path());
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.lease_ttl_ms, 60_000);
        assert_eq!(cfg.queue_cap_medium, 200);
        assert!(cfg.lease_renewal_interval_ms < cfg.lease_ttl_ms as u64 / 3);
    }

    #[test]
    fn toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("fleetd.toml"),
            "max_retries = 7\nqueue_cap_low = 42\n",
        )
        .unwrap();
        let cfg = CoordinatorConfig::for_data_dir(dir.path());
        assert_eq!(cfg.max_retries, 7);
        assert_eq!(cfg.queue_cap_low, 42);
        // Untouched fields keep defaults.
        assert_eq!(cfg.queue_cap_high, 100);
    }

    #[test]
    fn renewal_interval_is_clamped_below_third_of_ttl() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("fleetd.toml"),
            "lease_ttl_ms = 30000\nlease_renewal_interval_ms = 29000\n",
        )
        .unwrap();
        let cfg = CoordinatorConfig::for_data_dir(dir.path());
        assert!(cfg.lease_renewal_interval_ms < 10_000);
    }

    #[test]
    fn malformed_toml_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fleetd.toml"), "max_retries = }{").unwrap();
        let cfg = CoordinatorConfig::for_data_dir(dir.path());
        assert_eq!(cfg.max_retries, 3);
    }
}
