//! Per-agent liveness loops: heartbeat probes, lease renewal, health checks.
//!
//! `start` takes a claim and activates the agent's cooperative loop; `stop`
//! drains in-flight renewals and releases every lease the agent owns. A
//! renewal that keeps failing past the configured limit emits
//! HEARTBEAT_MISSED and stops renewing — the lease then expires naturally
//! and reclamation recovers the task.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cancel::{CancelSource, CancelToken};
use crate::config::CoordinatorConfig;
use crate::events::{EventKind, EventLog};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::scheduler::Claim;
use crate::storage::Storage;

/// Tracks consecutive renewal failures against the missed-heartbeat limit.
#[derive(Debug, Clone)]
struct FailureTracker {
    consecutive: u32,
    limit: u32,
    missed: bool,
}

impl FailureTracker {
    fn new(limit: u32) -> Self {
        Self {
            consecutive: 0,
            limit,
            missed: false,
        }
    }

    /// Record one failed renewal round. Returns `true` exactly once, when
    /// the limit is crossed.
    fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        if !self.missed && self.consecutive >= self.limit {
            self.missed = true;
            return true;
        }
        false
    }

    fn record_success(&mut self) {
        self.consecutive = 0;
    }

    fn renewing(&self) -> bool {
        !self.missed
    }
}

/// Registry row for a connected agent.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// False once the agent crossed the renewal-failure limit.
    pub renewing: bool,
}

struct AgentHandle {
    cancel: CancelSource,
    join: JoinHandle<()>,
}

type Registry = Arc<RwLock<HashMap<String, AgentStatus>>>;

pub struct HeartbeatManager {
    store: Storage,
    events: EventLog,
    heartbeat_interval: Duration,
    renewal_interval: Duration,
    health_check_interval: Duration,
    lease_ttl_ms: i64,
    renewal_failure_limit: u32,
    retry: RetryConfig,
    registry: Registry,
    handles: RwLock<HashMap<String, AgentHandle>>,
}

impl HeartbeatManager {
    pub fn new(store: Storage, events: EventLog, cfg: &CoordinatorConfig) -> Self {
        Self {
            store,
            events,
            heartbeat_interval: Duration::from_millis(cfg.heartbeat_interval_ms),
            renewal_interval: Duration::from_millis(cfg.lease_renewal_interval_ms),
            health_check_interval: Duration::from_millis(cfg.health_check_interval_ms),
            lease_ttl_ms: cfg.lease_ttl_ms,
            renewal_failure_limit: cfg.renewal_failure_limit,
            retry: RetryConfig::default(),
            registry: Arc::new(RwLock::new(HashMap::new())),
            handles: RwLock::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Activate the agent's loops for a fresh claim. Idempotent per agent:
    /// one loop renews every lease the agent owns, however many claims it
    /// accumulates.
    pub async fn start(&self, claim: &Claim) {
        let agent_id = claim.lease.agent_id.clone();
        let mut handles = self.handles.write().await;
        if handles.contains_key(&agent_id) {
            debug!(agent_id, task_id = %claim.task.id, "agent loop already active");
            return;
        }

        let now = Utc::now();
        self.registry.write().await.insert(
            agent_id.clone(),
            AgentStatus {
                agent_id: agent_id.clone(),
                connected_at: now,
                last_seen: now,
                renewing: true,
            },
        );

        let (cancel_src, cancel) = CancelSource::new();
        let join = tokio::spawn(agent_loop(AgentLoop {
            agent_id: agent_id.clone(),
            store: self.store.clone(),
            events: self.events.clone(),
            registry: Arc::clone(&self.registry),
            heartbeat_interval: self.heartbeat_interval,
            renewal_interval: self.renewal_interval,
            health_check_interval: self.health_check_interval,
            lease_ttl_ms: self.lease_ttl_ms,
            tracker: FailureTracker::new(self.renewal_failure_limit),
            retry: self.retry.clone(),
            cancel,
        }));
        handles.insert(
            agent_id.clone(),
            AgentHandle {
                cancel: cancel_src,
                join,
            },
        );
        info!(agent_id, task_id = %claim.task.id, "agent heartbeat loop started");
    }

    /// Supervised shutdown for one agent: stop the loop, wait for in-flight
    /// renewals to drain, then release every lease it still owns.
    pub async fn stop(&self, agent_id: &str) {
        let handle = self.handles.write().await.remove(agent_id);
        let Some(handle) = handle else {
            return;
        };
        handle.cancel.cancel();
        if let Err(e) = handle.join.await {
            warn!(agent_id, err = %e, "agent loop join failed");
        }

        match self.store.leases_for_agent(agent_id).await {
            Ok(leases) => {
                for lease in leases {
                    if let Err(e) = self
                        .store
                        .release_lease(&lease.task_id, agent_id, Utc::now())
                        .await
                    {
                        warn!(agent_id, task_id = %lease.task_id, err = %e, "lease release failed");
                    }
                }
            }
            Err(e) => warn!(agent_id, err = %e, "could not list leases on stop"),
        }

        self.registry.write().await.remove(agent_id);
        info!(agent_id, "agent stopped");
    }

    /// Stop every agent loop (daemon shutdown).
    pub async fn stop_all(&self) {
        let agent_ids: Vec<String> = self.handles.read().await.keys().cloned().collect();
        for agent_id in agent_ids {
            self.stop(&agent_id).await;
        }
    }

    pub async fn list_agents(&self) -> Vec<AgentStatus> {
        let mut agents: Vec<AgentStatus> = self.registry.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    pub async fn is_active(&self, agent_id: &str) -> bool {
        self.handles.read().await.contains_key(agent_id)
    }
}

// ─── Agent loop ───────────────────────────────────────────────────────────────

struct AgentLoop {
    agent_id: String,
    store: Storage,
    events: EventLog,
    registry: Registry,
    heartbeat_interval: Duration,
    renewal_interval: Duration,
    health_check_interval: Duration,
    lease_ttl_ms: i64,
    tracker: FailureTracker,
    retry: RetryConfig,
    cancel: CancelToken,
}

async fn agent_loop(mut ctx: AgentLoop) {
    let mut heartbeat = tokio::time::interval(ctx.heartbeat_interval);
    let mut renewal = tokio::time::interval(ctx.renewal_interval);
    let mut health = tokio::time::interval(ctx.health_check_interval);
    // The immediate first tick of each interval would triple-fire on entry.
    heartbeat.tick().await;
    renewal.tick().await;
    health.tick().await;

    let mut cancel = ctx.cancel.clone();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = heartbeat.tick() => probe(&ctx).await,
            _ = renewal.tick() => {
                if ctx.tracker.renewing() {
                    renew_all(&mut ctx).await;
                }
            }
            _ = health.tick() => health_check(&ctx).await,
        }
    }
    debug!(agent_id = %ctx.agent_id, "agent loop exited");
}

/// Liveness probe: bump last_seen and emit a bare AGENT_HEALTH_CHECK.
async fn probe(ctx: &AgentLoop) {
    touch(ctx).await;
    let active = ctx
        .store
        .leases_for_agent(&ctx.agent_id)
        .await
        .map(|l| l.len() as u32)
        .unwrap_or(0);
    let _ = ctx
        .events
        .emit_system(EventKind::AgentHealthCheck {
            agent_id: ctx.agent_id.clone(),
            rss_bytes: None,
            cpu_percent: None,
            active_leases: active,
        })
        .await;
}

/// Full health check with process resource usage.
async fn health_check(ctx: &AgentLoop) {
    touch(ctx).await;
    let (rss_bytes, cpu_percent) = sample_resources();
    let active = ctx
        .store
        .leases_for_agent(&ctx.agent_id)
        .await
        .map(|l| l.len() as u32)
        .unwrap_or(0);
    let _ = ctx
        .events
        .emit_system(EventKind::AgentHealthCheck {
            agent_id: ctx.agent_id.clone(),
            rss_bytes,
            cpu_percent,
            active_leases: active,
        })
        .await;
}

/// Renew every lease the agent owns, extending expiry by the full ttl.
async fn renew_all(ctx: &mut AgentLoop) {
    let leases = match ctx.store.leases_for_agent(&ctx.agent_id).await {
        Ok(leases) => leases,
        Err(e) => {
            record_renewal_failure(ctx, "(all)", &e.to_string()).await;
            return;
        }
    };

    for lease in leases {
        let store = ctx.store.clone();
        let agent_id = ctx.agent_id.clone();
        let task_id = lease.task_id.clone();
        let ttl = ctx.lease_ttl_ms;
        // Spread keyed on the lease so agents renewing different tasks do
        // not retry in lockstep.
        let outcome = retry_with_backoff(&ctx.retry, &lease.task_id, || {
            let store = store.clone();
            let agent_id = agent_id.clone();
            let task_id = task_id.clone();
            async move { store.renew_lease(&task_id, &agent_id, ttl, Utc::now()).await }
        })
        .await;

        match outcome {
            // Ok(false): the lease is gone (expired, reclaimed, released) —
            // nothing to renew, not a failure.
            Ok(_) => ctx.tracker.record_success(),
            Err(e) => record_renewal_failure(ctx, &lease.task_id, &e.to_string()).await,
        }
    }
}

async fn record_renewal_failure(ctx: &mut AgentLoop, lease_id: &str, error: &str) {
    let _ = ctx
        .events
        .emit_system(EventKind::HeartbeatRenewFailure {
            agent_id: ctx.agent_id.clone(),
            lease_id: lease_id.to_string(),
            error: crate::redact::redact(error),
            retry_count: ctx.tracker.consecutive + 1,
        })
        .await;

    if ctx.tracker.record_failure() {
        warn!(
            agent_id = %ctx.agent_id,
            failures = ctx.tracker.consecutive,
            "renewal failures crossed the limit — leases will expire naturally"
        );
        let _ = ctx
            .events
            .emit_system(EventKind::HeartbeatMissed {
                agent_id: ctx.agent_id.clone(),
                consecutive_failures: ctx.tracker.consecutive,
            })
            .await;
        if let Some(status) = ctx.registry.write().await.get_mut(&ctx.agent_id) {
            status.renewing = false;
        }
    }
}

async fn touch(ctx: &AgentLoop) {
    if let Some(status) = ctx.registry.write().await.get_mut(&ctx.agent_id) {
        status.last_seen = Utc::now();
    }
}

/// Current process RSS and CPU from sysinfo.
fn sample_resources() -> (Option<u64>, Option<f32>) {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return (None, None);
    };
    let mut sys = sysinfo::System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
    match sys.process(pid) {
        Some(proc) => (Some(proc.memory()), Some(proc.cpu_usage())),
        None => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use crate::storage::NewTask;
    use serde_json::json;

    fn fast_config(dir: &std::path::Path) -> CoordinatorConfig {
        let mut cfg = CoordinatorConfig::for_data_dir(dir);
        cfg.heartbeat_interval_ms = 20;
        cfg.lease_renewal_interval_ms = 15;
        cfg.health_check_interval_ms = 40;
        cfg.lease_ttl_ms = 60_000;
        cfg
    }

    async fn setup() -> (Storage, Scheduler, HeartbeatManager) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = fast_config(dir.path());
        let store = Storage::open_in_memory().await.unwrap();
        let events = EventLog::new(store.clone());
        let sched = Scheduler::new(store.clone(), 3);
        let hb = HeartbeatManager::new(store.clone(), events, &cfg)
            .with_retry(RetryConfig::instant());
        (store, sched, hb)
    }

    async fn claim_one(store: &Storage, sched: &Scheduler, agent: &str) -> Claim {
        store
            .insert_task(
                NewTask {
                    id: Some("t1".into()),
                    payload: json!({}),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await
            .unwrap();
        sched
            .reserve(agent, chrono::Duration::seconds(60), &CancelToken::never())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn failure_tracker_crosses_limit_once() {
        let mut t = FailureTracker::new(3);
        assert!(!t.record_failure());
        assert!(!t.record_failure());
        assert!(t.record_failure(), "third failure crosses the limit");
        assert!(!t.record_failure(), "missed fires only once");
        assert!(!t.renewing());
    }

    #[test]
    fn failure_tracker_resets_on_success() {
        let mut t = FailureTracker::new(2);
        t.record_failure();
        t.record_success();
        assert!(!t.record_failure(), "streak restarted");
        assert!(t.renewing());
    }

    #[tokio::test]
    async fn loop_renews_leases() {
        let (store, sched, hb) = setup().await;
        let claim = claim_one(&store, &sched, "a1").await;
        let original_expiry = claim.lease.lease_expires_at;

        hb.start(&claim).await;
        tokio::time::sleep(Duration::from_millis(120)).await;

        let lease = store.get_lease("t1").await.unwrap().unwrap();
        assert!(
            lease.lease_expires_at > original_expiry,
            "renewal should push expiry forward"
        );
        hb.stop("a1").await;
    }

    #[tokio::test]
    async fn probes_emit_health_checks() {
        let (store, sched, hb) = setup().await;
        let claim = claim_one(&store, &sched, "a1").await;
        hb.start(&claim).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        hb.stop("a1").await;

        let probes = store
            .count_events_by_kind("AGENT_HEALTH_CHECK", 0)
            .await
            .unwrap();
        assert!(probes >= 2, "expected probes, saw {probes}");
    }

    #[tokio::test]
    async fn stop_releases_owned_leases() {
        let (store, sched, hb) = setup().await;
        let claim = claim_one(&store, &sched, "a1").await;
        hb.start(&claim).await;
        assert!(hb.is_active("a1").await);

        hb.stop("a1").await;
        assert!(!hb.is_active("a1").await);
        assert_eq!(store.count_leases("t1").await.unwrap(), 0);
        assert_eq!(
            store.get_task("t1").await.unwrap().unwrap().state,
            "READY",
            "released task returns to READY"
        );
    }

    #[tokio::test]
    async fn start_is_idempotent_per_agent() {
        let (store, sched, hb) = setup().await;
        let claim = claim_one(&store, &sched, "a1").await;
        hb.start(&claim).await;
        hb.start(&claim).await;
        assert_eq!(hb.list_agents().await.len(), 1);
        hb.stop_all().await;
        assert_eq!(hb.list_agents().await.len(), 0);
    }
}
