//! fleetd — single-host multi-agent fleet coordinator.
//!
//! A durable task/lease lifecycle engine plus a backpressure pipeline that
//! regulates outbound calls to LLM providers. Agents pull work, heartbeat
//! their leases, and report outcomes; everything observable lands in an
//! append-only event log.

pub mod agents;
pub mod backpressure;
pub mod cancel;
pub mod config;
pub mod events;
pub mod heartbeat;
pub mod observe;
pub mod quota;
pub mod redact;
pub mod retry;
pub mod review_gate;
pub mod scheduler;
pub mod storage;
pub mod ticker;
pub mod verifiers;

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use agents::AgentCoordinator;
use backpressure::{BackpressureAction, BackpressureDecision, BackpressureManager, SubmitRequest};
use cancel::CancelToken;
use config::CoordinatorConfig;
use events::{EventLog, QueuePriority};
use heartbeat::HeartbeatManager;
use observe::Observatory;
use quota::QuotaOracle;
use scheduler::Scheduler;
use storage::{NewTask, Storage, TaskRow, TaskState};
use ticker::Ticker;
use verifiers::VerifierRegistry;

/// A unit of work entering the coordinator.
#[derive(Debug, Clone)]
pub struct WorkSpec {
    pub task: NewTask,
    pub provider: String,
    pub priority: QueuePriority,
    pub estimated_duration_ms: Option<u64>,
}

/// What intake did with a submission: the pipeline decision plus the task
/// row when the work was accepted (routed or queued).
#[derive(Debug)]
pub struct SubmitOutcome {
    pub decision: BackpressureDecision,
    pub task: Option<TaskRow>,
}

/// Shared application state passed to every handler and background job.
#[derive(Clone)]
pub struct CoordinatorContext {
    pub config: Arc<CoordinatorConfig>,
    pub storage: Storage,
    pub events: EventLog,
    pub scheduler: Scheduler,
    pub heartbeats: Arc<HeartbeatManager>,
    pub backpressure: Arc<BackpressureManager>,
    pub agents: Arc<AgentCoordinator>,
    pub observatory: Observatory,
}

impl CoordinatorContext {
    /// Open the durable store under the configured data dir and wire every
    /// component together.
    pub async fn init(
        config: CoordinatorConfig,
        oracle: Arc<dyn QuotaOracle>,
        verifiers: VerifierRegistry,
    ) -> Result<Self> {
        let storage = Storage::open(&config.data_dir).await?;
        Self::init_with_storage(config, storage, oracle, verifiers)
    }

    /// Wire components over an existing store (tests use `:memory:`).
    pub fn init_with_storage(
        config: CoordinatorConfig,
        storage: Storage,
        oracle: Arc<dyn QuotaOracle>,
        verifiers: VerifierRegistry,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let events = EventLog::new(storage.clone());
        let scheduler = Scheduler::new(storage.clone(), config.max_retries);
        let heartbeats = Arc::new(HeartbeatManager::new(
            storage.clone(),
            events.clone(),
            &config,
        ));
        let backpressure = Arc::new(BackpressureManager::new(&config, events.clone(), oracle));
        let agents = Arc::new(AgentCoordinator::new(
            storage.clone(),
            scheduler.clone(),
            Arc::clone(&heartbeats),
            Arc::new(verifiers),
            &config,
        ));
        let observatory = Observatory::new(storage.clone(), Arc::clone(&heartbeats));

        Ok(Self {
            config,
            storage,
            events,
            scheduler,
            heartbeats,
            backpressure,
            agents,
            observatory,
        })
    }

    /// Intake: run the submission through the backpressure pipeline and
    /// persist the task when the work is accepted.
    ///
    /// Routed work lands READY for the next `claim_next_task`; queued work
    /// is parked BLOCKED until the queue drains it back to READY. Throttled
    /// and dropped submissions are not persisted — the decision tells the
    /// caller what to do next.
    pub async fn submit_work(
        &self,
        mut spec: WorkSpec,
        cancel: &CancelToken,
    ) -> Result<SubmitOutcome> {
        let task_id = spec
            .task
            .id
            .get_or_insert_with(|| ulid::Ulid::new().to_string())
            .clone();

        let decision = self
            .backpressure
            .submit(
                SubmitRequest {
                    task_id: task_id.clone(),
                    provider: spec.provider.clone(),
                    priority: spec.priority,
                    estimated_duration_ms: spec.estimated_duration_ms,
                },
                cancel,
            )
            .await?;

        let task = match decision.action {
            BackpressureAction::Route => {
                Some(self.storage.insert_task(spec.task, Utc::now()).await?)
            }
            BackpressureAction::Defer => {
                spec.task.initial_state = Some(TaskState::Blocked);
                Some(self.storage.insert_task(spec.task, Utc::now()).await?)
            }
            BackpressureAction::Throttle | BackpressureAction::Drop => None,
        };

        Ok(SubmitOutcome { decision, task })
    }

    /// Drain one queued submission: pop the backpressure queue and promote
    /// the parked task to READY. Returns the promoted task, if any.
    pub async fn promote_queued(&self) -> Result<Option<TaskRow>> {
        let Some(scheduled) = self.backpressure.next_scheduled().await else {
            return Ok(None);
        };
        let task_id = scheduled.item.task_id.clone();

        let promoted = self
            .storage
            .update_task_state(&task_id, TaskState::Blocked, TaskState::Ready, Utc::now())
            .await?;
        if promoted {
            return Ok(self.storage.get_task(&task_id).await?);
        }

        match self.storage.get_task(&task_id).await? {
            // Queue envelope beat the task insert (sub-millisecond intake
            // race): put it back and let the next drain pass retry.
            None => {
                self.backpressure.queue().enqueue(scheduled.item).await;
                Ok(None)
            }
            Some(task) => {
                tracing::warn!(task_id, state = %task.state, "queued task no longer BLOCKED — skipping promote");
                Ok(None)
            }
        }
    }

    /// Start the consolidated background ticker: lease reclamation, queue
    /// drain, COMMITTED finalization, event retention pruning, and cache
    /// refresh signaling. One cancel token stops all of it.
    pub fn start_ticker(&self, cancel: CancelToken) -> tokio::task::JoinHandle<()> {
        let cfg = Arc::clone(&self.config);

        let reclaim_ctx = self.clone();
        let drain_ctx = self.clone();
        let finalize_ctx = self.clone();
        let prune_ctx = self.clone();
        let refresh_ctx = self.clone();
        let metrics_ctx = self.clone();

        Ticker::new()
            .every(
                "reclaim-leases",
                Duration::from_millis(cfg.reclaim_interval_ms),
                move || {
                    let ctx = reclaim_ctx.clone();
                    async move {
                        if let Err(e) = ctx.scheduler.reclaim_expired(Utc::now()).await {
                            tracing::warn!(err = %e, "lease reclamation failed");
                        }
                    }
                },
            )
            .every(
                "drain-queue",
                Duration::from_millis(cfg.reclaim_interval_ms),
                move || {
                    let ctx = drain_ctx.clone();
                    async move {
                        // Promote at most a handful per tick to stay bounded.
                        for _ in 0..16 {
                            match ctx.promote_queued().await {
                                Ok(Some(_)) => continue,
                                Ok(None) => break,
                                Err(e) => {
                                    tracing::warn!(err = %e, "queue drain failed");
                                    break;
                                }
                            }
                        }
                    }
                },
            )
            .every(
                "finalize-committed",
                Duration::from_millis(cfg.reclaim_interval_ms),
                move || {
                    let ctx = finalize_ctx.clone();
                    async move {
                        let committed = match ctx
                            .storage
                            .list_tasks_by_state(TaskState::Committed)
                            .await
                        {
                            Ok(tasks) => tasks,
                            Err(e) => {
                                tracing::warn!(err = %e, "finalizer listing failed");
                                return;
                            }
                        };
                        for task in committed {
                            if let Err(e) = ctx
                                .scheduler
                                .finalize(&task.id, &CancelToken::never())
                                .await
                            {
                                tracing::warn!(task_id = %task.id, err = %e, "finalize failed");
                            }
                        }
                    }
                },
            )
            .every(
                "prune-events",
                Duration::from_millis(cfg.prune_interval_ms),
                move || {
                    let ctx = prune_ctx.clone();
                    async move {
                        let cutoff = Utc::now()
                            - chrono::Duration::days(ctx.config.event_retention_days as i64);
                        match ctx.storage.prune_events(storage::to_ms(cutoff)).await {
                            Ok(0) => {}
                            Ok(n) => tracing::info!(pruned = n, "event retention pass"),
                            Err(e) => tracing::warn!(err = %e, "event pruning failed"),
                        }
                    }
                },
            )
            .every(
                "cache-refresh-signal",
                Duration::from_millis(cfg.cache_refresh_interval_ms),
                move || {
                    let ctx = refresh_ctx.clone();
                    async move {
                        let due = ctx.backpressure.cache().refresh_candidates(Utc::now());
                        if !due.is_empty() {
                            tracing::debug!(candidates = due.len(), "cache entries due for refresh");
                        }
                    }
                },
            )
            .every(
                "metrics-flush",
                Duration::from_millis(cfg.metrics_flush_interval_ms),
                move || {
                    let ctx = metrics_ctx.clone();
                    async move {
                        let m = ctx.backpressure.metrics().await;
                        tracing::info!(
                            submitted = m.submitted,
                            routed = m.routed,
                            throttled = m.throttled,
                            deferred = m.deferred,
                            dropped = m.dropped,
                            alerts = m.predictive.alerts_generated,
                            "backpressure metrics"
                        );
                    }
                },
            )
            .spawn(cancel)
    }

    /// Graceful shutdown: stop every agent loop and release their leases.
    pub async fn shutdown(&self) {
        self.heartbeats.stop_all().await;
    }
}
