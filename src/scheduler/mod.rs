//! Task state machine.
//!
//! The scheduler is purely the state-machine authority; the durable triad
//! (transition + lease + event in one transaction) lives in the store and
//! the scheduler decides *which* transitions are legal:
//!
//! ```text
//! READY ─reserve(agent)→ LEASED ─start→ RUNNING ─verifying→ VERIFYING
//! VERIFYING ─committed→ COMMITTED ─finalize→ DONE
//! {LEASED,RUNNING,VERIFYING} ─error(retryable)→ READY
//! {LEASED,RUNNING,VERIFYING} ─error(fatal)→ ERROR
//! {LEASED,RUNNING,VERIFYING} ─lease_expired→ READY
//! ```
//!
//! Any other transition is an invariant violation: the operation fails, an
//! ERROR event records the full context, and a non-terminal task is parked
//! in ERROR for operator intervention.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::cancel::CancelToken;
use crate::events::EventKind;
use crate::redact::redact;
use crate::storage::{LeaseRow, NewTask, Storage, TaskRow, TaskState};

/// A successful reservation: the task row after transition plus its lease.
#[derive(Debug, Clone)]
pub struct Claim {
    pub task: TaskRow,
    pub lease: LeaseRow,
}

/// Context passed to [`Scheduler::error`].
#[derive(Debug, Clone)]
pub struct ErrorCtx {
    pub message: String,
    /// Error type name, e.g. `"OracleTimeout"`.
    pub name: String,
    pub context: Value,
    /// `None` means retryable unless the retry budget is exhausted.
    pub retryable: Option<bool>,
}

impl ErrorCtx {
    pub fn new(message: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: name.into(),
            context: Value::Null,
            retryable: None,
        }
    }

    pub fn fatal(mut self) -> Self {
        self.retryable = Some(false);
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("task {task_id} not found")]
    TaskNotFound { task_id: String },
    #[error("illegal transition for task {task_id}: {from} → {to}")]
    IllegalTransition {
        task_id: String,
        from: String,
        to: String,
    },
    #[error(transparent)]
    Cancelled(#[from] crate::cancel::Cancelled),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct Scheduler {
    store: Storage,
    max_retries: u32,
}

impl Scheduler {
    pub fn new(store: Storage, max_retries: u32) -> Self {
        Self { store, max_retries }
    }

    /// Persist a new READY task.
    pub async fn create_task(&self, new: NewTask, cancel: &CancelToken) -> Result<TaskRow> {
        cancel.check()?;
        self.store.insert_task(new, Utc::now()).await
    }

    // ─── reserve ──────────────────────────────────────────────────────────────

    /// Atomically claim the best READY task for `agent_id`.
    ///
    /// The CLAIMED event is emitted here and ONLY here — wrappers exposing
    /// claim semantics must delegate to this method, never emit their own.
    pub async fn reserve(
        &self,
        agent_id: &str,
        ttl: Duration,
        cancel: &CancelToken,
    ) -> Result<Option<Claim>> {
        cancel.check()?;
        let reserved = self
            .store
            .reserve_next(agent_id, ttl.num_milliseconds(), Utc::now())
            .await?;
        Ok(reserved.map(|(task, lease)| {
            tracing::info!(
                task_id = %task.id,
                agent_id,
                attempt = lease.attempt,
                "task reserved"
            );
            Claim { task, lease }
        }))
    }

    // ─── forward transitions ──────────────────────────────────────────────────

    /// LEASED → RUNNING.
    pub async fn start(&self, task_id: &str, cancel: &CancelToken) -> Result<(), TransitionError> {
        cancel.check()?;
        self.step(task_id, TaskState::Leased, TaskState::Running, EventKind::Running)
            .await
    }

    /// RUNNING → VERIFYING.
    pub async fn verifying(
        &self,
        task_id: &str,
        cancel: &CancelToken,
    ) -> Result<(), TransitionError> {
        cancel.check()?;
        self.step(
            task_id,
            TaskState::Running,
            TaskState::Verifying,
            EventKind::Verifying,
        )
        .await
    }

    /// VERIFYING → COMMITTED. The lease ends here.
    pub async fn committed(
        &self,
        task_id: &str,
        cancel: &CancelToken,
    ) -> Result<(), TransitionError> {
        cancel.check()?;
        let applied = self
            .store
            .finish_with_event(
                task_id,
                TaskState::Verifying,
                TaskState::Committed,
                &EventKind::Committed,
                Utc::now(),
            )
            .await?;
        if applied {
            Ok(())
        } else {
            Err(self
                .flag_invariant_violation(task_id, TaskState::Verifying, TaskState::Committed)
                .await)
        }
    }

    /// COMMITTED → DONE. Run by the finalizer tick or directly by callers.
    pub async fn finalize(
        &self,
        task_id: &str,
        cancel: &CancelToken,
    ) -> Result<(), TransitionError> {
        cancel.check()?;
        let applied = self
            .store
            .update_task_state(task_id, TaskState::Committed, TaskState::Done, Utc::now())
            .await?;
        if applied {
            Ok(())
        } else {
            Err(self
                .flag_invariant_violation(task_id, TaskState::Committed, TaskState::Done)
                .await)
        }
    }

    // ─── error path ───────────────────────────────────────────────────────────

    /// Route an executing task to READY (retryable) or ERROR (fatal), with a
    /// sanitized ERROR event either way.
    ///
    /// Retry policy: `ctx.retryable` defaults to true until the task's
    /// attempts reach `max_retries`.
    pub async fn error(
        &self,
        task_id: &str,
        ctx: ErrorCtx,
        cancel: &CancelToken,
    ) -> Result<TaskState, TransitionError> {
        cancel.check()?;
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| TransitionError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;
        let Some(from) = task.task_state() else {
            return Err(TransitionError::IllegalTransition {
                task_id: task_id.to_string(),
                from: task.state.clone(),
                to: TaskState::Error.to_string(),
            });
        };

        if !from.holds_lease() {
            return Err(self
                .flag_invariant_violation(task_id, from, TaskState::Error)
                .await);
        }

        let retryable = ctx
            .retryable
            .unwrap_or(task.attempts < self.max_retries as i64);
        let to = if retryable {
            TaskState::Ready
        } else {
            TaskState::Error
        };

        let event = EventKind::Error {
            message: redact(&ctx.message),
            name: ctx.name.clone(),
            context: ctx.context.clone(),
        };
        let applied = self
            .store
            .finish_with_event(task_id, from, to, &event, Utc::now())
            .await?;
        if !applied {
            // Lost a race (e.g. reclamation fired between read and write).
            return Err(self.flag_invariant_violation(task_id, from, to).await);
        }

        tracing::warn!(task_id, from = %from, to = %to, retryable, error = %ctx.name, "task errored");
        Ok(to)
    }

    /// Reset an ERROR task to READY for a fresh round of attempts.
    pub async fn retry_errored(
        &self,
        task_id: &str,
        cancel: &CancelToken,
    ) -> Result<(), TransitionError> {
        cancel.check()?;
        let applied = self
            .store
            .update_task_state(task_id, TaskState::Error, TaskState::Ready, Utc::now())
            .await?;
        if applied {
            Ok(())
        } else {
            Err(self
                .flag_invariant_violation(task_id, TaskState::Error, TaskState::Ready)
                .await)
        }
    }

    // ─── reclamation / release ────────────────────────────────────────────────

    /// Return every task whose lease expired before `now` to READY.
    /// Emits LEASE_EXPIRED per reclaimed lease. Idempotent.
    pub async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let reclaimed = self.store.reclaim_expired(now).await?;
        if !reclaimed.is_empty() {
            tracing::info!(count = reclaimed.len(), "reclaimed expired leases");
        }
        Ok(reclaimed.len())
    }

    /// Voluntary release by the owning agent; the task returns to READY
    /// without an error mark.
    pub async fn release(&self, task_id: &str, agent_id: &str) -> Result<bool> {
        self.store.release_lease(task_id, agent_id, Utc::now()).await
    }

    // ─── internals ────────────────────────────────────────────────────────────

    async fn step(
        &self,
        task_id: &str,
        from: TaskState,
        to: TaskState,
        event: EventKind,
    ) -> Result<(), TransitionError> {
        let applied = self
            .store
            .transition_with_event(task_id, from, to, &event, Utc::now())
            .await?;
        if applied {
            Ok(())
        } else {
            Err(self.flag_invariant_violation(task_id, from, to).await)
        }
    }

    /// Record an illegal-transition attempt: append an ERROR event with the
    /// full context and park a non-terminal task in ERROR. The coordinator
    /// does not self-heal invariant breaches.
    async fn flag_invariant_violation(
        &self,
        task_id: &str,
        expected_from: TaskState,
        to: TaskState,
    ) -> TransitionError {
        let actual = match self.store.get_task(task_id).await {
            Ok(Some(task)) => task.state,
            Ok(None) => {
                return TransitionError::TaskNotFound {
                    task_id: task_id.to_string(),
                }
            }
            Err(e) => return TransitionError::Store(e),
        };

        let event = EventKind::Error {
            message: format!(
                "illegal transition: expected {expected_from}, found {actual}, wanted {to}"
            ),
            name: "TransitionError".to_string(),
            context: serde_json::json!({
                "expected_from": expected_from.as_str(),
                "actual": actual,
                "attempted_to": to.as_str(),
            }),
        };

        let now = Utc::now();
        let outcome = match TaskState::parse(&actual) {
            Some(state) if state.holds_lease() => {
                self.store
                    .finish_with_event(task_id, state, TaskState::Error, &event, now)
                    .await
            }
            Some(state @ (TaskState::Ready | TaskState::Blocked | TaskState::Committed)) => {
                self.store
                    .transition_with_event(task_id, state, TaskState::Error, &event, now)
                    .await
            }
            // Terminal (DONE/ERROR) or unparseable: record only.
            _ => self
                .store
                .append_event(task_id, &event, now)
                .await
                .map(|_| true),
        };
        if let Err(e) = outcome {
            tracing::error!(task_id, err = %e, "failed to record invariant violation");
        }

        TransitionError::IllegalTransition {
            task_id: task_id.to_string(),
            from: actual,
            to: to.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::EventFilter;
    use serde_json::json;

    async fn scheduler() -> (Storage, Scheduler) {
        let store = Storage::open_in_memory().await.unwrap();
        (store.clone(), Scheduler::new(store, 3))
    }

    async fn seed(store: &Storage, id: &str) {
        store
            .insert_task(
                NewTask {
                    id: Some(id.to_string()),
                    payload: json!({}),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await
            .unwrap();
    }

    async fn kinds_for(store: &Storage, id: &str) -> Vec<String> {
        store
            .query_events(
                &EventFilter {
                    task_id: Some(id.to_string()),
                    ..Default::default()
                },
                100,
            )
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect()
    }

    #[tokio::test]
    async fn full_happy_walk() {
        let (store, sched) = scheduler().await;
        let cancel = CancelToken::never();
        seed(&store, "t1").await;

        let claim = sched
            .reserve("a1", Duration::seconds(60), &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.task.id, "t1");

        sched.start("t1", &cancel).await.unwrap();
        sched.verifying("t1", &cancel).await.unwrap();
        sched.committed("t1", &cancel).await.unwrap();
        sched.finalize("t1", &cancel).await.unwrap();

        let task = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.state, "DONE");
        assert_eq!(store.count_leases("t1").await.unwrap(), 0);
        assert_eq!(
            kinds_for(&store, "t1").await,
            vec!["CLAIMED", "RUNNING", "VERIFYING", "COMMITTED"]
        );
    }

    #[tokio::test]
    async fn retryable_error_returns_to_ready() {
        let (store, sched) = scheduler().await;
        let cancel = CancelToken::never();
        seed(&store, "t1").await;
        sched.reserve("a1", Duration::seconds(60), &cancel).await.unwrap();
        sched.start("t1", &cancel).await.unwrap();

        let to = sched
            .error("t1", ErrorCtx::new("provider 500", "ProviderError"), &cancel)
            .await
            .unwrap();
        assert_eq!(to, TaskState::Ready);
        let task = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.state, "READY");
        assert_eq!(task.attempts, 1, "attempts already counted by reserve");
        assert_eq!(store.count_leases("t1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fatal_error_parks_in_error_state() {
        let (store, sched) = scheduler().await;
        let cancel = CancelToken::never();
        seed(&store, "t1").await;
        sched.reserve("a1", Duration::seconds(60), &cancel).await.unwrap();

        let to = sched
            .error(
                "t1",
                ErrorCtx::new("bad payload", "ValidationError").fatal(),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(to, TaskState::Error);
        assert_eq!(store.get_task("t1").await.unwrap().unwrap().state, "ERROR");
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_is_fatal() {
        let (store, sched) = scheduler().await;
        let cancel = CancelToken::never();
        seed(&store, "t1").await;

        // Burn through the budget: each reserve bumps attempts.
        for round in 0..3 {
            sched.reserve("a1", Duration::seconds(60), &cancel).await.unwrap().unwrap();
            let to = sched
                .error("t1", ErrorCtx::new("flaky", "Transient"), &cancel)
                .await
                .unwrap();
            if round < 2 {
                assert_eq!(to, TaskState::Ready, "round {round} should retry");
            } else {
                assert_eq!(to, TaskState::Error, "attempts >= max_retries is fatal");
            }
        }
    }

    #[tokio::test]
    async fn error_messages_are_redacted() {
        let (store, sched) = scheduler().await;
        let cancel = CancelToken::never();
        seed(&store, "t1").await;
        sched.reserve("a1", Duration::seconds(60), &cancel).await.unwrap();

        sched
            .error(
                "t1",
                ErrorCtx::new("auth failed: api_key=supersecret123", "AuthError").fatal(),
                &cancel,
            )
            .await
            .unwrap();

        let events = kinds_for(&store, "t1").await;
        assert!(events.contains(&"ERROR".to_string()));
        let rows = store
            .query_events(
                &EventFilter {
                    task_id: Some("t1".into()),
                    kind: Some("ERROR".into()),
                    ..Default::default()
                },
                10,
            )
            .await
            .unwrap();
        let msg = rows[0].data["message"].as_str().unwrap();
        assert!(!msg.contains("supersecret123"));
    }

    #[tokio::test]
    async fn errored_task_can_be_reset_and_reclaimed() {
        let (store, sched) = scheduler().await;
        let cancel = CancelToken::never();
        seed(&store, "t1").await;
        sched.reserve("a1", Duration::seconds(60), &cancel).await.unwrap();
        sched
            .error("t1", ErrorCtx::new("x", "E").fatal(), &cancel)
            .await
            .unwrap();

        sched.retry_errored("t1", &cancel).await.unwrap();
        assert_eq!(store.get_task("t1").await.unwrap().unwrap().state, "READY");

        let claim = sched
            .reserve("a2", Duration::seconds(60), &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.lease.attempt, 2);
    }

    #[tokio::test]
    async fn illegal_transition_parks_task_and_errors() {
        let (store, sched) = scheduler().await;
        let cancel = CancelToken::never();
        seed(&store, "t1").await;

        // start() without reserve: READY is not LEASED.
        let err = sched.start("t1", &cancel).await.unwrap_err();
        assert!(matches!(err, TransitionError::IllegalTransition { .. }));
        let task = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.state, "ERROR", "invariant breach parks the task");
        assert!(kinds_for(&store, "t1").await.contains(&"ERROR".to_string()));
    }

    #[tokio::test]
    async fn illegal_transition_on_done_task_only_records() {
        let (store, sched) = scheduler().await;
        let cancel = CancelToken::never();
        seed(&store, "t1").await;
        sched.reserve("a1", Duration::seconds(60), &cancel).await.unwrap();
        sched.start("t1", &cancel).await.unwrap();
        sched.verifying("t1", &cancel).await.unwrap();
        sched.committed("t1", &cancel).await.unwrap();
        sched.finalize("t1", &cancel).await.unwrap();

        let err = sched.start("t1", &cancel).await.unwrap_err();
        assert!(matches!(err, TransitionError::IllegalTransition { .. }));
        // Terminal state is left alone.
        assert_eq!(store.get_task("t1").await.unwrap().unwrap().state, "DONE");
    }

    #[tokio::test]
    async fn reclaim_returns_count_and_allows_reclaim_then_reserve() {
        let (store, sched) = scheduler().await;
        let cancel = CancelToken::never();
        seed(&store, "t1").await;
        sched.reserve("a1", Duration::seconds(1), &cancel).await.unwrap();

        let later = Utc::now() + Duration::seconds(10);
        assert_eq!(sched.reclaim_expired(later).await.unwrap(), 1);
        assert_eq!(sched.reclaim_expired(later).await.unwrap(), 0);

        let claim = sched
            .reserve("a2", Duration::seconds(60), &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.task.id, "t1");
        assert_eq!(claim.lease.attempt, 2, "attempts incremented on re-lease");
    }

    #[tokio::test]
    async fn cancelled_token_blocks_new_work() {
        let (store, sched) = scheduler().await;
        seed(&store, "t1").await;
        let (src, cancel) = crate::cancel::CancelSource::new();
        src.cancel();
        let err = sched.reserve("a1", Duration::seconds(60), &cancel).await;
        assert!(err.is_err());
        // Nothing was claimed.
        assert_eq!(store.count_leases("t1").await.unwrap(), 0);
    }
}
