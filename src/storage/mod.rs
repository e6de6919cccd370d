//! Durable store: tasks, leases, events, evidence.
//!
//! SQLite in WAL mode — many concurrent readers, one serialized writer.
//! Every multi-row mutation (the reserve triad, error/commit transitions,
//! reclamation) runs inside one transaction, so a crash can never leave a
//! LEASED task without a matching lease row.

use anyhow::{anyhow, Context as _, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::events::{Event, EventKind, Severity};

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the coordinator indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

/// Candidate rows fetched per page while `reserve_next` scans for a task
/// with satisfied dependencies.
const RESERVE_SCAN_BATCH: i64 = 32;

/// Current time as epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Epoch milliseconds for an explicit instant (tests pass fake clocks).
pub fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

// ─── Task state ───────────────────────────────────────────────────────────────

/// Task lifecycle states. Stored as uppercase strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Ready,
    Leased,
    Running,
    Verifying,
    Committed,
    Done,
    Error,
    Blocked,
}

impl TaskState {
    pub const ALL: [TaskState; 8] = [
        TaskState::Ready,
        TaskState::Leased,
        TaskState::Running,
        TaskState::Verifying,
        TaskState::Committed,
        TaskState::Done,
        TaskState::Error,
        TaskState::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Ready => "READY",
            TaskState::Leased => "LEASED",
            TaskState::Running => "RUNNING",
            TaskState::Verifying => "VERIFYING",
            TaskState::Committed => "COMMITTED",
            TaskState::Done => "DONE",
            TaskState::Error => "ERROR",
            TaskState::Blocked => "BLOCKED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "READY" => Some(TaskState::Ready),
            "LEASED" => Some(TaskState::Leased),
            "RUNNING" => Some(TaskState::Running),
            "VERIFYING" => Some(TaskState::Verifying),
            "COMMITTED" => Some(TaskState::Committed),
            "DONE" => Some(TaskState::Done),
            "ERROR" => Some(TaskState::Error),
            "BLOCKED" => Some(TaskState::Blocked),
            _ => None,
        }
    }

    /// States that must have exactly one active lease.
    pub fn holds_lease(&self) -> bool {
        matches!(
            self,
            TaskState::Leased | TaskState::Running | TaskState::Verifying
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Row types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: String,
    pub state: String,
    pub priority: i64,
    pub payload_json: String,
    /// JSON array of task ids that must be DONE before this task is eligible.
    pub depends_on: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub attempts: i64,
    pub token_budget: Option<i64>,
    pub cost_budget_cents: Option<i64>,
    pub policy_label: Option<String>,
}

impl TaskRow {
    pub fn task_state(&self) -> Option<TaskState> {
        TaskState::parse(&self.state)
    }

    pub fn dependencies(&self) -> Vec<String> {
        serde_json::from_str(&self.depends_on).unwrap_or_default()
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct LeaseRow {
    pub task_id: String,
    pub agent_id: String,
    pub lease_expires_at: i64,
    pub attempt: i64,
    pub acquired_at: i64,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct EvidenceRow {
    pub id: String,
    pub task_id: String,
    pub attempt: i64,
    pub verifier: String,
    pub result: String,
    pub details_json: String,
    pub ts: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct EventRow {
    id: i64,
    task_id: String,
    ts: i64,
    kind: String,
    severity: String,
    data_json: String,
}

impl EventRow {
    /// Convert the raw row into the typed [`Event`]. `None` when the
    /// payload column holds invalid JSON (corrupt row).
    fn into_event(self) -> Option<Event> {
        let data: Value = serde_json::from_str(&self.data_json).ok()?;
        Some(Event {
            id: self.id,
            task_id: self.task_id,
            ts_ms: self.ts,
            kind: self.kind,
            severity: Severity::parse(&self.severity).unwrap_or(Severity::Info),
            data,
        })
    }
}

/// Parameters for inserting a new task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    /// Caller-supplied id; a ULID is generated when absent.
    pub id: Option<String>,
    pub priority: i64,
    pub payload: Value,
    pub depends_on: Vec<String>,
    pub token_budget: Option<i64>,
    pub cost_budget_cents: Option<i64>,
    pub policy_label: Option<String>,
    /// READY unless the intake path parks the task (e.g. BLOCKED while it
    /// waits in the backpressure queue).
    pub initial_state: Option<TaskState>,
}

/// Filter for [`Storage::query_events`].
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub task_id: Option<String>,
    pub kind: Option<String>,
    pub since_ms: Option<i64>,
    pub until_ms: Option<i64>,
    pub min_severity: Option<Severity>,
}

/// What a reclamation pass recovered, used to build LEASE_EXPIRED payloads.
#[derive(Debug, Clone)]
pub struct ReclaimedLease {
    pub task_id: String,
    pub agent_id: String,
    pub lease_duration_ms: i64,
    pub expiry_time: i64,
}

// ─── Storage ──────────────────────────────────────────────────────────────────

/// Shared handle to the coordinator database. Cheap to clone.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
    /// Serializes multi-statement write transactions. Single-statement
    /// writes rely on SQLite's own writer lock.
    writer: Arc<Mutex<()>>,
}

impl Storage {
    /// Open (or create) the database under `data_dir`.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("fleetd.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        })
    }

    /// In-memory database for tests. A single connection keeps every query
    /// on the same memory database.
    pub async fn open_in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [
            include_str!("migrations/001_init.sql"),
            include_str!("migrations/002_evidence.sql"),
        ] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // ─── Tasks ────────────────────────────────────────────────────────────────

    pub async fn insert_task(&self, new: NewTask, at: DateTime<Utc>) -> Result<TaskRow> {
        let id = new.id.unwrap_or_else(|| ulid::Ulid::new().to_string());
        let now = to_ms(at);
        let payload = serde_json::to_string(&new.payload)?;
        let deps = serde_json::to_string(&new.depends_on)?;
        let state = new.initial_state.unwrap_or(TaskState::Ready);
        sqlx::query(
            "INSERT INTO tasks
             (id, state, priority, payload_json, depends_on, created_at, updated_at, attempts,
              token_budget, cost_budget_cents, policy_label)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(&id)
        .bind(state.as_str())
        .bind(new.priority)
        .bind(&payload)
        .bind(&deps)
        .bind(now)
        .bind(now)
        .bind(new.token_budget)
        .bind(new.cost_budget_cents)
        .bind(&new.policy_label)
        .execute(&self.pool)
        .await?;

        self.get_task(&id)
            .await?
            .ok_or_else(|| anyhow!("task not found after insert"))
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<TaskRow>> {
        Ok(sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Remove a task that never got accepted (rejected at intake). Refuses
    /// to touch a task holding a lease.
    pub async fn delete_task(&self, id: &str) -> Result<bool> {
        let rows = sqlx::query(
            "DELETE FROM tasks
             WHERE id = ? AND NOT EXISTS (SELECT 1 FROM leases WHERE task_id = ?)",
        )
        .bind(id)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows == 1)
    }

    pub async fn list_tasks_by_state(&self, state: TaskState) -> Result<Vec<TaskRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM tasks WHERE state = ?
                 ORDER BY priority DESC, created_at ASC, id ASC",
            )
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    /// `(state, count)` pairs for every state currently present.
    pub async fn count_tasks_by_state(&self) -> Result<Vec<(String, i64)>> {
        Ok(
            sqlx::query_as("SELECT state, COUNT(*) FROM tasks GROUP BY state")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Guarded state transition. Returns `false` when the task was not in
    /// `from` (the caller decides whether that is an invariant violation).
    pub async fn update_task_state(
        &self,
        id: &str,
        from: TaskState,
        to: TaskState,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE tasks SET state = ?, updated_at = ? WHERE id = ? AND state = ?",
        )
        .bind(to.as_str())
        .bind(to_ms(at))
        .bind(id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows == 1)
    }

    /// Guarded transition plus event append in one transaction.
    pub async fn transition_with_event(
        &self,
        id: &str,
        from: TaskState,
        to: TaskState,
        event: &EventKind,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let now = to_ms(at);
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "UPDATE tasks SET state = ?, updated_at = ? WHERE id = ? AND state = ?",
        )
        .bind(to.as_str())
        .bind(now)
        .bind(id)
        .bind(from.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        append_event_tx(&mut tx, id, event, now).await?;
        tx.commit().await?;
        Ok(true)
    }

    // ─── Reserve (the claim triad) ────────────────────────────────────────────

    /// Atomically pick the best READY task with satisfied dependencies,
    /// increment attempts, transition to LEASED, insert the lease row, and
    /// append the CLAIMED event — all in one transaction.
    ///
    /// This is the ONLY place a CLAIMED event is written.
    pub async fn reserve_next(
        &self,
        agent_id: &str,
        ttl_ms: i64,
        at: DateTime<Utc>,
    ) -> Result<Option<(TaskRow, LeaseRow)>> {
        let now = to_ms(at);
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        // Page through READY tasks in claim order until one with satisfied
        // dependencies turns up or the table is exhausted. Dependency checks
        // happen in Rust since depends_on is a JSON column; the batched scan
        // rides idx_tasks_ready_order so a long dependency-blocked prefix
        // never starves eligible work further down.
        let mut chosen: Option<TaskRow> = None;
        let mut offset = 0i64;
        'scan: loop {
            let candidates: Vec<TaskRow> = sqlx::query_as(
                "SELECT * FROM tasks WHERE state = 'READY'
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT ? OFFSET ?",
            )
            .bind(RESERVE_SCAN_BATCH)
            .bind(offset)
            .fetch_all(&mut *tx)
            .await?;
            let exhausted = (candidates.len() as i64) < RESERVE_SCAN_BATCH;

            for task in candidates {
                if self.deps_satisfied_tx(&mut tx, &task).await? {
                    chosen = Some(task);
                    break 'scan;
                }
            }
            if exhausted {
                break;
            }
            offset += RESERVE_SCAN_BATCH;
        }
        let Some(task) = chosen else {
            tx.rollback().await?;
            return Ok(None);
        };

        let attempt = task.attempts + 1;
        sqlx::query(
            "UPDATE tasks SET state = 'LEASED', attempts = ?, updated_at = ?
             WHERE id = ? AND state = 'READY'",
        )
        .bind(attempt)
        .bind(now)
        .bind(&task.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO leases (task_id, agent_id, lease_expires_at, attempt, acquired_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(agent_id)
        .bind(now + ttl_ms)
        .bind(attempt)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let claimed = EventKind::Claimed {
            agent_id: agent_id.to_string(),
            attempt,
        };
        append_event_tx(&mut tx, &task.id, &claimed, now).await?;
        tx.commit().await?;

        let task = self
            .get_task(&task.id)
            .await?
            .ok_or_else(|| anyhow!("task vanished after reserve"))?;
        let lease = LeaseRow {
            task_id: task.id.clone(),
            agent_id: agent_id.to_string(),
            lease_expires_at: now + ttl_ms,
            attempt,
            acquired_at: now,
        };
        Ok(Some((task, lease)))
    }

    /// All declared dependencies must be DONE. A dependency id with no task
    /// row counts as unsatisfied.
    async fn deps_satisfied_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        task: &TaskRow,
    ) -> Result<bool> {
        for dep in task.dependencies() {
            let state: Option<String> =
                sqlx::query_scalar("SELECT state FROM tasks WHERE id = ?")
                    .bind(&dep)
                    .fetch_optional(&mut **tx)
                    .await?;
            if state.as_deref() != Some("DONE") {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ─── Leases ───────────────────────────────────────────────────────────────

    pub async fn get_lease(&self, task_id: &str) -> Result<Option<LeaseRow>> {
        Ok(sqlx::query_as("SELECT * FROM leases WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn leases_for_agent(&self, agent_id: &str) -> Result<Vec<LeaseRow>> {
        Ok(sqlx::query_as("SELECT * FROM leases WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn count_leases(&self, task_id: &str) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM leases WHERE task_id = ?")
                .bind(task_id)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    /// Insert a lease row directly. `reserve_next` is the normal path; this
    /// exists for operator tooling that re-attaches a lease by hand.
    pub async fn acquire_lease(
        &self,
        task_id: &str,
        agent_id: &str,
        ttl_ms: i64,
        attempt: i64,
        at: DateTime<Utc>,
    ) -> Result<LeaseRow> {
        let now = to_ms(at);
        sqlx::query(
            "INSERT INTO leases (task_id, agent_id, lease_expires_at, attempt, acquired_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(agent_id)
        .bind(now + ttl_ms)
        .bind(attempt)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("lease already exists for task")?;
        self.get_lease(task_id)
            .await?
            .ok_or_else(|| anyhow!("lease not found after insert"))
    }

    /// Extend the lease by `ttl_ms` from `at`. Guarded by agent identity;
    /// returns `false` when the lease is gone or owned by another agent.
    pub async fn renew_lease(
        &self,
        task_id: &str,
        agent_id: &str,
        ttl_ms: i64,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE leases SET lease_expires_at = ? WHERE task_id = ? AND agent_id = ?",
        )
        .bind(to_ms(at) + ttl_ms)
        .bind(task_id)
        .bind(agent_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows == 1)
    }

    /// Explicit release: drop the lease and return the task to READY in one
    /// transaction. Returns `false` when this agent held no lease.
    pub async fn release_lease(
        &self,
        task_id: &str,
        agent_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let now = to_ms(at);
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query("DELETE FROM leases WHERE task_id = ? AND agent_id = ?")
            .bind(task_id)
            .bind(agent_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if rows == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE tasks SET state = 'READY', updated_at = ?
             WHERE id = ? AND state IN ('LEASED', 'RUNNING', 'VERIFYING')",
        )
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Drop the lease without touching task state. Used by terminal commit
    /// and error transitions that set the state themselves.
    async fn delete_lease_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        task_id: &str,
    ) -> Result<()> {
        sqlx::query("DELETE FROM leases WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Terminal transition that also removes the lease: used for
    /// VERIFYING→COMMITTED and the error paths out of executing states.
    pub async fn finish_with_event(
        &self,
        id: &str,
        from: TaskState,
        to: TaskState,
        event: &EventKind,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let now = to_ms(at);
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "UPDATE tasks SET state = ?, updated_at = ? WHERE id = ? AND state = ?",
        )
        .bind(to.as_str())
        .bind(now)
        .bind(id)
        .bind(from.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        Self::delete_lease_tx(&mut tx, id).await?;
        append_event_tx(&mut tx, id, event, now).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Reclaim every lease with `lease_expires_at < now`: delete the lease,
    /// return the task to READY, append LEASE_EXPIRED. Idempotent — a second
    /// pass with the same clock finds nothing.
    pub async fn reclaim_expired(&self, at: DateTime<Utc>) -> Result<Vec<ReclaimedLease>> {
        let now = to_ms(at);
        let _guard = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;

        let expired: Vec<LeaseRow> =
            sqlx::query_as("SELECT * FROM leases WHERE lease_expires_at < ?")
                .bind(now)
                .fetch_all(&mut *tx)
                .await?;

        let mut reclaimed = Vec::with_capacity(expired.len());
        for lease in expired {
            sqlx::query("DELETE FROM leases WHERE task_id = ?")
                .bind(&lease.task_id)
                .execute(&mut *tx)
                .await?;

            sqlx::query(
                "UPDATE tasks SET state = 'READY', updated_at = ?
                 WHERE id = ? AND state IN ('LEASED', 'RUNNING', 'VERIFYING')",
            )
            .bind(now)
            .bind(&lease.task_id)
            .execute(&mut *tx)
            .await?;

            let info = ReclaimedLease {
                task_id: lease.task_id.clone(),
                agent_id: lease.agent_id.clone(),
                lease_duration_ms: lease.lease_expires_at - lease.acquired_at,
                expiry_time: lease.lease_expires_at,
            };
            let event = EventKind::LeaseExpired {
                agent_id: info.agent_id.clone(),
                lease_duration_ms: info.lease_duration_ms,
                expiry_time: info.expiry_time,
            };
            append_event_tx(&mut tx, &lease.task_id, &event, now).await?;
            reclaimed.push(info);
        }

        tx.commit().await?;
        Ok(reclaimed)
    }

    // ─── Events ───────────────────────────────────────────────────────────────

    /// Append one event. Returns the event row id.
    pub async fn append_event(
        &self,
        task_id: &str,
        kind: &EventKind,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        let now = to_ms(at);
        let result = sqlx::query(
            "INSERT INTO events (task_id, ts, kind, severity, data_json)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(now)
        .bind(kind.kind_str())
        .bind(kind.severity().as_str())
        .bind(serde_json::to_string(&kind.data_value())?)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Raw append for tests exercising corrupt-row tolerance.
    #[doc(hidden)]
    pub async fn append_event_raw(
        &self,
        task_id: &str,
        kind: &str,
        severity: &str,
        data_json: &str,
        ts: i64,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO events (task_id, ts, kind, severity, data_json)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(ts)
        .bind(kind)
        .bind(severity)
        .bind(data_json)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Filtered event query, insertion order. Corrupt rows (invalid JSON in
    /// `data_json`) are skipped with a warning, never an error.
    pub async fn query_events(&self, filter: &EventFilter, limit: i64) -> Result<Vec<Event>> {
        let limit = limit.clamp(1, 10_000);
        let rows: Vec<EventRow> = with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM events
                 WHERE (? IS NULL OR task_id = ?)
                   AND (? IS NULL OR kind = ?)
                   AND (? IS NULL OR ts >= ?)
                   AND (? IS NULL OR ts <= ?)
                 ORDER BY id ASC
                 LIMIT ?",
            )
            .bind(&filter.task_id)
            .bind(&filter.task_id)
            .bind(&filter.kind)
            .bind(&filter.kind)
            .bind(filter.since_ms)
            .bind(filter.since_ms)
            .bind(filter.until_ms)
            .bind(filter.until_ms)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
        })
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        let mut skipped = 0usize;
        for row in rows {
            let id = row.id;
            match row.into_event() {
                Some(ev) => {
                    if let Some(min) = filter.min_severity {
                        if ev.severity < min {
                            continue;
                        }
                    }
                    events.push(ev);
                }
                None => {
                    skipped += 1;
                    tracing::warn!(event_id = id, "skipping corrupt event row");
                }
            }
        }
        if skipped > 0 {
            tracing::warn!(skipped, "event query skipped corrupt rows");
        }
        Ok(events)
    }

    /// Most recent events, newest first.
    pub async fn recent_events(&self, limit: i64) -> Result<Vec<Event>> {
        let limit = limit.clamp(1, 1_000);
        let rows: Vec<EventRow> =
            sqlx::query_as("SELECT * FROM events ORDER BY id DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().filter_map(EventRow::into_event).collect())
    }

    pub async fn count_events_by_kind(&self, kind: &str, since_ms: i64) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE kind = ? AND ts >= ?")
                .bind(kind)
                .bind(since_ms)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    pub async fn count_events_between(
        &self,
        kind: &str,
        from_ms: i64,
        until_ms: i64,
    ) -> Result<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM events WHERE kind = ? AND ts >= ? AND ts <= ?",
        )
        .bind(kind)
        .bind(from_ms)
        .bind(until_ms)
        .fetch_one(&self.pool)
        .await?)
    }

    /// Delete events older than the cutoff. Returns rows removed.
    pub async fn prune_events(&self, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM events WHERE ts < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ─── Evidence ─────────────────────────────────────────────────────────────

    pub async fn insert_evidence(
        &self,
        task_id: &str,
        attempt: i64,
        verifier: &str,
        result: &str,
        details: &Value,
        at: DateTime<Utc>,
    ) -> Result<EvidenceRow> {
        use sha2::{Digest, Sha256};
        let now = to_ms(at);
        let id = hex::encode(Sha256::digest(
            format!("{task_id}:{attempt}:{verifier}:{now}").as_bytes(),
        ));
        let id = &id[..32];
        sqlx::query(
            "INSERT INTO evidence (id, task_id, attempt, verifier, result, details_json, ts)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(task_id)
        .bind(attempt)
        .bind(verifier)
        .bind(result)
        .bind(serde_json::to_string(details)?)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(sqlx::query_as("SELECT * FROM evidence WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn list_evidence(&self, task_id: &str) -> Result<Vec<EvidenceRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM evidence WHERE task_id = ? ORDER BY ts ASC")
                .bind(task_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Number of review-gate evaluations recorded for a task.
    pub async fn count_review_cycles(&self, task_id: &str) -> Result<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM evidence WHERE task_id = ? AND verifier = 'review_gate'",
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await?)
    }
}

/// Append an event inside an open transaction.
async fn append_event_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    task_id: &str,
    kind: &EventKind,
    ts: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO events (task_id, ts, kind, severity, data_json)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(task_id)
    .bind(ts)
    .bind(kind.kind_str())
    .bind(kind.severity().as_str())
    .bind(serde_json::to_string(&kind.data_value())?)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
