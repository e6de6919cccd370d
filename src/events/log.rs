//! Thin typed façade over the store's event table.
//!
//! Payload shape is enforced by [`EventKind`](super::EventKind) itself — a
//! malformed payload cannot be constructed, and a corrupt persisted row is
//! skipped on read with a warning rather than failing the query.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::events::{Event, EventKind, SYSTEM_TASK};
use crate::storage::{to_ms, EventFilter, Storage};

#[derive(Clone)]
pub struct EventLog {
    store: Storage,
}

impl EventLog {
    pub fn new(store: Storage) -> Self {
        Self { store }
    }

    // ─── Emission ─────────────────────────────────────────────────────────────

    /// Append one event for a task, stamped now.
    pub async fn emit(&self, task_id: &str, kind: EventKind) -> Result<i64> {
        self.emit_at(task_id, kind, Utc::now()).await
    }

    /// Append one event with an explicit timestamp (tests, replays).
    pub async fn emit_at(
        &self,
        task_id: &str,
        kind: EventKind,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        tracing::debug!(task_id, kind = kind.kind_str(), "event");
        self.store.append_event(task_id, &kind, at).await
    }

    /// Append an event not tied to any task (liveness, config, oracle).
    pub async fn emit_system(&self, kind: EventKind) -> Result<i64> {
        self.emit(SYSTEM_TASK, kind).await
    }

    // ─── Queries ──────────────────────────────────────────────────────────────

    /// All events for one task, insertion order.
    pub async fn get_task_events(&self, task_id: &str) -> Result<Vec<Event>> {
        self.store
            .query_events(
                &EventFilter {
                    task_id: Some(task_id.to_string()),
                    ..Default::default()
                },
                10_000,
            )
            .await
    }

    pub async fn get_events_by_kind(&self, kind: &str, limit: i64) -> Result<Vec<Event>> {
        self.store
            .query_events(
                &EventFilter {
                    kind: Some(kind.to_string()),
                    ..Default::default()
                },
                limit,
            )
            .await
    }

    /// Most recent events across all tasks, newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<Event>> {
        self.store.recent_events(limit).await
    }

    pub async fn count_since(&self, kind: &str, since: DateTime<Utc>) -> Result<i64> {
        self.store.count_events_by_kind(kind, to_ms(since)).await
    }

    pub async fn count_between(
        &self,
        kind: &str,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<i64> {
        self.store
            .count_events_between(kind, to_ms(from), to_ms(until))
            .await
    }

    /// Events within the trailing window whose payload names `provider`.
    ///
    /// Provider is part of the payload, not a column, so the filter runs
    /// after decode; the window bound keeps the scan small.
    pub async fn provider_events_within(
        &self,
        provider: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let events = self
            .store
            .query_events(
                &EventFilter {
                    since_ms: Some(to_ms(now - window)),
                    ..Default::default()
                },
                10_000,
            )
            .await?;
        Ok(events
            .into_iter()
            .filter(|e| e.data.get("provider").and_then(|p| p.as_str()) == Some(provider))
            .collect())
    }
}
