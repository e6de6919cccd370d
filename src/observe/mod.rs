//! Snapshot provider for presentation collaborators (CLI `top`, notifiers).
//!
//! The event log is the source of truth: error rollups are aggregated from
//! ERROR-severity events, not from separate counters that could drift.

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::events::{Event, Severity};
use crate::heartbeat::{AgentStatus, HeartbeatManager};
use crate::storage::{to_ms, EventFilter, Storage};

/// Per-kind error aggregation over hourly / daily windows.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRollup {
    pub kind: String,
    pub count_1h: i64,
    pub count_24h: i64,
    /// Epoch ms of the most recent occurrence.
    pub last_seen_ms: i64,
}

/// Periodic snapshot handed to presentation consumers.
#[derive(Debug, Serialize)]
pub struct Snapshot {
    /// Task counts grouped by state.
    pub tasks_by_state: BTreeMap<String, i64>,
    pub agents: Vec<AgentStatus>,
    /// Newest first.
    pub recent_events: Vec<Event>,
    pub errors: Vec<ErrorRollup>,
}

#[derive(Clone)]
pub struct Observatory {
    store: Storage,
    heartbeats: Arc<HeartbeatManager>,
}

impl Observatory {
    pub fn new(store: Storage, heartbeats: Arc<HeartbeatManager>) -> Self {
        Self { store, heartbeats }
    }

    pub async fn snapshot(&self, recent_limit: i64) -> Result<Snapshot> {
        let tasks_by_state = self
            .store
            .count_tasks_by_state()
            .await?
            .into_iter()
            .collect();
        let agents = self.heartbeats.list_agents().await;
        let recent_events = self.store.recent_events(recent_limit).await?;
        let errors = self.error_rollups().await?;
        Ok(Snapshot {
            tasks_by_state,
            agents,
            recent_events,
            errors,
        })
    }

    /// Aggregate ERROR-and-worse events by kind with 1 h / 24 h windows and
    /// the most recent timestamp per kind.
    pub async fn error_rollups(&self) -> Result<Vec<ErrorRollup>> {
        let now = Utc::now();
        let day_ago = to_ms(now - Duration::hours(24));
        let hour_ago = to_ms(now - Duration::hours(1));

        let events = self
            .store
            .query_events(
                &EventFilter {
                    since_ms: Some(day_ago),
                    min_severity: Some(Severity::Error),
                    ..Default::default()
                },
                10_000,
            )
            .await?;

        let mut rollups: BTreeMap<String, ErrorRollup> = BTreeMap::new();
        for event in events {
            let entry = rollups
                .entry(event.kind.clone())
                .or_insert_with(|| ErrorRollup {
                    kind: event.kind.clone(),
                    count_1h: 0,
                    count_24h: 0,
                    last_seen_ms: 0,
                });
            entry.count_24h += 1;
            if event.ts_ms >= hour_ago {
                entry.count_1h += 1;
            }
            entry.last_seen_ms = entry.last_seen_ms.max(event.ts_ms);
        }

        // Most recent kinds first.
        let mut out: Vec<ErrorRollup> = rollups.into_values().collect();
        out.sort_by(|a, b| b.last_seen_ms.cmp(&a.last_seen_ms));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::events::{EventKind, EventLog};
    use crate::storage::NewTask;
    use serde_json::json;

    async fn observatory() -> (Storage, Observatory) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CoordinatorConfig::for_data_dir(dir.path());
        let store = Storage::open_in_memory().await.unwrap();
        let events = EventLog::new(store.clone());
        let heartbeats = Arc::new(HeartbeatManager::new(store.clone(), events, &cfg));
        (store.clone(), Observatory::new(store, heartbeats))
    }

    #[tokio::test]
    async fn snapshot_groups_tasks_by_state() {
        let (store, obs) = observatory().await;
        for i in 0..3 {
            store
                .insert_task(
                    NewTask {
                        id: Some(format!("t{i}")),
                        payload: json!({}),
                        ..Default::default()
                    },
                    Utc::now(),
                )
                .await
                .unwrap();
        }
        store.reserve_next("a1", 60_000, Utc::now()).await.unwrap();

        let snap = obs.snapshot(10).await.unwrap();
        assert_eq!(snap.tasks_by_state.get("READY"), Some(&2));
        assert_eq!(snap.tasks_by_state.get("LEASED"), Some(&1));
        assert!(!snap.recent_events.is_empty(), "CLAIMED should be recent");
    }

    #[tokio::test]
    async fn error_rollups_split_windows() {
        let (store, obs) = observatory().await;
        let now = Utc::now();
        let err = |msg: &str| EventKind::Error {
            message: msg.to_string(),
            name: "E".to_string(),
            context: json!(null),
        };

        store.append_event("t1", &err("old"), now - Duration::hours(5)).await.unwrap();
        store.append_event("t1", &err("new"), now - Duration::minutes(10)).await.unwrap();
        store.append_event("t2", &err("newer"), now - Duration::minutes(1)).await.unwrap();
        // Info events never show in rollups.
        store.append_event("t1", &EventKind::Running, now).await.unwrap();

        let rollups = obs.error_rollups().await.unwrap();
        assert_eq!(rollups.len(), 1);
        let error = &rollups[0];
        assert_eq!(error.kind, "ERROR");
        assert_eq!(error.count_24h, 3);
        assert_eq!(error.count_1h, 2);
        assert!(error.last_seen_ms >= to_ms(now - Duration::minutes(2)));
    }
}
