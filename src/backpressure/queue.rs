//! Three-tier priority queue with depth caps and medium→low demotion.
//!
//! Each tier is FIFO behind its own lock. A full medium tier demotes to low
//! when low has room; high and low never demote. Outcomes are computed under
//! the tier lock, events are emitted after it is released.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::events::{DropReason, EventKind, EventLog, QueuePriority};
use crate::retry::spread_unit;

/// Fallback per-item duration when the submitter gave no estimate.
const DEFAULT_ITEM_DURATION_MS: u64 = 5_000;
/// Wait-time estimates carry ± this much jitter.
const WAIT_JITTER_MS: f64 = 500.0;

/// A task waiting in the backpressure queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    /// Queue-entry id (UUID), distinct from the task id.
    pub id: String,
    pub task_id: String,
    pub provider: String,
    pub priority: QueuePriority,
    pub enqueued_at: DateTime<Utc>,
    pub estimated_duration_ms: Option<u64>,
}

impl QueueItem {
    pub fn new(
        task_id: impl Into<String>,
        provider: impl Into<String>,
        priority: QueuePriority,
        estimated_duration_ms: Option<u64>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            provider: provider.into(),
            priority,
            enqueued_at: now,
            estimated_duration_ms,
        }
    }
}

/// What `enqueue` did with the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued {
        priority: QueuePriority,
        depth: u32,
    },
    /// Medium demoted to low because medium was at cap.
    Deferred {
        new_priority: QueuePriority,
        depth: u32,
    },
    Rejected {
        depth: u32,
        capacity: u32,
    },
}

impl EnqueueOutcome {
    pub fn accepted(&self) -> bool {
        !matches!(self, EnqueueOutcome::Rejected { .. })
    }
}

/// Conservation counters per tier: `enqueued − dequeued − removed == depth`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TierStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub removed: u64,
    pub depth: u32,
    pub capacity: u32,
}

#[derive(Debug)]
struct Tier {
    items: std::collections::VecDeque<QueueItem>,
    capacity: usize,
    enqueued: u64,
    dequeued: u64,
    removed: u64,
}

impl Tier {
    fn new(capacity: usize) -> Self {
        Self {
            items: std::collections::VecDeque::new(),
            capacity,
            enqueued: 0,
            dequeued: 0,
            removed: 0,
        }
    }

    fn has_space(&self) -> bool {
        self.items.len() < self.capacity
    }

    fn stats(&self) -> TierStats {
        TierStats {
            enqueued: self.enqueued,
            dequeued: self.dequeued,
            removed: self.removed,
            depth: self.items.len() as u32,
            capacity: self.capacity as u32,
        }
    }
}

pub struct QueueManager {
    high: Mutex<Tier>,
    medium: Mutex<Tier>,
    low: Mutex<Tier>,
    events: EventLog,
    wait_estimate_depth: usize,
}

impl QueueManager {
    pub fn new(
        events: EventLog,
        cap_high: usize,
        cap_medium: usize,
        cap_low: usize,
        wait_estimate_depth: usize,
    ) -> Self {
        Self {
            high: Mutex::new(Tier::new(cap_high)),
            medium: Mutex::new(Tier::new(cap_medium)),
            low: Mutex::new(Tier::new(cap_low)),
            events,
            wait_estimate_depth,
        }
    }

    fn tier(&self, priority: QueuePriority) -> &Mutex<Tier> {
        match priority {
            QueuePriority::High => &self.high,
            QueuePriority::Medium => &self.medium,
            QueuePriority::Low => &self.low,
        }
    }

    /// Append the item, demoting medium→low when medium is at cap.
    /// Emits QUEUED / DEFERRED / DROPPED(+QUEUE_FULL) accordingly.
    pub async fn enqueue(&self, mut item: QueueItem) -> EnqueueOutcome {
        let priority = item.priority;
        let task_id = item.task_id.clone();
        let provider = item.provider.clone();

        // Target tier first.
        let direct = {
            let mut tier = self.tier(priority).lock().await;
            if tier.has_space() {
                tier.enqueued += 1;
                tier.items.push_back(item.clone());
                Some(tier.items.len() as u32)
            } else {
                None
            }
        };
        if let Some(depth) = direct {
            self.emit(
                &task_id,
                EventKind::Queued {
                    provider,
                    priority,
                    depth,
                },
            )
            .await;
            return EnqueueOutcome::Queued { priority, depth };
        }

        // Demotion path: only medium falls back to low.
        if priority == QueuePriority::Medium {
            let demoted = {
                let mut low = self.low.lock().await;
                if low.has_space() {
                    item.priority = QueuePriority::Low;
                    low.enqueued += 1;
                    low.items.push_back(item);
                    Some(low.items.len() as u32)
                } else {
                    None
                }
            };
            if let Some(depth) = demoted {
                self.emit(
                    &task_id,
                    EventKind::Deferred {
                        provider,
                        original_priority: QueuePriority::Medium,
                        new_priority: QueuePriority::Low,
                    },
                )
                .await;
                return EnqueueOutcome::Deferred {
                    new_priority: QueuePriority::Low,
                    depth,
                };
            }
        }

        let (depth, capacity) = {
            let tier = self.tier(priority).lock().await;
            (tier.items.len() as u32, tier.capacity as u32)
        };
        self.emit(
            &task_id,
            EventKind::QueueFull {
                provider: provider.clone(),
                priority,
                depth,
                capacity,
            },
        )
        .await;
        self.emit(
            &task_id,
            EventKind::Dropped {
                provider,
                priority,
                reason: DropReason::QueueFull,
            },
        )
        .await;
        EnqueueOutcome::Rejected { depth, capacity }
    }

    /// Pop the head, scanning high → medium → low. Emits ALLOWED with the
    /// time the item actually waited.
    pub async fn dequeue(&self, now: DateTime<Utc>) -> Option<(QueueItem, u64)> {
        for priority in QueuePriority::ALL {
            let popped = {
                let mut tier = self.tier(priority).lock().await;
                match tier.items.pop_front() {
                    Some(item) => {
                        tier.dequeued += 1;
                        Some(item)
                    }
                    None => None,
                }
            };
            if let Some(item) = popped {
                let waited_ms = (now - item.enqueued_at).num_milliseconds().max(0) as u64;
                self.emit(
                    &item.task_id.clone(),
                    EventKind::Allowed {
                        provider: item.provider.clone(),
                        priority: item.priority,
                        wait_time_ms: waited_ms,
                    },
                )
                .await;
                return Some((item, waited_ms));
            }
        }
        None
    }

    /// Estimated wait for a new item at `priority`: the summed durations of
    /// the first `wait_estimate_depth` queued items (5 s fallback each),
    /// plus deterministic ±500 ms jitter.
    ///
    /// The jitter is keyed on the head queue entry, so lockstep pollers see
    /// fanned-out estimates while a stable queue keeps a stable answer.
    pub async fn wait_time(&self, priority: QueuePriority) -> u64 {
        let tier = self.tier(priority).lock().await;
        let base: u64 = tier
            .items
            .iter()
            .take(self.wait_estimate_depth)
            .map(|i| i.estimated_duration_ms.unwrap_or(DEFAULT_ITEM_DURATION_MS))
            .sum();
        let seed = tier
            .items
            .front()
            .map(|i| i.id.as_str())
            .unwrap_or_else(|| priority.as_str());
        let depth = tier.items.len() as u32;
        let jitter = (spread_unit(seed, depth) - 0.5) * 2.0 * WAIT_JITTER_MS;
        (base as f64 + jitter).max(0.0) as u64
    }

    /// Delete a queued item by queue-entry id.
    pub async fn remove(&self, id: &str) -> bool {
        for priority in QueuePriority::ALL {
            let mut tier = self.tier(priority).lock().await;
            if let Some(pos) = tier.items.iter().position(|i| i.id == id) {
                tier.items.remove(pos);
                tier.removed += 1;
                return true;
            }
        }
        false
    }

    /// Empty all tiers. Cleared items count as removed for conservation.
    pub async fn clear(&self) {
        for priority in QueuePriority::ALL {
            let mut tier = self.tier(priority).lock().await;
            tier.removed += tier.items.len() as u64;
            tier.items.clear();
        }
    }

    /// Change a tier's cap at runtime. Existing overflow items stay queued.
    pub async fn set_capacity(&self, priority: QueuePriority, capacity: usize) {
        {
            let mut tier = self.tier(priority).lock().await;
            tier.capacity = capacity;
        }
        self.events
            .emit_system(EventKind::LimitConfigChanged {
                scope: format!("queue.{priority}"),
                config: serde_json::json!({ "capacity": capacity }),
            })
            .await
            .ok();
    }

    pub async fn depth(&self, priority: QueuePriority) -> usize {
        self.tier(priority).lock().await.items.len()
    }

    /// Depth over capacity for one tier, 0..1.
    pub async fn utilization(&self, priority: QueuePriority) -> f64 {
        let tier = self.tier(priority).lock().await;
        if tier.capacity == 0 {
            return 1.0;
        }
        tier.items.len() as f64 / tier.capacity as f64
    }

    /// Combined depth over combined capacity, 0..1.
    pub async fn total_utilization(&self) -> f64 {
        let mut depth = 0usize;
        let mut cap = 0usize;
        for priority in QueuePriority::ALL {
            let tier = self.tier(priority).lock().await;
            depth += tier.items.len();
            cap += tier.capacity;
        }
        if cap == 0 {
            1.0
        } else {
            depth as f64 / cap as f64
        }
    }

    pub async fn stats(&self, priority: QueuePriority) -> TierStats {
        self.tier(priority).lock().await.stats()
    }

    async fn emit(&self, task_id: &str, kind: EventKind) {
        if let Err(e) = self.events.emit(task_id, kind).await {
            tracing::warn!(err = %e, "queue event emission failed");
        }
    }
}
