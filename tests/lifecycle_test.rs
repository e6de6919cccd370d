//! Integration tests for the task/lease lifecycle engine.

use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;

use fleetd::agents::Outcome;
use fleetd::cancel::CancelToken;
use fleetd::config::CoordinatorConfig;
use fleetd::quota::StaticOracle;
use fleetd::storage::{EventFilter, NewTask, Storage, TaskState};
use fleetd::verifiers::VerifierRegistry;
use fleetd::CoordinatorContext;

async fn context() -> CoordinatorContext {
    let dir = tempfile::tempdir().unwrap();
    let cfg = CoordinatorConfig::for_data_dir(dir.path());
    let storage = Storage::open_in_memory().await.unwrap();
    CoordinatorContext::init_with_storage(
        cfg,
        storage,
        Arc::new(StaticOracle::new()),
        VerifierRegistry::new(),
    )
    .unwrap()
}

async fn seed_task(store: &Storage, id: &str) {
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

async fn claimed_count(store: &Storage, task_id: &str) -> i64 {
    store
        .query_events(
            &EventFilter {
                task_id: Some(task_id.to_string()),
                kind: Some("CLAIMED".into()),
                ..Default::default()
            },
            1_000,
        )
        .await
        .unwrap()
        .len() as i64
}

// ── Exactly-once CLAIMED (spec scenario 5) ───────────────────────────────────

#[tokio::test]
async fn test_claim_next_task_emits_claimed_exactly_once() {
    let ctx = context().await;
    seed_task(&ctx.storage, "t1").await;

    let claim = ctx
        .agents
        .claim_next_task("agent-1", &CancelToken::never())
        .await
        .unwrap()
        .expect("task should be claimable");
    assert_eq!(claim.task.id, "t1");

    // One round trip through the caller-level wrapper: exactly one CLAIMED.
    assert_eq!(claimed_count(&ctx.storage, "t1").await, 1);
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_claimed_count_always_equals_attempts() {
    let ctx = context().await;
    seed_task(&ctx.storage, "t1").await;
    let cancel = CancelToken::never();

    // Lease → retryable error → lease → expiry reclaim → lease.
    ctx.scheduler
        .reserve("a1", Duration::seconds(60), &cancel)
        .await
        .unwrap()
        .unwrap();
    ctx.scheduler
        .error(
            "t1",
            fleetd::scheduler::ErrorCtx::new("transient", "Transient"),
            &cancel,
        )
        .await
        .unwrap();

    ctx.scheduler
        .reserve("a2", Duration::milliseconds(1), &cancel)
        .await
        .unwrap()
        .unwrap();
    ctx.scheduler
        .reclaim_expired(Utc::now() + Duration::seconds(5))
        .await
        .unwrap();

    ctx.scheduler
        .reserve("a3", Duration::seconds(60), &cancel)
        .await
        .unwrap()
        .unwrap();

    let task = ctx.storage.get_task("t1").await.unwrap().unwrap();
    assert_eq!(task.attempts, 3);
    assert_eq!(claimed_count(&ctx.storage, "t1").await, task.attempts);
}

// ── Lease expiry recovery (spec scenario 6) ──────────────────────────────────

#[tokio::test]
async fn test_lease_expiry_recovery() {
    let ctx = context().await;
    seed_task(&ctx.storage, "t1").await;
    let cancel = CancelToken::never();

    // Lease that is already expired relative to the reclaim clock.
    ctx.scheduler
        .reserve("a1", Duration::milliseconds(1), &cancel)
        .await
        .unwrap()
        .unwrap();

    let reclaimed = ctx
        .scheduler
        .reclaim_expired(Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(reclaimed, 1);

    let expired_events = ctx
        .storage
        .count_events_by_kind("LEASE_EXPIRED", 0)
        .await
        .unwrap();
    assert_eq!(expired_events, 1);
    assert_eq!(
        ctx.storage.get_task("t1").await.unwrap().unwrap().state,
        "READY"
    );

    // A subsequent reserve picks it up with attempts incremented.
    let claim = ctx
        .scheduler
        .reserve("a2", Duration::seconds(60), &cancel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claim.task.id, "t1");
    assert_eq!(claim.task.attempts, 2);
    assert_eq!(claim.lease.attempt, 2);
}

// ── State-transition closure ─────────────────────────────────────────────────

#[tokio::test]
async fn test_event_walk_matches_state_machine() {
    let ctx = context().await;
    seed_task(&ctx.storage, "t1").await;
    let cancel = CancelToken::never();

    ctx.agents
        .claim_next_task("a1", &cancel)
        .await
        .unwrap()
        .unwrap();
    ctx.agents.begin_task("t1", &cancel).await.unwrap();
    let report = ctx
        .agents
        .report_outcome(
            "t1",
            Outcome::Success {
                evidence: json!({}),
                review: None,
            },
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(report.final_state, TaskState::Done);

    let state_kinds: Vec<String> = ctx
        .events
        .get_task_events("t1")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .filter(|k| matches!(k.as_str(), "CLAIMED" | "RUNNING" | "VERIFYING" | "COMMITTED" | "ERROR" | "LEASE_EXPIRED"))
        .collect();
    assert_eq!(
        state_kinds,
        vec!["CLAIMED", "RUNNING", "VERIFYING", "COMMITTED"],
        "event projection must be a valid walk of the state machine"
    );
    ctx.shutdown().await;
}

// ── At-most-one lease ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_no_task_ever_has_two_leases() {
    let ctx = context().await;
    for i in 0..5 {
        seed_task(&ctx.storage, &format!("t{i}")).await;
    }
    let cancel = CancelToken::never();

    // Several agents racing to claim.
    let mut claims = Vec::new();
    for agent in ["a1", "a2", "a3", "a4", "a5", "a6", "a7"] {
        if let Some(claim) = ctx
            .scheduler
            .reserve(agent, Duration::seconds(60), &cancel)
            .await
            .unwrap()
        {
            claims.push(claim);
        }
    }
    assert_eq!(claims.len(), 5, "five tasks, five claims");

    for i in 0..5 {
        assert_eq!(
            ctx.storage.count_leases(&format!("t{i}")).await.unwrap(),
            1
        );
    }

    // Distinct tasks per claim.
    let mut ids: Vec<String> = claims.into_iter().map(|c| c.task.id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 5);
}

// ── Ordering ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_task_events_are_ordered() {
    let ctx = context().await;
    seed_task(&ctx.storage, "t1").await;
    let cancel = CancelToken::never();

    ctx.scheduler
        .reserve("a1", Duration::seconds(60), &cancel)
        .await
        .unwrap()
        .unwrap();
    ctx.scheduler.start("t1", &cancel).await.unwrap();
    ctx.scheduler.verifying("t1", &cancel).await.unwrap();
    ctx.scheduler.committed("t1", &cancel).await.unwrap();

    let events = ctx.events.get_task_events("t1").await.unwrap();
    assert!(events.len() >= 4);
    for pair in events.windows(2) {
        assert!(pair[0].id < pair[1].id, "insertion order");
        assert!(pair[0].ts_ms <= pair[1].ts_ms, "non-decreasing timestamps");
    }
}

// ── Priority + FIFO ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reserve_order_priority_then_fifo_then_id() {
    let ctx = context().await;
    let now = Utc::now();
    let cancel = CancelToken::never();

    for (id, priority, offset) in [
        ("b-old", 5, 0),
        ("a-tie", 5, 0),
        ("late-high", 9, 10),
        ("early-low", 1, 0),
    ] {
        ctx.storage
            .insert_task(
                NewTask {
                    id: Some(id.to_string()),
                    priority,
                    payload: json!({}),
                    ..Default::default()
                },
                now + Duration::seconds(offset),
            )
            .await
            .unwrap();
    }

    let mut order = Vec::new();
    while let Some(claim) = ctx
        .scheduler
        .reserve("a1", Duration::seconds(60), &cancel)
        .await
        .unwrap()
    {
        order.push(claim.task.id);
    }
    // Highest priority first; ties by created_at then lexicographic id.
    assert_eq!(order, vec!["late-high", "a-tie", "b-old", "early-low"]);
}

// ── Dependencies ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_dependent_task_waits_for_done() {
    let ctx = context().await;
    let cancel = CancelToken::never();
    seed_task(&ctx.storage, "base").await;
    ctx.storage
        .insert_task(
            NewTask {
                id: Some("child".into()),
                priority: 100,
                depends_on: vec!["base".into()],
                payload: json!({}),
                ..Default::default()
            },
            Utc::now(),
        )
        .await
        .unwrap();

    // Child outranks base but its dependency is not DONE.
    let first = ctx
        .scheduler
        .reserve("a1", Duration::seconds(60), &cancel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.task.id, "base");

    ctx.scheduler.start("base", &cancel).await.unwrap();
    ctx.scheduler.verifying("base", &cancel).await.unwrap();
    ctx.scheduler.committed("base", &cancel).await.unwrap();
    ctx.scheduler.finalize("base", &cancel).await.unwrap();

    let second = ctx
        .scheduler
        .reserve("a1", Duration::seconds(60), &cancel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.task.id, "child");
}
