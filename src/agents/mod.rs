//! Pull-based agent protocol surface.
//!
//! Agents call `claim_next_task`, `heartbeat`, and `report_outcome`; the
//! coordinator never opens a connection to an agent. Claiming delegates to
//! [`Scheduler::reserve`] — the single place a CLAIMED event is written —
//! and completion drives verification, the review gate, and the terminal
//! transitions.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::config::CoordinatorConfig;
use crate::review_gate::{self, GateEvaluation, GateInput};
use crate::scheduler::{Claim, ErrorCtx, Scheduler, TransitionError};
use crate::storage::{Storage, TaskState};
use crate::verifiers::{VerificationReport, VerifierRegistry, VerifyCtx};
use crate::heartbeat::HeartbeatManager;

/// What an agent reports when it finishes (or gives up on) a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        /// Arbitrary evidence blob handed to the verifiers.
        #[serde(default)]
        evidence: Value,
        /// Reviewer summaries, when the task went through code review.
        #[serde(default)]
        review: Option<GateInput>,
    },
    Error {
        message: String,
        #[serde(default = "default_error_name")]
        name: String,
        #[serde(default)]
        retryable: Option<bool>,
        #[serde(default)]
        context: Value,
    },
}

fn default_error_name() -> String {
    "AgentError".to_string()
}

/// Result of `report_outcome`, echoed back to the agent.
#[derive(Debug, Serialize)]
pub struct OutcomeReport {
    pub task_id: String,
    pub final_state: TaskState,
    pub verification: Option<VerificationReport>,
    pub gate: Option<GateEvaluation>,
}

pub struct AgentCoordinator {
    store: Storage,
    scheduler: Scheduler,
    heartbeats: Arc<HeartbeatManager>,
    verifiers: Arc<VerifierRegistry>,
    lease_ttl: chrono::Duration,
    op_timeout: Duration,
    escalation_threshold: u32,
}

impl AgentCoordinator {
    pub fn new(
        store: Storage,
        scheduler: Scheduler,
        heartbeats: Arc<HeartbeatManager>,
        verifiers: Arc<VerifierRegistry>,
        cfg: &CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            scheduler,
            heartbeats,
            verifiers,
            lease_ttl: chrono::Duration::milliseconds(cfg.lease_ttl_ms),
            op_timeout: Duration::from_millis(cfg.default_op_timeout_ms),
            escalation_threshold: cfg.escalation_threshold,
        }
    }

    fn op_token(&self, cancel: &CancelToken) -> CancelToken {
        cancel.with_deadline(self.op_timeout)
    }

    /// Claim the best READY task and start the agent's heartbeat loops.
    ///
    /// Delegates to the scheduler for the claim — exactly one CLAIMED event
    /// per lease, no matter how many layers sit above.
    pub async fn claim_next_task(
        &self,
        agent_id: &str,
        cancel: &CancelToken,
    ) -> Result<Option<Claim>> {
        let token = self.op_token(cancel);
        let Some(claim) = self.scheduler.reserve(agent_id, self.lease_ttl, &token).await? else {
            return Ok(None);
        };
        self.heartbeats.start(&claim).await;
        Ok(Some(claim))
    }

    /// Agent-driven lease renewal. Returns false when the lease is gone
    /// (expired and reclaimed) — the agent should abandon the task.
    pub async fn heartbeat(&self, agent_id: &str, task_id: &str) -> Result<bool> {
        self.store
            .renew_lease(task_id, agent_id, self.lease_ttl.num_milliseconds(), Utc::now())
            .await
    }

    /// Mark the claimed task as actually executing (LEASED → RUNNING).
    pub async fn begin_task(
        &self,
        task_id: &str,
        cancel: &CancelToken,
    ) -> Result<(), TransitionError> {
        self.scheduler.start(task_id, &self.op_token(cancel)).await
    }

    /// Completion protocol: verify, gate, commit — or reopen on failure.
    pub async fn report_outcome(
        &self,
        task_id: &str,
        outcome: Outcome,
        cancel: &CancelToken,
    ) -> Result<OutcomeReport> {
        let token = self.op_token(cancel);
        match outcome {
            Outcome::Error {
                message,
                name,
                retryable,
                context,
            } => {
                let ctx = ErrorCtx {
                    message,
                    name,
                    context,
                    retryable,
                };
                let state = self.scheduler.error(task_id, ctx, &token).await?;
                Ok(OutcomeReport {
                    task_id: task_id.to_string(),
                    final_state: state,
                    verification: None,
                    gate: None,
                })
            }
            Outcome::Success { evidence, review } => {
                self.success_path(task_id, evidence, review, &token).await
            }
        }
    }

    async fn success_path(
        &self,
        task_id: &str,
        evidence: Value,
        review: Option<GateInput>,
        token: &CancelToken,
    ) -> Result<OutcomeReport> {
        self.scheduler.verifying(task_id, token).await?;

        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task {task_id} vanished during verification"))?;
        let attempt = task.attempts;

        // Tags come from the task payload; unknown tags are skipped by the
        // registry.
        let tags: Vec<String> = task
            .payload_json
            .parse::<Value>()
            .ok()
            .and_then(|p| {
                p.get("tags").and_then(|t| {
                    t.as_array().map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                })
            })
            .unwrap_or_default();

        let ctx = VerifyCtx {
            task,
            attempt,
            outcome: evidence,
        };
        let report = self.verifiers.run_verifications(&tags, &ctx).await;
        self.verifiers.persist_report(&self.store, &ctx, &report).await?;

        let gate = match review {
            Some(input) => Some(
                review_gate::evaluate_gate(&self.store, &input, self.escalation_threshold)
                    .await?,
            ),
            None => None,
        };
        let gate_pass = gate.as_ref().map(|g| g.decision.pass).unwrap_or(true);

        if report.pass && gate_pass {
            self.scheduler.committed(task_id, token).await?;
            self.scheduler.finalize(task_id, token).await?;
            return Ok(OutcomeReport {
                task_id: task_id.to_string(),
                final_state: TaskState::Done,
                verification: Some(report),
                gate,
            });
        }

        // Verification or gate failure reopens the task per retry policy.
        let reason = if !report.pass {
            "verification failed"
        } else {
            "review gate failed"
        };
        let failed_tags: Vec<&str> = report
            .outcomes
            .iter()
            .filter(|o| o.result == "FAIL")
            .map(|o| o.tag.as_str())
            .collect();
        let state = self
            .scheduler
            .error(
                task_id,
                ErrorCtx::new(reason, "VerificationFailure").with_context(serde_json::json!({
                    "failed_tags": failed_tags,
                    "gate_code": gate.as_ref().map(|g| g.decision.code),
                })),
                token,
            )
            .await?;

        Ok(OutcomeReport {
            task_id: task_id.to_string(),
            final_state: state,
            verification: Some(report),
            gate,
        })
    }

    /// Voluntary release without an outcome (agent shutting down cleanly).
    pub async fn release_task(&self, agent_id: &str, task_id: &str) -> Result<bool> {
        self.scheduler.release(task_id, agent_id).await
    }
}
