//! Tag-driven verification plug-ins, run at task completion.
//!
//! Verifiers are pure over their context: a failing verifier is captured as
//! a FAIL outcome with details, never an error the caller has to handle.
//! Per-verifier outcomes are persisted as evidence rows.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::storage::{Storage, TaskRow};

/// Context handed to every verifier.
#[derive(Debug, Clone)]
pub struct VerifyCtx {
    pub task: TaskRow,
    pub attempt: i64,
    /// Outcome evidence reported by the executing agent.
    pub outcome: Value,
}

/// What one verifier concluded.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub pass: bool,
    pub details: Value,
}

impl Verdict {
    pub fn pass(details: Value) -> Self {
        Self {
            pass: true,
            details,
        }
    }

    pub fn fail(details: Value) -> Self {
        Self {
            pass: false,
            details,
        }
    }
}

#[async_trait]
pub trait Verifier: Send + Sync {
    /// The tag this verifier answers to.
    fn tag(&self) -> &str;
    /// Pure check over the context. An `Err` is captured as FAIL.
    async fn verify(&self, ctx: &VerifyCtx) -> Result<Verdict>;
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifierOutcome {
    pub tag: String,
    pub result: &'static str, // "PASS" | "FAIL"
    pub details: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub outcomes: Vec<VerifierOutcome>,
    /// True iff every matched verifier passed.
    pub pass: bool,
}

#[derive(Default)]
pub struct VerifierRegistry {
    verifiers: HashMap<String, Arc<dyn Verifier>>,
}

impl VerifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, verifier: Arc<dyn Verifier>) {
        self.verifiers
            .insert(verifier.tag().to_string(), verifier);
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.verifiers.contains_key(tag)
    }

    /// Run each matching verifier sequentially, capturing failures.
    /// Tags with no registered verifier are skipped.
    pub async fn run_verifications(&self, tags: &[String], ctx: &VerifyCtx) -> VerificationReport {
        let mut outcomes = Vec::new();
        for tag in tags {
            let Some(verifier) = self.verifiers.get(tag) else {
                continue;
            };
            let outcome = match verifier.verify(ctx).await {
                Ok(verdict) => VerifierOutcome {
                    tag: tag.clone(),
                    result: if verdict.pass { "PASS" } else { "FAIL" },
                    details: verdict.details,
                },
                Err(e) => VerifierOutcome {
                    tag: tag.clone(),
                    result: "FAIL",
                    details: json!({ "error": crate::redact::redact(&e.to_string()) }),
                },
            };
            tracing::debug!(task_id = %ctx.task.id, tag, result = outcome.result, "verifier ran");
            outcomes.push(outcome);
        }
        let pass = outcomes.iter().all(|o| o.result == "PASS");
        VerificationReport { outcomes, pass }
    }

    /// Persist one evidence row per outcome.
    pub async fn persist_report(
        &self,
        store: &Storage,
        ctx: &VerifyCtx,
        report: &VerificationReport,
    ) -> Result<()> {
        for outcome in &report.outcomes {
            store
                .insert_evidence(
                    &ctx.task.id,
                    ctx.attempt,
                    &outcome.tag,
                    if outcome.result == "PASS" {
                        "pass"
                    } else {
                        "fail"
                    },
                    &outcome.details,
                    Utc::now(),
                )
                .await?;
        }
        Ok(())
    }
}
