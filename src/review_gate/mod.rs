//! CI review gate: decides pass/fail from reviewer summaries and tracks
//! review cycles per task.
//!
//! `decide` is a pure function over the gate input; `evaluate_gate` adds the
//! durable side: one evidence row per attempt and an escalation flag once a
//! task has burned through too many review cycles.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::storage::Storage;

/// Exit codes of the gate decision.
pub const CODE_PASS: i32 = 0;
pub const CODE_BLOCKING: i32 = 1;
pub const CODE_MISSING_SECONDARY: i32 = 2;
pub const CODE_MISSING_PRIMARY: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewTier {
    Light,
    Medium,
    Heavy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// One reviewer's summarised output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSummary {
    /// Count of blocking findings.
    pub blocking: u32,
    /// Count of non-blocking findings.
    #[serde(default)]
    pub non_blocking: u32,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateInput {
    pub task_id: String,
    pub tier: ReviewTier,
    pub risk: RiskLevel,
    /// Files in the change that belong to the protected tier-1 set.
    #[serde(default)]
    pub tier1_files: Vec<String>,
    /// Primary (codex) reviewer summary.
    pub codex: Option<ReviewSummary>,
    /// Secondary (gpt-5) reviewer summary.
    pub gpt5: Option<ReviewSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateDecision {
    pub pass: bool,
    pub code: i32,
    pub reason: String,
}

/// Result of a persisted gate evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct GateEvaluation {
    pub decision: GateDecision,
    /// Review cycles recorded for the task, including this one.
    pub cycles: i64,
    pub escalation_recommended: bool,
}

/// Whether this change demands the secondary (gpt-5) review.
fn requires_gpt5(input: &GateInput) -> bool {
    input.risk == RiskLevel::High
        || input.tier == ReviewTier::Heavy
        || !input.tier1_files.is_empty()
}

/// Pure gate decision. Rules evaluated in order:
/// missing codex → 3, codex blocking → 1, gpt-5 required but missing → 2,
/// gpt-5 blocking → 1, else pass.
pub fn decide(input: &GateInput) -> GateDecision {
    let Some(codex) = &input.codex else {
        return GateDecision {
            pass: false,
            code: CODE_MISSING_PRIMARY,
            reason: "codex summary missing".to_string(),
        };
    };
    if codex.blocking > 0 {
        return GateDecision {
            pass: false,
            code: CODE_BLOCKING,
            reason: "codex blocking issues".to_string(),
        };
    }
    if requires_gpt5(input) {
        let Some(gpt5) = &input.gpt5 else {
            return GateDecision {
                pass: false,
                code: CODE_MISSING_SECONDARY,
                reason: "gpt5 review required but missing".to_string(),
            };
        };
        if gpt5.blocking > 0 {
            return GateDecision {
                pass: false,
                code: CODE_BLOCKING,
                reason: "gpt5 blocking issues".to_string(),
            };
        }
    } else if let Some(gpt5) = &input.gpt5 {
        // Secondary review present even though not required still gates.
        if gpt5.blocking > 0 {
            return GateDecision {
                pass: false,
                code: CODE_BLOCKING,
                reason: "gpt5 blocking issues".to_string(),
            };
        }
    }
    GateDecision {
        pass: true,
        code: CODE_PASS,
        reason: "ok".to_string(),
    }
}

/// Decide and persist: writes an evidence row for this attempt, counts the
/// task's total review cycles, and recommends escalation once the cycle
/// count reaches `escalation_threshold`.
pub async fn evaluate_gate(
    store: &Storage,
    input: &GateInput,
    escalation_threshold: u32,
) -> Result<GateEvaluation> {
    let decision = decide(input);

    let prior_cycles = store.count_review_cycles(&input.task_id).await?;
    let attempt = prior_cycles + 1;
    store
        .insert_evidence(
            &input.task_id,
            attempt,
            "review_gate",
            if decision.pass { "pass" } else { "fail" },
            &json!({
                "code": decision.code,
                "reason": decision.reason,
                "tier": input.tier,
                "risk": input.risk,
                "tier1_files": input.tier1_files,
            }),
            chrono::Utc::now(),
        )
        .await?;

    let cycles = prior_cycles + 1;
    let escalation_recommended = cycles >= escalation_threshold as i64;
    if escalation_recommended {
        tracing::warn!(
            task_id = %input.task_id,
            cycles,
            "review cycles reached escalation threshold"
        );
    }

    Ok(GateEvaluation {
        decision,
        cycles,
        escalation_recommended,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> GateInput {
        GateInput {
            task_id: "t1".to_string(),
            tier: ReviewTier::Light,
            risk: RiskLevel::Low,
            tier1_files: vec![],
            codex: Some(ReviewSummary {
                blocking: 0,
                non_blocking: 2,
                notes: None,
            }),
            gpt5: None,
        }
    }

    #[test]
    fn clean_light_review_passes() {
        let d = decide(&input());
        assert!(d.pass);
        assert_eq!(d.code, CODE_PASS);
    }

    #[test]
    fn missing_codex_is_code_3() {
        let mut i = input();
        i.codex = None;
        let d = decide(&i);
        assert!(!d.pass);
        assert_eq!(d.code, CODE_MISSING_PRIMARY);
        assert_eq!(d.reason, "codex summary missing");
    }

    #[test]
    fn codex_blocking_is_code_1() {
        let mut i = input();
        i.codex = Some(ReviewSummary {
            blocking: 2,
            non_blocking: 0,
            notes: None,
        });
        let d = decide(&i);
        assert_eq!(d.code, CODE_BLOCKING);
        assert_eq!(d.reason, "codex blocking issues");
    }

    #[test]
    fn high_risk_requires_gpt5() {
        let mut i = input();
        i.risk = RiskLevel::High;
        let d = decide(&i);
        assert_eq!(d.code, CODE_MISSING_SECONDARY);
        assert_eq!(d.reason, "gpt5 review required but missing");
    }

    #[test]
    fn heavy_tier_requires_gpt5() {
        let mut i = input();
        i.tier = ReviewTier::Heavy;
        assert_eq!(decide(&i).code, CODE_MISSING_SECONDARY);
    }

    #[test]
    fn tier1_files_require_gpt5() {
        let mut i = input();
        i.tier1_files = vec!["core/auth.rs".to_string()];
        assert_eq!(decide(&i).code, CODE_MISSING_SECONDARY);
    }

    #[test]
    fn gpt5_blocking_is_code_1() {
        let mut i = input();
        i.risk = RiskLevel::High;
        i.gpt5 = Some(ReviewSummary {
            blocking: 1,
            non_blocking: 0,
            notes: None,
        });
        let d = decide(&i);
        assert_eq!(d.code, CODE_BLOCKING);
        assert_eq!(d.reason, "gpt5 blocking issues");
    }

    #[test]
    fn satisfied_gpt5_requirement_passes() {
        let mut i = input();
        i.risk = RiskLevel::High;
        i.gpt5 = Some(ReviewSummary {
            blocking: 0,
            non_blocking: 1,
            notes: Some("minor nits".into()),
        });
        assert!(decide(&i).pass);
    }

    #[tokio::test]
    async fn evaluate_persists_and_counts_cycles() {
        let store = crate::storage::Storage::open_in_memory().await.unwrap();
        let mut i = input();
        i.codex = Some(ReviewSummary {
            blocking: 1,
            non_blocking: 0,
            notes: None,
        });

        let first = evaluate_gate(&store, &i, 3).await.unwrap();
        assert_eq!(first.cycles, 1);
        assert!(!first.escalation_recommended);

        let second = evaluate_gate(&store, &i, 3).await.unwrap();
        assert_eq!(second.cycles, 2);
        assert!(!second.escalation_recommended);

        let third = evaluate_gate(&store, &i, 3).await.unwrap();
        assert_eq!(third.cycles, 3);
        assert!(third.escalation_recommended, "threshold reached");

        let rows = store.list_evidence("t1").await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].verifier, "review_gate");
        assert_eq!(rows[0].result, "fail");
    }
}
