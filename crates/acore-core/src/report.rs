//! Verdict document produced by the evaluator.
//!
//! Exactly one verdict is written per job, to the results volume as
//! `success.json` or `error.json`. The aggregate is fail-closed: a
//! missing result, an empty invariant set, or any failed invariant all
//! score zero.

use serde::{Deserialize, Serialize};

/// Aggregate pass/fail status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictStatus {
    /// Every invariant passed and at least one was evaluated.
    Pass,
    /// Anything else.
    Fail,
}

/// Outcome of one invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantOutcome {
    /// Invariant id from the task spec.
    pub id: String,
    /// Invariant kind tag.
    pub kind: String,
    /// Whether the invariant held.
    pub passed: bool,
    /// Failure reason; absent on pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The complete validation verdict for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    /// Aggregate status.
    pub status: VerdictStatus,
    /// `passed / total` in `[0, 1]`; `0` when `total == 0`.
    pub score: f64,
    /// Number of invariants that passed.
    pub passed_invariants: u32,
    /// Number of invariants evaluated.
    pub total_invariants: u32,
    /// Per-invariant outcomes, in declared order.
    #[serde(default)]
    pub detail: Vec<InvariantOutcome>,
    /// Top-level failure message, when the job failed outside the
    /// evaluator (setup error, timeout, missing result).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    /// Reference to the job log, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_ref: Option<String>,
}

impl Verdict {
    /// Aggregates per-invariant outcomes into a verdict.
    ///
    /// Fail-closed: zero invariants yield `score = 0`, `status = fail`.
    #[must_use]
    pub fn from_outcomes(detail: Vec<InvariantOutcome>) -> Self {
        let total = u32::try_from(detail.len()).unwrap_or(u32::MAX);
        let passed = u32::try_from(detail.iter().filter(|o| o.passed).count()).unwrap_or(0);

        if total == 0 {
            return Self {
                status: VerdictStatus::Fail,
                score: 0.0,
                passed_invariants: 0,
                total_invariants: 0,
                detail,
                msg: Some("no invariants provided".to_string()),
                logs_ref: None,
            };
        }

        let score = f64::from(passed) / f64::from(total);
        Self {
            status: if passed == total {
                VerdictStatus::Pass
            } else {
                VerdictStatus::Fail
            },
            score,
            passed_invariants: passed,
            total_invariants: total,
            detail,
            msg: None,
            logs_ref: None,
        }
    }

    /// A fail-closed verdict for failures outside the evaluator.
    #[must_use]
    pub fn fail_closed(msg: impl Into<String>) -> Self {
        Self {
            status: VerdictStatus::Fail,
            score: 0.0,
            passed_invariants: 0,
            total_invariants: 0,
            detail: Vec::new(),
            msg: Some(msg.into()),
            logs_ref: None,
        }
    }

    /// Attaches a log reference.
    #[must_use]
    pub fn with_logs_ref(mut self, logs_ref: impl Into<String>) -> Self {
        self.logs_ref = Some(logs_ref.into());
        self
    }

    /// True iff the verdict passed.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.status == VerdictStatus::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(id: &str, passed: bool) -> InvariantOutcome {
        InvariantOutcome {
            id: id.to_string(),
            kind: "resource_exists".to_string(),
            passed,
            reason: (!passed).then(|| "mismatch".to_string()),
        }
    }

    #[test]
    fn all_pass_scores_one() {
        let v = Verdict::from_outcomes(vec![outcome("a", true), outcome("b", true)]);
        assert!(v.passed());
        assert!((v.score - 1.0).abs() < f64::EPSILON);
        assert_eq!(v.passed_invariants, 2);
        assert_eq!(v.total_invariants, 2);
    }

    #[test]
    fn partial_pass_fails_with_fractional_score() {
        let v = Verdict::from_outcomes(vec![outcome("a", true), outcome("b", false)]);
        assert_eq!(v.status, VerdictStatus::Fail);
        assert!((v.score - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_invariants_fail_closed() {
        let v = Verdict::from_outcomes(Vec::new());
        assert_eq!(v.status, VerdictStatus::Fail);
        assert_eq!(v.score, 0.0);
        assert_eq!(v.msg.as_deref(), Some("no invariants provided"));
    }

    #[test]
    fn serializes_status_lowercase() {
        let v = Verdict::fail_closed("boom");
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["status"], "fail");
        assert_eq!(json["score"], 0.0);
    }
}
