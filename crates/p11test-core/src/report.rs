//! Run outcomes and their serialization.

use std::fmt;
use std::path::Path;

use serde::Serialize;

use crate::error::{HarnessError, HarnessResult};

/// A single unmet expectation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub call: String,
    pub expected: String,
    pub actual: String,
    /// The case stopped at this failure.
    pub fatal: bool,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}, got {}",
            self.call, self.expected, self.actual
        )?;
        if self.fatal {
            write!(f, " (fatal)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CaseOutcome {
    Passed,
    Skipped { reason: String },
    Failed { failures: Vec<Failure> },
}

impl CaseOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CaseOutcome::Passed => "OK",
            CaseOutcome::Skipped { .. } => "SKIPPED",
            CaseOutcome::Failed { .. } => "FAILED",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, CaseOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseReport {
    pub id: String,
    #[serde(flatten)]
    pub outcome: CaseOutcome,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cases: {} passed, {} skipped, {} failed",
            self.total, self.passed, self.skipped, self.failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Module path, or `simulated` for the in-process token.
    pub module: String,
    pub seed: u64,
    pub cases: Vec<CaseReport>,
}

impl RunReport {
    pub fn summary(&self) -> Summary {
        self.cases
            .iter()
            .fold(Summary::default(), |mut summary, case| {
                summary.total += 1;
                match case.outcome {
                    CaseOutcome::Passed => summary.passed += 1,
                    CaseOutcome::Skipped { .. } => summary.skipped += 1,
                    CaseOutcome::Failed { .. } => summary.failed += 1,
                }
                summary
            })
    }

    pub fn is_success(&self) -> bool {
        !self.cases.iter().any(|case| case.outcome.is_failure())
    }

    pub fn case(&self, id: &str) -> Option<&CaseReport> {
        self.cases.iter().find(|case| case.id == id)
    }

    pub fn to_json(&self) -> HarnessResult<String> {
        #[derive(Serialize)]
        struct Document<'a> {
            #[serde(flatten)]
            report: &'a RunReport,
            summary: Summary,
        }
        serde_json::to_string_pretty(&Document {
            report: self,
            summary: self.summary(),
        })
        .map_err(HarnessError::serialization)
    }

    pub fn write_json(&self, path: &Path) -> HarnessResult<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> RunReport {
        RunReport {
            module: "simulated".to_string(),
            seed: 9,
            cases: vec![
                CaseReport {
                    id: "Signatures/SignTest.SignVerify/RSA".to_string(),
                    outcome: CaseOutcome::Passed,
                    duration_ms: 1,
                },
                CaseReport {
                    id: "ROUserSessionTest.SignVerifyRecover".to_string(),
                    outcome: CaseOutcome::Skipped {
                        reason: "SignRecover not supported".to_string(),
                    },
                    duration_ms: 0,
                },
            ],
        }
    }

    #[test]
    fn summary_counts_outcomes() {
        let mut report = report();
        assert!(report.is_success());
        report.cases.push(CaseReport {
            id: "x".to_string(),
            outcome: CaseOutcome::Failed {
                failures: vec![Failure {
                    call: "C_Verify".to_string(),
                    expected: "CKR_SIGNATURE_INVALID".to_string(),
                    actual: "CKR_OK".to_string(),
                    fatal: false,
                }],
            },
            duration_ms: 0,
        });
        let summary = report.summary();
        assert_eq!((summary.total, summary.passed, summary.skipped, summary.failed), (3, 1, 1, 1));
        assert!(!report.is_success());
        assert_eq!(summary.to_string(), "3 cases: 1 passed, 1 skipped, 1 failed");
    }

    #[test]
    fn json_carries_outcome_tags_and_summary() {
        let json = report().to_json().expect("json");
        let value: serde_json::Value = serde_json::from_str(&json).expect("parse");
        assert_eq!(value["seed"], 9);
        assert_eq!(value["cases"][0]["outcome"], "passed");
        assert_eq!(value["cases"][1]["reason"], "SignRecover not supported");
        assert_eq!(value["summary"]["skipped"], 1);
    }
}
