//! Case registry, filtering and the sequential runner.

use std::time::Instant;

use glob::Pattern;
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use tracing::{error, info, warn};

use crate::backend::Cryptoki;
use crate::cases::{Case, CaseContext, signature_cases};
use crate::check::{CaseResult, Checker, Stop};
use crate::config::SuiteConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::report::{CaseOutcome, CaseReport, Failure, RunReport};
use crate::session::{SessionSettings, UserSession};

/// Glob filter over case ids.
///
/// `pos1:pos2-neg1:neg2` selects ids matching any positive pattern and no
/// negative one. Case ids contain `-`, so the negative list starts at the
/// first `-` that begins a pattern: `SignTest.*:-*MD5-RSA`.
#[derive(Debug, Clone, Default)]
pub struct CaseFilter {
    positive: Vec<Pattern>,
    negative: Vec<Pattern>,
}

impl CaseFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn parse(filter: &str) -> HarnessResult<Self> {
        let (positive, negative) = split_filter(filter);
        Ok(Self {
            positive: patterns(positive)?,
            negative: patterns(negative)?,
        })
    }

    pub fn matches(&self, id: &str) -> bool {
        let selected =
            self.positive.is_empty() || self.positive.iter().any(|pattern| pattern.matches(id));
        selected && !self.negative.iter().any(|pattern| pattern.matches(id))
    }
}

fn split_filter(filter: &str) -> (&str, &str) {
    let bytes = filter.as_bytes();
    let separator = (0..bytes.len())
        .find(|&i| bytes[i] == b'-' && (i == 0 || bytes[i - 1] == b':'));
    match separator {
        Some(i) => (&filter[..i], &filter[i + 1..]),
        None => (filter, ""),
    }
}

fn patterns(list: &str) -> HarnessResult<Vec<Pattern>> {
    list.split(':')
        .filter(|pattern| !pattern.is_empty())
        .map(|pattern| Pattern::new(pattern).map_err(HarnessError::config))
        .collect()
}

/// An ordered set of cases.
#[derive(Debug, Clone)]
pub struct Suite {
    cases: Vec<Case>,
}

impl Suite {
    /// The s11.11/11.12 signature cases.
    pub fn signatures() -> Self {
        Self {
            cases: signature_cases(),
        }
    }

    pub fn cases(&self) -> &[Case] {
        &self.cases
    }

    pub fn select<'s>(&'s self, filter: &'s CaseFilter) -> impl Iterator<Item = &'s Case> + 's {
        self.cases.iter().filter(|case| filter.matches(case.id()))
    }

    /// Run every selected case in order against `backend`.
    pub fn run(&self, backend: &dyn Cryptoki, config: &SuiteConfig) -> HarnessResult<RunReport> {
        let filter = match config.filter.as_deref() {
            Some(filter) => CaseFilter::parse(filter)?,
            None => CaseFilter::all(),
        };
        // Random seeds stay below 2^63 so a TOML config can hold them.
        let seed = config.seed.unwrap_or_else(|| OsRng.next_u64() >> 1);
        let settings = config.session_settings();
        let module = config.module_label();
        info!(%module, seed, "starting conformance run");

        let cases = self
            .cases
            .iter()
            .enumerate()
            .filter(|(_, case)| filter.matches(case.id()))
            .map(|(index, case)| {
                let runner = CaseRunner {
                    backend,
                    settings: &settings,
                    config,
                    seed: seed.wrapping_add(index as u64),
                };
                runner.run(case)
            })
            .collect();

        let report = RunReport {
            module,
            seed,
            cases,
        };
        info!("{}", report.summary());
        Ok(report)
    }
}

struct CaseRunner<'r> {
    backend: &'r dyn Cryptoki,
    settings: &'r SessionSettings,
    config: &'r SuiteConfig,
    seed: u64,
}

impl CaseRunner<'_> {
    fn run(&self, case: &Case) -> CaseReport {
        let id = case.id();
        info!("[ RUN      ] {id}");
        let started = Instant::now();

        let outcome = match UserSession::open(self.backend, self.settings) {
            Ok(session) => {
                let mut ctx = CaseContext {
                    session: &session,
                    rng: StdRng::seed_from_u64(self.seed),
                    check: Checker::new(),
                    modulus_bits: self.config.rsa_modulus_bits,
                    verbose: self.config.verbose,
                };
                let result = case.run(&mut ctx);
                outcome_of(result, ctx.check)
            }
            Err(err) => CaseOutcome::Failed {
                failures: vec![Failure {
                    call: "setup".to_string(),
                    expected: "logged-in user session".to_string(),
                    actual: err.to_string(),
                    fatal: true,
                }],
            },
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            CaseOutcome::Passed => info!("[       OK ] {id} ({duration_ms} ms)"),
            CaseOutcome::Skipped { reason } => warn!("[  SKIPPED ] {id}: {reason}"),
            CaseOutcome::Failed { failures } => {
                error!("[  FAILED  ] {id} ({} failures)", failures.len())
            }
        }
        CaseReport {
            id: id.to_string(),
            outcome,
            duration_ms,
        }
    }
}

/// Recorded failures win over a skip or a clean finish.
fn outcome_of(result: CaseResult, check: Checker) -> CaseOutcome {
    let failures = check.into_failures();
    if !failures.is_empty() {
        return CaseOutcome::Failed { failures };
    }
    match result {
        Ok(()) => CaseOutcome::Passed,
        Err(Stop::Skip(reason)) => CaseOutcome::Skipped { reason },
        Err(Stop::Fatal) => CaseOutcome::Failed {
            failures: vec![Failure {
                call: "case".to_string(),
                expected: "completion".to_string(),
                actual: "stopped without a recorded failure".to_string(),
                fatal: true,
            }],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_selects_everything() {
        let filter = CaseFilter::parse("").expect("filter");
        assert!(filter.matches("Signatures/SignTest.SignVerify/RSA"));
    }

    #[test]
    fn positive_and_negative_patterns() {
        let filter = CaseFilter::parse("Signatures/*:-*MD5-RSA:*Short*").expect("filter");
        assert!(filter.matches("Signatures/SignTest.SignVerify/RSA"));
        assert!(!filter.matches("Signatures/SignTest.SignVerify/MD5-RSA"));
        assert!(!filter.matches("Signatures/SignTest.SignFailVerifyShort/RSA"));
        assert!(!filter.matches("ROUserSessionTest.SignVerifyRecover"));
    }

    #[test]
    fn leading_dash_is_negative_only() {
        let filter = CaseFilter::parse("-SignaturesEC/*").expect("filter");
        assert!(filter.matches("ROUserSessionTest.SignVerifyRecover"));
        assert!(!filter.matches("SignaturesEC/SignTestEC.SignVerify/NIST-SECP256R1"));
    }

    #[test]
    fn dashes_inside_a_pattern_stay_positive() {
        let filter = CaseFilter::parse("*/NIST-SECP384R1").expect("filter");
        assert!(filter.matches("SignaturesEC/SignTestEC.SignVerify/NIST-SECP384R1"));
        assert!(!filter.matches("SignaturesEC/SignTestEC.SignVerify/NIST-SECP256R1"));
    }

    #[test]
    fn invalid_glob_is_rejected() {
        assert!(matches!(
            CaseFilter::parse("[unclosed"),
            Err(HarnessError::Config(_))
        ));
    }

    #[test]
    fn select_respects_filter() {
        let suite = Suite::signatures();
        let filter = CaseFilter::parse("ROUserSessionTest.*").expect("filter");
        let selected: Vec<&str> = suite.select(&filter).map(Case::id).collect();
        assert_eq!(selected, vec!["ROUserSessionTest.SignVerifyRecover"]);
    }

    #[test]
    fn failures_outrank_skips() {
        let mut check = Checker::new();
        check.expect_true("sanity", false);
        let outcome = outcome_of(Err(Stop::Skip("later".to_string())), check);
        assert!(outcome.is_failure());
    }
}
