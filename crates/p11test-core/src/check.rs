//! Expectation recording for conformance cases.
//!
//! `expect_*` records a failure and lets the case continue, `assert_*`
//! records it and stops the case with [`Stop::Fatal`].

use std::fmt::Debug;

use cryptoki_sys::{CK_RV, CKR_MECHANISM_INVALID};
use tracing::error;

use crate::keypair::KeyPair;
use crate::report::Failure;
use crate::rv::{CkResult, ReturnCode, rv_of};

/// Why a case ended before its last statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stop {
    Fatal,
    Skip(String),
}

pub type CaseResult = Result<(), Stop>;

#[derive(Debug, Default)]
pub struct Checker {
    failures: Vec<Failure>,
}

impl Checker {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, call: &str, expected: String, actual: String, fatal: bool) {
        let failure = Failure {
            call: call.to_string(),
            expected,
            actual,
            fatal,
        };
        error!("{failure}");
        self.failures.push(failure);
    }

    /// Non-fatal: the call returned `expected`.
    pub fn expect_rv<T>(&mut self, call: &str, expected: CK_RV, result: &CkResult<T>) -> bool {
        let actual = rv_of(result);
        if actual.raw() == expected {
            return true;
        }
        self.record(
            call,
            ReturnCode(expected).to_string(),
            actual.to_string(),
            false,
        );
        false
    }

    pub fn expect_ok<T>(&mut self, call: &str, result: &CkResult<T>) -> bool {
        self.expect_rv(call, ReturnCode::OK.raw(), result)
    }

    /// Fatal: the call returned `expected`.
    pub fn assert_rv<T>(&mut self, call: &str, expected: CK_RV, result: &CkResult<T>) -> CaseResult {
        let actual = rv_of(result);
        if actual.raw() == expected {
            return Ok(());
        }
        self.record(
            call,
            ReturnCode(expected).to_string(),
            actual.to_string(),
            true,
        );
        Err(Stop::Fatal)
    }

    /// Fatal: the call succeeded. Yields its value.
    pub fn assert_ok<T>(&mut self, call: &str, result: CkResult<T>) -> Result<T, Stop> {
        result.map_err(|rv| {
            self.record(call, ReturnCode::OK.to_string(), rv.to_string(), true);
            Stop::Fatal
        })
    }

    pub fn expect_eq<T: PartialEq + Debug>(&mut self, what: &str, expected: T, actual: T) -> bool {
        if expected == actual {
            return true;
        }
        self.record(what, format!("{expected:?}"), format!("{actual:?}"), false);
        false
    }

    pub fn expect_true(&mut self, what: &str, condition: bool) -> bool {
        if !condition {
            self.record(what, "true".to_string(), "false".to_string(), false);
        }
        condition
    }

    pub fn assert_true(&mut self, what: &str, condition: bool) -> CaseResult {
        if condition {
            return Ok(());
        }
        self.record(what, "true".to_string(), "false".to_string(), true);
        Err(Stop::Fatal)
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<Failure> {
        self.failures
    }
}

/// Skip when the module does not implement the mechanism.
pub fn skip_if_unimplemented(rv: ReturnCode, mechanism: &str) -> CaseResult {
    if rv.raw() == CKR_MECHANISM_INVALID {
        return Err(Stop::Skip(format!("{mechanism} not supported")));
    }
    Ok(())
}

/// Skip when the fixture keypair could not be generated.
pub fn skip_unless_valid(pair: &KeyPair<'_>, mechanism: &str) -> CaseResult {
    if pair.valid() {
        return Ok(());
    }
    Err(Stop::Skip(format!(
        "{mechanism} keypair generation failed with {}",
        pair.generation_rv()
    )))
}
