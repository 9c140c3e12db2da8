use std::path::PathBuf;

use thiserror::Error;

use crate::rv::ReturnCode;

pub type HarnessResult<T> = Result<T, HarnessError>;

/// Errors that stop the harness itself, as opposed to conformance failures
/// which are recorded per case.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to load PKCS#11 module {path}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error("module does not export {0}")]
    MissingSymbol(&'static str),
    #[error("{call} returned {rv}")]
    Pkcs11 { call: &'static str, rv: ReturnCode },
    #[error("no slot with a token present")]
    NoSlot,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl HarnessError {
    pub fn pkcs11(call: &'static str, rv: ReturnCode) -> Self {
        Self::Pkcs11 { call, rv }
    }
    pub fn config<E: std::fmt::Display>(err: E) -> Self {
        Self::Config(err.to_string())
    }
    pub fn serialization<E: std::fmt::Display>(err: E) -> Self {
        Self::Serialization(err.to_string())
    }
}
