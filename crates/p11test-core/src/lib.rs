//! PKCS#11 conformance checks for signing and verification.
//!
//! The suite drives a module through the [`Cryptoki`] trait: either a shared
//! library loaded with [`Pkcs11Module`] or the in-process [`SimulatedToken`].
//! Cases cover C_Sign*, C_Verify* and their recover variants (s11.11 and
//! s11.12), and every PKCS#11 return code they see is checked.

pub mod attribute;
pub mod backend;
pub mod cases;
pub mod check;
pub mod config;
pub mod curves;
pub mod data;
pub mod error;
pub mod keypair;
pub mod mechanism;
pub mod module;
pub mod report;
pub mod rv;
pub mod session;
pub mod simulated;
pub mod suite;

pub use backend::{Cryptoki, ModuleInfo};
pub use config::SuiteConfig;
pub use error::{HarnessError, HarnessResult};
pub use module::Pkcs11Module;
pub use report::{CaseOutcome, CaseReport, Failure, RunReport, Summary};
pub use rv::{CkResult, ReturnCode};
pub use simulated::{Fault, SimulatedToken};
pub use suite::{CaseFilter, Suite};
