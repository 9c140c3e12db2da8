//! Runs against a real PKCS#11 library named by `P11TEST_MODULE`, e.g.
//! `P11TEST_MODULE=/usr/lib/softhsm/libsofthsm2.so P11TEST_USER_PIN=1234`.
//! Without the variable these tests only exercise the loader error paths.

use std::env;
use std::path::PathBuf;

use p11test_core::session::{SessionSettings, UserSession};
use p11test_core::{Cryptoki, HarnessError, Pkcs11Module, Suite, SuiteConfig};
use serial_test::serial;

fn configured_module() -> Option<PathBuf> {
    env::var_os("P11TEST_MODULE").map(PathBuf::from)
}

fn user_pin() -> String {
    env::var("P11TEST_USER_PIN").unwrap_or_else(|_| "1234".to_string())
}

#[test]
fn missing_library_reports_load_error() {
    let err = Pkcs11Module::load("/nonexistent/libp11test-missing.so")
        .err()
        .expect("load must fail");
    assert!(matches!(err, HarnessError::Load { .. }));
}

#[test]
#[serial]
fn module_reports_info_and_slots() {
    let Some(path) = configured_module() else {
        eprintln!("P11TEST_MODULE not set; skipping");
        return;
    };
    let module = Pkcs11Module::load(&path).expect("load module");
    let settings = SessionSettings {
        slot: None,
        user_pin: user_pin(),
    };
    let session = UserSession::open(&module, &settings).expect("user session");
    let info = module.module_info().expect("C_GetInfo");
    assert!(info.cryptoki_version.0 >= 2);
    assert!(!module.slot_list(true).expect("slots").is_empty());
    assert!(
        !module
            .mechanism_list(session.slot())
            .expect("mechanisms")
            .is_empty()
    );
}

#[test]
#[serial]
fn module_passes_signature_suite() {
    let Some(path) = configured_module() else {
        eprintln!("P11TEST_MODULE not set; skipping");
        return;
    };
    let module = Pkcs11Module::load(&path).expect("load module");
    let config = SuiteConfig {
        module: Some(path),
        user_pin: user_pin(),
        seed: Some(1),
        ..SuiteConfig::default()
    };
    let report = Suite::signatures().run(&module, &config).expect("run");
    assert!(
        report.is_success(),
        "{}",
        report.to_json().unwrap_or_default()
    );
}
