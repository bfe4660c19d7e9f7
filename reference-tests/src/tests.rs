//! Reference test integration tests
//!
//! These tests run the full reference suite via cargo test.

use crate::scenarios::all_tests;
use crate::{run_suite, CheckResult, ReferenceTest};

fn run_named(name: &str) {
    let test = all_tests()
        .into_iter()
        .find(|t| t.name == name)
        .unwrap_or_else(|| panic!("no reference test named {}", name));
    let result = test.run().expect("Test execution failed");
    result.print_summary();
    assert!(result.passed, "{} failed: {:?}", name, result.checks);
}

#[test]
fn test_kernel_moments() {
    run_named("Kernel Moments");
}

#[test]
fn test_interp_spread_adjointness() {
    run_named("Interpolation/Spreading Adjointness");
}

#[test]
fn test_uniform_advection() {
    run_named("Uniform Advection");
}

#[test]
fn test_anchored_nodes() {
    run_named("Anchored Nodes");
}

#[test]
fn test_force_conservation() {
    run_named("Force Conservation");
}

#[test]
fn test_redistribution() {
    run_named("Redistribution");
}

#[test]
fn test_failed_check_fails_test() {
    fn scenario() -> Result<Vec<CheckResult>, String> {
        Ok(vec![
            CheckResult::within("small", 1e-14, 1e-12),
            CheckResult::within("large", 1e-3, 1e-12),
        ])
    }
    let result = ReferenceTest {
        name: "synthetic".to_string(),
        scenario,
    }
    .run()
    .unwrap();
    assert!(!result.passed);
    assert!(result.checks[0].passed);
    assert!(!result.checks[1].passed);
}

#[test]
fn test_nan_error_fails_check() {
    assert!(!CheckResult::within("nan", f64::NAN, 1.0).passed);
}

#[test]
fn test_suite_report_serializes() {
    fn broken() -> Result<Vec<CheckResult>, String> {
        Err("no grid".to_string())
    }
    let tests = vec![ReferenceTest {
        name: "broken".to_string(),
        scenario: broken,
    }];
    let report = run_suite(&tests);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors, vec![("broken".to_string(), "no grid".to_string())]);
    let json: serde_json::Value = serde_json::to_value(&report).unwrap();
    assert_eq!(json["failed"], 1);
    assert_eq!(json["ndim"], ib_kernel::NDIM);
}
