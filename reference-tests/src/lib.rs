//! Reference validation framework for the immersed-boundary coupling layer
//!
//! Each reference test builds a small coupled problem whose answer is known
//! exactly (kernel moments, adjointness of interpolation and spreading,
//! advection by a uniform flow, force conservation, node ownership after
//! redistribution) and checks the library against it.  Results serialize to
//! JSON so runs can be archived and compared.

#[cfg(test)]
mod tests;

pub mod scenarios;

use serde::Serialize;
use std::time::Instant;

/// Result of an individual validation check
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    /// Check name
    pub name: String,
    /// Whether check passed
    pub passed: bool,
    /// Largest observed error, when the check measures one
    pub max_error: Option<f64>,
    /// Human readable detail
    pub message: Option<String>,
}

impl CheckResult {
    /// A check on a measured error against a tolerance.
    pub fn within(name: &str, max_error: f64, tolerance: f64) -> Self {
        let passed = max_error.is_finite() && max_error <= tolerance;
        Self {
            name: name.to_string(),
            passed,
            max_error: Some(max_error),
            message: Some(format!("max error {:.3e} (tolerance {:.1e})", max_error, tolerance)),
        }
    }

    /// A pass/fail check with an explanation.
    pub fn expect(name: &str, passed: bool, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed,
            max_error: None,
            message: Some(message.into()),
        }
    }
}

/// Result of running a reference test
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    /// Test name
    pub name: String,
    /// Whether every check passed
    pub passed: bool,
    /// Individual check results
    pub checks: Vec<CheckResult>,
    /// Wall-clock time spent in the scenario
    pub elapsed_ms: f64,
}

/// Summary of a full suite run
#[derive(Debug, Clone, Serialize)]
pub struct SuiteReport {
    /// Spatial dimension the suite was built for
    pub ndim: usize,
    /// Number of passed tests
    pub passed: usize,
    /// Number of failed tests, including tests that errored
    pub failed: usize,
    /// Per-test results
    pub results: Vec<TestResult>,
    /// Tests that could not run, with their error
    pub errors: Vec<(String, String)>,
}

/// A reference test case
pub struct ReferenceTest {
    /// Test name
    pub name: String,
    /// Scenario producing the checks
    pub scenario: fn() -> Result<Vec<CheckResult>, String>,
}

impl ReferenceTest {
    /// Run the reference test and return results
    pub fn run(&self) -> Result<TestResult, String> {
        tracing::info!("Running reference test: {}", self.name);
        let start = Instant::now();
        let checks = (self.scenario)()?;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1e3;
        let passed = !checks.is_empty() && checks.iter().all(|c| c.passed);
        for check in checks.iter().filter(|c| !c.passed) {
            tracing::warn!("{}: check `{}` failed: {:?}", self.name, check.name, check.message);
        }
        Ok(TestResult {
            name: self.name.clone(),
            passed,
            checks,
            elapsed_ms,
        })
    }
}

/// Run every test and collect the outcome.
pub fn run_suite(tests: &[ReferenceTest]) -> SuiteReport {
    let mut report = SuiteReport {
        ndim: ib_kernel::NDIM,
        passed: 0,
        failed: 0,
        results: Vec::new(),
        errors: Vec::new(),
    };
    for test in tests {
        match test.run() {
            Ok(result) => {
                if result.passed {
                    report.passed += 1;
                } else {
                    report.failed += 1;
                }
                report.results.push(result);
            }
            Err(e) => {
                tracing::error!("ERROR running test {}: {}", test.name, e);
                report.failed += 1;
                report.errors.push((test.name.clone(), e));
            }
        }
    }
    report
}

impl TestResult {
    /// Print a summary of the test result
    pub fn print_summary(&self) {
        println!("\n{}", "=".repeat(80));
        println!("Test: {}", self.name);
        println!("{}", "=".repeat(80));
        println!("Status: {}", if self.passed { "PASSED" } else { "FAILED" });
        println!("Elapsed: {:.1} ms", self.elapsed_ms);
        println!("\nValidation Checks:");
        for check in &self.checks {
            let status = if check.passed { "PASS" } else { "FAIL" };
            print!("  [{}] {}", status, check.name);
            if let Some(ref msg) = check.message {
                print!(" - {}", msg);
            }
            println!();
        }
        println!("{}", "=".repeat(80));
    }
}
