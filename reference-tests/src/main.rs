//! Reference test binary entry point
//!
//! Runs every reference scenario, prints a summary per test and, when a path
//! is given as the first argument, writes the JSON report there.

use reference_tests::run_suite;
use reference_tests::scenarios::all_tests;
use tracing_subscriber::EnvFilter;

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    tracing::info!("IB Coupling Reference Test Suite");
    tracing::info!("================================");

    let tests = all_tests();
    tracing::info!("Found {} reference tests", tests.len());

    let report = run_suite(&tests);
    for result in &report.results {
        result.print_summary();
    }
    for (name, e) in &report.errors {
        eprintln!("\nERROR running test {}: {}", name, e);
    }

    // Print overall summary
    println!("\n{}", "=".repeat(80));
    println!("OVERALL SUMMARY (NDIM = {})", report.ndim);
    println!("{}", "=".repeat(80));
    println!("Total tests: {}", tests.len());
    println!("Passed: {}", report.passed);
    println!("Failed: {}", report.failed);
    println!("{}", "=".repeat(80));

    if let Some(path) = std::env::args().nth(1) {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => match std::fs::write(&path, json) {
                Ok(()) => tracing::info!("Report written to {}", path),
                Err(e) => tracing::error!("Failed to write report to {}: {}", path, e),
            },
            Err(e) => tracing::error!("Failed to serialize report: {}", e),
        }
    }

    // Exit with error code if any tests failed
    if report.failed > 0 {
        std::process::exit(1);
    }
}
