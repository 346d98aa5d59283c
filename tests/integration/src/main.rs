//! Integration scenario runner
//!
//! Runs each scenario binary through `cargo test` and prints one line per
//! category. Pass category binary names to run a subset:
//!
//! ```text
//! cargo run -p integration-tests
//! cargo run -p integration-tests -- batch_tests timer_tests
//! RUST_LOG=rpcnet::network=debug,rpcobj::adapter=debug cargo run -p integration-tests
//! ```

use std::process::{Command, ExitCode};
use std::time::{Duration, Instant};

/// Scenario binaries declared in Cargo.toml, with what they cover
const CATEGORIES: &[(&str, &str)] = &[
    ("adapter_lifecycle_tests", "activation, locator rollback, hold, deactivation, destruction"),
    ("invocation_tests", "twoway, oneway, datagram, facets, default servants, replica groups"),
    ("batch_tests", "batched oneway ordering, explicit, size-triggered and periodic flush"),
    ("timer_tests", "cancellation and repeated task pacing"),
    ("stress_tests", "many clients, one shared connection, client churn"),
];

struct Outcome {
    category: &'static str,
    passed: bool,
    elapsed: Duration,
    detail: String,
}

fn run(category: &'static str) -> Outcome {
    println!("\n--- {} ---", category);
    let start = Instant::now();
    let status = Command::new("cargo")
        .args(["test", "-p", "integration-tests", "--test", category])
        .status();
    let elapsed = start.elapsed();

    match status {
        Ok(status) => Outcome {
            category,
            passed: status.success(),
            elapsed,
            detail: match status.code() {
                Some(0) => String::new(),
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            },
        },
        Err(e) => Outcome {
            category,
            passed: false,
            elapsed,
            detail: format!("cannot run cargo: {}", e),
        },
    }
}

fn main() -> ExitCode {
    let requested: Vec<String> = std::env::args().skip(1).collect();
    let selected: Vec<&(&str, &str)> = CATEGORIES
        .iter()
        .filter(|(name, _)| requested.is_empty() || requested.iter().any(|r| r == name))
        .collect();

    if selected.is_empty() {
        eprintln!("no such category; known categories:");
        for (name, covers) in CATEGORIES {
            eprintln!("  {:<26} {}", name, covers);
        }
        return ExitCode::FAILURE;
    }

    for (name, covers) in &selected {
        println!("  {:<26} {}", name, covers);
    }

    let outcomes: Vec<Outcome> = selected.iter().map(|(name, _)| run(name)).collect();

    println!("\n{:<26} {:<6} {:>10}", "category", "result", "time");
    for outcome in &outcomes {
        println!(
            "{:<26} {:<6} {:>9.1}s {}",
            outcome.category,
            if outcome.passed { "ok" } else { "FAILED" },
            outcome.elapsed.as_secs_f64(),
            outcome.detail
        );
    }

    if outcomes.iter().all(|o| o.passed) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
