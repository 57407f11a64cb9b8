//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in the arbiter crates MUST NOT sleep.
//! Rotation and dance pacing run on `tokio::time::interval`; waiting on
//! anything else means waiting on a channel or socket.
//! **Exceptions**: test code

use architectural_enforcement::{production_sources, violation};

#[test]
fn test_no_sleep_in_production_code() {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (line_number, code) in file.production_lines() {
            if code.contains("::sleep(") || code.contains(".sleep(") {
                violations.push(violation(&file, line_number, "Sleep call"));
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ Sleep calls found in production code!\n");
        for v in &violations {
            eprintln!("  ❌ {v}");
        }
        eprintln!("\n✅ Use tokio::time::interval for periodic work");
        eprintln!("✅ Await the channel or socket you are waiting for");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}
