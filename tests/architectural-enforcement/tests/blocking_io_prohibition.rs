//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async code in the arbiter crates MUST NOT block on I/O.
//! **Required**: `tokio::fs`, `tokio::net`, `tokio::process` inside async fns
//! **Acceptable**: Blocking calls in plain functions that run before the
//! runtime does real work (the configuration loader), and test code

use architectural_enforcement::{production_sources, violation};

const BLOCKING_CALLS: &[(&str, &str)] = &[
    ("std::fs::", "Blocking file I/O"),
    ("std::net::TcpStream", "Blocking network I/O"),
    ("std::net::TcpListener", "Blocking network I/O"),
    ("std::net::UdpSocket", "Blocking network I/O"),
    ("std::process::Command", "Blocking process I/O"),
    ("std::thread::spawn", "OS thread spawned from async code"),
    (".blocking_recv(", "Blocking channel receive"),
    (".blocking_send(", "Blocking channel send"),
];

#[test]
fn test_no_blocking_io_in_async_code() {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (line_number, code) in file.production_lines() {
            for (needle, what) in BLOCKING_CALLS {
                if code.contains(needle) && file.in_async_context(line_number) {
                    violations.push(violation(&file, line_number, what));
                }
            }
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ Blocking I/O found in async code!\n");
        for v in &violations {
            eprintln!("  ❌ {v}");
        }
        eprintln!("\n✅ REQUIRED async I/O:");
        eprintln!("  - tokio::fs::read_to_string().await");
        eprintln!("  - tokio::net::TcpListener::bind().await");
        eprintln!("  - tokio::sync::mpsc::Sender::send().await");

        panic!(
            "\nFound {} blocking I/O violation(s) in async code.\nFix these before merging!",
            violations.len()
        );
    }
}

#[test]
fn test_production_trees_are_scanned() {
    let files = production_sources();
    assert!(
        files.iter().any(|f| f.path.ends_with("arbiter/core/src/scheduler.rs")),
        "core sources not found; scan would pass vacuously"
    );
    assert!(files.iter().any(|f| f.path.ends_with("arbiter/daemon/src/server.rs")));
}
