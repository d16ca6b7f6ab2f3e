//! End-to-end recordings with the lo2s binary.
//!
//! These need perf_event_open for the calling user
//! (kernel.perf_event_paranoid <= 1 or root) and are ignored by default:
//! ```
//! cargo test --test recording -- --ignored
//! ```

mod common;

use std::process::Command;

use tempfile::TempDir;

use common::{definitions, read_json, read_json_lines};

fn lo2s() -> Command {
    Command::new(env!("CARGO_BIN_EXE_lo2s"))
}

#[test]
#[ignore] // Requires perf_event_open privileges
fn test_record_command() {
    let dir = TempDir::new().unwrap();
    let trace = dir.path().join("trace");
    let output = lo2s()
        .args(["-o", trace.to_str().unwrap(), "-c", "100000", "--"])
        .args(["sh", "-c", "i=0; while [ $i -lt 20000 ]; do i=$((i+1)); done; exit 4"])
        .output()
        .expect("Failed to run lo2s");

    assert_eq!(
        output.status.code(),
        Some(4),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let anchor = read_json(&trace.join("traces.otf2"));
    assert!(anchor["number_of_locations"].as_u64().unwrap() >= 1);

    let defs = read_json_lines(&trace.join("traces.def"));
    assert!(!definitions(&defs, "calling_context").is_empty());
    assert_eq!(definitions(&defs, "interrupt_generator").len(), 1);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("trace written to"));
}

#[test]
#[ignore] // Requires perf_event_open privileges
fn test_record_counters_with_duration() {
    let dir = TempDir::new().unwrap();
    let trace = dir.path().join("trace");
    let status = lo2s()
        .args(["-o", trace.to_str().unwrap(), "-e", "task-clock", "-i", "10", "-d", "1"])
        .args(["--", "sleep", "5"])
        .status()
        .expect("Failed to run lo2s");
    assert!(status.code().is_some());

    let defs = read_json_lines(&trace.join("traces.def"));
    let metrics: Vec<_> = definitions(&defs, "location")
        .into_iter()
        .filter(|l| l["type"] == "metric")
        .collect();
    assert!(!metrics.is_empty());
    for location in metrics {
        let events = read_json_lines(&trace.join(format!("traces/{}.evt", location["ref"])));
        assert!(events.len() >= 2);
        let times: Vec<u64> = events.iter().map(|e| e["time"].as_u64().unwrap()).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }
}
