//! CLI Integration Tests
//!
//! These tests run the `cgm` binary against a throwaway database and
//! configuration directory. The `simulate` tests drive the whole pipeline
//! with a virtual sensor at high speed, so no hardware is involved.
//!
//! ```
//! cargo test --package cgm-cli --test cli_integration
//! ```

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

/// Isolated home for one test: database plus config directory.
struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    fn database(&self) -> PathBuf {
        self.dir.path().join("data.db")
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Run cgm and return its output
    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_cgm"))
            .args(args)
            .env("CGM_DATABASE", self.database())
            .env("HOME", self.path())
            .env("XDG_CONFIG_HOME", self.path().join("config"))
            .env("XDG_DATA_HOME", self.path().join("data"))
            .env("NO_COLOR", "1")
            .env_remove("RUST_LOG")
            .output()
            .expect("Failed to run cgm binary")
    }

    fn run_ok(&self, args: &[&str]) -> String {
        let output = self.run(args);
        assert!(
            output.status.success(),
            "cgm {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    fn run_json(&self, args: &[&str]) -> serde_json::Value {
        let stdout = self.run_ok(args);
        serde_json::from_str(&stdout).expect("Output should be valid JSON")
    }

    /// Pair and stream a few simulated minutes into the database.
    fn simulate(&self, minutes: u32) -> String {
        let minutes = minutes.to_string();
        self.run_ok(&[
            "--quiet",
            "simulate",
            "--minutes",
            &minutes,
            "--speed",
            "600",
            "--seed",
            "7",
            "--format",
            "json",
        ])
    }
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_command() {
    let sandbox = Sandbox::new();
    let stdout = sandbox.run_ok(&["--help"]);

    assert!(stdout.contains("glucose"), "Help should describe the tool");
    for cmd in ["simulate", "status", "history", "calibration", "bg", "reset"] {
        assert!(stdout.contains(cmd), "Help should list {} command", cmd);
    }
}

#[test]
fn test_version_command() {
    let sandbox = Sandbox::new();
    let stdout = sandbox.run_ok(&["--version"]);
    assert!(stdout.contains("cgm"), "Version should contain the binary name");
}

#[test]
fn test_subcommand_help() {
    let sandbox = Sandbox::new();
    for cmd in ["simulate", "status", "history", "calibration", "bg", "reset", "config"] {
        let stdout = sandbox.run_ok(&[cmd, "--help"]);
        assert!(!stdout.is_empty(), "{} --help should produce output", cmd);
    }
}

#[test]
fn test_completions_bash() {
    let sandbox = Sandbox::new();
    let stdout = sandbox.run_ok(&["completions", "bash"]);
    assert!(stdout.contains("cgm"));
}

// =============================================================================
// Config Commands
// =============================================================================

#[test]
fn test_config_path() {
    let sandbox = Sandbox::new();
    let stdout = sandbox.run_ok(&["config", "path"]);
    assert!(stdout.contains("config.toml"));
}

#[test]
fn test_config_init_then_show() {
    let sandbox = Sandbox::new();
    sandbox.run_ok(&["config", "init"]);

    let output = sandbox.run(&["config", "init"]);
    assert!(!output.status.success(), "Second init without --force should fail");

    sandbox.run_ok(&["config", "init", "--force"]);
    let stdout = sandbox.run_ok(&["config", "show"]);
    assert!(stdout.contains("[calibration]"));
    assert!(stdout.contains("horizon_hours"));
}

// =============================================================================
// Offline Commands
// =============================================================================

#[test]
fn test_status_without_sensor() {
    let sandbox = Sandbox::new();
    let stdout = sandbox.run_ok(&["status"]);
    assert!(stdout.contains("No sensor paired"));
    assert!(stdout.contains("no readings"));

    let json = sandbox.run_json(&["status", "--format", "json"]);
    assert!(json["sensor"].is_null());
    assert!(json["latest"].is_null());

    let brief = sandbox.run_ok(&["status", "--brief"]);
    assert_eq!(brief.trim(), "---");
}

#[test]
fn test_blood_glucose_history() {
    let sandbox = Sandbox::new();
    sandbox.run_ok(&["bg", "112"]);
    sandbox.run_ok(&["bg", "98"]);

    let csv = sandbox.run_ok(&["history", "--kind", "blood", "--format", "csv"]);
    let mut lines = csv.lines();
    assert_eq!(
        lines.next(),
        Some("timestamp,glucose_mg_dl,raw_value,minute_change,trend,source,quality")
    );
    let rows: Vec<&str> = lines.collect();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.contains(",blood,")));

    let json = sandbox.run_json(&["history", "--kind", "blood", "--format", "json"]);
    let records = json.as_array().expect("History JSON should be an array");
    assert_eq!(records.len(), 2);
    // Newest first by default
    assert_eq!(records[0]["glucose_mg_dl"], 98);
    assert_eq!(records[1]["glucose_mg_dl"], 112);

    let sensor_only = sandbox.run_json(&["history", "--format", "json"]);
    assert_eq!(sensor_only.as_array().map(Vec::len), Some(0));
}

#[test]
fn test_blood_glucose_out_of_range() {
    let sandbox = Sandbox::new();
    let output = sandbox.run(&["bg", "5"]);
    assert!(!output.status.success());
}

#[test]
fn test_history_csv_no_header() {
    let sandbox = Sandbox::new();
    sandbox.run_ok(&["bg", "140"]);
    let csv = sandbox.run_ok(&["history", "--kind", "all", "--format", "csv", "--no-header"]);
    assert_eq!(csv.lines().count(), 1);
    assert!(!csv.starts_with("timestamp"));
}

#[test]
fn test_history_output_file() {
    let sandbox = Sandbox::new();
    sandbox.run_ok(&["bg", "140"]);
    let file = sandbox.path().join("out.json");
    let file_arg = file.to_string_lossy().into_owned();
    sandbox.run_ok(&["history", "--kind", "blood", "--json", "--output", &file_arg]);

    let content = std::fs::read_to_string(&file).expect("Output file should exist");
    let json: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(json[0]["source"], "blood");
}

#[test]
fn test_reset_without_sensor() {
    let sandbox = Sandbox::new();
    sandbox.run_ok(&["reset", "--yes"]);
}

#[test]
fn test_calibration_requires_sensor() {
    let sandbox = Sandbox::new();
    let output = sandbox.run(&["calibration", "add", "110"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.to_lowercase().contains("sensor"));
}

// =============================================================================
// Simulation
// =============================================================================

#[test]
fn test_simulate_streams_events() {
    let sandbox = Sandbox::new();
    let stdout = sandbox.simulate(2);

    let events: Vec<serde_json::Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).expect("Each event should be one JSON line"))
        .collect();
    let kinds: Vec<&str> = events.iter().filter_map(|e| e["type"].as_str()).collect();

    assert!(kinds.contains(&"sensor_paired"), "events: {:?}", kinds);
    assert!(kinds.contains(&"glucose_added"), "events: {:?}", kinds);
    assert!(kinds.contains(&"connection_state_changed"), "events: {:?}", kinds);
}

#[test]
fn test_simulate_persists_state() {
    let sandbox = Sandbox::new();
    sandbox.simulate(2);

    let status = sandbox.run_json(&["status", "--format", "json"]);
    assert!(status["sensor"]["serial"].is_string());
    assert!(status["unlock_count"].as_u64().unwrap() >= 1);
    assert!(status["latest"]["glucose_mg_dl"].is_number());

    let history = sandbox.run_json(&["history", "--format", "json"]);
    let records = history.as_array().unwrap();
    assert!(!records.is_empty());
    assert!(records.iter().all(|r| r["source"] == "sensor"));
}

#[test]
fn test_simulate_resumes_paired_sensor() {
    let sandbox = Sandbox::new();
    sandbox.simulate(1);
    let first = sandbox.run_json(&["status", "--format", "json"]);

    let stdout = sandbox.simulate(1);
    assert!(
        !stdout.contains("sensor_paired"),
        "Same sensor should reconnect without pairing"
    );

    let second = sandbox.run_json(&["status", "--format", "json"]);
    assert_eq!(first["sensor"]["serial"], second["sensor"]["serial"]);
    assert!(second["unlock_count"].as_u64() > first["unlock_count"].as_u64());
}

#[test]
fn test_consecutive_simulate_runs_keep_streaming() {
    let sandbox = Sandbox::new();
    sandbox.simulate(3);
    let first = sandbox.run_json(&["history", "--format", "json"]);
    let first = first.as_array().expect("History JSON should be an array");
    assert!(!first.is_empty(), "First run should store sensor values");

    sandbox.simulate(3);
    let second = sandbox.run_json(&["history", "--format", "json"]);
    let second = second.as_array().expect("History JSON should be an array");
    assert!(
        second.len() > first.len(),
        "Second run should append values ({} -> {})",
        first.len(),
        second.len()
    );
    assert_ne!(
        second[0]["timestamp"], first[0]["timestamp"],
        "Newest value should come from the second run"
    );
}

#[test]
fn test_simulate_ephemeral_leaves_database_empty() {
    let sandbox = Sandbox::new();
    sandbox.run_ok(&[
        "--quiet",
        "simulate",
        "--minutes",
        "1",
        "--speed",
        "600",
        "--ephemeral",
        "--format",
        "json",
    ]);

    let status = sandbox.run_json(&["status", "--format", "json"]);
    assert!(status["sensor"].is_null());
}

#[test]
fn test_calibration_after_simulate() {
    let sandbox = Sandbox::new();
    sandbox.simulate(2);

    sandbox.run_ok(&["calibration", "add", "120"]);
    let points = sandbox.run_json(&["calibration", "list", "--format", "json"]);
    let points = points.as_array().expect("Calibration JSON should be an array");
    assert_eq!(points.len(), 1);

    let id = points[0]["id"].as_str().unwrap().to_string();
    sandbox.run_ok(&["calibration", "remove", &id]);
    let points = sandbox.run_json(&["calibration", "list", "--format", "json"]);
    assert_eq!(points.as_array().map(Vec::len), Some(0));
}

#[test]
fn test_reset_after_simulate_keeps_history() {
    let sandbox = Sandbox::new();
    sandbox.simulate(1);
    sandbox.run_ok(&["reset", "--yes"]);

    let status = sandbox.run_json(&["status", "--format", "json"]);
    assert!(status["sensor"].is_null());
    let history = sandbox.run_json(&["history", "--format", "json"]);
    assert!(!history.as_array().unwrap().is_empty());
}
