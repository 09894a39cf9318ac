use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use std::{error::Error, path::PathBuf};

#[test]
fn default_parameters_validate() -> Result<(), Box<dyn Error>> {
    let output = cargo_bin_cmd!("pore")
        .arg("validate")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let config: Value = serde_json::from_slice(&output)?;
    assert_eq!(config["min_event_length"], 10.0);
    assert_eq!(config["max_event_length"], 1000.0);
    assert_eq!(config["direction"], "Both");
    Ok(())
}

#[test]
fn params_file_and_overrides_combine() -> Result<(), Box<dyn Error>> {
    let output = cargo_bin_cmd!("pore")
        .args([
            "validate",
            "--params",
            sample_path("test_data/params.toml").to_str().expect("utf8 path"),
            "--absolute-change-start",
            "0.35",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let config: Value = serde_json::from_slice(&output)?;
    assert_eq!(config["threshold"]["AbsoluteChange"]["start"], 0.35);
    assert_eq!(config["direction"], "Negative");
    Ok(())
}

#[test]
fn bad_filter_parameter_is_reported_by_field() {
    let assert = cargo_bin_cmd!("pore")
        .args(["validate", "--filter-parameter", "abc"])
        .assert()
        .code(2);
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(stderr.contains("filterParameter"), "stderr: {}", stderr);
}

#[test]
fn invalid_parameters_never_start_a_run() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("never.pore");
    cargo_bin_cmd!("pore")
        .args([
            "find-events",
            "--out",
            store.to_str().unwrap(),
            "--filter-parameter",
            "abc",
            sample_path("test_data/trace_small.txt").to_str().unwrap(),
        ])
        .assert()
        .code(2);
    assert!(!store.exists());
}

fn sample_path(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .and_then(|p| p.parent())
        .expect("workspace root")
        .join(relative)
}
