use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use std::{error::Error, path::Path, path::PathBuf};

fn run_json(args: &[&str]) -> Result<Value, Box<dyn Error>> {
    let output = cargo_bin_cmd!("pore")
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    Ok(serde_json::from_slice(&output)?)
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf8 path")
}

#[test]
fn detection_fills_the_store() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let store = dir.path().join("trace.pore");
    let trace = sample_path("test_data/trace_small.txt");
    let params = sample_path("test_data/params.toml");

    let summary = run_json(&[
        "find-events",
        "--out",
        path_str(&store),
        "--params",
        path_str(&params),
        "--tick-ms",
        "50",
        path_str(&trace),
    ])?;
    assert_eq!(summary["events"], 3);
    assert_eq!(summary["appended"], 3);
    assert_eq!(summary["outcome"], "completed");
    assert_eq!(
        summary["last_status"],
        "Event Count: 3 Percent Done: 100"
    );

    let counts = run_json(&["events", "--store", path_str(&store)])?;
    assert_eq!(counts["events"], 3);
    assert_eq!(counts["n_points"], 3000);
    assert_eq!(counts["sample_rate"], 10000.0);

    let row = run_json(&["events", "--store", path_str(&store), "--row", "1"])?;
    assert_eq!(row["array_row"], 1);
    assert_eq!(row["event_length"], 8);
    assert_eq!(row["levels"][0], 0.5);

    cargo_bin_cmd!("pore")
        .args(["events", "--store", path_str(&store), "--row", "3"])
        .assert()
        .failure();

    let parquet = dir.path().join("events.parquet");
    let exported = run_json(&[
        "export",
        "--store",
        path_str(&store),
        "--out",
        path_str(&parquet),
    ])?;
    assert_eq!(exported["rows"], 3);
    assert!(parquet.exists());

    let cleaned = run_json(&["clean", "--store", path_str(&store)])?;
    assert_eq!(cleaned["events"], 0);
    assert_eq!(cleaned["n_points"], 3000);
    Ok(())
}

#[test]
fn rerun_appends_after_existing_rows() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let store = dir.path().join("twice.pore");
    let trace = sample_path("test_data/trace_small.txt");
    let params = sample_path("test_data/params.toml");
    let args = [
        "find-events",
        "--out",
        path_str(&store),
        "--params",
        path_str(&params),
        "--tick-ms",
        "20",
        path_str(&trace),
    ];
    run_json(&args)?;
    let second = run_json(&args)?;
    assert_eq!(second["events"], 6);
    assert_eq!(second["appended"], 3);
    Ok(())
}

#[test]
fn unreadable_files_do_not_stop_detection() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let store = dir.path().join("mixed.pore");
    let trace = sample_path("test_data/trace_small.txt");
    let missing = dir.path().join("missing.txt");
    let summary = run_json(&[
        "find-events",
        "--out",
        path_str(&store),
        "--params",
        path_str(&sample_path("test_data/params.toml")),
        "--tick-ms",
        "20",
        path_str(&trace),
        path_str(&missing),
    ])?;
    assert_eq!(summary["events"], 3);
    assert_eq!(summary["outcome"], "completed");
    Ok(())
}

#[test]
fn info_reports_each_file() {
    let csv = sample_path("test_data/trace_sample.csv");
    let assert = cargo_bin_cmd!("pore")
        .args(["info", path_str(&csv), "/nonexistent/trace.txt"])
        .assert()
        .success();
    let output = assert.get_output();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().count(), 1);
    let meta: Value = serde_json::from_str(stdout.lines().next().unwrap()).unwrap();
    assert_eq!(meta["format"], "csv");
    assert_eq!(meta["n_points"], 5);
    assert!(String::from_utf8_lossy(&output.stderr).contains("nonexistent"));
}

#[test]
fn import_creates_a_store() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let store = dir.path().join("imported.pore");
    let summary = run_json(&[
        "import",
        "--input",
        path_str(&sample_path("test_data/trace_small.txt")),
        "--out",
        path_str(&store),
    ])?;
    assert_eq!(summary["n_points"], 3000);
    assert_eq!(summary["events"], 0);

    let again = run_json(&["info", path_str(&store)])?;
    assert_eq!(again["format"], "store");
    assert_eq!(again["sample_rate"], 10000.0);
    Ok(())
}

fn sample_path(relative: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .and_then(|p| p.parent())
        .expect("workspace root")
        .join(relative)
}
