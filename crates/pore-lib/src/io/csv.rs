use anyhow::{Context, Result};
use csv::ReaderBuilder;
use std::path::Path;

use crate::signal::TimeSeries;

/// Column holding the current samples.
pub const CURRENT_COLUMN: &str = "current";

/// Load a CSV with `timestamp` (seconds) and `current` columns.
///
/// The sample rate is taken from the spacing of the first two timestamps.
pub fn read_trace(path: &Path) -> Result<TimeSeries> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let headers = reader.headers()?.clone();
    let timestamp_idx = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case("timestamp"))
        .context("missing timestamp column")?;
    let current_idx = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case(CURRENT_COLUMN))
        .with_context(|| format!("missing {} column", CURRENT_COLUMN))?;

    let mut data = Vec::new();
    let mut first_ts = None;
    let mut sample_rate = None;
    for (row, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("reading row {}", row + 1))?;
        let ts: f64 = record
            .get(timestamp_idx)
            .context("missing timestamp value")?
            .parse()
            .with_context(|| format!("parsing timestamp on row {}", row + 1))?;
        let value: f64 = record
            .get(current_idx)
            .context("missing current value")?
            .parse()
            .with_context(|| format!("parsing current on row {}", row + 1))?;
        match first_ts {
            None => first_ts = Some(ts),
            Some(prev) if sample_rate.is_none() => {
                let dt = ts - prev;
                if !(dt > 0.0) {
                    anyhow::bail!("timestamps must increase (row {})", row + 1);
                }
                sample_rate = Some(1.0 / dt);
            }
            Some(_) => {}
        }
        data.push(value);
    }
    if data.is_empty() {
        anyhow::bail!("no samples in {}", path.display());
    }
    let sample_rate = sample_rate.context("need at least two rows to infer the sample rate")?;
    Ok(TimeSeries { sample_rate, data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn parses_fixture() {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .and_then(|p| p.parent())
            .expect("workspace root")
            .join("test_data/trace_sample.csv");
        let ts = read_trace(&path).expect("read sample");
        assert_eq!(ts.data.len(), 5);
        assert!((ts.sample_rate - 100_000.0).abs() < 1e-3);
        assert!((ts.data[0] - 1.2).abs() < 1e-9);
    }

    #[test]
    fn rejects_single_row() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("one.csv");
        std::fs::write(&path, "timestamp,current\n0.0,1.0\n").unwrap();
        assert!(read_trace(&path).is_err());
    }

    #[test]
    fn requires_current_column() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cols.csv");
        std::fs::write(&path, "timestamp,voltage\n0.0,1.0\n0.1,1.0\n").unwrap();
        let err = read_trace(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("current"));
    }
}
