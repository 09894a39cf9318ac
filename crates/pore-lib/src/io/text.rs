use anyhow::{Context, Result};
use std::path::Path;

use crate::signal::TimeSeries;

/// Rate assumed when a text trace carries no `# sample_rate:` header.
pub const DEFAULT_SAMPLE_RATE: f64 = 1000.0;

/// Parse newline-delimited samples, ignoring blank lines and `#` comments.
///
/// A comment of the form `# sample_rate: 250000` sets the rate in Hz.
pub fn parse_trace(text: &str) -> Result<TimeSeries> {
    let mut data = Vec::new();
    let mut sample_rate = None;
    for (idx, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(comment) = trimmed.strip_prefix('#') {
            if let Some(value) = comment.trim().strip_prefix("sample_rate:") {
                let rate: f64 = value
                    .trim()
                    .parse()
                    .with_context(|| format!("line {} has a bad sample rate: {}", idx + 1, value))?;
                if !(rate.is_finite() && rate > 0.0) {
                    anyhow::bail!("line {}: sample rate must be positive", idx + 1);
                }
                sample_rate = Some(rate);
            }
            continue;
        }
        let val: f64 = trimmed
            .parse()
            .with_context(|| format!("line {} is not f64: {}", idx + 1, trimmed))?;
        data.push(val);
    }
    if data.is_empty() {
        anyhow::bail!("no numeric samples found");
    }
    Ok(TimeSeries {
        sample_rate: sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE),
        data,
    })
}

pub fn read_trace(path: &Path) -> Result<TimeSeries> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_trace(&text)
}

/// Write a trace in the format `parse_trace` reads.
#[cfg(test)]
pub(crate) fn write_trace(path: &Path, series: &TimeSeries) -> Result<()> {
    let mut out = format!("# sample_rate: {}\n", series.sample_rate);
    for value in &series.data {
        out.push_str(&value.to_string());
        out.push('\n');
    }
    std::fs::write(path, out).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn header_sets_rate() {
        let ts = parse_trace("# sample_rate: 250000\n\n1.5\n# note\n-2\n").unwrap();
        assert_eq!(ts.sample_rate, 250_000.0);
        assert_eq!(ts.data, vec![1.5, -2.0]);
    }

    #[test]
    fn missing_header_uses_default_rate() {
        let ts = parse_trace("0.1\n0.2\n").unwrap();
        assert_eq!(ts.sample_rate, DEFAULT_SAMPLE_RATE);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_trace("1.0\nabc\n").is_err());
        assert!(parse_trace("# only comments\n").is_err());
        assert!(parse_trace("# sample_rate: -5\n1.0\n").is_err());
    }

    #[test]
    fn reads_fixture() {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .and_then(|p| p.parent())
            .expect("workspace root")
            .join("test_data/trace_small.txt");
        let ts = read_trace(&path).expect("read fixture");
        assert_eq!(ts.sample_rate, 10_000.0);
        assert!(ts.len() > 100);
    }
}
