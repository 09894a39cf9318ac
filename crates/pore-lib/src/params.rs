//! Detection parameters: the raw text a user supplies and the validated configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Unvalidated parameters exactly as typed, one string per input field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawParameters {
    pub min_event_length: String,
    pub max_event_length: String,
    pub baseline_mode: String,
    pub filter_parameter: String,
    pub baseline_current: String,
    pub threshold_direction: String,
    pub threshold_mode: String,
    pub start_stddev: String,
    pub end_stddev: String,
    pub absolute_change_start: String,
    pub absolute_change_end: String,
    pub percent_change_start: String,
    pub percent_change_end: String,
}

impl Default for RawParameters {
    fn default() -> Self {
        Self {
            min_event_length: "10.0".into(),
            max_event_length: "1000.0".into(),
            baseline_mode: "Adaptive".into(),
            filter_parameter: "0.93".into(),
            baseline_current: "0.0".into(),
            threshold_direction: "Both".into(),
            threshold_mode: "Noise Based".into(),
            start_stddev: "5.0".into(),
            end_stddev: "1.0".into(),
            absolute_change_start: "0.1".into(),
            absolute_change_end: "0.0".into(),
            percent_change_start: "10.0".into(),
            percent_change_end: "0.0".into(),
        }
    }
}

/// Load raw parameters from a TOML file; absent keys keep their defaults.
pub fn read_parameters(path: &Path) -> Result<RawParameters> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read parameters {}", path.display()))?;
    let raw: RawParameters = toml::from_str(&contents)
        .with_context(|| format!("parsing parameters {}", path.display()))?;
    Ok(raw)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BaselineMode {
    /// Exponentially filtered running baseline; the parameter is the filter pole in (0, 1).
    Adaptive { filter_parameter: f64 },
    Fixed { baseline_current: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdDirection {
    Both,
    Positive,
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ThresholdMode {
    NoiseBased { start_stddev: f64, end_stddev: f64 },
    AbsoluteChange { start: f64, end: f64 },
    PercentChange { start: f64, end: f64 },
}

/// Validated, internally consistent detection configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Shortest accepted event, microseconds.
    pub min_event_length: f64,
    /// Longest accepted event, microseconds.
    pub max_event_length: f64,
    pub baseline: BaselineMode,
    pub direction: ThresholdDirection,
    pub threshold: ThresholdMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Validate raw parameters, stopping at the first offending field.
///
/// Fields are checked left to right: min length, max length, their ordering,
/// baseline mode and its field, threshold direction, threshold mode, then the
/// fields of the selected threshold branch. Fields of unselected branches are
/// never inspected.
pub fn validate(raw: &RawParameters) -> Result<DetectionConfig, ValidationError> {
    let min_event_length = parse_number("minEventLength", "Min Event Length", &raw.min_event_length)?;
    let max_event_length = parse_number("maxEventLength", "Max Event Length", &raw.max_event_length)?;
    if min_event_length >= max_event_length {
        return Err(ValidationError::new(
            "maxEventLength",
            format!(
                "Min Event Length ({}) must be less than Max Event Length ({})",
                min_event_length, max_event_length
            ),
        ));
    }

    let baseline = match normalize(&raw.baseline_mode).as_str() {
        "adaptive" => BaselineMode::Adaptive {
            filter_parameter: parse_number(
                "filterParameter",
                "Filter Parameter",
                &raw.filter_parameter,
            )?,
        },
        "fixed" => BaselineMode::Fixed {
            baseline_current: parse_number(
                "baselineCurrent",
                "Baseline Current",
                &raw.baseline_current,
            )?,
        },
        _ => {
            return Err(ValidationError::new(
                "baselineMode",
                format!("unknown baseline mode '{}'", raw.baseline_mode),
            ))
        }
    };

    let direction = match normalize(&raw.threshold_direction).as_str() {
        "both" => ThresholdDirection::Both,
        "positive" => ThresholdDirection::Positive,
        "negative" => ThresholdDirection::Negative,
        _ => {
            return Err(ValidationError::new(
                "thresholdDirection",
                format!("unknown threshold direction '{}'", raw.threshold_direction),
            ))
        }
    };

    let threshold = match normalize(&raw.threshold_mode).as_str() {
        "noisebased" => ThresholdMode::NoiseBased {
            start_stddev: parse_number("startStdDev", "Start StdDev", &raw.start_stddev)?,
            end_stddev: parse_number("endStdDev", "End StdDev", &raw.end_stddev)?,
        },
        "absolutechange" => ThresholdMode::AbsoluteChange {
            start: parse_number(
                "absoluteChangeStart",
                "Absolute Change Start",
                &raw.absolute_change_start,
            )?,
            end: parse_number(
                "absoluteChangeEnd",
                "Absolute Change End",
                &raw.absolute_change_end,
            )?,
        },
        "percentchange" => ThresholdMode::PercentChange {
            start: parse_number(
                "percentChangeStart",
                "Percent Change Start",
                &raw.percent_change_start,
            )?,
            end: parse_number(
                "percentChangeEnd",
                "Percent Change End",
                &raw.percent_change_end,
            )?,
        },
        _ => {
            return Err(ValidationError::new(
                "thresholdMode",
                format!("unknown threshold mode '{}'", raw.threshold_mode),
            ))
        }
    };

    Ok(DetectionConfig {
        min_event_length,
        max_event_length,
        baseline,
        direction,
        threshold,
    })
}

fn parse_number(field: &'static str, label: &str, text: &str) -> Result<f64, ValidationError> {
    match text.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(ValidationError::new(
            field,
            format!("Could not read a number from {} ('{}')", label, text),
        )),
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .flat_map(char::to_lowercase)
        .collect()
}
