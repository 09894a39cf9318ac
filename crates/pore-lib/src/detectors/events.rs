use super::MessageSink;
use crate::io::open_reader;
use crate::params::{BaselineMode, DetectionConfig, ThresholdDirection, ThresholdMode};
use crate::pipeline::Message;
use crate::signal::{EventRecord, TimeSeries};
use anyhow::Result;
use log::{debug, info, warn};
use std::path::PathBuf;

/// Context samples kept on each side of an event, at most.
pub const MAX_RAW_POINTS_PER_SIDE: usize = 50;
/// Events per `EventsBatch`.
pub const BATCH_SIZE: usize = 100;
/// Samples used to seed the baseline and noise estimates.
const SEED_WINDOW: usize = 1000;
/// Shortest run the level fit will split off.
const MIN_LEVEL_SAMPLES: usize = 3;
/// Progress reports per file.
const STATUS_STEPS: usize = 20;

/// Run detection over every file, streaming status and event batches into `sink`.
///
/// Unreadable files are reported as a status message and skipped. Returns the
/// total number of events emitted.
pub fn find_events(
    filenames: &[PathBuf],
    config: &DetectionConfig,
    sink: &mut dyn MessageSink,
) -> Result<usize> {
    let mut total = 0;
    let files = filenames.len().max(1);
    for (file_idx, path) in filenames.iter().enumerate() {
        let (mut reader, meta) = match open_reader(path) {
            Ok(opened) => opened,
            Err(err) => {
                warn!("skipping {}", err);
                sink.send(Message::StatusUpdate(format!("Error: {}", err)))?;
                continue;
            }
        };
        let data = match reader.get_all_data(false) {
            Ok(data) => data,
            Err(err) => {
                warn!("skipping {}", err);
                sink.send(Message::StatusUpdate(format!("Error: {}", err)))?;
                continue;
            }
        };
        reader.close();
        let series = TimeSeries {
            sample_rate: meta.sample_rate,
            data,
        };
        info!(
            "Scanning {} ({} samples, {:.3} s at {} Hz)",
            path.display(),
            series.len(),
            series.duration(),
            series.sample_rate
        );

        let mut batch = Vec::with_capacity(BATCH_SIZE);
        let mut scanner = Scanner::new(&series, config);
        let stride = (series.len() / STATUS_STEPS).max(1);
        let mut next_report = stride;
        while let Some(event) = scanner.next_event() {
            batch.push(event);
            total += 1;
            if batch.len() == BATCH_SIZE {
                sink.send(Message::EventsBatch(std::mem::take(&mut batch)))?;
            }
            if scanner.position >= next_report {
                next_report = scanner.position + stride;
                let done = (file_idx as f64 + scanner.position as f64 / series.len() as f64)
                    / files as f64;
                sink.send(status(total, done))?;
            }
        }
        if !batch.is_empty() {
            sink.send(Message::EventsBatch(batch))?;
        }
        sink.send(status(total, (file_idx + 1) as f64 / files as f64))?;
        debug!("{}: {} events so far", path.display(), total);
    }
    Ok(total)
}

fn status(count: usize, fraction: f64) -> Message {
    Message::StatusUpdate(format!(
        "Event Count: {} Percent Done: {:.0}",
        count,
        (fraction * 100.0).clamp(0.0, 100.0)
    ))
}

#[derive(Debug, Clone, Copy)]
struct Thresholds {
    start: f64,
    end: f64,
}

/// Walks one trace, tracking baseline and noise between events.
struct Scanner<'a> {
    series: &'a TimeSeries,
    data: &'a [f64],
    config: &'a DetectionConfig,
    baseline: f64,
    variance: f64,
    position: usize,
}

impl<'a> Scanner<'a> {
    fn new(series: &'a TimeSeries, config: &'a DetectionConfig) -> Self {
        let seed = &series.data[..series.len().min(SEED_WINDOW)];
        let (mean, variance) = mean_variance(seed);
        let baseline = match config.baseline {
            BaselineMode::Adaptive { .. } => mean,
            BaselineMode::Fixed { baseline_current } => baseline_current,
        };
        Self {
            series,
            data: &series.data,
            config,
            baseline,
            variance,
            position: 0,
        }
    }

    fn thresholds(&self) -> Thresholds {
        match self.config.threshold {
            ThresholdMode::NoiseBased {
                start_stddev,
                end_stddev,
            } => {
                let sigma = self.variance.sqrt();
                Thresholds {
                    start: start_stddev * sigma,
                    end: end_stddev * sigma,
                }
            }
            ThresholdMode::AbsoluteChange { start, end } => Thresholds { start, end },
            ThresholdMode::PercentChange { start, end } => Thresholds {
                start: self.baseline.abs() * start / 100.0,
                end: self.baseline.abs() * end / 100.0,
            },
        }
    }

    /// Polarity of a threshold crossing, or `None` if the sample stays inside.
    fn crossing(&self, deviation: f64, start: f64) -> Option<f64> {
        match self.config.direction {
            ThresholdDirection::Positive if deviation > start => Some(1.0),
            ThresholdDirection::Negative if deviation < -start => Some(-1.0),
            ThresholdDirection::Both if deviation.abs() > start => Some(deviation.signum()),
            _ => None,
        }
    }

    fn track(&mut self, x: f64) {
        if let BaselineMode::Adaptive { filter_parameter } = self.config.baseline {
            self.baseline = filter_parameter * self.baseline + (1.0 - filter_parameter) * x;
        }
        let d = x - self.baseline;
        let a = match self.config.baseline {
            BaselineMode::Adaptive { filter_parameter } => filter_parameter,
            BaselineMode::Fixed { .. } => 0.999,
        };
        self.variance = a * self.variance + (1.0 - a) * d * d;
    }

    fn next_event(&mut self) -> Option<EventRecord> {
        while self.position < self.data.len() {
            let x = self.data[self.position];
            let thresholds = self.thresholds();
            let deviation = x - self.baseline;
            let Some(sign) = self.crossing(deviation, thresholds.start) else {
                // excursions in the ignored direction stay out of the baseline
                if deviation.abs() <= thresholds.start {
                    self.track(x);
                }
                self.position += 1;
                continue;
            };

            let start = self.position;
            let mut end = start;
            while end < self.data.len() && sign * (self.data[end] - self.baseline) > thresholds.end {
                end += 1;
            }
            self.position = end.max(start + 1);
            if end == self.data.len() {
                // Trace ended inside the event.
                return None;
            }
            let length = end - start;
            let duration_us = self.series.samples_to_us(length);
            if duration_us < self.config.min_event_length || duration_us > self.config.max_event_length {
                continue;
            }
            return Some(self.record(start, end, thresholds));
        }
        None
    }

    fn record(&self, start: usize, end: usize, thresholds: Thresholds) -> EventRecord {
        let side = MAX_RAW_POINTS_PER_SIDE
            .min(start)
            .min(self.data.len() - end);
        let interior = &self.data[start..end];
        let step = (thresholds.start * 0.5).max(f64::EPSILON);
        let (levels, level_lengths) = fit_levels(interior, step);
        EventRecord {
            array_row: 0,
            event_length: interior.len(),
            raw_points_per_side: side,
            baseline: self.baseline,
            n_levels: levels.len(),
            raw_data: self.data[start - side..end + side].to_vec(),
            levels,
            level_lengths,
        }
    }
}

fn mean_variance(data: &[f64]) -> (f64, f64) {
    if data.is_empty() {
        return (0.0, 0.0);
    }
    let n = data.len() as f64;
    let mean = data.iter().sum::<f64>() / n;
    let variance = data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    (mean, variance)
}

/// Split `samples` into constant-level runs whose means differ by more than `step`.
///
/// The returned lengths always sum to `samples.len()`.
pub fn fit_levels(samples: &[f64], step: f64) -> (Vec<f64>, Vec<usize>) {
    let mut runs: Vec<(f64, usize)> = Vec::new();
    let mut sum = 0.0;
    let mut count = 0usize;
    for &x in samples {
        if count >= MIN_LEVEL_SAMPLES && (x - sum / count as f64).abs() > step {
            runs.push((sum, count));
            sum = 0.0;
            count = 0;
        }
        sum += x;
        count += 1;
    }
    if count > 0 {
        runs.push((sum, count));
    }

    // merge neighbours that ended up within one step of each other
    let mut merged: Vec<(f64, usize)> = Vec::with_capacity(runs.len());
    for (sum, count) in runs {
        if let Some(last) = merged.last_mut() {
            let last_mean = last.0 / last.1 as f64;
            if (sum / count as f64 - last_mean).abs() <= step || count < MIN_LEVEL_SAMPLES {
                last.0 += sum;
                last.1 += count;
                continue;
            }
        }
        merged.push((sum, count));
    }
    merged
        .into_iter()
        .map(|(sum, count)| (sum / count as f64, count))
        .unzip()
}
