use serde::{Deserialize, Serialize};

/// Every n-th sample is kept when a reader is asked to decimate.
pub const DECIMATION_STEP: usize = 10;

/// Uniformly sampled current trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Sampling frequency in Hz
    pub sample_rate: f64,
    /// Samples
    pub data: Vec<f64>,
}

impl TimeSeries {
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn duration(&self) -> f64 {
        self.data.len() as f64 / self.sample_rate
    }

    /// Converts a sample count into microseconds at this trace's rate.
    pub fn samples_to_us(&self, samples: usize) -> f64 {
        samples as f64 * 1e6 / self.sample_rate
    }
}

pub fn decimate(data: &[f64]) -> Vec<f64> {
    data.iter().step_by(DECIMATION_STEP).copied().collect()
}

/// One detected translocation event with its context samples and fitted levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Index shared by the fixed-width row and the ragged areas; assigned by the store.
    pub array_row: usize,
    pub event_length: usize,
    pub raw_points_per_side: usize,
    pub baseline: f64,
    pub n_levels: usize,
    /// `raw_points_per_side` context samples, the event, then the trailing context.
    pub raw_data: Vec<f64>,
    pub levels: Vec<f64>,
    pub level_lengths: Vec<usize>,
}

impl EventRecord {
    /// Checks the shape constraints tying the fixed-width row to its ragged data.
    ///
    /// Counts must also fit the store's signed 64-bit columns.
    pub fn check_shape(&self) -> Result<(), String> {
        for (name, value) in [
            ("event_length", self.event_length),
            ("raw_points_per_side", self.raw_points_per_side),
            ("n_levels", self.n_levels),
        ] {
            if i64::try_from(value).is_err() {
                return Err(format!("{} {} is too large", name, value));
            }
        }
        if self.levels.len() != self.n_levels || self.level_lengths.len() != self.n_levels {
            return Err(format!(
                "n_levels is {} but {} levels and {} level lengths were given",
                self.n_levels,
                self.levels.len(),
                self.level_lengths.len()
            ));
        }
        let covered = self
            .level_lengths
            .iter()
            .try_fold(0usize, |acc, &len| acc.checked_add(len))
            .ok_or_else(|| "level lengths overflow".to_string())?;
        if covered != self.event_length {
            return Err(format!(
                "level lengths cover {} samples but event_length is {}",
                covered, self.event_length
            ));
        }
        let expected_raw = self
            .raw_points_per_side
            .checked_mul(2)
            .and_then(|context| context.checked_add(self.event_length))
            .ok_or_else(|| {
                format!(
                    "raw_points_per_side {} and event_length {} overflow",
                    self.raw_points_per_side, self.event_length
                )
            })?;
        if self.raw_data.len() != expected_raw {
            return Err(format!(
                "raw data holds {} samples, expected {}",
                self.raw_data.len(),
                expected_raw
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> EventRecord {
        EventRecord {
            array_row: 0,
            event_length: 4,
            raw_points_per_side: 2,
            baseline: 1.0,
            n_levels: 2,
            raw_data: vec![1.0, 1.0, 0.5, 0.5, 0.2, 0.2, 1.0, 1.0],
            levels: vec![0.5, 0.2],
            level_lengths: vec![2, 2],
        }
    }

    #[test]
    fn well_formed_record_passes_shape_check() {
        let rec = record();
        assert!(rec.check_shape().is_ok());
    }

    #[test]
    fn level_lengths_must_cover_event() {
        let mut rec = record();
        rec.level_lengths = vec![2, 1];
        let err = rec.check_shape().unwrap_err();
        assert!(err.contains("cover 3"));
    }

    #[test]
    fn raw_data_must_include_context() {
        let mut rec = record();
        rec.raw_data.pop();
        assert!(rec.check_shape().is_err());
    }

    #[test]
    fn oversized_counts_are_rejected_not_wrapped() {
        let mut rec = record();
        rec.raw_points_per_side = usize::MAX / 2 + 1;
        assert!(rec.check_shape().is_err());
        rec.raw_points_per_side = i64::MAX as usize;
        let err = rec.check_shape().unwrap_err();
        assert!(err.contains("overflow"), "{}", err);

        let mut rec = record();
        rec.level_lengths = vec![usize::MAX, 5];
        rec.event_length = 4;
        let err = rec.check_shape().unwrap_err();
        assert!(err.contains("overflow"), "{}", err);

        let mut rec = record();
        rec.event_length = i64::MAX as usize + 1;
        let err = rec.check_shape().unwrap_err();
        assert!(err.contains("event_length"), "{}", err);
    }

    #[test]
    fn decimation_keeps_every_tenth_sample() {
        let data: Vec<f64> = (0..25).map(|i| i as f64).collect();
        assert_eq!(decimate(&data), vec![0.0, 10.0, 20.0]);
        let ts = TimeSeries {
            sample_rate: 1000.0,
            data,
        };
        assert_eq!(ts.samples_to_us(10), 10_000.0);
    }
}
