//! Raw trace readers: one `SignalReader` per supported file type.

pub mod csv;
pub mod edf;
pub mod store;
pub mod text;

use crate::signal::{decimate, TimeSeries};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("{}: {message}", path.display())]
pub struct ReaderError {
    pub path: PathBuf,
    pub message: String,
}

impl ReaderError {
    pub fn new(path: &Path, err: impl std::fmt::Display) -> Self {
        Self {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceFormat {
    Text,
    Csv,
    Edf,
    Store,
}

impl TraceFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "txt" | "dat" => Some(Self::Text),
            "csv" => Some(Self::Csv),
            "edf" => Some(Self::Edf),
            "pore" => Some(Self::Store),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderMetadata {
    pub path: PathBuf,
    pub format: TraceFormat,
    pub sample_rate: f64,
    pub n_points: usize,
}

/// An opened trace.
pub trait SignalReader: Send {
    fn get_all_data(&mut self, decimate: bool) -> Result<Vec<f64>, ReaderError>;
    fn sample_rate(&self) -> f64;
    /// Release the underlying file; later reads are an error.
    fn close(&mut self);
}

/// Reader for traces that are fully parsed at open time.
pub struct InMemoryReader {
    path: PathBuf,
    series: Option<TimeSeries>,
    sample_rate: f64,
}

impl InMemoryReader {
    pub fn new(path: &Path, series: TimeSeries) -> Self {
        Self {
            path: path.to_path_buf(),
            sample_rate: series.sample_rate,
            series: Some(series),
        }
    }
}

impl SignalReader for InMemoryReader {
    fn get_all_data(&mut self, decimated: bool) -> Result<Vec<f64>, ReaderError> {
        let series = self
            .series
            .as_ref()
            .ok_or_else(|| ReaderError::new(&self.path, "reader is closed"))?;
        Ok(if decimated {
            decimate(&series.data)
        } else {
            series.data.clone()
        })
    }

    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn close(&mut self) {
        self.series = None;
    }
}

/// Open a trace, choosing the reader from the file extension.
pub fn open_reader(path: &Path) -> Result<(Box<dyn SignalReader>, ReaderMetadata), ReaderError> {
    let format = TraceFormat::from_path(path)
        .ok_or_else(|| ReaderError::new(path, "unsupported file type"))?;
    let (reader, n_points): (Box<dyn SignalReader>, usize) = match format {
        TraceFormat::Text => {
            let series = text::read_trace(path).map_err(|e| ReaderError::new(path, format!("{:#}", e)))?;
            let n = series.len();
            (Box::new(InMemoryReader::new(path, series)), n)
        }
        TraceFormat::Csv => {
            let series = csv::read_trace(path).map_err(|e| ReaderError::new(path, format!("{:#}", e)))?;
            let n = series.len();
            (Box::new(InMemoryReader::new(path, series)), n)
        }
        TraceFormat::Edf => {
            let series =
                edf::load_channel(path, 0).map_err(|e| ReaderError::new(path, format!("{:#}", e)))?;
            let n = series.len();
            (Box::new(InMemoryReader::new(path, series)), n)
        }
        TraceFormat::Store => {
            let reader = store::StoreReader::open(path)?;
            let n = reader.n_points();
            (Box::new(reader), n)
        }
    };
    let metadata = ReaderMetadata {
        path: path.to_path_buf(),
        format,
        sample_rate: reader.sample_rate(),
        n_points,
    };
    Ok((reader, metadata))
}

/// Open every file independently; one failure does not affect the rest.
pub fn inspect_files(paths: &[PathBuf]) -> Vec<Result<ReaderMetadata, ReaderError>> {
    paths
        .iter()
        .map(|path| {
            open_reader(path).map(|(mut reader, metadata)| {
                reader.close();
                metadata
            })
        })
        .collect()
}
