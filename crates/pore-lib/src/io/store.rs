use super::{ReaderError, SignalReader};
use crate::signal::decimate;
use crate::store::EventStore;
use std::path::{Path, PathBuf};

/// Reads the raw-sample area of an event store file.
pub struct StoreReader {
    path: PathBuf,
    store: Option<EventStore>,
    sample_rate: f64,
    n_points: usize,
}

impl StoreReader {
    pub fn open(path: &Path) -> Result<Self, ReaderError> {
        let store = EventStore::open_read_only(path).map_err(|e| ReaderError::new(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            sample_rate: store.sample_rate(),
            n_points: store.n_points(),
            store: Some(store),
        })
    }

    pub fn n_points(&self) -> usize {
        self.n_points
    }
}

impl SignalReader for StoreReader {
    fn get_all_data(&mut self, decimated: bool) -> Result<Vec<f64>, ReaderError> {
        let store = self
            .store
            .as_mut()
            .ok_or_else(|| ReaderError::new(&self.path, "reader is closed"))?;
        let data = store
            .all_samples()
            .map_err(|e| ReaderError::new(&self.path, e))?;
        Ok(if decimated { decimate(&data) } else { data })
    }

    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn close(&mut self) {
        self.store = None;
    }
}
