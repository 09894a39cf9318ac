use crate::signal::TimeSeries;
use anyhow::{anyhow, Result};
use edf_reader::file_reader::SyncFileReader;
use edf_reader::sync_reader::SyncEDFReader;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Positional reads against an EDF file on disk.
struct DiskFileReader {
    path: PathBuf,
}

impl SyncFileReader for DiskFileReader {
    fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, std::io::Error> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Load one EDF signal channel as a current trace.
pub fn load_channel(path: &Path, channel: usize) -> Result<TimeSeries> {
    let reader = SyncEDFReader::init_with_file_reader(DiskFileReader {
        path: path.to_path_buf(),
    })?;
    let header = &reader.edf_header;
    let hdr_chan = header.channels.get(channel).ok_or_else(|| {
        anyhow!(
            "EDF file has {} channels; channel {} is out of range",
            header.channels.len(),
            channel
        )
    })?;
    if header.block_duration == 0 {
        return Err(anyhow!("EDF header has a zero record duration"));
    }
    // block_duration is in milliseconds
    let sample_rate =
        hdr_chan.number_of_samples_in_data_record as f64 * 1000.0 / header.block_duration as f64;
    let total_duration = header.block_duration * header.number_of_blocks;
    let data_matrix = reader.read_data_window(0, total_duration)?;
    let channel_data = data_matrix
        .get(channel)
        .ok_or_else(|| anyhow!("missing channel data"))?;
    Ok(TimeSeries {
        sample_rate,
        data: channel_data.iter().map(|value| *value as f64).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn rejects_non_edf_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fake.edf");
        std::fs::write(&path, b"this is not an EDF header").unwrap();
        assert!(load_channel(&path, 0).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_channel(Path::new("/nonexistent/trace.edf"), 0).is_err());
    }
}
