use super::StoreError;
use rusqlite::{params, Connection, OptionalExtension};
use std::time::Duration;

pub(crate) const FORMAT_VERSION: i64 = 1;

/// Samples per compressed chunk of the raw-sample area.
pub(crate) const CHUNK_LEN: usize = 65_536;

const RAW_AREA: &str = "
    CREATE TABLE IF NOT EXISTS metadata (
        key TEXT PRIMARY KEY,
        value NOT NULL
    );
    CREATE TABLE IF NOT EXISTS raw_samples (
        chunk INTEGER PRIMARY KEY,
        data BLOB NOT NULL
    );
";

const EVENT_AREA: &str = "
    CREATE TABLE IF NOT EXISTS event_records (
        array_row INTEGER PRIMARY KEY,
        event_length INTEGER NOT NULL,
        raw_points_per_side INTEGER NOT NULL,
        baseline REAL NOT NULL,
        n_levels INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS event_raw_data (
        array_row INTEGER PRIMARY KEY,
        data BLOB NOT NULL
    );
    CREATE TABLE IF NOT EXISTS event_levels (
        array_row INTEGER PRIMARY KEY,
        data BLOB NOT NULL
    );
    CREATE TABLE IF NOT EXISTS event_level_lengths (
        array_row INTEGER PRIMARY KEY,
        data BLOB NOT NULL
    );
";

const DROP_EVENT_AREA: &str = "
    DROP TABLE IF EXISTS event_records;
    DROP TABLE IF EXISTS event_raw_data;
    DROP TABLE IF EXISTS event_levels;
    DROP TABLE IF EXISTS event_level_lengths;
    DELETE FROM raw_samples;
";

/// Several handles may share one file; writers wait instead of failing with SQLITE_BUSY.
pub(crate) fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}

pub(crate) fn create_tables(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(RAW_AREA)?;
    conn.execute_batch(EVENT_AREA)?;
    Ok(())
}

/// Drops the event-record area and empties the raw-sample chunks, then recreates both.
pub(crate) fn reset_areas(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(DROP_EVENT_AREA)?;
    conn.execute_batch(EVENT_AREA)?;
    Ok(())
}

pub(crate) fn has_raw_area(conn: &Connection) -> Result<bool, StoreError> {
    let tables: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('metadata', 'raw_samples')",
        [],
        |row| row.get(0),
    )?;
    if tables < 2 {
        return Ok(false);
    }
    Ok(get_i64(conn, "n_points")?.is_some())
}

pub(crate) fn get_i64(conn: &Connection, key: &str) -> Result<Option<i64>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

pub(crate) fn get_f64(conn: &Connection, key: &str) -> Result<Option<f64>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

pub(crate) fn set_i64(conn: &Connection, key: &str, value: i64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub(crate) fn set_f64(conn: &Connection, key: &str, value: f64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub(crate) fn chunk_count(n_points: usize) -> usize {
    (n_points + CHUNK_LEN - 1) / CHUNK_LEN
}

/// Length of chunk `chunk` in a raw-sample area of `n_points` samples.
pub(crate) fn chunk_len(n_points: usize, chunk: usize) -> usize {
    let start = chunk * CHUNK_LEN;
    n_points.saturating_sub(start).min(CHUNK_LEN)
}

/// Writes every chunk of a zero-filled raw-sample area.
pub(crate) fn write_zero_chunks(conn: &Connection, n_points: usize) -> Result<(), StoreError> {
    let mut stmt = conn.prepare("INSERT OR REPLACE INTO raw_samples (chunk, data) VALUES (?1, ?2)")?;
    for chunk in 0..chunk_count(n_points) {
        let zeros = vec![0.0; chunk_len(n_points, chunk)];
        stmt.execute(params![chunk as i64, compress_samples(&zeros)])?;
    }
    Ok(())
}

pub(crate) fn compress_samples(samples: &[f64]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(&encode_f64(samples))
}

pub(crate) fn decompress_samples(blob: &[u8]) -> Result<Vec<f64>, StoreError> {
    let bytes = lz4_flex::decompress_size_prepended(blob)
        .map_err(|e| StoreError::Corrupt(format!("raw sample chunk: {e}")))?;
    decode_f64(&bytes)
}

pub(crate) fn encode_f64(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn decode_f64(bytes: &[u8]) -> Result<Vec<f64>, StoreError> {
    if bytes.len() % 8 != 0 {
        return Err(StoreError::Corrupt(format!(
            "float blob of {} bytes is not a multiple of 8",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
        .collect())
}

pub(crate) fn encode_lengths(values: &[usize]) -> Vec<u8> {
    values
        .iter()
        .flat_map(|v| (*v as u64).to_le_bytes())
        .collect()
}

pub(crate) fn decode_lengths(bytes: &[u8]) -> Result<Vec<usize>, StoreError> {
    if bytes.len() % 8 != 0 {
        return Err(StoreError::Corrupt(format!(
            "length blob of {} bytes is not a multiple of 8",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as usize)
        .collect())
}
