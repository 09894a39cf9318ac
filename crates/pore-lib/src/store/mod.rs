//! Persistent event store: a fixed-length raw-sample area plus a ragged per-event record area.
//!
//! One `EventStore` wraps one SQLite file. The raw-sample area is stored as
//! LZ4-compressed chunks; the event area as a fixed-width row table and three
//! variable-length tables keyed by `array_row`. In memory the event area is a
//! row vector plus offsets-over-flat-buffer arrays, refreshed whenever another
//! connection commits.

mod ragged;
mod schema;

pub use ragged::RaggedArray;

use crate::signal::EventRecord;
use log::{debug, info, warn};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, TransactionBehavior};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;

use schema::CHUNK_LEN;

/// Dirty raw-sample chunks kept in memory before an implicit flush.
const MAX_PENDING_CHUNKS: usize = 16;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),
    #[error("{} has no event store schema", .0.display())]
    MissingSchema(PathBuf),
    #[error("{what} index {index} out of range (0..{len})")]
    OutOfRange {
        what: &'static str,
        index: usize,
        len: usize,
    },
    #[error("handle or buffered write predates a store reset")]
    StaleHandle,
    #[error("invalid event record: {0}")]
    InvalidRecord(String),
    #[error("store is open read-only")]
    ReadOnly,
    #[error("corrupt store: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    ReadOnly,
    Append,
}

/// Reference to one event row, valid until the next `clean`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowHandle {
    pub array_row: usize,
    generation: i64,
}

#[derive(Debug, Clone, Copy)]
struct RowFields {
    event_length: usize,
    raw_points_per_side: usize,
    baseline: f64,
    n_levels: usize,
}

#[derive(Debug)]
struct EventView {
    data_version: i64,
    generation: i64,
    n_points: usize,
    sample_rate: f64,
    rows: Vec<RowFields>,
    raw_data: RaggedArray<f64>,
    levels: RaggedArray<f64>,
    level_lengths: RaggedArray<usize>,
}

impl EventView {
    fn load(conn: &Connection) -> Result<Self, StoreError> {
        let data_version = data_version(conn)?;
        let n_points = schema::get_i64(conn, "n_points")?
            .ok_or_else(|| StoreError::Corrupt("n_points missing".into()))?;
        let sample_rate = schema::get_f64(conn, "sample_rate")?
            .ok_or_else(|| StoreError::Corrupt("sample_rate missing".into()))?;
        let generation = schema::get_i64(conn, "generation")?.unwrap_or(0);

        let mut view = Self {
            data_version,
            generation,
            n_points: n_points as usize,
            sample_rate,
            rows: Vec::new(),
            raw_data: RaggedArray::new(),
            levels: RaggedArray::new(),
            level_lengths: RaggedArray::new(),
        };

        let mut stmt = conn.prepare(
            "SELECT r.array_row, r.event_length, r.raw_points_per_side, r.baseline, r.n_levels,
                    d.data, l.data, ll.data
             FROM event_records r
             JOIN event_raw_data d ON d.array_row = r.array_row
             JOIN event_levels l ON l.array_row = r.array_row
             JOIN event_level_lengths ll ON ll.array_row = r.array_row
             ORDER BY r.array_row",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let array_row: i64 = row.get(0)?;
            if array_row as usize != view.rows.len() {
                return Err(StoreError::Corrupt(format!(
                    "event rows are not dense: expected {}, found {}",
                    view.rows.len(),
                    array_row
                )));
            }
            view.rows.push(RowFields {
                event_length: row.get::<_, i64>(1)? as usize,
                raw_points_per_side: row.get::<_, i64>(2)? as usize,
                baseline: row.get(3)?,
                n_levels: row.get::<_, i64>(4)? as usize,
            });
            view.raw_data
                .push(&schema::decode_f64(&row.get::<_, Vec<u8>>(5)?)?);
            view.levels
                .push(&schema::decode_f64(&row.get::<_, Vec<u8>>(6)?)?);
            view.level_lengths
                .push(&schema::decode_lengths(&row.get::<_, Vec<u8>>(7)?)?);
        }
        Ok(view)
    }

    fn check_row(&self, index: usize) -> Result<(), StoreError> {
        if index < self.rows.len() {
            Ok(())
        } else {
            Err(StoreError::OutOfRange {
                what: "event",
                index,
                len: self.rows.len(),
            })
        }
    }

    fn record(&self, index: usize) -> Result<EventRecord, StoreError> {
        self.check_row(index)?;
        let fields = self.rows[index];
        Ok(EventRecord {
            array_row: index,
            event_length: fields.event_length,
            raw_points_per_side: fields.raw_points_per_side,
            baseline: fields.baseline,
            n_levels: fields.n_levels,
            raw_data: self.raw_data.get(index).unwrap_or_default().to_vec(),
            levels: self.levels.get(index).unwrap_or_default().to_vec(),
            level_lengths: self.level_lengths.get(index).unwrap_or_default().to_vec(),
        })
    }

    fn push(&mut self, record: &EventRecord) {
        self.rows.push(RowFields {
            event_length: record.event_length,
            raw_points_per_side: record.raw_points_per_side,
            baseline: record.baseline,
            n_levels: record.n_levels,
        });
        self.raw_data.push(&record.raw_data);
        self.levels.push(&record.levels);
        self.level_lengths.push(&record.level_lengths);
    }
}

fn data_version(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row("PRAGMA data_version", [], |row| row.get(0))?)
}

fn is_not_a_database(err: &StoreError) -> bool {
    matches!(
        err,
        StoreError::Database(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::NotADatabase
    )
}

/// A validated handle on an event store file.
pub struct EventStore {
    conn: Connection,
    path: PathBuf,
    mode: StoreMode,
    pending: BTreeMap<usize, Vec<f64>>,
    /// Store generation the buffered chunks were loaded under.
    pending_generation: i64,
    view: RefCell<EventView>,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish()
    }
}

impl EventStore {
    /// Create (or reinitialise) a store with a zero-filled raw-sample area.
    ///
    /// An existing raw-sample area is kept as is; only the sample rate is rewritten.
    pub fn create(
        path: impl AsRef<Path>,
        n_points: usize,
        sample_rate: f64,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if n_points == 0 {
            return Err(StoreError::InvalidConfig("n_points must be positive".into()));
        }
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(StoreError::InvalidConfig(format!(
                "sample_rate must be positive, got {}",
                sample_rate
            )));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(path)?;
        schema::apply_pragmas(&conn)?;
        let tx = conn.transaction()?;
        schema::create_tables(&tx)?;
        match schema::get_i64(&tx, "n_points")? {
            Some(existing) => {
                debug!(
                    "{} already holds {} raw samples; keeping them",
                    path.display(),
                    existing
                );
            }
            None => {
                schema::set_i64(&tx, "n_points", n_points as i64)?;
                schema::set_i64(&tx, "generation", 0)?;
                schema::set_i64(&tx, "format_version", schema::FORMAT_VERSION)?;
                schema::write_zero_chunks(&tx, n_points)?;
            }
        }
        schema::set_f64(&tx, "sample_rate", sample_rate)?;
        tx.commit()?;

        info!(
            "Created event store {} ({} samples at {} Hz)",
            path.display(),
            n_points,
            sample_rate
        );
        Self::from_connection(conn, path, StoreMode::Append)
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open(path.as_ref(), StoreMode::ReadOnly)
    }

    /// Open an existing store for appending events; never resizes the raw-sample area.
    pub fn open_append(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open(path.as_ref(), StoreMode::Append)
    }

    fn open(path: &Path, mode: StoreMode) -> Result<Self, StoreError> {
        if !path.is_file() {
            return Err(StoreError::MissingSchema(path.to_path_buf()));
        }
        let flags = match mode {
            StoreMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
            StoreMode::Append => OpenFlags::SQLITE_OPEN_READ_WRITE,
        } | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        schema::apply_pragmas(&conn)?;
        match schema::has_raw_area(&conn) {
            Ok(true) => {}
            Ok(false) => return Err(StoreError::MissingSchema(path.to_path_buf())),
            Err(err) if is_not_a_database(&err) => {
                return Err(StoreError::MissingSchema(path.to_path_buf()))
            }
            Err(err) => return Err(err),
        }
        if mode == StoreMode::Append {
            schema::create_tables(&conn)?;
        }
        debug!("Opened event store {} ({:?})", path.display(), mode);
        Self::from_connection(conn, path, mode)
    }

    fn from_connection(conn: Connection, path: &Path, mode: StoreMode) -> Result<Self, StoreError> {
        let view = EventView::load(&conn)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            mode,
            pending: BTreeMap::new(),
            pending_generation: view.generation,
            view: RefCell::new(view),
        })
    }

    fn ensure_writable(&self) -> Result<(), StoreError> {
        match self.mode {
            StoreMode::Append => Ok(()),
            StoreMode::ReadOnly => Err(StoreError::ReadOnly),
        }
    }

    /// Reload the in-memory view if another connection committed since the last read.
    fn sync(&self) -> Result<(), StoreError> {
        let version = data_version(&self.conn)?;
        if version != self.view.borrow().data_version {
            debug!("{} changed on disk; reloading events", self.path.display());
            *self.view.borrow_mut() = EventView::load(&self.conn)?;
        }
        Ok(())
    }

    /// Delete every event and reinitialise both areas with the original configuration.
    ///
    /// Row handles obtained before the reset fail with `StaleHandle` afterwards.
    pub fn clean(&mut self) -> Result<(), StoreError> {
        self.ensure_writable()?;
        self.sync()?;
        self.pending.clear();
        let (n_points, generation) = {
            let view = self.view.borrow();
            (view.n_points, view.generation)
        };
        let tx = self.conn.transaction()?;
        schema::reset_areas(&tx)?;
        schema::write_zero_chunks(&tx, n_points)?;
        schema::set_i64(&tx, "generation", generation + 1)?;
        tx.commit()?;
        *self.view.borrow_mut() = EventView::load(&self.conn)?;
        info!(
            "Cleaned event store {} (generation {})",
            self.path.display(),
            generation + 1
        );
        Ok(())
    }

    /// Number of raw samples, after making every buffered sample write visible.
    pub fn row_count(&mut self) -> Result<usize, StoreError> {
        self.flush()?;
        let n_points = schema::get_i64(&self.conn, "n_points")?
            .ok_or_else(|| StoreError::Corrupt("n_points missing".into()))?;
        Ok(n_points as usize)
    }

    pub fn sample_rate(&self) -> f64 {
        if let Err(err) = self.sync() {
            warn!("could not refresh {}: {}", self.path.display(), err);
        }
        self.view.borrow().sample_rate
    }

    /// Length of the raw-sample area as fixed at creation.
    pub fn n_points(&self) -> usize {
        self.view.borrow().n_points
    }

    /// Overwrite raw samples starting at `offset`; buffered until the next flush.
    pub fn write_samples(&mut self, offset: usize, samples: &[f64]) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let n_points = self.n_points();
        let end = offset.checked_add(samples.len()).unwrap_or(usize::MAX);
        if end > n_points {
            return Err(StoreError::OutOfRange {
                what: "sample",
                index: end.saturating_sub(1),
                len: n_points,
            });
        }
        if self.pending.is_empty() {
            self.sync()?;
            self.pending_generation = self.view.borrow().generation;
        }
        let mut position = offset;
        let mut remaining = samples;
        while !remaining.is_empty() {
            let chunk = position / CHUNK_LEN;
            let within = position % CHUNK_LEN;
            if !self.pending.contains_key(&chunk) {
                let loaded = self.load_chunk(chunk)?;
                self.pending.insert(chunk, loaded);
            }
            let buffer = self
                .pending
                .get_mut(&chunk)
                .ok_or_else(|| StoreError::Corrupt(format!("chunk {} vanished", chunk)))?;
            let take = (buffer.len() - within).min(remaining.len());
            buffer[within..within + take].copy_from_slice(&remaining[..take]);
            position += take;
            remaining = &remaining[take..];
        }
        if self.pending.len() >= MAX_PENDING_CHUNKS {
            self.flush()?;
        }
        Ok(())
    }

    /// Persist buffered raw-sample writes.
    ///
    /// Writes buffered before another handle cleaned the store are discarded
    /// and reported as `StaleHandle`.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let generation = schema::get_i64(&tx, "generation")?.unwrap_or(0);
        if generation != self.pending_generation {
            drop(tx);
            warn!(
                "discarding {} raw sample chunk(s) buffered before {} was cleaned",
                self.pending.len(),
                self.path.display()
            );
            self.pending.clear();
            return Err(StoreError::StaleHandle);
        }
        {
            let mut stmt =
                tx.prepare("INSERT OR REPLACE INTO raw_samples (chunk, data) VALUES (?1, ?2)")?;
            for (chunk, data) in &self.pending {
                stmt.execute(params![*chunk as i64, schema::compress_samples(data)])?;
            }
        }
        tx.commit()?;
        debug!(
            "Flushed {} raw sample chunk(s) to {}",
            self.pending.len(),
            self.path.display()
        );
        self.pending.clear();
        Ok(())
    }

    fn load_chunk(&self, chunk: usize) -> Result<Vec<f64>, StoreError> {
        let blob: Vec<u8> = self.conn.query_row(
            "SELECT data FROM raw_samples WHERE chunk = ?1",
            params![chunk as i64],
            |row| row.get(0),
        )?;
        let samples = schema::decompress_samples(&blob)?;
        let expected = schema::chunk_len(self.n_points(), chunk);
        if samples.len() != expected {
            return Err(StoreError::Corrupt(format!(
                "raw chunk {} holds {} samples, expected {}",
                chunk,
                samples.len(),
                expected
            )));
        }
        Ok(samples)
    }

    /// Read a range of raw samples, flushing buffered writes first.
    pub fn read_samples(&mut self, range: Range<usize>) -> Result<Vec<f64>, StoreError> {
        self.flush()?;
        let n_points = self.n_points();
        if range.start > range.end || range.end > n_points {
            return Err(StoreError::OutOfRange {
                what: "sample",
                index: range.end.saturating_sub(1),
                len: n_points,
            });
        }
        let mut out = Vec::with_capacity(range.len());
        if range.is_empty() {
            return Ok(out);
        }
        let first = range.start / CHUNK_LEN;
        let last = (range.end - 1) / CHUNK_LEN;
        for chunk in first..=last {
            let data = self.load_chunk(chunk)?;
            let chunk_start = chunk * CHUNK_LEN;
            let lo = range.start.max(chunk_start) - chunk_start;
            let hi = range.end.min(chunk_start + data.len()) - chunk_start;
            out.extend_from_slice(&data[lo..hi]);
        }
        Ok(out)
    }

    pub fn all_samples(&mut self) -> Result<Vec<f64>, StoreError> {
        let n_points = self.n_points();
        self.read_samples(0..n_points)
    }

    pub fn event_count(&self) -> Result<usize, StoreError> {
        self.sync()?;
        Ok(self.view.borrow().rows.len())
    }

    pub fn event_row(&self, index: usize) -> Result<EventRecord, StoreError> {
        self.sync()?;
        self.view.borrow().record(index)
    }

    pub fn row_handle(&self, index: usize) -> Result<RowHandle, StoreError> {
        self.sync()?;
        let view = self.view.borrow();
        view.check_row(index)?;
        Ok(RowHandle {
            array_row: index,
            generation: view.generation,
        })
    }

    /// Resolve a handle obtained earlier; fails if the store was cleaned in between.
    pub fn resolve(&self, handle: RowHandle) -> Result<EventRecord, StoreError> {
        self.sync()?;
        let view = self.view.borrow();
        if handle.generation != view.generation {
            return Err(StoreError::StaleHandle);
        }
        view.record(handle.array_row)
    }

    pub fn raw_data_at(&self, array_row: usize) -> Result<Vec<f64>, StoreError> {
        self.sync()?;
        let view = self.view.borrow();
        view.check_row(array_row)?;
        Ok(view.raw_data.get(array_row).unwrap_or_default().to_vec())
    }

    pub fn levels_at(&self, array_row: usize) -> Result<Vec<f64>, StoreError> {
        self.sync()?;
        let view = self.view.borrow();
        view.check_row(array_row)?;
        Ok(view.levels.get(array_row).unwrap_or_default().to_vec())
    }

    pub fn level_lengths_at(&self, array_row: usize) -> Result<Vec<usize>, StoreError> {
        self.sync()?;
        let view = self.view.borrow();
        view.check_row(array_row)?;
        Ok(view.level_lengths.get(array_row).unwrap_or_default().to_vec())
    }

    /// Append one event; returns the `array_row` it was stored under.
    pub fn append_event(&mut self, record: &EventRecord) -> Result<usize, StoreError> {
        let rows = self.append_events(std::slice::from_ref(record))?;
        Ok(rows.start)
    }

    /// Append a batch atomically: either every record becomes visible or none does.
    pub fn append_events(&mut self, records: &[EventRecord]) -> Result<Range<usize>, StoreError> {
        self.ensure_writable()?;
        for record in records {
            record.check_shape().map_err(StoreError::InvalidRecord)?;
        }
        self.sync()?;
        let first = self.view.borrow().rows.len();

        let tx = self.conn.transaction()?;
        let next: i64 = tx.query_row(
            "SELECT COALESCE(MAX(array_row) + 1, 0) FROM event_records",
            [],
            |row| row.get(0),
        )?;
        {
            let mut record_stmt = tx.prepare(
                "INSERT INTO event_records
                 (array_row, event_length, raw_points_per_side, baseline, n_levels)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            let mut raw_stmt =
                tx.prepare("INSERT INTO event_raw_data (array_row, data) VALUES (?1, ?2)")?;
            let mut levels_stmt =
                tx.prepare("INSERT INTO event_levels (array_row, data) VALUES (?1, ?2)")?;
            let mut lengths_stmt =
                tx.prepare("INSERT INTO event_level_lengths (array_row, data) VALUES (?1, ?2)")?;
            for (offset, record) in records.iter().enumerate() {
                let array_row = next + offset as i64;
                record_stmt.execute(params![
                    array_row,
                    record.event_length as i64,
                    record.raw_points_per_side as i64,
                    record.baseline,
                    record.n_levels as i64,
                ])?;
                raw_stmt.execute(params![array_row, schema::encode_f64(&record.raw_data)])?;
                levels_stmt.execute(params![array_row, schema::encode_f64(&record.levels)])?;
                lengths_stmt.execute(params![
                    array_row,
                    schema::encode_lengths(&record.level_lengths)
                ])?;
            }
        }
        tx.commit()?;

        let next = next as usize;
        if next == first {
            let mut view = self.view.borrow_mut();
            for record in records {
                view.push(record);
            }
        } else {
            // Another connection appended between our sync and commit.
            *self.view.borrow_mut() = EventView::load(&self.conn)?;
        }
        Ok(next..next + records.len())
    }
}

impl Drop for EventStore {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(
                "failed to flush raw samples to {}: {}",
                self.path.display(),
                err
            );
        }
    }
}
