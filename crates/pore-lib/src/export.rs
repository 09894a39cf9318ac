use crate::store::EventStore;
use anyhow::{Context, Result};
use arrow::array::{Array, PrimitiveArray};
use arrow::chunk::Chunk;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::error::Result as ArrowResult;
use arrow::io::parquet::write::{
    CompressionOptions, Encoding, FileWriter, RowGroupIterator, Version, WriteOptions,
};
use log::info;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// Rows per Parquet row group.
const ROW_GROUP_LEN: usize = 10_000;

fn event_table_schema() -> Schema {
    Schema::from(vec![
        Field::new("array_row", DataType::Int64, false),
        Field::new("event_length", DataType::Int64, false),
        Field::new("raw_points_per_side", DataType::Int64, false),
        Field::new("baseline", DataType::Float64, false),
        Field::new("n_levels", DataType::Int64, false),
        Field::new("duration_us", DataType::Float64, false),
    ])
}

/// Write the fixed-width event table of `store` to a Parquet file. Returns the row count.
pub fn write_event_table_parquet(store: &EventStore, path: &Path) -> Result<usize> {
    let schema = event_table_schema();
    let options = WriteOptions {
        write_statistics: false,
        version: Version::V2,
        compression: CompressionOptions::Uncompressed,
        data_pagesize_limit: None,
    };
    let encodings = vec![vec![Encoding::Plain]; schema.fields.len()];
    let file = File::create(path)
        .with_context(|| format!("Failed to create Parquet export at {}", path.display()))?;
    let mut writer = FileWriter::try_new(file, schema.clone(), options)
        .context("Failed to initialize Parquet writer")?;

    let sample_rate = store.sample_rate();
    let total = store.event_count()?;
    let mut start = 0;
    while start < total {
        let end = (start + ROW_GROUP_LEN).min(total);
        let mut rows = Vec::with_capacity(end - start);
        for index in start..end {
            rows.push(store.event_row(index)?);
        }
        let column = |f: &dyn Fn(&crate::signal::EventRecord) -> i64| -> Arc<dyn Array> {
            Arc::new(PrimitiveArray::<i64>::from_vec(rows.iter().map(f).collect()))
        };
        let chunk = Chunk::try_new(vec![
            column(&|r| r.array_row as i64),
            column(&|r| r.event_length as i64),
            column(&|r| r.raw_points_per_side as i64),
            Arc::new(PrimitiveArray::<f64>::from_vec(
                rows.iter().map(|r| r.baseline).collect(),
            )) as Arc<dyn Array>,
            column(&|r| r.n_levels as i64),
            Arc::new(PrimitiveArray::<f64>::from_vec(
                rows.iter()
                    .map(|r| r.event_length as f64 * 1e6 / sample_rate)
                    .collect(),
            )),
        ])?;

        let row_groups = RowGroupIterator::try_new(
            std::iter::once(ArrowResult::Ok(chunk)),
            &schema,
            options,
            encodings.clone(),
        )?;
        for group in row_groups {
            writer
                .write(group?)
                .context("Failed to write Parquet row group")?;
        }
        start = end;
    }
    writer
        .end(None)
        .context("Failed to finalize Parquet file")?;
    info!("Exported {} events to {}", total, path.display());
    Ok(total)
}
