//! Date-partitioned columnar encoding.
//!
//! The artifact is a directory with one ZSTD-compressed file per date:
//!
//! ```text
//! crypto_rankings_2025-11-23_20251124_010203.parquet/
//!     year=2025/month=11/day=23/data.parquet
//! ```
//!
//! Files hold the nine canonical columns and carry the schema version in
//! their key/value metadata. On read, the `year`/`month`/`day` partition
//! values are appended as extra columns.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, Date32Array, Int32Array};
use arrow::compute::{concat_batches, filter_record_batch};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::Datelike;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use tracing::{debug, instrument};

use super::{ArtifactContents, BuildError, DatasetFormat, Encoding, blocking};
use crate::schema::{PARTITION_COLUMNS, RANKINGS_SCHEMA, SCHEMA_VERSION_KEY, days_to_date};

const ZSTD_LEVEL: i32 = 3;
const DATA_FILE: &str = "data.parquet";

#[derive(Debug, Clone, Copy, Default)]
pub struct ParquetEncoding;

#[async_trait]
impl Encoding for ParquetEncoding {
    fn format(&self) -> DatasetFormat {
        DatasetFormat::Parquet
    }

    #[instrument(skip(self, table), fields(path = %path.display(), rows = table.num_rows()))]
    async fn write(&self, table: &RecordBatch, path: &Path) -> Result<(), BuildError> {
        let table = table.clone();
        let root = path.to_path_buf();
        blocking(path, move || write_partitions(&table, &root)).await
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn read(&self, path: &Path) -> Result<ArtifactContents, BuildError> {
        let root = path.to_path_buf();
        blocking(path, move || read_partitions(&root)).await
    }
}

fn writer_properties() -> Result<WriterProperties, BuildError> {
    let level = ZstdLevel::try_new(ZSTD_LEVEL).map_err(|e| BuildError::parquet("<properties>", e))?;
    Ok(WriterProperties::builder()
        .set_compression(Compression::ZSTD(level))
        .set_dictionary_enabled(true)
        .set_key_value_metadata(Some(vec![KeyValue::new(
            SCHEMA_VERSION_KEY.to_string(),
            RANKINGS_SCHEMA.version().to_string(),
        )]))
        .build())
}

fn partition_dir(root: &Path, days: i32) -> Option<PathBuf> {
    let date = days_to_date(days)?;
    Some(
        root.join(format!("year={}", date.year()))
            .join(format!("month={:02}", date.month()))
            .join(format!("day={:02}", date.day())),
    )
}

fn write_partitions(table: &RecordBatch, root: &Path) -> Result<(), BuildError> {
    let dates = table
        .column_by_name("date")
        .and_then(|c| c.as_any().downcast_ref::<Date32Array>())
        .ok_or_else(|| BuildError::malformed(root, "table lacks a date column"))?;
    let days: BTreeSet<i32> = dates.iter().flatten().collect();

    fs::create_dir_all(root).map_err(|e| BuildError::io(root, e))?;
    let props = writer_properties()?;

    for day in days {
        let dir = partition_dir(root, day)
            .ok_or_else(|| BuildError::malformed(root, format!("date out of range: {day}")))?;
        let mask: BooleanArray = dates.iter().map(|d| Some(d == Some(day))).collect();
        let partition =
            filter_record_batch(table, &mask).map_err(|e| BuildError::arrow("partition", e))?;

        fs::create_dir_all(&dir).map_err(|e| BuildError::io(&dir, e))?;
        let file_path = dir.join(DATA_FILE);
        let file = File::create(&file_path).map_err(|e| BuildError::io(&file_path, e))?;
        let mut writer = ArrowWriter::try_new(file, table.schema(), Some(props.clone()))
            .map_err(|e| BuildError::parquet(&file_path, e))?;
        writer
            .write(&partition)
            .map_err(|e| BuildError::parquet(&file_path, e))?;
        writer
            .close()
            .map_err(|e| BuildError::parquet(&file_path, e))?;

        debug!(path = %file_path.display(), rows = partition.num_rows(), "partition written");
    }
    Ok(())
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), BuildError> {
    for entry in fs::read_dir(dir).map_err(|e| BuildError::io(dir, e))? {
        let path = entry.map_err(|e| BuildError::io(dir, e))?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "parquet") {
            out.push(path);
        }
    }
    Ok(())
}

/// Partition values from `.../year=Y/month=M/day=D/file`.
fn partition_values(root: &Path, file: &Path) -> Result<[i32; 3], BuildError> {
    let mut values = [None; 3];
    let relative = file.strip_prefix(root).unwrap_or(file);
    for component in relative.components() {
        let Some((key, value)) = component.as_os_str().to_str().and_then(|s| s.split_once('='))
        else {
            continue;
        };
        if let Some(idx) = PARTITION_COLUMNS.iter().position(|c| *c == key) {
            values[idx] = value.parse::<i32>().ok();
        }
    }
    match values {
        [Some(y), Some(m), Some(d)] => Ok([y, m, d]),
        _ => Err(BuildError::malformed(
            file,
            "expected year=/month=/day= partition directories",
        )),
    }
}

fn read_file(root: &Path, file: &Path) -> Result<(RecordBatch, Option<String>), BuildError> {
    let handle = File::open(file).map_err(|e| BuildError::io(file, e))?;
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(handle).map_err(|e| BuildError::parquet(file, e))?;
    let version = builder
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .and_then(|kv| kv.iter().find(|entry| entry.key == SCHEMA_VERSION_KEY))
        .and_then(|entry| entry.value.clone());
    let schema = Arc::clone(builder.schema());
    let reader = builder.build().map_err(|e| BuildError::parquet(file, e))?;
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BuildError::arrow("parquet read", e))?;
    let data = concat_batches(&schema, &batches).map_err(|e| BuildError::arrow("parquet read", e))?;

    let partition = partition_values(root, file)?;
    let mut fields: Vec<Field> = schema
        .fields()
        .iter()
        .map(|f| f.as_ref().clone().with_nullable(true))
        .collect();
    let mut columns: Vec<ArrayRef> = data.columns().to_vec();
    for (name, value) in PARTITION_COLUMNS.iter().zip(partition) {
        fields.push(Field::new(*name, DataType::Int32, true));
        columns.push(Arc::new(Int32Array::from(vec![value; data.num_rows()])));
    }

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .map_err(|e| BuildError::arrow("partition columns", e))?;
    Ok((batch, version))
}

fn read_partitions(root: &Path) -> Result<ArtifactContents, BuildError> {
    if !root.is_dir() {
        return Err(BuildError::malformed(root, "not a partitioned dataset directory"));
    }
    let mut files = Vec::new();
    collect_files(root, &mut files)?;
    files.sort();
    if files.is_empty() {
        return Err(BuildError::EmptyArtifact {
            path: root.to_path_buf(),
        });
    }

    let mut batches = Vec::with_capacity(files.len());
    let mut versions = BTreeSet::new();
    for file in &files {
        let (batch, version) = read_file(root, file)?;
        versions.insert(version);
        batches.push(batch);
    }
    if versions.len() > 1 {
        return Err(BuildError::malformed(
            root,
            format!("partitions disagree on schema version: {versions:?}"),
        ));
    }

    let schema = batches[0].schema();
    let table = concat_batches(&schema, &batches)
        .map_err(|e| BuildError::malformed(root, format!("partition schemas differ: {e}")))?;
    Ok(ArtifactContents {
        table,
        schema_version: versions.into_iter().next().flatten(),
    })
}
