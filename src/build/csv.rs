//! Gzip-compressed CSV encoding.
//!
//! One header row in canonical column order, dates as `YYYY-MM-DD`, floats
//! in shortest round-trip form and empty cells for nulls. The schema version
//! travels in the gzip header comment as `schema_version=X.Y.Z`.

use std::fs::File;
use std::io::{BufWriter, Read};
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, Date32Array, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Date32Type, Field, Float64Type, Int64Type, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::NaiveDate;
use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use tracing::{debug, instrument};

use super::{ArtifactContents, BuildError, DatasetFormat, Encoding, blocking};
use crate::schema::{RANKINGS_SCHEMA, SCHEMA_VERSION_KEY, SemanticType, date_to_days, days_to_date};

const GZIP_LEVEL: u32 = 6;

#[derive(Debug, Clone, Copy, Default)]
pub struct CsvEncoding;

#[async_trait]
impl Encoding for CsvEncoding {
    fn format(&self) -> DatasetFormat {
        DatasetFormat::Csv
    }

    #[instrument(skip(self, table), fields(path = %path.display(), rows = table.num_rows()))]
    async fn write(&self, table: &RecordBatch, path: &Path) -> Result<(), BuildError> {
        let table = table.clone();
        let target = path.to_path_buf();
        blocking(path, move || write_csv(&table, &target)).await
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn read(&self, path: &Path) -> Result<ArtifactContents, BuildError> {
        let source = path.to_path_buf();
        blocking(path, move || read_csv(&source)).await
    }
}

fn version_comment() -> String {
    format!("{SCHEMA_VERSION_KEY}={}", RANKINGS_SCHEMA.version())
}

fn cell(array: &ArrayRef, row: usize) -> String {
    if array.is_null(row) {
        return String::new();
    }
    match array.data_type() {
        DataType::Date32 => days_to_date(array.as_primitive::<Date32Type>().value(row))
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        DataType::Int64 => array.as_primitive::<Int64Type>().value(row).to_string(),
        DataType::Float64 => array.as_primitive::<Float64Type>().value(row).to_string(),
        DataType::Utf8 => array.as_string::<i32>().value(row).to_string(),
        _ => String::new(),
    }
}

fn write_csv(table: &RecordBatch, path: &Path) -> Result<(), BuildError> {
    let file = File::create(path).map_err(|e| BuildError::io(path, e))?;
    let encoder = GzBuilder::new()
        .comment(version_comment())
        .write(BufWriter::new(file), Compression::new(GZIP_LEVEL));
    let mut writer = csv::Writer::from_writer(encoder);

    let names: Vec<&str> = RANKINGS_SCHEMA.field_names().collect();
    let mut columns = Vec::with_capacity(names.len());
    for name in &names {
        columns.push(
            table
                .column_by_name(name)
                .ok_or_else(|| BuildError::malformed(path, format!("table lacks column {name}")))?,
        );
    }

    writer
        .write_record(&names)
        .map_err(|e| BuildError::csv(path, e))?;
    for row in 0..table.num_rows() {
        writer
            .write_record(columns.iter().map(|c| cell(c, row)))
            .map_err(|e| BuildError::csv(path, e))?;
    }

    writer.flush().map_err(|e| BuildError::io(path, e))?;
    let encoder = writer
        .into_inner()
        .map_err(|e| BuildError::io(path, std::io::Error::other(e.to_string())))?;
    let file = encoder
        .finish()
        .and_then(|buffered| buffered.into_inner().map_err(std::io::IntoInnerError::into_error))
        .map_err(|e| BuildError::io(path, e))?;
    file.sync_all().map_err(|e| BuildError::io(path, e))?;

    debug!("csv artifact written");
    Ok(())
}

/// Parses every cell of one column. Header names outside the schema are
/// kept as text so the validator can report them.
fn parse_column(
    path: &Path,
    name: &str,
    semantic_type: SemanticType,
    cells: &[&str],
) -> Result<ArrayRef, BuildError> {
    let bad = |value: &str| {
        BuildError::malformed(
            path,
            format!("column {name}: cannot parse {value:?} as {semantic_type}"),
        )
    };
    let present = |value: &&str| !value.is_empty();

    let array: ArrayRef = match semantic_type {
        SemanticType::Date => Arc::new(Date32Array::from(
            cells
                .iter()
                .map(|v| {
                    Some(*v)
                        .filter(present)
                        .map(|s| {
                            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                                .map(date_to_days)
                                .map_err(|_| bad(s))
                        })
                        .transpose()
                })
                .collect::<Result<Vec<_>, _>>()?,
        )),
        SemanticType::Int64 => Arc::new(Int64Array::from(
            cells
                .iter()
                .map(|v| {
                    Some(*v)
                        .filter(present)
                        .map(|s| s.parse::<i64>().map_err(|_| bad(s)))
                        .transpose()
                })
                .collect::<Result<Vec<_>, _>>()?,
        )),
        SemanticType::Float64 => Arc::new(Float64Array::from(
            cells
                .iter()
                .map(|v| {
                    Some(*v)
                        .filter(present)
                        .map(|s| s.parse::<f64>().map_err(|_| bad(s)))
                        .transpose()
                })
                .collect::<Result<Vec<_>, _>>()?,
        )),
        SemanticType::Utf8 => Arc::new(StringArray::from(
            cells
                .iter()
                .map(|v| Some(*v).filter(present))
                .collect::<Vec<_>>(),
        )),
    };
    Ok(array)
}

fn read_csv(path: &Path) -> Result<ArtifactContents, BuildError> {
    let file = File::open(path).map_err(|e| BuildError::io(path, e))?;
    let mut decoder = GzDecoder::new(file);
    let mut text = Vec::new();
    decoder
        .read_to_end(&mut text)
        .map_err(|e| BuildError::io(path, e))?;

    let schema_version = decoder
        .header()
        .and_then(|h| h.comment())
        .and_then(|c| std::str::from_utf8(c).ok())
        .and_then(|c| c.strip_prefix(SCHEMA_VERSION_KEY))
        .and_then(|c| c.strip_prefix('='))
        .map(ToString::to_string);

    let mut reader = csv::Reader::from_reader(text.as_slice());
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| BuildError::csv(path, e))?
        .iter()
        .map(ToString::to_string)
        .collect();
    if headers.is_empty() {
        return Err(BuildError::malformed(path, "missing header row"));
    }

    let records = reader
        .records()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BuildError::csv(path, e))?;

    let mut fields = Vec::with_capacity(headers.len());
    let mut columns = Vec::with_capacity(headers.len());
    for (idx, name) in headers.iter().enumerate() {
        let semantic_type = RANKINGS_SCHEMA
            .field(name)
            .map_or(SemanticType::Utf8, |f| f.semantic_type);
        let cells: Vec<&str> = records.iter().map(|r| r.get(idx).unwrap_or("")).collect();
        columns.push(parse_column(path, name, semantic_type, &cells)?);
        fields.push(Field::new(name, semantic_type.arrow_type(), true));
    }

    let table = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .map_err(|e| BuildError::arrow("csv read-back", e))?;
    Ok(ArtifactContents {
        table,
        schema_version,
    })
}
