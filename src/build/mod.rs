//! Build pipeline: raw snapshot to published, verified artifact.
//!
//! Every [`Encoding`] shares the same steps in [`Builder::build`]:
//!
//! 1. load the raw snapshot and transform it into the canonical table
//! 2. validate; any violation aborts with the aggregated failure
//! 3. write the artifact into a hidden staging directory inside the output
//!    directory
//! 4. read the staged artifact back, check row count and schema version, and
//!    re-validate it
//! 5. rename it to `crypto_rankings_{date}_{timestamp}.{ext}` (with a `_N`
//!    suffix on collision)
//!
//! Nothing appears under the final name unless every step succeeded. A
//! dropped staging directory takes any partial output with it.

mod csv;
mod error;
mod parquet;
mod sqlite;
pub mod transform;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info, instrument};

use crate::collect::RawSnapshot;
use crate::fsutil;
use crate::schema::SCHEMA_VERSION;
use crate::validate::{ValidationError, ValidationFailure, Validator};

pub use self::csv::CsvEncoding;
pub use self::error::BuildError;
pub use self::parquet::ParquetEncoding;
pub use self::sqlite::SqliteEncoding;

/// Default output directory for published artifacts.
pub const DEFAULT_PROCESSED_DIR: &str = "data/processed";

/// Published artifact encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetFormat {
    /// Single-file indexed embedded database.
    Sqlite,
    /// Date-partitioned directory of columnar files.
    Parquet,
    /// Single gzip-compressed CSV file.
    Csv,
}

impl DatasetFormat {
    pub const ALL: [Self; 3] = [Self::Sqlite, Self::Parquet, Self::Csv];

    /// Artifact name extension, without the leading dot.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Sqlite => "db",
            Self::Parquet => "parquet",
            Self::Csv => "csv.gz",
        }
    }

    /// Infers the format from an artifact path's extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".csv.gz") {
            Some(Self::Csv)
        } else if name.ends_with(".parquet") {
            Some(Self::Parquet)
        } else if name.ends_with(".db") || name.ends_with(".sqlite") {
            Some(Self::Sqlite)
        } else {
            None
        }
    }

    /// Encoding implementation for this format.
    #[must_use]
    pub fn encoding(self) -> Box<dyn Encoding> {
        match self {
            Self::Sqlite => Box::new(SqliteEncoding),
            Self::Parquet => Box::new(ParquetEncoding),
            Self::Csv => Box::new(CsvEncoding),
        }
    }
}

impl fmt::Display for DatasetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Sqlite => "sqlite",
            Self::Parquet => "parquet",
            Self::Csv => "csv",
        };
        write!(f, "{label}")
    }
}

/// Table read back from an artifact.
#[derive(Debug, Clone)]
pub struct ArtifactContents {
    pub table: RecordBatch,
    /// Version tag stored in the artifact, if any.
    pub schema_version: Option<String>,
}

/// One physical artifact encoding.
#[async_trait]
pub trait Encoding: Send + Sync {
    fn format(&self) -> DatasetFormat;

    /// Writes `table` (strict canonical schema) to `path`, which does not
    /// exist yet.
    async fn write(&self, table: &RecordBatch, path: &Path) -> Result<(), BuildError>;

    /// Reads an artifact back into a table.
    async fn read(&self, path: &Path) -> Result<ArtifactContents, BuildError>;
}

/// `crypto_rankings_{date}_{YYYYmmdd_HHMMSS}.{ext}`
#[must_use]
pub fn artifact_file_name(date: NaiveDate, at: DateTime<Utc>, format: DatasetFormat) -> String {
    format!(
        "crypto_rankings_{}_{}.{}",
        date.format("%Y-%m-%d"),
        at.format("%Y%m%d_%H%M%S"),
        format.extension()
    )
}

/// Runs synchronous encoder IO on the blocking pool.
async fn blocking<T, F>(path: &Path, work: F) -> Result<T, BuildError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, BuildError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| BuildError::io(path, std::io::Error::other(e)))?
}

/// Shared transform, validate, write and verify pipeline for one encoding.
pub struct Builder {
    encoding: Box<dyn Encoding>,
    validator: Validator,
    output_dir: PathBuf,
}

impl Builder {
    /// Builder for `format` publishing into `output_dir`, using the default
    /// validator.
    ///
    /// # Arguments
    ///
    /// * `format` - which encoding to write
    /// * `output_dir` - created on first build if missing; staging happens
    ///   inside it so the final rename never crosses filesystems
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::path::Path;
    ///
    /// use marketcap_core::{Builder, DatasetFormat};
    ///
    /// # async fn run() -> Result<(), marketcap_core::BuildError> {
    /// let builder = Builder::new(DatasetFormat::Parquet, "data/processed");
    /// let raw = Path::new("data/raw/coingecko_rankings_2025-11-23_20251123_120000.json");
    /// let artifact = builder.build(raw).await?;
    /// assert!(builder.validate(&artifact).await?.is_empty());
    /// # Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn new(format: DatasetFormat, output_dir: impl Into<PathBuf>) -> Self {
        Self::with_encoding(format.encoding(), output_dir)
    }

    /// Builder over a caller-supplied encoding.
    #[must_use]
    pub fn with_encoding(encoding: Box<dyn Encoding>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            encoding,
            validator: Validator::default(),
            output_dir: output_dir.into(),
        }
    }

    /// Replaces the validator used for both the pre-write and read-back checks.
    #[must_use]
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    #[must_use]
    pub fn format(&self) -> DatasetFormat {
        self.encoding.format()
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Builds and publishes an artifact from the raw snapshot at `raw`.
    ///
    /// # Errors
    ///
    /// [`BuildError::Validation`] when the canonical table or its read-back
    /// violates a rule; [`BuildError::EmptySnapshot`] for a snapshot without
    /// records; encoding, IO and verification errors otherwise.
    #[instrument(skip(self), fields(format = %self.format(), raw = %raw.display()))]
    pub async fn build(&self, raw: &Path) -> Result<PathBuf, BuildError> {
        let snapshot = RawSnapshot::load(raw)?;
        let date_str = &snapshot.metadata.collection_date;
        let date = NaiveDate::parse_from_str(date_str, "%Y-%m-%d").map_err(|_| {
            BuildError::InvalidDate {
                value: date_str.clone(),
            }
        })?;
        if snapshot.coins.is_empty() {
            return Err(BuildError::EmptySnapshot {
                path: raw.to_path_buf(),
            });
        }

        let table = transform::to_canonical_batch(date, &snapshot.coins)?;
        self.validator.validate_and_raise(&table)?;
        let table = transform::conform(&table)?;
        debug!(rows = table.num_rows(), "canonical table validated");

        fs::create_dir_all(&self.output_dir).map_err(|e| BuildError::io(&self.output_dir, e))?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.output_dir)
            .map_err(|e| BuildError::io(&self.output_dir, e))?;

        let name = artifact_file_name(date, Utc::now(), self.format());
        let staged = staging.path().join(&name);
        self.encoding.write(&table, &staged).await?;
        self.verify(&staged, table.num_rows()).await?;

        let bytes = fsutil::disk_usage(&staged).map_err(|e| BuildError::io(&staged, e))?;
        let target = fsutil::resolve_unique_path(&self.output_dir, &name);
        fsutil::publish(&staged, &target).map_err(|e| BuildError::io(&target, e))?;

        info!(
            path = %target.display(),
            rows = table.num_rows(),
            bytes,
            "artifact published"
        );
        Ok(target)
    }

    /// Re-checks an existing artifact. Returns every violation found.
    ///
    /// # Errors
    ///
    /// [`BuildError::EmptyArtifact`] when the artifact holds no rows;
    /// encoding errors when it cannot be read.
    #[instrument(skip(self), fields(format = %self.format(), artifact = %artifact.display()))]
    pub async fn validate(&self, artifact: &Path) -> Result<Vec<ValidationError>, BuildError> {
        let contents = self.encoding.read(artifact).await?;
        if contents.table.num_rows() == 0 {
            return Err(BuildError::EmptyArtifact {
                path: artifact.to_path_buf(),
            });
        }
        if contents.schema_version.as_deref() != Some(SCHEMA_VERSION) {
            info!(
                found = contents.schema_version.as_deref().unwrap_or("none"),
                current = SCHEMA_VERSION,
                "artifact schema version differs from current"
            );
        }
        Ok(self.validator.validate(&contents.table))
    }

    async fn verify(&self, staged: &Path, expected_rows: usize) -> Result<(), BuildError> {
        let contents = self.encoding.read(staged).await?;
        let rows = contents.table.num_rows();
        if rows == 0 {
            return Err(BuildError::EmptyArtifact {
                path: staged.to_path_buf(),
            });
        }
        if rows != expected_rows {
            return Err(BuildError::verification(
                staged,
                format!("wrote {expected_rows} row(s), read back {rows}"),
            ));
        }
        if contents.schema_version.as_deref() != Some(SCHEMA_VERSION) {
            return Err(BuildError::verification(
                staged,
                format!(
                    "schema version tag {:?}, expected {SCHEMA_VERSION:?}",
                    contents.schema_version
                ),
            ));
        }

        let errors = self.validator.validate(&contents.table);
        if !errors.is_empty() {
            return Err(ValidationFailure { errors }.into());
        }
        debug!(rows, "read-back verified");
        Ok(())
    }
}
