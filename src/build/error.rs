//! Error types for the build pipeline.

use std::path::PathBuf;

use arrow::error::ArrowError;
use parquet::errors::ParquetError;
use thiserror::Error;

use crate::collect::SnapshotError;
use crate::validate::ValidationFailure;

/// Errors from building or re-checking an artifact.
///
/// A failed build never leaves output under the final artifact name.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("invalid collection date {value:?} in snapshot")]
    InvalidDate { value: String },

    #[error("snapshot {path} contains no records")]
    EmptySnapshot { path: PathBuf },

    /// The canonical table (or its read-back) failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationFailure),

    #[error("failed to assemble table ({context}): {source}")]
    Arrow {
        context: &'static str,
        #[source]
        source: ArrowError,
    },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("database error on {path}: {source}")]
    Database {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },

    #[error("parquet error on {path}: {source}")]
    Parquet {
        path: PathBuf,
        #[source]
        source: ParquetError,
    },

    #[error("CSV error on {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    /// The artifact's layout or contents are not what this crate writes.
    #[error("artifact {path} is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("artifact {path} contains no rows")]
    EmptyArtifact { path: PathBuf },

    /// Read-back disagrees with what was written.
    #[error("verification of {path} failed: {reason}")]
    Verification { path: PathBuf, reason: String },

    #[error("cannot infer dataset format from {path}")]
    UnknownFormat { path: PathBuf },
}

impl BuildError {
    pub fn arrow(context: &'static str, source: ArrowError) -> Self {
        Self::Arrow { context, source }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn database(path: impl Into<PathBuf>, source: sqlx::Error) -> Self {
        Self::Database {
            path: path.into(),
            source,
        }
    }

    pub fn parquet(path: impl Into<PathBuf>, source: ParquetError) -> Self {
        Self::Parquet {
            path: path.into(),
            source,
        }
    }

    pub fn csv(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        Self::Csv {
            path: path.into(),
            source,
        }
    }

    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn verification(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Verification {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Validation failure carried by this error, if any.
    #[must_use]
    pub fn validation_failure(&self) -> Option<&ValidationFailure> {
        match self {
            Self::Validation(failure) => Some(failure),
            _ => None,
        }
    }
}
