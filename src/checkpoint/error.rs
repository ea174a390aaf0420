use std::path::PathBuf;

use thiserror::Error;

/// Errors from checkpoint persistence.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON, or a partial-records line is malformed.
    #[error("checkpoint file {path} is corrupted: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("checkpoint {path} is missing required field(s): {}", .fields.join(", "))]
    MissingFields {
        path: PathBuf,
        fields: Vec<&'static str>,
    },

    /// A field is present but has the wrong type or an out-of-range value.
    #[error("checkpoint {path} has invalid {field}: {value} ({expected})")]
    InvalidField {
        path: PathBuf,
        field: &'static str,
        /// Offending value as JSON.
        value: String,
        expected: &'static str,
    },

    /// `last_page` may never go backwards for one date.
    #[error("refusing to move checkpoint for {date} back from page {stored} to {attempted}")]
    Regression {
        date: String,
        stored: u32,
        attempted: u32,
    },

    /// The key cannot be used as part of a file name.
    #[error("invalid checkpoint key: {key:?}")]
    InvalidKey { key: String },
}

impl CheckpointError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupted(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
