//! Raw snapshot file: one collection run's records plus run metadata.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::fsutil;
use crate::schema::SCHEMA_VERSION;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error on snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid snapshot {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl SnapshotError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}

/// Timestamp layout used in snapshot metadata and file names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Run metadata stored beside the records.
///
/// Only `collection_date` is required to read a snapshot back; every counter
/// defaults to zero and `duration_seconds` may be `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Snapshot date, `YYYY-MM-DD`.
    pub collection_date: String,
    /// When the snapshot was written, [`TIMESTAMP_FORMAT`] in UTC.
    #[serde(default)]
    pub collection_timestamp: String,
    #[serde(default)]
    pub total_coins: usize,
    #[serde(default)]
    pub api_calls: u32,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub duplicates_skipped: usize,
    /// Upstream records dropped for lacking an `id`.
    #[serde(default)]
    pub records_without_id: usize,
    #[serde(default)]
    pub failed_requests: u32,
    #[serde(default)]
    pub pages_fetched: u32,
    #[serde(default)]
    pub page_ceiling_reached: bool,
    #[serde(default)]
    pub schema_version: Option<String>,
}

impl SnapshotMetadata {
    /// Metadata for `date` stamped with the current schema version.
    ///
    /// # Arguments
    ///
    /// * `date` - snapshot date as `YYYY-MM-DD`
    /// * `written_at` - snapshot time, stored in [`TIMESTAMP_FORMAT`]
    #[must_use]
    pub fn new(date: impl Into<String>, written_at: DateTime<Utc>) -> Self {
        Self {
            collection_date: date.into(),
            collection_timestamp: written_at.format(TIMESTAMP_FORMAT).to_string(),
            total_coins: 0,
            api_calls: 0,
            duration_seconds: None,
            duplicates_skipped: 0,
            records_without_id: 0,
            failed_requests: 0,
            pages_fetched: 0,
            page_ceiling_reached: false,
            schema_version: Some(SCHEMA_VERSION.to_string()),
        }
    }
}

/// `{ "metadata": {...}, "coins": [...] }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub metadata: SnapshotMetadata,
    pub coins: Vec<Value>,
}

impl RawSnapshot {
    /// File name for a snapshot of `date` written at `timestamp`
    /// (already in [`TIMESTAMP_FORMAT`]).
    #[must_use]
    pub fn file_name(date: &str, timestamp: &str) -> String {
        format!("coingecko_rankings_{date}_{timestamp}.json")
    }

    /// Writes the snapshot atomically into `dir` and returns its path.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] on serialization or IO failure.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, SnapshotError> {
        fs::create_dir_all(dir).map_err(|e| SnapshotError::io(dir, e))?;
        let timestamp = if self.metadata.collection_timestamp.is_empty() {
            Utc::now().format(TIMESTAMP_FORMAT).to_string()
        } else {
            self.metadata.collection_timestamp.clone()
        };
        let name = Self::file_name(&self.metadata.collection_date, &timestamp);
        let path = fsutil::resolve_unique_path(dir, &name);

        let bytes = serde_json::to_vec_pretty(self).map_err(|e| SnapshotError::json(&path, e))?;
        fsutil::write_atomic(&path, &bytes).map_err(|e| SnapshotError::io(&path, e))?;

        info!(
            path = %path.display(),
            coins = self.coins.len(),
            "raw snapshot saved"
        );
        Ok(path)
    }

    /// Reads a snapshot from disk.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] when the file is unreadable or malformed.
    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let bytes = fs::read(path).map_err(|e| SnapshotError::io(path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| SnapshotError::json(path, e))
    }
}
