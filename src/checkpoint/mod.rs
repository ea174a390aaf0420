//! Resumable collection progress.
//!
//! One checkpoint per collection date lives at
//! `{dir}/checkpoint_{date}.json`, written atomically. Beside it,
//! `{dir}/checkpoint_{date}.records.jsonl` holds the unique records gathered so
//! far, one JSON object per line, so a restarted run can rebuild its state.
//!
//! Restoring never guesses: a file that exists but fails field or type checks
//! is reported as a [`CheckpointError`] describing the offending content.

mod error;

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

use crate::fsutil;

pub use error::CheckpointError;

/// Default checkpoint directory, relative to the working directory.
pub const DEFAULT_CHECKPOINT_DIR: &str = "data/.checkpoints";

const PREFIX: &str = "checkpoint_";
const EXTENSION: &str = ".json";
const RECORDS_EXTENSION: &str = ".records.jsonl";

const REQUIRED_FIELDS: [&str; 5] = [
    "date",
    "last_page",
    "total_coins_collected",
    "checkpoint_time",
    "api_calls_used",
];

/// Progress marker for one collection date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub date: String,
    /// Last page fully processed (>= 1).
    pub last_page: u32,
    pub total_coins_collected: u64,
    /// RFC 3339 timestamp of the save.
    pub checkpoint_time: String,
    pub api_calls_used: u32,
    /// Free-form extras, such as run counters carried across a resume.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Checkpoint {
    /// Checkpoint stamped with the current time.
    #[must_use]
    pub fn new(date: impl Into<String>, last_page: u32, total_coins_collected: u64, api_calls_used: u32) -> Self {
        Self {
            date: date.into(),
            last_page,
            total_coins_collected,
            checkpoint_time: Utc::now().to_rfc3339(),
            api_calls_used,
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Saves, restores, lists and deletes checkpoints in one directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    /// Manager rooted at `dir`. The directory is created on first save.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the checkpoint file for `key`.
    ///
    /// # Errors
    ///
    /// [`CheckpointError::InvalidKey`] when `key` is empty or contains path
    /// separators.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, CheckpointError> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{PREFIX}{key}{EXTENSION}")))
    }

    /// Path of the partial-records file for `key`.
    ///
    /// # Errors
    ///
    /// Same as [`path_for`](Self::path_for).
    pub fn records_path_for(&self, key: &str) -> Result<PathBuf, CheckpointError> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{PREFIX}{key}{RECORDS_EXTENSION}")))
    }

    /// Writes `checkpoint` atomically and returns its path.
    ///
    /// # Errors
    ///
    /// [`CheckpointError::Regression`] if a stored checkpoint for the same
    /// date has a higher `last_page`; restore errors for a corrupt stored
    /// file; IO errors from the write.
    #[instrument(skip_all, fields(date = %checkpoint.date, page = checkpoint.last_page))]
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<PathBuf, CheckpointError> {
        let path = self.path_for(&checkpoint.date)?;

        if let Some(stored) = self.restore(&checkpoint.date)? {
            if checkpoint.last_page < stored.last_page {
                return Err(CheckpointError::Regression {
                    date: checkpoint.date.clone(),
                    stored: stored.last_page,
                    attempted: checkpoint.last_page,
                });
            }
        }

        let bytes = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| CheckpointError::corrupted(&path, e.to_string()))?;
        fsutil::write_atomic(&path, &bytes).map_err(|e| CheckpointError::io(&path, e))?;

        debug!(
            coins = checkpoint.total_coins_collected,
            api_calls = checkpoint.api_calls_used,
            "checkpoint saved"
        );
        Ok(path)
    }

    /// Loads the checkpoint for `key`, or `None` when no file exists.
    ///
    /// # Errors
    ///
    /// Returns a [`CheckpointError`] naming the problem when the file exists
    /// but is unreadable, not JSON, missing a required field, or carries an
    /// invalid value.
    #[instrument(skip(self))]
    pub fn restore(&self, key: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(key)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no checkpoint found");
                return Ok(None);
            }
            Err(e) => return Err(CheckpointError::io(&path, e)),
        };

        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| CheckpointError::corrupted(&path, format!("invalid JSON: {e}")))?;
        let checkpoint = parse_checkpoint(&path, key, &value)?;

        info!(
            page = checkpoint.last_page,
            coins = checkpoint.total_coins_collected,
            api_calls = checkpoint.api_calls_used,
            "checkpoint restored"
        );
        Ok(Some(checkpoint))
    }

    /// Removes the checkpoint and its partial records. Returns whether a
    /// checkpoint file existed.
    ///
    /// # Errors
    ///
    /// IO errors other than not-found.
    pub fn delete(&self, key: &str) -> Result<bool, CheckpointError> {
        let path = self.path_for(key)?;
        let existed = remove_if_exists(&path)?;
        remove_if_exists(&self.records_path_for(key)?)?;
        if existed {
            info!(path = %path.display(), "checkpoint deleted");
        }
        Ok(existed)
    }

    /// Sorted keys of all stored checkpoints.
    ///
    /// # Errors
    ///
    /// IO errors reading the directory; a missing directory lists nothing.
    pub fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CheckpointError::io(&self.dir, e)),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CheckpointError::io(&self.dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(key) = name
                .strip_prefix(PREFIX)
                .and_then(|rest| rest.strip_suffix(EXTENSION))
            {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Appends records to the partial-records file for `key`.
    ///
    /// # Errors
    ///
    /// IO or serialization errors.
    pub fn append_records(&self, key: &str, records: &[Value]) -> Result<(), CheckpointError> {
        let path = self.records_path_for(key)?;
        fs::create_dir_all(&self.dir).map_err(|e| CheckpointError::io(&self.dir, e))?;

        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)
                .map_err(|e| CheckpointError::corrupted(&path, e.to_string()))?;
            buf.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CheckpointError::io(&path, e))?;
        file.write_all(&buf)
            .and_then(|()| file.sync_data())
            .map_err(|e| CheckpointError::io(&path, e))
    }

    /// Replaces the partial-records file for `key` with exactly `records`.
    ///
    /// # Errors
    ///
    /// IO or serialization errors.
    pub fn rewrite_records(&self, key: &str, records: &[Value]) -> Result<(), CheckpointError> {
        let path = self.records_path_for(key)?;
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)
                .map_err(|e| CheckpointError::corrupted(&path, e.to_string()))?;
            buf.push(b'\n');
        }
        fsutil::write_atomic(&path, &buf).map_err(|e| CheckpointError::io(&path, e))
    }

    /// Reads at most `limit` records from the partial-records file.
    ///
    /// Lines past `limit` belong to a page whose checkpoint was never saved
    /// and are ignored unparsed.
    ///
    /// # Errors
    ///
    /// [`CheckpointError::Corrupted`] for a malformed line within `limit`.
    pub fn load_records(&self, key: &str, limit: usize) -> Result<Vec<Value>, CheckpointError> {
        let path = self.records_path_for(key)?;
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CheckpointError::io(&path, e)),
        };

        let mut records = Vec::with_capacity(limit);
        for (index, line) in BufReader::new(file).lines().take(limit).enumerate() {
            let line = line.map_err(|e| CheckpointError::io(&path, e))?;
            let record = serde_json::from_str(&line).map_err(|e| {
                CheckpointError::corrupted(&path, format!("line {}: {e}", index + 1))
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

fn validate_key(key: &str) -> Result<(), CheckpointError> {
    let bad = key.is_empty()
        || key.contains(['/', '\\'])
        || key.contains("..")
        || key.chars().any(char::is_control);
    if bad {
        Err(CheckpointError::InvalidKey {
            key: key.to_string(),
        })
    } else {
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> Result<bool, CheckpointError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CheckpointError::io(path, e)),
    }
}

fn parse_checkpoint(path: &Path, key: &str, value: &Value) -> Result<Checkpoint, CheckpointError> {
    let Some(object) = value.as_object() else {
        return Err(CheckpointError::corrupted(path, "expected a JSON object"));
    };

    let missing: Vec<&'static str> = REQUIRED_FIELDS
        .into_iter()
        .filter(|f| !object.contains_key(*f))
        .collect();
    if !missing.is_empty() {
        return Err(CheckpointError::MissingFields {
            path: path.to_path_buf(),
            fields: missing,
        });
    }

    let invalid = |field: &'static str, expected: &'static str| CheckpointError::InvalidField {
        path: path.to_path_buf(),
        field,
        value: object[field].to_string(),
        expected,
    };

    let date = object["date"]
        .as_str()
        .ok_or_else(|| invalid("date", "a string"))?;
    if date != key {
        return Err(invalid("date", "the checkpoint key"));
    }
    let last_page = object["last_page"]
        .as_u64()
        .filter(|&p| p >= 1)
        .and_then(|p| u32::try_from(p).ok())
        .ok_or_else(|| invalid("last_page", "an integer >= 1"))?;
    let total_coins_collected = object["total_coins_collected"]
        .as_u64()
        .ok_or_else(|| invalid("total_coins_collected", "an integer >= 0"))?;
    let checkpoint_time = object["checkpoint_time"]
        .as_str()
        .ok_or_else(|| invalid("checkpoint_time", "a string"))?;
    let api_calls_used = object["api_calls_used"]
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| invalid("api_calls_used", "an integer >= 0"))?;
    let metadata = match object.get("metadata") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Err(invalid("metadata", "an object")),
    };

    Ok(Checkpoint {
        date: date.to_string(),
        last_page,
        total_coins_collected,
        checkpoint_time: checkpoint_time.to_string(),
        api_calls_used,
        metadata,
    })
}
