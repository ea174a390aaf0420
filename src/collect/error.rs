//! Error types for the collection module.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use super::collector::CollectionMetrics;
use crate::checkpoint::CheckpointError;

/// Quota refusals from the [`RateLimiter`](super::RateLimiter).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaError {
    /// Per-minute window is full and the caller asked not to wait.
    #[error("per-minute quota exhausted ({used}/{limit}); next slot in {}ms", .retry_in.as_millis())]
    MinuteExceeded {
        used: u32,
        limit: u32,
        retry_in: Duration,
    },

    /// Monthly quota is spent; no wait will help before the month rolls over.
    #[error("monthly quota exhausted ({used}/{limit})")]
    MonthlyExceeded { used: u32, limit: u32 },
}

/// Errors fetching one page from the upstream API.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection refused, DNS failure, TLS error and similar.
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("timeout fetching {url}")]
    Timeout { url: String },

    /// Non-2xx response.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        url: String,
        status: u16,
        /// Raw `Retry-After` header, if present.
        retry_after: Option<String>,
    },

    /// Body was not a JSON array of records.
    #[error("invalid response body from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },
}

impl FetchError {
    /// Creates a network error from a reqwest error, mapping timeouts.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network { url, source }
        }
    }

    pub fn http_status(url: impl Into<String>, status: u16, retry_after: Option<String>) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    pub fn decode(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            url: url.into(),
            message: message.into(),
        }
    }

    /// HTTP status code, if this was a status error.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Why a collection run stopped before reaching the last page.
#[derive(Debug, Error)]
pub enum AbortReason {
    #[error(transparent)]
    Quota(#[from] QuotaError),

    /// Upstream refused the request for the current access tier.
    #[error("upstream tier limit (HTTP {status}); not retried")]
    TierLimit { status: u16 },

    #[error("giving up after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: FetchError,
    },

    /// A failure the retry policy classifies as permanent.
    #[error("permanent failure: {source}")]
    Permanent {
        #[source]
        source: FetchError,
    },

    #[error("interrupted")]
    Cancelled,
}

/// Records gathered before an abort, kept for the caller.
#[derive(Debug, Clone)]
pub struct PartialCollection {
    pub date: String,
    /// Unique records in first-seen order.
    pub records: Vec<Value>,
    pub metrics: CollectionMetrics,
    /// Checkpoint file left behind for resumption, if checkpointing was on.
    pub checkpoint: Option<PathBuf>,
}

/// Errors from a collection run.
#[derive(Debug, Error)]
pub enum CollectError {
    /// Unrecoverable failure on `page`; partial results are attached.
    #[error(
        "collection for {} aborted on page {page} with {} record(s) gathered: {reason}",
        .partial.date,
        .partial.records.len()
    )]
    Aborted {
        page: u32,
        reason: AbortReason,
        partial: Box<PartialCollection>,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Snapshot(#[from] super::SnapshotError),

    /// Checkpoint and partial-records file disagree; resuming would lose or
    /// duplicate records.
    #[error(
        "cannot resume {date}: checkpoint records {expected} coin(s) but partial file holds {found}"
    )]
    ResumeMismatch {
        date: String,
        expected: u64,
        found: usize,
    },
}

impl CollectError {
    /// Partial results, when the run aborted mid-collection.
    #[must_use]
    pub fn partial(&self) -> Option<&PartialCollection> {
        match self {
            Self::Aborted { partial, .. } => Some(partial),
            _ => None,
        }
    }

    #[must_use]
    pub fn reason(&self) -> Option<&AbortReason> {
        match self {
            Self::Aborted { reason, .. } => Some(reason),
            _ => None,
        }
    }
}
