//! Market cap rankings core library
//!
//! Collects the complete daily market-cap ranking from a paginated upstream
//! API under a strict quota, and publishes it as validated, versioned
//! datasets.
//!
//! # Architecture
//!
//! - [`collect`] - rate-limited, retrying, resumable page collection into a
//!   raw snapshot
//! - [`checkpoint`] - durable per-date progress markers
//! - [`schema`] - the versioned canonical schema and its exporters
//! - [`validate`] - structural and value checks over canonical tables
//! - [`build`] - raw snapshot to published artifact (embedded database,
//!   partitioned columnar, gzip CSV)
//! - [`fsutil`] - atomic writes and collision-free naming

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod build;
pub mod checkpoint;
pub mod collect;
pub mod fsutil;
pub mod schema;
pub mod validate;

// Re-export commonly used types
pub use build::{
    ArtifactContents, BuildError, Builder, DEFAULT_PROCESSED_DIR, DatasetFormat, Encoding,
    artifact_file_name,
};
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointManager, DEFAULT_CHECKPOINT_DIR};
pub use collect::{
    AbortReason, ClientConfig, CollectError, CollectionMetrics, Collector, CollectorConfig,
    DEFAULT_BASE_URL, DEFAULT_CALLS_PER_MINUTE, DEFAULT_CALLS_PER_MONTH, DEFAULT_MAX_PAGES,
    DEFAULT_MAX_RETRIES, DEFAULT_PER_PAGE, DEFAULT_RAW_DIR, DEFAULT_WARN_THRESHOLD, FetchError,
    MarketsClient, PageSource, PartialCollection, QuotaError, RATE_LIMIT_COOLDOWN,
    REQUEST_TIMEOUT_SECS, RateLimitConfig, RateLimiter, RawSnapshot, RetryPolicy, SnapshotError,
    SnapshotMetadata, UsageReport, default_page_delay,
};
pub use schema::{RANKINGS_SCHEMA, SCHEMA_VERSION, SchemaDefinition};
pub use validate::{
    DEFAULT_MAX_RANK_FACTOR, ValidationError, ValidationFailure, ValidationRule, Validator,
    ValidatorConfig,
};
