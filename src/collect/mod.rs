//! Rate-limited, checkpointed collection of ranked records.
//!
//! The [`Collector`] pages through a [`PageSource`] (the markets API in
//! production, see [`MarketsClient`]), asks the [`RateLimiter`] before every
//! request, retries per [`RetryPolicy`] and writes a [`RawSnapshot`].

mod client;
mod collector;
mod error;
mod rate_limiter;
pub mod retry;
mod snapshot;

pub use client::{
    ClientConfig, DEFAULT_BASE_URL, DEFAULT_PER_PAGE, MarketsClient, PageSource,
    REQUEST_TIMEOUT_SECS,
};
pub use collector::{
    CollectionMetrics, Collector, CollectorConfig, DEFAULT_MAX_PAGES, DEFAULT_RAW_DIR,
    ESTIMATED_TOTAL_RECORDS, PAGE_DELAY_WITH_KEY, PAGE_DELAY_WITHOUT_KEY, PROGRESS_INTERVAL,
    RATE_LIMIT_COOLDOWN, default_page_delay,
};
pub use error::{AbortReason, CollectError, FetchError, PartialCollection, QuotaError};
pub use rate_limiter::{
    Clock, DEFAULT_CALLS_PER_MINUTE, DEFAULT_CALLS_PER_MONTH, DEFAULT_WARN_THRESHOLD,
    RateLimitConfig, RateLimiter, SystemClock, UsageReport,
};
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};
pub use snapshot::{RawSnapshot, SnapshotError, SnapshotMetadata};
