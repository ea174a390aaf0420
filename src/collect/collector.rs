//! Exhaustive, resumable page collection.
//!
//! Pages are requested strictly in order starting from 1 (or from the page
//! after the last checkpoint). The loop stops on an empty page or on a page
//! shorter than the page size; the page-count estimate only feeds progress
//! logging. A hard ceiling guards against pagination that never terminates.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error, parse_retry_after};
use super::{
    AbortReason, CollectError, FetchError, PageSource, PartialCollection, RateLimiter, RawSnapshot,
    SnapshotMetadata,
};
use crate::checkpoint::{Checkpoint, CheckpointManager};

/// Default hard ceiling on pages per run.
pub const DEFAULT_MAX_PAGES: u32 = 100;

/// Inter-page delay when an API key is configured.
pub const PAGE_DELAY_WITH_KEY: Duration = Duration::from_secs(4);

/// Inter-page delay for anonymous access.
pub const PAGE_DELAY_WITHOUT_KEY: Duration = Duration::from_secs(20);

/// Wait after an upstream HTTP 429 before the single immediate retry.
pub const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);

/// Interval between progress log lines.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// Record count assumed when estimating pages for progress output.
pub const ESTIMATED_TOTAL_RECORDS: u32 = 20_000;

/// Default raw snapshot directory.
pub const DEFAULT_RAW_DIR: &str = "data/raw";

/// Collector settings.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Where raw snapshots are written.
    pub output_dir: PathBuf,
    /// Pause between consecutive pages, on top of the rate limiter.
    pub page_delay: Duration,
    /// Hard ceiling on pages per run; reaching it sets
    /// `page_ceiling_reached` in the snapshot metadata.
    pub max_pages: u32,
    /// Sleep after an HTTP 429 before the single immediate retry.
    pub rate_limit_cooldown: Duration,
    /// Minimum time between progress log lines.
    pub progress_interval: Duration,
    /// Expected record count, used only for the page estimate in logs.
    pub estimated_total: u32,
    /// Continue from a stored checkpoint for the same date.
    pub resume: bool,
}

impl CollectorConfig {
    /// Defaults for `output_dir`, with the page delay chosen by key presence.
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>, has_api_key: bool) -> Self {
        Self {
            output_dir: output_dir.into(),
            page_delay: default_page_delay(has_api_key),
            max_pages: DEFAULT_MAX_PAGES,
            rate_limit_cooldown: RATE_LIMIT_COOLDOWN,
            progress_interval: PROGRESS_INTERVAL,
            estimated_total: ESTIMATED_TOTAL_RECORDS,
            resume: true,
        }
    }
}

/// Inter-page delay for the given access tier.
#[must_use]
pub fn default_page_delay(has_api_key: bool) -> Duration {
    if has_api_key {
        PAGE_DELAY_WITH_KEY
    } else {
        PAGE_DELAY_WITHOUT_KEY
    }
}

/// Counters for one collection run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionMetrics {
    /// Requests sent, including retries and those carried over from a
    /// resumed checkpoint.
    pub api_calls: u32,
    pub failed_requests: u32,
    pub duplicates_skipped: usize,
    /// Records dropped for lacking an `id`.
    pub records_without_id: usize,
    pub pages_fetched: u32,
    pub page_ceiling_reached: bool,
    pub duration: Duration,
}

/// Mutable state of one run.
#[derive(Debug, Default)]
struct RunState {
    records: Vec<Value>,
    seen: HashSet<String>,
    metrics: CollectionMetrics,
    page: u32,
}

impl RunState {
    /// Adds first-seen records and returns them.
    fn absorb(&mut self, page: Vec<Value>) -> Vec<Value> {
        let mut fresh = Vec::new();
        for record in page {
            let Some(id) = record_id(&record) else {
                self.metrics.records_without_id += 1;
                continue;
            };
            if self.seen.insert(id) {
                fresh.push(record);
            } else {
                self.metrics.duplicates_skipped += 1;
            }
        }
        self.records.extend(fresh.iter().cloned());
        fresh
    }
}

// Checkpoint metadata keys for counters carried across a resume.
const DUPLICATES_KEY: &str = "duplicates_skipped";
const WITHOUT_ID_KEY: &str = "records_without_id";
const FAILED_KEY: &str = "failed_requests";

fn carried_count(checkpoint: &Checkpoint, key: &str) -> usize {
    checkpoint
        .metadata
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(0)
}

fn record_id(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Paginated collector over a [`PageSource`].
pub struct Collector {
    source: Box<dyn PageSource>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    checkpoints: Option<CheckpointManager>,
    interrupt: Option<Arc<AtomicBool>>,
    config: CollectorConfig,
}

impl Collector {
    /// Creates a collector with the default retry policy, no checkpoints and
    /// no interrupt flag.
    ///
    /// # Arguments
    ///
    /// * `source` - page fetcher, usually a [`MarketsClient`](super::MarketsClient)
    /// * `limiter` - quota gate consulted before every request, retries included
    /// * `config` - pacing, ceiling and output settings
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::sync::Arc;
    ///
    /// use chrono::NaiveDate;
    /// use marketcap_core::{
    ///     ClientConfig, Collector, CollectorConfig, MarketsClient, RateLimitConfig, RateLimiter,
    /// };
    ///
    /// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
    /// let client = MarketsClient::new(ClientConfig::default())?;
    /// let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default()));
    /// let collector = Collector::new(Box::new(client), limiter, CollectorConfig::new("data/raw", false));
    ///
    /// let date = NaiveDate::from_ymd_opt(2025, 11, 23).ok_or("bad date")?;
    /// let snapshot = collector.collect(date).await?;
    /// println!("raw snapshot at {}", snapshot.display());
    /// # Ok(())
    /// # }
    /// ```
    #[must_use]
    pub fn new(source: Box<dyn PageSource>, limiter: Arc<RateLimiter>, config: CollectorConfig) -> Self {
        Self {
            source,
            limiter,
            retry: RetryPolicy::default(),
            checkpoints: None,
            interrupt: None,
            config,
        }
    }

    /// Replaces the backoff policy for transient failures.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Enables per-page checkpointing and resumption.
    #[must_use]
    pub fn with_checkpoints(mut self, manager: CheckpointManager) -> Self {
        self.checkpoints = Some(manager);
        self
    }

    /// Flag checked between pages; once set the run stops with
    /// [`AbortReason::Cancelled`].
    #[must_use]
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    #[must_use]
    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Collects every ranked record for `date` and writes the raw snapshot.
    ///
    /// # Errors
    ///
    /// [`CollectError::Aborted`] with the partial records when a page cannot
    /// be fetched; checkpoint or snapshot errors from persistence.
    #[instrument(skip(self))]
    pub async fn collect(&self, date: NaiveDate) -> Result<PathBuf, CollectError> {
        let date = date.format("%Y-%m-%d").to_string();
        let started = Instant::now();
        let mut run = self.start_run(&date)?;

        let page_size = self.source.page_size().max(1);
        let pages_estimate = self.config.estimated_total.div_ceil(page_size).max(1);
        info!(
            start_page = run.page,
            pages_estimate,
            page_delay_secs = self.config.page_delay.as_secs_f64(),
            "starting collection"
        );

        let mut last_progress = Instant::now();
        loop {
            if run.page > self.config.max_pages {
                warn!(max_pages = self.config.max_pages, "page ceiling reached, stopping");
                run.metrics.page_ceiling_reached = true;
                break;
            }
            if self.interrupted() {
                warn!(page = run.page, "interrupt requested, stopping between pages");
                return Err(self.abort(&date, AbortReason::Cancelled, run, started));
            }
            if last_progress.elapsed() >= self.config.progress_interval {
                info!(
                    page = run.page,
                    pages_estimate,
                    coins = run.records.len(),
                    elapsed_secs = started.elapsed().as_secs(),
                    "collection progress"
                );
                last_progress = Instant::now();
            }

            let records = match self.fetch_with_retry(run.page, &mut run.metrics).await {
                Ok(records) => records,
                Err(reason) => return Err(self.abort(&date, reason, run, started)),
            };
            run.metrics.pages_fetched += 1;

            if records.is_empty() {
                info!(page = run.page, "empty page, end of ranked records");
                break;
            }

            let received = records.len();
            let fresh = run.absorb(records);
            debug!(
                page = run.page,
                received,
                fresh = fresh.len(),
                "page processed"
            );
            self.save_progress(&date, &run, &fresh)?;

            if received < page_size as usize {
                info!(page = run.page, received, "partial page, collection complete");
                break;
            }

            if run.page < self.config.max_pages {
                tokio::time::sleep(self.config.page_delay).await;
            }
            run.page += 1;
        }

        run.metrics.duration = started.elapsed();
        self.finish(&date, run)
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn start_run(&self, date: &str) -> Result<RunState, CollectError> {
        let mut run = RunState {
            page: 1,
            ..RunState::default()
        };
        let Some(manager) = &self.checkpoints else {
            return Ok(run);
        };

        if !self.config.resume {
            if manager.delete(date)? {
                info!("discarded existing checkpoint");
            }
            return Ok(run);
        }

        let Some(checkpoint) = manager.restore(date)? else {
            // Records appended before the first checkpoint save are orphans.
            manager.delete(date)?;
            return Ok(run);
        };

        let expected = checkpoint.total_coins_collected;
        let limit = usize::try_from(expected).unwrap_or(usize::MAX);
        let records = manager.load_records(date, limit)?;
        if records.len() as u64 != expected {
            return Err(CollectError::ResumeMismatch {
                date: date.to_string(),
                expected,
                found: records.len(),
            });
        }
        manager.rewrite_records(date, &records)?;

        run.seen = records.iter().filter_map(record_id).collect();
        run.records = records;
        run.page = checkpoint.last_page + 1;
        run.metrics.api_calls = checkpoint.api_calls_used;
        run.metrics.pages_fetched = checkpoint.last_page;
        run.metrics.duplicates_skipped = carried_count(&checkpoint, DUPLICATES_KEY);
        run.metrics.records_without_id = carried_count(&checkpoint, WITHOUT_ID_KEY);
        run.metrics.failed_requests =
            u32::try_from(carried_count(&checkpoint, FAILED_KEY)).unwrap_or(u32::MAX);

        info!(
            from_page = run.page,
            coins = run.records.len(),
            "resuming from checkpoint"
        );
        Ok(run)
    }

    fn save_progress(&self, date: &str, run: &RunState, fresh: &[Value]) -> Result<(), CollectError> {
        let Some(manager) = &self.checkpoints else {
            return Ok(());
        };
        manager.append_records(date, fresh)?;
        let checkpoint = Checkpoint::new(
            date,
            run.page,
            run.records.len() as u64,
            run.metrics.api_calls,
        )
        .with_metadata("status", "in_progress")
        .with_metadata(DUPLICATES_KEY, run.metrics.duplicates_skipped)
        .with_metadata(WITHOUT_ID_KEY, run.metrics.records_without_id)
        .with_metadata(FAILED_KEY, run.metrics.failed_requests);
        manager.save(&checkpoint)?;
        Ok(())
    }

    /// Fetches one page, applying the 429 cooldown and the retry policy.
    async fn fetch_with_retry(
        &self,
        page: u32,
        metrics: &mut CollectionMetrics,
    ) -> Result<Vec<Value>, AbortReason> {
        let mut attempt = 1;
        loop {
            let mut failure = match self.request(page, metrics).await? {
                Ok(records) => return Ok(records),
                Err(e) => e,
            };

            if classify_error(&failure) == FailureType::RateLimited {
                let cooldown = self.cooldown_for(&failure);
                warn!(
                    page,
                    cooldown_secs = cooldown.as_secs(),
                    "upstream rate limit (429), cooling down"
                );
                tokio::time::sleep(cooldown).await;
                failure = match self.request(page, metrics).await? {
                    Ok(records) => return Ok(records),
                    Err(e) => e,
                };
            }

            metrics.failed_requests += 1;
            let failure_type = classify_error(&failure);
            if failure_type == FailureType::TierLimited {
                error!(page, error = %failure, "tier limit reached, stopping without retry");
                return Err(AbortReason::TierLimit {
                    status: failure.status().unwrap_or(402),
                });
            }

            match self.retry.should_retry(failure_type, attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    warn!(
                        page,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %failure,
                        "page fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                RetryDecision::GiveUp { reason } => {
                    warn!(page, attempt, %reason, error = %failure, "page fetch failed");
                    return Err(if failure_type == FailureType::Permanent {
                        AbortReason::Permanent { source: failure }
                    } else {
                        AbortReason::RetriesExhausted {
                            attempts: attempt,
                            source: failure,
                        }
                    });
                }
            }
        }
    }

    /// One quota-checked request.
    async fn request(
        &self,
        page: u32,
        metrics: &mut CollectionMetrics,
    ) -> Result<Result<Vec<Value>, FetchError>, AbortReason> {
        self.limiter.acquire(true).await?;
        metrics.api_calls += 1;
        Ok(self.source.fetch_page(page).await)
    }

    /// Fixed cooldown, extended when the server asks for longer.
    fn cooldown_for(&self, failure: &FetchError) -> Duration {
        let requested = match failure {
            FetchError::HttpStatus {
                retry_after: Some(value),
                ..
            } => parse_retry_after(value),
            _ => None,
        };
        requested.map_or(self.config.rate_limit_cooldown, |d| {
            d.max(self.config.rate_limit_cooldown)
        })
    }

    fn abort(&self, date: &str, reason: AbortReason, mut run: RunState, started: Instant) -> CollectError {
        run.metrics.duration = started.elapsed();
        let checkpoint = self
            .checkpoints
            .as_ref()
            .and_then(|m| m.path_for(date).ok())
            .filter(|p| p.exists());

        error!(
            page = run.page,
            coins = run.records.len(),
            api_calls = run.metrics.api_calls,
            failed_requests = run.metrics.failed_requests,
            %reason,
            "collection aborted"
        );

        CollectError::Aborted {
            page: run.page,
            reason,
            partial: Box::new(PartialCollection {
                date: date.to_string(),
                records: run.records,
                metrics: run.metrics,
                checkpoint,
            }),
        }
    }

    fn finish(&self, date: &str, run: RunState) -> Result<PathBuf, CollectError> {
        let metrics = &run.metrics;
        let mut metadata = SnapshotMetadata::new(date, Utc::now());
        metadata.total_coins = run.records.len();
        metadata.api_calls = metrics.api_calls;
        metadata.duration_seconds = Some(metrics.duration.as_secs_f64());
        metadata.duplicates_skipped = metrics.duplicates_skipped;
        metadata.records_without_id = metrics.records_without_id;
        metadata.failed_requests = metrics.failed_requests;
        metadata.pages_fetched = metrics.pages_fetched;
        metadata.page_ceiling_reached = metrics.page_ceiling_reached;

        let snapshot = RawSnapshot {
            metadata,
            coins: run.records,
        };
        let path = snapshot.save(&self.config.output_dir)?;

        if let Some(manager) = &self.checkpoints {
            manager.delete(date)?;
        }

        info!(
            path = %path.display(),
            coins = snapshot.coins.len(),
            duplicates_skipped = metrics.duplicates_skipped,
            records_without_id = metrics.records_without_id,
            api_calls = metrics.api_calls,
            failed_requests = metrics.failed_requests,
            duration_secs = metrics.duration.as_secs_f64(),
            "collection complete"
        );
        Ok(path)
    }
}
