//! Retry classification and exponential backoff for page fetches.
//!
//! A failed fetch is classified into a [`FailureType`]:
//! - [`FailureType::Transient`]: timeouts, connection errors, non-2xx
//!   statuses and undecodable bodies; retried with backoff
//! - [`FailureType::RateLimited`]: HTTP 429; the collector sleeps a fixed
//!   cooldown and retries once before counting the attempt as failed
//! - [`FailureType::TierLimited`]: HTTP 402; the access tier does not cover
//!   the request, so the run stops immediately
//! - [`FailureType::Permanent`]: a malformed request URL
//!
//! [`RetryPolicy::should_retry`] turns a failure type and attempt number into
//! a [`RetryDecision`].

use std::time::{Duration, SystemTime};

use rand::Rng;
use tracing::{debug, instrument, warn};

use super::FetchError;

/// Default maximum attempts per page, including the first.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

const BASE_BACKOFF: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(32);
const BACKOFF_FACTOR: f64 = 2.0;

/// Jitter is drawn from `[0, delay * JITTER_FRACTION]`.
const JITTER_FRACTION: f64 = 0.25;

/// Upper bound honoured for a server `Retry-After`.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Classification of fetch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// May succeed on retry.
    Transient,

    /// Upstream per-minute throttling (HTTP 429).
    RateLimited,

    /// Request exceeds the access tier (HTTP 402). Never retried.
    TierLimited,

    /// Will not succeed regardless of retries.
    Permanent,
}

impl FailureType {
    fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited)
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep `delay`, then make attempt number `attempt`.
    Retry { delay: Duration, attempt: u32 },

    GiveUp { reason: String },
}

/// Exponential backoff: the sleep after failed attempt `n` is
/// `min(base * factor^(n-1), cap)` plus up to a quarter of that as jitter.
/// Defaults sleep about 1s and 2s between three attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    cap: Duration,
    factor: f64,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, BASE_BACKOFF, BACKOFF_CAP, BACKOFF_FACTOR)
    }
}

impl RetryPolicy {
    /// `max_attempts` counts the first request and is raised to at least 1.
    #[must_use]
    pub fn new(max_attempts: u32, base: Duration, cap: Duration, factor: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            cap,
            factor: factor.max(1.0),
            jitter: true,
        }
    }

    /// Default backoff with a custom attempt budget.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self::new(max_attempts, BASE_BACKOFF, BACKOFF_CAP, BACKOFF_FACTOR)
    }

    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides what follows failed attempt `attempt` (1-indexed).
    #[instrument(level = "debug", skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if !failure_type.is_retryable() {
            let what = if failure_type == FailureType::TierLimited {
                "request exceeds the access tier"
            } else {
                "request can never succeed"
            };
            return RetryDecision::GiveUp {
                reason: format!("{what}, not retrying"),
            };
        }
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("all {} attempts failed", self.max_attempts),
            };
        }

        let delay = self.backoff_for(attempt);
        debug!(delay_ms = delay.as_millis(), "scheduling retry");
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scale = self.factor.powi(exponent);
        let raw = if scale.is_finite() && scale < self.cap.as_secs_f64() / self.base.as_secs_f64() {
            self.base.mul_f64(scale)
        } else {
            self.cap
        };
        let delay = raw.min(self.cap);

        if self.jitter && !delay.is_zero() {
            let extra = rand::thread_rng().gen_range(0.0..=JITTER_FRACTION);
            delay + delay.mul_f64(extra)
        } else {
            delay
        }
    }
}

/// Maps a fetch error to its retry class. 402 and 429 are singled out; every
/// other status is transient, as are timeouts, network and decode failures.
#[must_use]
pub fn classify_error(error: &FetchError) -> FailureType {
    match error {
        FetchError::HttpStatus { status: 402, .. } => FailureType::TierLimited,
        FetchError::HttpStatus { status: 429, .. } => FailureType::RateLimited,
        FetchError::InvalidUrl { .. } => FailureType::Permanent,
        FetchError::HttpStatus { .. }
        | FetchError::Timeout { .. }
        | FetchError::Network { .. }
        | FetchError::Decode { .. } => FailureType::Transient,
    }
}

/// Reads a `Retry-After` header given as delta-seconds or an HTTP-date.
/// Dates in the past mean no wait; anything over an hour is clamped.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let value = header_value.trim();
    let requested = match value.parse::<u64>() {
        Ok(seconds) => Duration::from_secs(seconds),
        Err(_) => {
            let at = httpdate::parse_http_date(value)
                .map_err(|_| debug!(value, "ignoring unparseable Retry-After"))
                .ok()?;
            at.duration_since(SystemTime::now()).unwrap_or_default()
        }
    };

    if requested > MAX_RETRY_AFTER {
        warn!(
            requested_secs = requested.as_secs(),
            "Retry-After clamped to one hour"
        );
        return Some(MAX_RETRY_AFTER);
    }
    Some(requested)
}
