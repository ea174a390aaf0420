//! Sliding-window and monthly quota enforcement for upstream requests.
//!
//! [`RateLimiter::acquire`] is called once before every request. It keeps two
//! counters:
//!
//! - a sliding window of request instants over the last 60 seconds, compared
//!   against `calls_per_minute`; a full window either waits for the oldest
//!   slot to expire (`blocking = true`) or refuses with
//!   [`QuotaError::MinuteExceeded`];
//! - a calendar-month counter compared against `calls_per_month`; once spent,
//!   every call is refused with [`QuotaError::MonthlyExceeded`] immediately,
//!   blocking or not.
//!
//! Window timing uses [`tokio::time::Instant`] so tests can drive it with
//! paused time. Month boundaries come from an injected [`Clock`].
//!
//! State is process-local. Two collector processes sharing one API key each
//! count only their own calls.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::QuotaError;

/// Default per-minute request limit.
pub const DEFAULT_CALLS_PER_MINUTE: u32 = 30;

/// Default monthly request limit.
pub const DEFAULT_CALLS_PER_MONTH: u32 = 10_000;

/// Default fraction of the monthly quota that triggers a warning.
pub const DEFAULT_WARN_THRESHOLD: f64 = 0.8;

const WINDOW: Duration = Duration::from_secs(60);

/// Slack added to computed waits so the oldest entry has definitely expired.
const WAIT_BUFFER: Duration = Duration::from_millis(100);

/// Wall-clock source used for month rollover.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// [`Clock`] backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Quota limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Requests allowed in any 60 s window.
    pub calls_per_minute: u32,
    /// Requests allowed per calendar month (UTC). Never exceeded.
    pub calls_per_month: u32,
    /// Monthly usage fraction in `0.0..=1.0` that triggers the one-time
    /// warning.
    pub warn_threshold: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            calls_per_minute: DEFAULT_CALLS_PER_MINUTE,
            calls_per_month: DEFAULT_CALLS_PER_MONTH,
            warn_threshold: DEFAULT_WARN_THRESHOLD,
        }
    }
}

/// Snapshot of current quota consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageReport {
    /// Requests inside the current 60 s window.
    pub minute_calls: u32,
    pub minute_limit: u32,
    /// Requests counted so far this month.
    pub month_calls: u32,
    pub month_limit: u32,
}

impl UsageReport {
    /// Requests left before the monthly hard stop.
    #[must_use]
    pub fn month_remaining(&self) -> u32 {
        self.month_limit.saturating_sub(self.month_calls)
    }
}

#[derive(Debug)]
struct QuotaState {
    window: VecDeque<Instant>,
    monthly_calls: u32,
    /// (year, month) the monthly counter belongs to.
    period: (i32, u32),
    warned: bool,
}

impl QuotaState {
    fn roll_period(&mut self, now: DateTime<Utc>) {
        let period = (now.year(), now.month());
        if period != self.period {
            info!(
                previous_calls = self.monthly_calls,
                year = period.0,
                month = period.1,
                "new month, resetting monthly quota"
            );
            self.period = period;
            self.monthly_calls = 0;
            self.warned = false;
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.window.front() {
            if now.duration_since(oldest) >= WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn window_len(&self) -> u32 {
        self.window.len() as u32
    }
}

/// Per-minute and monthly quota guard, shared via `Arc`.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<QuotaState>,
}

impl RateLimiter {
    /// Creates a limiter on the system clock.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a limiter reading month boundaries from `clock`.
    ///
    /// Limits of zero are raised to one.
    #[must_use]
    #[instrument(skip_all, fields(per_minute = config.calls_per_minute, per_month = config.calls_per_month))]
    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let config = RateLimitConfig {
            calls_per_minute: config.calls_per_minute.max(1),
            calls_per_month: config.calls_per_month.max(1),
            warn_threshold: config.warn_threshold.clamp(0.0, 1.0),
        };
        let now = clock.now();
        debug!("creating rate limiter");
        Self {
            config,
            clock,
            state: Mutex::new(QuotaState {
                window: VecDeque::new(),
                monthly_calls: 0,
                period: (now.year(), now.month()),
                warned: false,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Reserves quota for one request.
    ///
    /// # Errors
    ///
    /// [`QuotaError::MonthlyExceeded`] when the monthly quota is spent,
    /// regardless of `blocking`. [`QuotaError::MinuteExceeded`] when the
    /// window is full and `blocking` is false.
    #[instrument(skip(self))]
    pub async fn acquire(&self, blocking: bool) -> Result<(), QuotaError> {
        let mut state = self.state.lock().await;

        loop {
            state.roll_period(self.clock.now());
            if state.monthly_calls >= self.config.calls_per_month {
                return Err(QuotaError::MonthlyExceeded {
                    used: state.monthly_calls,
                    limit: self.config.calls_per_month,
                });
            }

            let now = Instant::now();
            state.prune(now);
            let Some(&oldest) = state.window.front() else {
                break;
            };
            if state.window_len() < self.config.calls_per_minute {
                break;
            }

            let wait = WINDOW.saturating_sub(now.duration_since(oldest)) + WAIT_BUFFER;
            if !blocking {
                return Err(QuotaError::MinuteExceeded {
                    used: state.window_len(),
                    limit: self.config.calls_per_minute,
                    retry_in: wait,
                });
            }

            info!(wait_ms = wait.as_millis(), "per-minute quota reached, waiting");
            tokio::time::sleep(wait).await;
        }

        state.window.push_back(Instant::now());
        state.monthly_calls += 1;
        self.maybe_warn(&mut state);
        Ok(())
    }

    /// Current minute and month consumption.
    pub async fn usage(&self) -> UsageReport {
        let mut state = self.state.lock().await;
        state.roll_period(self.clock.now());
        state.prune(Instant::now());
        UsageReport {
            minute_calls: state.window_len(),
            minute_limit: self.config.calls_per_minute,
            month_calls: state.monthly_calls,
            month_limit: self.config.calls_per_month,
        }
    }

    fn maybe_warn(&self, state: &mut QuotaState) {
        if state.warned {
            return;
        }
        let used = f64::from(state.monthly_calls);
        let limit = f64::from(self.config.calls_per_month);
        if used >= limit * self.config.warn_threshold {
            state.warned = true;
            warn!(
                used = state.monthly_calls,
                limit = self.config.calls_per_month,
                "monthly API quota usage at {:.0}%",
                used / limit * 100.0
            );
        }
    }
}
