//! Per-job retry/dead-letter bookkeeping and the clock-skew monitor.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Outcome of [`RetryTracker::record_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFailureOutcome {
    Scheduled { next_attempt_in: Duration },
    DeadLettered,
}

struct RetryState {
    attempts: u32,
    retry_after: Instant,
}

/// Exponential backoff (base × 2^attempt) with a dead-letter floor,
/// scoped per `(job name, booking id)` so one booking's failures never
/// throttle another's retries within the same job.
pub struct RetryTracker {
    base: Duration,
    max_retries: u32,
    state: Mutex<HashMap<(&'static str, i64), RetryState>>,
    dead_letter: Mutex<HashSet<(&'static str, i64)>>,
}

impl RetryTracker {
    pub fn new(base: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max_retries,
            state: Mutex::new(HashMap::new()),
            dead_letter: Mutex::new(HashSet::new()),
        }
    }

    /// `false` while the item is still backing off, or once dead-lettered.
    pub fn is_eligible(&self, job: &'static str, booking_id: i64) -> bool {
        if self.dead_letter.lock().unwrap().contains(&(job, booking_id)) {
            return false;
        }
        match self.state.lock().unwrap().get(&(job, booking_id)) {
            Some(s) => Instant::now() >= s.retry_after,
            None => true,
        }
    }

    pub fn record_success(&self, job: &'static str, booking_id: i64) {
        self.state.lock().unwrap().remove(&(job, booking_id));
    }

    pub fn record_failure(&self, job: &'static str, booking_id: i64) -> JobFailureOutcome {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .entry((job, booking_id))
            .or_insert(RetryState { attempts: 0, retry_after: Instant::now() });
        entry.attempts += 1;

        if entry.attempts > self.max_retries {
            state.remove(&(job, booking_id));
            drop(state);
            self.dead_letter.lock().unwrap().insert((job, booking_id));
            tracing::error!(job, booking_id, "job dead-lettered after exhausting retries");
            return JobFailureOutcome::DeadLettered;
        }

        let delay = self.base * 2u32.pow(entry.attempts - 1);
        entry.retry_after = Instant::now() + delay;
        JobFailureOutcome::Scheduled { next_attempt_in: delay }
    }

    pub fn is_dead_lettered(&self, job: &'static str, booking_id: i64) -> bool {
        self.dead_letter.lock().unwrap().contains(&(job, booking_id))
    }
}

/// Warns when the app's clock and the database's clock drift apart by
/// more than `threshold`, rate-limited to once per `check_interval` so a
/// sustained skew doesn't spam the log on every tick.
pub struct ClockSkewMonitor {
    threshold: chrono::Duration,
    check_interval: Duration,
    last_warned_at: Mutex<Option<Instant>>,
}

impl ClockSkewMonitor {
    pub fn new(threshold_seconds: i64, check_interval: Duration) -> Self {
        Self {
            threshold: chrono::Duration::seconds(threshold_seconds),
            check_interval,
            last_warned_at: Mutex::new(None),
        }
    }

    /// Compare the app's view of "now" against a caller-supplied store
    /// time, logging a rate-limited warning if they've drifted apart
    /// past the configured threshold.
    pub fn check(&self, app_time: DateTime<Utc>, store_time: DateTime<Utc>) {
        let skew = if app_time >= store_time {
            app_time - store_time
        } else {
            store_time - app_time
        };
        if skew <= self.threshold {
            return;
        }

        let mut last_warned_at = self.last_warned_at.lock().unwrap();
        let now = Instant::now();
        if let Some(prev) = *last_warned_at {
            if now.duration_since(prev) < self.check_interval {
                return;
            }
        }

        tracing::warn!(skew_seconds = skew.num_seconds(), "app/store clock skew exceeds threshold");
        *last_warned_at = Some(now);
    }
}
