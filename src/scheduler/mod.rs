//! Background scheduler: three periodic jobs plus the one-shot reminder
//! job, each holding a named distributed lock for the duration of its
//! tick and retrying per-booking failures independently.

pub mod jobs;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::Utc;

use crate::clock::Clock;
use crate::effects::{self, EffectContext};
use crate::lock::DistributedLock;
use crate::ports::EmailPort;
use crate::state_machine::{self, Command};
use crate::store::BookingStore;
use crate::Error;

pub use jobs::{ClockSkewMonitor, JobFailureOutcome, RetryTracker};

/// Lock TTL headroom over expected tick runtime.
const JOB_LOCK_TTL: StdDuration = StdDuration::from_secs(600);

const JOB_EXPIRE_REQUESTS: &str = "expire_requests";
const JOB_START_SESSIONS: &str = "start_sessions";
const JOB_END_SESSIONS: &str = "end_sessions";
const JOB_SEND_REMINDERS: &str = "send_reminders";

/// Outcome of one job tick across its whole candidate set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub succeeded: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

/// Owns the periodic job registry and the state needed to run a tick:
/// the booking store, the distributed lock, a clock, and the
/// integration surface side-effect intents execute against.
pub struct Scheduler {
    booking_store: Arc<dyn BookingStore>,
    lock: Arc<dyn crate::lock::DistributedLock>,
    clock: Arc<dyn Clock>,
    effects: EffectContext,
    request_expiry_hours: i64,
    session_end_grace: chrono::Duration,
    reminder_lookahead: chrono::Duration,
    reminder_window: chrono::Duration,
    retries: RetryTracker,
    skew_monitor: ClockSkewMonitor,
    running: Mutex<HashSet<&'static str>>,
    reminded: Mutex<HashSet<i64>>,
}

impl Scheduler {
    pub fn new(
        booking_store: Arc<dyn BookingStore>,
        lock: Arc<dyn crate::lock::DistributedLock>,
        clock: Arc<dyn Clock>,
        effects: EffectContext,
        cfg: &crate::config::Config,
    ) -> Self {
        Self {
            booking_store,
            lock,
            clock,
            effects,
            request_expiry_hours: cfg.request_expiry_hours,
            session_end_grace: chrono::Duration::minutes(cfg.session_end_grace_minutes),
            reminder_lookahead: chrono::Duration::hours(24),
            reminder_window: chrono::Duration::minutes(5),
            retries: RetryTracker::new(StdDuration::from_secs(cfg.job_retry_base_seconds), cfg.job_max_retries),
            skew_monitor: ClockSkewMonitor::new(cfg.clock_skew_warning_threshold_seconds, StdDuration::from_secs(300)),
            running: Mutex::new(HashSet::new()),
            reminded: Mutex::new(HashSet::new()),
        }
    }

    /// `max-instances = 1` within this worker plus a named distributed
    /// lock across workers; returns `None` if either guard is already
    /// held, meaning this tick is skipped rather than queued.
    async fn with_job_guard<F, Fut>(&self, name: &'static str, run: F) -> Option<TickReport>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = TickReport>,
    {
        {
            let mut running = self.running.lock().unwrap();
            if running.contains(name) {
                tracing::debug!(job = name, "previous tick still in flight, skipping");
                return None;
            }
            running.insert(name);
        }

        let handle = self.lock.acquire(name, JOB_LOCK_TTL).await;
        let report = match handle {
            Some(handle) => {
                let report = run().await;
                self.lock.release(&handle).await;
                Some(report)
            }
            None => {
                tracing::debug!(job = name, "another worker holds the job lock");
                None
            }
        };

        self.running.lock().unwrap().remove(name);
        report
    }

    fn check_clock_skew(&self) {
        // The store's clock stands in for a real database server's
        // `SELECT now()`; this worker's view is `self.clock`, which in
        // tests may be a `FixedClock` deliberately pinned away from it.
        self.skew_monitor.check(self.clock.now(), Utc::now());
    }

    pub async fn tick_expire_requests(&self) -> Option<TickReport> {
        self.with_job_guard(JOB_EXPIRE_REQUESTS, || async {
            self.check_clock_skew();
            let cutoff = self.clock.now() - chrono::Duration::hours(self.request_expiry_hours);
            let candidates = self.booking_store.pending_for_expiry(cutoff).await;
            self.run_per_booking(JOB_EXPIRE_REQUESTS, candidates.into_iter().map(|b| b.id), |id| {
                self.expire_one(id)
            })
            .await
        })
        .await
    }

    pub async fn tick_start_sessions(&self) -> Option<TickReport> {
        self.with_job_guard(JOB_START_SESSIONS, || async {
            self.check_clock_skew();
            let now = self.clock.now();
            let candidates = self.booking_store.scheduled_ready_to_start(now).await;
            self.run_per_booking(JOB_START_SESSIONS, candidates.into_iter().map(|b| b.id), |id| {
                self.start_session_one(id)
            })
            .await
        })
        .await
    }

    pub async fn tick_end_sessions(&self) -> Option<TickReport> {
        self.with_job_guard(JOB_END_SESSIONS, || async {
            self.check_clock_skew();
            let now = self.clock.now();
            let candidates = self.booking_store.active_past_end(now, self.session_end_grace).await;
            self.run_per_booking(JOB_END_SESSIONS, candidates.into_iter().map(|b| b.id), |id| {
                self.end_session_one(id)
            })
            .await
        })
        .await
    }

    /// Sweeps for SCHEDULED bookings entering the reminder lookahead
    /// window and fires the one-shot `send_reminder` job for each,
    /// deduped so a booking is reminded at most once.
    pub async fn tick_send_reminders(&self) -> Option<TickReport> {
        self.with_job_guard(JOB_SEND_REMINDERS, || async {
            let at = self.clock.now() + self.reminder_lookahead;
            let candidates = self.booking_store.scheduled_for_reminder_at(at, self.reminder_window).await;
            let mut report = TickReport::default();
            for booking in candidates {
                if self.reminded.lock().unwrap().contains(&booking.id) {
                    continue;
                }
                match self.send_reminder(booking.id).await {
                    Ok(()) => {
                        self.reminded.lock().unwrap().insert(booking.id);
                        report.succeeded += 1;
                    }
                    Err(err) => {
                        tracing::warn!(booking_id = booking.id, error = %err, "send_reminder failed");
                        report.failed += 1;
                    }
                }
            }
            report
        })
        .await
    }

    /// One-shot job: send a single reminder for `booking_id`, independent
    /// of the periodic sweep.
    pub async fn send_reminder(&self, booking_id: i64) -> crate::Result<()> {
        let booking = self
            .booking_store
            .get_by_id(booking_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("booking {booking_id}")))?;
        self.effects
            .email
            .send_reminder(booking_id, &effects::student_email(&booking))
            .await;
        Ok(())
    }

    async fn run_per_booking<I, F, Fut>(&self, job: &'static str, ids: I, f: F) -> TickReport
    where
        I: IntoIterator<Item = i64>,
        F: Fn(i64) -> Fut,
        Fut: std::future::Future<Output = crate::Result<()>>,
    {
        let mut report = TickReport::default();
        for booking_id in ids {
            if !self.retries.is_eligible(job, booking_id) {
                continue;
            }
            match f(booking_id).await {
                Ok(()) => {
                    self.retries.record_success(job, booking_id);
                    report.succeeded += 1;
                }
                Err(err) => {
                    tracing::warn!(job, booking_id, error = %err, "job failed for booking");
                    match self.retries.record_failure(job, booking_id) {
                        JobFailureOutcome::DeadLettered => report.dead_lettered += 1,
                        JobFailureOutcome::Scheduled { .. } => report.failed += 1,
                    }
                }
            }
        }
        report
    }

    async fn expire_one(&self, booking_id: i64) -> crate::Result<()> {
        let Some((booking, row_lock)) = self.booking_store.get_with_lock(booking_id).await else {
            return Err(Error::NotFound(format!("booking {booking_id}")));
        };
        let command = Command::Expire { request_expiry_hours: self.request_expiry_hours };
        let transition = state_machine::transition(&booking, command, self.clock.as_ref())?;
        let updated = self.booking_store.update(transition.booking.clone(), booking.version).await?;
        drop(row_lock);
        effects::execute_intents(&self.effects, &updated, &transition.intents).await;
        Ok(())
    }

    async fn start_session_one(&self, booking_id: i64) -> crate::Result<()> {
        let Some((booking, row_lock)) = self.booking_store.get_with_lock(booking_id).await else {
            return Err(Error::NotFound(format!("booking {booking_id}")));
        };
        let transition = state_machine::transition(&booking, Command::StartSession, self.clock.as_ref())?;
        let updated = self.booking_store.update(transition.booking.clone(), booking.version).await?;
        drop(row_lock);
        effects::execute_intents(&self.effects, &updated, &transition.intents).await;
        Ok(())
    }

    async fn end_session_one(&self, booking_id: i64) -> crate::Result<()> {
        let Some((booking, row_lock)) = self.booking_store.get_with_lock(booking_id).await else {
            return Err(Error::NotFound(format!("booking {booking_id}")));
        };
        let command = Command::EndSession { outcome: None, manual: false, grace: self.session_end_grace };
        let transition = state_machine::transition(&booking, command, self.clock.as_ref())?;
        let updated = self.booking_store.update(transition.booking.clone(), booking.version).await?;
        drop(row_lock);
        effects::execute_intents(&self.effects, &updated, &transition.intents).await;
        Ok(())
    }
}
