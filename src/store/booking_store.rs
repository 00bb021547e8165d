//! Booking persistence contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::domain::booking::Booking;
use crate::domain::status::SessionState;
use crate::{Error, Result};

/// Proof that the row for a given booking id is exclusively held for
/// the lifetime of the enclosing transaction — the in-memory analogue
/// of a `SELECT … FOR UPDATE` row lock. Dropping it releases the row.
pub struct RowLock {
    pub booking_id: i64,
    _guard: OwnedMutexGuard<()>,
}

/// Durable persistence of bookings with optimistic-lock updates,
/// row-level lock acquisition, and the time-overlap query the conflict
/// check depends on.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn get_by_id(&self, id: i64) -> Option<Booking>;

    /// Acquire an exclusive row lock held for the lifetime of the
    /// enclosing transaction. Readers without the lock still see the
    /// pre-transaction value until [`BookingStore::update`] commits.
    async fn get_with_lock(&self, id: i64) -> Option<(Booking, RowLock)>;

    /// Assigns an id; fails with [`Error::Conflict`] if a conflicting
    /// window exists for the same tutor.
    async fn create(&self, booking: Booking) -> Result<Booking>;

    /// Atomic compare-and-swap on `version`. Fails with
    /// [`Error::OptimisticLockConflict`] on mismatch.
    async fn update(&self, booking: Booking, expected_version: i64) -> Result<Booking>;

    /// `true` iff any non-terminal booking for `tutor_id` overlaps
    /// `[start, end)`, excluding `exclude_id` if given. Must be called
    /// inside the same transaction as the subsequent insert/update to
    /// prevent a time-of-check/time-of-use race against a concurrent
    /// insert for the same tutor.
    async fn time_conflict_exists(
        &self,
        tutor_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude_id: Option<i64>,
    ) -> bool;

    /// REQUESTED bookings created before `cutoff`, for the `expire_requests` job.
    async fn pending_for_expiry(&self, cutoff: DateTime<Utc>) -> Vec<Booking>;

    /// SCHEDULED bookings with `start <= now`, for the `start_sessions` job.
    async fn scheduled_ready_to_start(&self, now: DateTime<Utc>) -> Vec<Booking>;

    /// ACTIVE bookings with `end + grace <= now`, for the `end_sessions` job.
    async fn active_past_end(&self, now: DateTime<Utc>, grace: Duration) -> Vec<Booking>;

    /// SCHEDULED bookings whose `start` falls in `[at, at + window)`, for
    /// the one-shot `send_reminder` job.
    async fn scheduled_for_reminder_at(&self, at: DateTime<Utc>, window: Duration) -> Vec<Booking>;
}

#[derive(Default)]
pub struct InMemoryBookingStore {
    bookings: RwLock<HashMap<i64, Booking>>,
    row_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
    next_id: AtomicI64,
}

impl InMemoryBookingStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn row_lock_for(&self, id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.row_locks.lock().await;
        locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    fn overlap_exists(
        bookings: &HashMap<i64, Booking>,
        tutor_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude_id: Option<i64>,
    ) -> bool {
        bookings.values().any(|b| {
            b.tutor_id == tutor_id
                && Some(b.id) != exclude_id
                && b.is_non_terminal()
                && b.overlaps(start, end)
        })
    }
}

#[async_trait]
impl BookingStore for InMemoryBookingStore {
    async fn get_by_id(&self, id: i64) -> Option<Booking> {
        self.bookings.read().await.get(&id).cloned()
    }

    async fn get_with_lock(&self, id: i64) -> Option<(Booking, RowLock)> {
        let row_lock = self.row_lock_for(id).await;
        let guard = row_lock.lock_owned().await;

        let booking = self.bookings.read().await.get(&id).cloned()?;
        Some((booking, RowLock { booking_id: id, _guard: guard }))
    }

    async fn create(&self, mut booking: Booking) -> Result<Booking> {
        let mut bookings = self.bookings.write().await;
        if Self::overlap_exists(&bookings, booking.tutor_id, booking.start, booking.end, None) {
            return Err(Error::Conflict(format!(
                "tutor {} already has a booking overlapping [{}, {})",
                booking.tutor_id, booking.start, booking.end
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        booking.id = id;
        bookings.insert(id, booking.clone());
        Ok(booking)
    }

    async fn update(&self, booking: Booking, expected_version: i64) -> Result<Booking> {
        let mut bookings = self.bookings.write().await;
        let current = bookings.get(&booking.id).ok_or_else(|| Error::NotFound(format!("booking {}", booking.id)))?;

        if current.version != expected_version {
            return Err(Error::OptimisticLockConflict {
                booking_id: booking.id,
                expected: expected_version,
                found: current.version,
            });
        }

        bookings.insert(booking.id, booking.clone());
        Ok(booking)
    }

    async fn time_conflict_exists(
        &self,
        tutor_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude_id: Option<i64>,
    ) -> bool {
        let bookings = self.bookings.read().await;
        Self::overlap_exists(&bookings, tutor_id, start, end, exclude_id)
    }

    async fn pending_for_expiry(&self, cutoff: DateTime<Utc>) -> Vec<Booking> {
        self.bookings
            .read()
            .await
            .values()
            .filter(|b| b.session_state == SessionState::Requested && b.created_at < cutoff)
            .cloned()
            .collect()
    }

    async fn scheduled_ready_to_start(&self, now: DateTime<Utc>) -> Vec<Booking> {
        self.bookings
            .read()
            .await
            .values()
            .filter(|b| b.session_state == SessionState::Scheduled && b.start <= now)
            .cloned()
            .collect()
    }

    async fn active_past_end(&self, now: DateTime<Utc>, grace: Duration) -> Vec<Booking> {
        self.bookings
            .read()
            .await
            .values()
            .filter(|b| b.session_state == SessionState::Active && b.end + grace <= now)
            .cloned()
            .collect()
    }

    async fn scheduled_for_reminder_at(&self, at: DateTime<Utc>, window: Duration) -> Vec<Booking> {
        self.bookings
            .read()
            .await
            .values()
            .filter(|b| b.session_state == SessionState::Scheduled && b.start >= at && b.start < at + window)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn booking(id: i64, tutor_id: i64, start_hour: u32, end_hour: u32) -> Booking {
        let now = Utc.with_ymd_and_hms(2030, 1, 10, 9, 0, 0).unwrap();
        let mut b = Booking::new_request(
            id,
            101,
            tutor_id,
            9001,
            Utc.with_ymd_and_hms(2030, 1, 15, start_hour, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2030, 1, 15, end_hour, 0, 0).unwrap(),
            "UTC".to_string(),
            5000,
            "USD".to_string(),
            500,
            now,
        );
        b.id = id;
        b
    }

    #[tokio::test]
    async fn create_rejects_overlapping_window_for_same_tutor() {
        let store = InMemoryBookingStore::new();
        store.create(booking(0, 202, 14, 15)).await.unwrap();

        let result = store.create(booking(0, 202, 14, 15)).await;
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn create_allows_back_to_back_and_different_tutor_bookings() {
        let store = InMemoryBookingStore::new();
        let first = store.create(booking(0, 202, 14, 15)).await.unwrap();
        assert_eq!(first.id, 1);

        // Back-to-back: new booking starts exactly when the first ends.
        let second = store.create(booking(0, 202, 15, 16)).await;
        assert!(second.is_ok());

        let other_tutor = store.create(booking(0, 303, 14, 15)).await;
        assert!(other_tutor.is_ok());
    }

    #[tokio::test]
    async fn update_rejects_stale_version() {
        let store = InMemoryBookingStore::new();
        let created = store.create(booking(0, 202, 14, 15)).await.unwrap();

        let mut updated = created.clone();
        updated.version += 1;
        let ok = store.update(updated.clone(), created.version).await;
        assert!(ok.is_ok());

        let mut stale = created;
        stale.version += 1;
        let result = store.update(stale, 1).await;
        assert!(matches!(result, Err(Error::OptimisticLockConflict { .. })));
    }

    #[tokio::test]
    async fn get_with_lock_serializes_concurrent_acquirers() {
        let store = Arc::new(InMemoryBookingStore::new());
        let created = store.create(booking(0, 202, 14, 15)).await.unwrap();

        let (booking_seen, _lock) = store.get_with_lock(created.id).await.unwrap();
        assert_eq!(booking_seen.id, created.id);

        let store2 = store.clone();
        let id = created.id;
        let handle = tokio::spawn(async move {
            let acquired_at = tokio::time::Instant::now();
            let _lock2 = store2.get_with_lock(id).await.unwrap();
            acquired_at.elapsed()
        });

        // Hold the first lock briefly before dropping it.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(_lock);

        let waited = handle.await.unwrap();
        assert!(waited >= std::time::Duration::from_millis(15));
    }
}
