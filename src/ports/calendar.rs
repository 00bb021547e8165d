//! Calendar provider port: create/update/delete an external calendar
//! event and query freebusy for a user.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use super::PortError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarResult {
    pub event_id: String,
}

/// A busy interval returned by a freebusy query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Result of a freebusy query. `timed_out = true` means the conflict
/// check proceeds without external calendar data, per the caller's
/// 5-second wall-clock budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeBusyResult {
    pub busy: Vec<BusyInterval>,
    pub timed_out: bool,
}

#[async_trait]
pub trait CalendarPort: Send + Sync {
    async fn create_event(
        &self,
        user_id: i64,
        title: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        booking_id: i64,
    ) -> Result<CalendarResult, PortError>;

    async fn update_event(
        &self,
        event_id: &str,
        title: Option<&str>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<CalendarResult, PortError>;

    async fn delete_event(&self, event_id: &str) -> Result<(), PortError>;

    /// Hard-capped at 5s by the caller; on timeout the
    /// caller treats this as `FreeBusyResult { timed_out: true, .. }`
    /// rather than propagating an error, so availability degrades to
    /// internal-state-only rather than failing the whole request.
    async fn freebusy(
        &self,
        user_id: i64,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> Result<FreeBusyResult, PortError>;
}

struct Record {
    event_id: String,
    deleted: bool,
}

#[derive(Default)]
pub struct InMemoryCalendarPort {
    events: Mutex<HashMap<i64, Record>>,
    next_id: AtomicU64,
}

impl InMemoryCalendarPort {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CalendarPort for InMemoryCalendarPort {
    async fn create_event(
        &self,
        _user_id: i64,
        _title: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        booking_id: i64,
    ) -> Result<CalendarResult, PortError> {
        let mut events = self.events.lock().await;
        if let Some(existing) = events.get(&booking_id) {
            return Ok(CalendarResult { event_id: existing.event_id.clone() });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event_id = format!("evt_{id}");
        events.insert(booking_id, Record { event_id: event_id.clone(), deleted: false });
        Ok(CalendarResult { event_id })
    }

    async fn update_event(
        &self,
        event_id: &str,
        _title: Option<&str>,
        _start: Option<DateTime<Utc>>,
        _end: Option<DateTime<Utc>>,
    ) -> Result<CalendarResult, PortError> {
        let events = self.events.lock().await;
        if events.values().any(|r| r.event_id == event_id) {
            Ok(CalendarResult { event_id: event_id.to_string() })
        } else {
            Err(PortError::Terminal(format!("unknown event {event_id}")))
        }
    }

    async fn delete_event(&self, event_id: &str) -> Result<(), PortError> {
        let mut events = self.events.lock().await;
        if let Some(record) = events.values_mut().find(|r| r.event_id == event_id) {
            record.deleted = true;
            Ok(())
        } else {
            Err(PortError::Terminal(format!("unknown event {event_id}")))
        }
    }

    async fn freebusy(
        &self,
        _user_id: i64,
        _range_start: DateTime<Utc>,
        _range_end: DateTime<Utc>,
    ) -> Result<FreeBusyResult, PortError> {
        Ok(FreeBusyResult { busy: Vec::new(), timed_out: false })
    }
}
