//! Meeting provider port: create/update/cancel a video-meeting room for
//! a booking.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use super::PortError;

/// Result of a meeting create/cancel/update call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingResult {
    pub meeting_id: String,
    pub join_url: String,
    pub host_url: Option<String>,
}

/// Abstracts away the specific provider (Zoom, Google Meet, Teams, a
/// platform-native room) behind one contract.
#[async_trait]
pub trait MeetingPort: Send + Sync {
    async fn create_meeting(
        &self,
        topic: &str,
        start: DateTime<Utc>,
        duration_minutes: i64,
        host_email: Option<&str>,
        attendee_emails: &[String],
        booking_id: i64,
    ) -> Result<MeetingResult, PortError>;

    async fn cancel_meeting(&self, meeting_id: &str) -> Result<(), PortError>;

    async fn update_meeting(
        &self,
        meeting_id: &str,
        topic: Option<&str>,
        start: Option<DateTime<Utc>>,
        duration_minutes: Option<i64>,
    ) -> Result<MeetingResult, PortError>;
}

struct Record {
    result: MeetingResult,
    cancelled: bool,
}

/// Deterministic in-memory fake: idempotent per `booking_id`, so a
/// retried `create_meeting` call returns the same join URL instead of
/// minting a second room.
#[derive(Default)]
pub struct InMemoryMeetingPort {
    by_booking: Mutex<HashMap<i64, Record>>,
    next_id: AtomicU64,
}

impl InMemoryMeetingPort {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MeetingPort for InMemoryMeetingPort {
    async fn create_meeting(
        &self,
        _topic: &str,
        _start: DateTime<Utc>,
        _duration_minutes: i64,
        _host_email: Option<&str>,
        _attendee_emails: &[String],
        booking_id: i64,
    ) -> Result<MeetingResult, PortError> {
        let mut by_booking = self.by_booking.lock().await;
        if let Some(existing) = by_booking.get(&booking_id) {
            return Ok(existing.result.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let result = MeetingResult {
            meeting_id: format!("mtg_{id}"),
            join_url: format!("https://meet.example.test/{id}"),
            host_url: Some(format!("https://meet.example.test/{id}/host")),
        };
        by_booking.insert(booking_id, Record { result: result.clone(), cancelled: false });
        Ok(result)
    }

    async fn cancel_meeting(&self, meeting_id: &str) -> Result<(), PortError> {
        let mut by_booking = self.by_booking.lock().await;
        if let Some(record) = by_booking.values_mut().find(|r| r.result.meeting_id == meeting_id) {
            record.cancelled = true;
            Ok(())
        } else {
            Err(PortError::Terminal(format!("unknown meeting {meeting_id}")))
        }
    }

    async fn update_meeting(
        &self,
        meeting_id: &str,
        _topic: Option<&str>,
        _start: Option<DateTime<Utc>>,
        _duration_minutes: Option<i64>,
    ) -> Result<MeetingResult, PortError> {
        let by_booking = self.by_booking.lock().await;
        by_booking
            .values()
            .find(|r| r.result.meeting_id == meeting_id)
            .map(|r| r.result.clone())
            .ok_or_else(|| PortError::Terminal(format!("unknown meeting {meeting_id}")))
    }
}
