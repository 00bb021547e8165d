//! Availability slots, blackouts, and prepaid packages.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-tutor recurring availability window. Used only by the conflict
/// check; not a mutable entity during booking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilitySlot {
    pub tutor_id: i64,
    /// 0 = Monday .. 6 = Sunday.
    pub day_of_week: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub timezone: String,
}

/// A one-off period during which a tutor is unavailable regardless of
/// their recurring [`AvailabilitySlot`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blackout {
    pub tutor_id: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Prepaid bundle of sessions bound to a student-tutor pair, with an
/// expiry and a remaining-session counter that decrements atomically
/// when a session reaches `Ended`/`Completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub id: i64,
    pub student_id: i64,
    pub tutor_id: i64,
    pub total_sessions: u32,
    pub remaining_sessions: u32,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Package {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn has_remaining_sessions(&self) -> bool {
        self.remaining_sessions > 0
    }

    /// Decrement the remaining-session counter. Returns `false` (no-op)
    /// if already exhausted, matching the store-level atomic decrement
    /// contract: never goes negative.
    pub fn consume_one(&mut self) -> bool {
        if self.remaining_sessions == 0 {
            return false;
        }
        self.remaining_sessions -= 1;
        true
    }
}
