//! The central [`Booking`] entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::{CancelledByRole, DisputeState, PaymentState, SessionOutcome, SessionState};

/// One tutoring engagement, from proposal through its terminal state.
///
/// Mutated only by the [`crate::state_machine`] through the
/// [`crate::orchestrator::BookingOrchestrator`] or
/// [`crate::scheduler`]; never hard-deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: i64,
    /// Optimistic-concurrency counter; strictly increases on every
    /// persisted change.
    pub version: i64,

    pub student_id: i64,
    pub tutor_id: i64,
    pub tutor_profile_id: i64,

    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// IANA timezone name, for display and DST-correct rendering.
    pub timezone: String,

    pub session_state: SessionState,
    pub session_outcome: Option<SessionOutcome>,
    pub payment_state: PaymentState,
    pub dispute_state: DisputeState,

    pub amount_cents: i64,
    pub currency: String,
    pub platform_fee_cents: i64,

    /// Prepaid package this session is drawn from, if any.
    pub package_id: Option<i64>,

    pub meeting_id: Option<String>,
    pub meeting_join_url: Option<String>,
    pub calendar_event_id: Option<String>,
    pub checkout_session_id: Option<String>,
    pub payment_intent_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<CancelledByRole>,
}

impl Booking {
    /// A freshly requested booking, as created by the orchestrator on a
    /// student request.
    #[allow(clippy::too_many_arguments)]
    pub fn new_request(
        id: i64,
        student_id: i64,
        tutor_id: i64,
        tutor_profile_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        timezone: String,
        amount_cents: i64,
        currency: String,
        platform_fee_cents: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            version: 1,
            student_id,
            tutor_id,
            tutor_profile_id,
            start,
            end,
            timezone,
            session_state: SessionState::Requested,
            session_outcome: None,
            payment_state: PaymentState::Pending,
            dispute_state: DisputeState::None,
            amount_cents,
            currency,
            platform_fee_cents,
            package_id: None,
            meeting_id: None,
            meeting_join_url: None,
            calendar_event_id: None,
            checkout_session_id: None,
            payment_intent_id: None,
            created_at: now,
            updated_at: now,
            confirmed_at: None,
            cancelled_at: None,
            ended_at: None,
            cancellation_reason: None,
            cancelled_by: None,
        }
    }

    /// Duration of the booked window.
    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }

    /// Invariant: `start < end`, duration >= the configured minimum.
    pub fn has_valid_window(&self, min_duration_minutes: i64) -> bool {
        self.start < self.end
            && self.duration() >= chrono::Duration::minutes(min_duration_minutes)
    }

    /// Invariant 1: `session_outcome != None <=> session_state == Ended`.
    pub fn outcome_matches_state(&self) -> bool {
        self.session_outcome.is_some() == (self.session_state == SessionState::Ended)
    }

    /// Invariant 4: cancellation bookkeeping is set when cancelled.
    pub fn cancellation_bookkeeping_complete(&self) -> bool {
        if self.session_state != SessionState::Cancelled {
            return true;
        }
        self.cancelled_at.is_some() && self.cancelled_by.is_some()
    }

    /// Invariant 3: a captured/refunded payment state implies a
    /// successful Payment record exists — callers check this against the
    /// ledger; this just reports whether the invariant's state-side
    /// condition is active.
    pub fn requires_successful_payment_record(&self) -> bool {
        self.payment_state.implies_successful_payment()
    }

    pub fn is_non_terminal(&self) -> bool {
        !self.session_state.is_terminal()
    }

    /// Overlap predicate used by the conflict check:
    /// `existing.start < new.end AND existing.end > new.start`.
    pub fn overlaps(&self, other_start: DateTime<Utc>, other_end: DateTime<Utc>) -> bool {
        self.start < other_end && self.end > other_start
    }
}

/// Record of a booking status change, for audit/history (not itself part
/// of the optimistic-locking contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingStatusChange {
    pub booking_id: i64,
    pub from_state: SessionState,
    pub to_state: SessionState,
    pub changed_by_user_id: Option<i64>,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}
