//! Pure booking transition function.
//!
//! `transition` performs no I/O: every fact a precondition needs that
//! would otherwise require a database or clock read (a time conflict,
//! "now", a pre-computed refund amount) is supplied by the caller as
//! part of the [`Command`]. The state machine produces intents only;
//! [`crate::refund_policy`] is a pure function the orchestrator calls
//! *before* building a `Command` to decide amounts.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::domain::booking::Booking;
use crate::domain::payment::RefundReason;
use crate::domain::status::{CancelledByRole, DisputeState, PaymentState, SessionOutcome, SessionState};

/// Which party failed to show up, for [`Command::MarkNoShow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoShowParty {
    Student,
    Tutor,
}

/// Outcome of an admin dispute resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputeResolution {
    FavorStudent,
    FavorTutor,
}

/// A command applied to a booking. Every variant carries the external
/// facts its precondition needs — the function itself never reaches out
/// to a clock, store, or policy.
#[derive(Debug, Clone)]
pub enum Command {
    /// REQUESTED -> SCHEDULED. Precondition: `payment_state = Captured`
    /// (checked against the booking itself) and no time conflict.
    Approve { time_conflict: bool },

    /// REQUESTED -> CANCELLED, declined by the tutor before approval.
    Decline { reason: Option<String> },

    /// REQUESTED|SCHEDULED -> CANCELLED, or ACTIVE -> CANCELLED when
    /// `by = Admin`. `refund_amount_cents` is pre-computed by
    /// [`crate::refund_policy::resolve`] in the orchestrator.
    Cancel {
        by: CancelledByRole,
        reason: Option<String>,
        refund_amount_cents: Option<i64>,
        refund_reason: Option<RefundReason>,
    },

    /// REQUESTED -> EXPIRED. Precondition: `created_at` older than
    /// `request_expiry_hours`.
    Expire { request_expiry_hours: i64 },

    /// SCHEDULED -> ACTIVE. Precondition: `now >= start`.
    StartSession,

    /// ACTIVE -> ENDED. `manual = true` bypasses the `now >= end` check
    /// (a manual end can happen early); `outcome` defaults to
    /// `Completed` when omitted on a scheduler-driven end.
    EndSession {
        outcome: Option<SessionOutcome>,
        manual: bool,
        grace: Duration,
    },

    /// SCHEDULED -> SCHEDULED (timing fields only). Re-checks the
    /// conflict window; emits update intents instead of create intents.
    Reschedule {
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
        new_timezone: Option<String>,
        time_conflict: bool,
        min_session_duration_minutes: i64,
    },

    /// ACTIVE -> ENDED with a no-show outcome.
    MarkNoShow {
        party: NoShowParty,
        refund_amount_cents: Option<i64>,
        refund_reason: Option<RefundReason>,
    },

    /// dispute_state: NONE -> OPEN. Only meaningful once ENDED.
    OpenDispute { reason: String },

    /// dispute_state: OPEN -> RESOLVED_STUDENT | RESOLVED_TUTOR.
    ResolveDispute {
        resolution: DisputeResolution,
        admin_id: i64,
        refund_amount_cents: Option<i64>,
    },
}

/// Declarative record of an external action the orchestrator must later
/// attempt. Independently idempotent; failure to execute one does not
/// roll back the committed booking state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SideEffectIntent {
    CreateMeeting { booking_id: i64 },
    CreateCalendarEvent { booking_id: i64 },
    SendConfirmationEmail { booking_id: i64 },
    SendDeclineEmail { booking_id: i64 },
    CancelMeeting { booking_id: i64, meeting_id: String },
    CancelCalendarEvent { booking_id: i64, event_id: String },
    SendCancellationEmail { booking_id: i64 },
    UpdateMeeting { booking_id: i64, meeting_id: String },
    UpdateCalendarEvent { booking_id: i64, event_id: String },
    SendRescheduleEmail { booking_id: i64 },
    RefundPayment { booking_id: i64, amount_cents: i64, reason: RefundReason },
    ReleaseTutorPayout { booking_id: i64, amount_cents: i64 },
    HoldTutorPayout { booking_id: i64 },
    ReleasePackageSession { package_id: i64 },
    SendSessionStartedEvent { booking_id: i64 },
    SendSessionEndedEmail { booking_id: i64 },
    SendReviewRequestEmail { booking_id: i64 },
    SendNoShowEmail { booking_id: i64, party: &'static str },
}

/// Machine-readable rejection reason. Reserved for "command not
/// permitted right now" — invariant violations are a
/// [`crate::Error::Fatal`], not a `Rejection`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("booking is in terminal state {0:?}, no further transitions allowed")]
    Terminal(SessionState),

    #[error("expected session_state {expected:?}, found {actual:?}")]
    WrongState {
        expected: SessionState,
        actual: SessionState,
    },

    #[error("payment_state must be Captured to approve, found {0:?}")]
    PaymentNotCaptured(PaymentState),

    #[error("time conflict with another booking for this tutor")]
    TimeConflict,

    #[error("request is not yet old enough to expire")]
    NotYetExpired,

    #[error("session start time has not yet arrived")]
    NotYetStartTime,

    #[error("session end time (plus grace) has not yet arrived")]
    NotYetEndTime,

    #[error("invalid time window: start must be before end with the minimum duration")]
    InvalidWindow,

    #[error("only an admin may cancel an active session")]
    ActiveCancelRequiresAdmin,

    #[error("dispute is not open")]
    DisputeNotOpen,

    #[error("a dispute is already open")]
    DisputeAlreadyOpen,

    #[error("no-show may only be marked on an active session")]
    NoShowRequiresActiveSession,
}

/// The booking after a successful transition, plus the side-effect
/// intents the orchestrator must execute outside the transaction.
#[derive(Debug, Clone)]
pub struct Transition {
    pub booking: Booking,
    pub intents: Vec<SideEffectIntent>,
}

pub type TransitionResult = Result<Transition, Rejection>;

/// Apply `command` to `current`, returning an updated booking and its
/// side-effect intents, or a typed rejection. Never panics for any
/// (state, command) pair — totality over the full (state, command)
/// space is the first property its tests exercise.
pub fn transition(current: &Booking, command: Command, clock: &dyn Clock) -> TransitionResult {
    if current.session_state.is_terminal() {
        return Err(Rejection::Terminal(current.session_state));
    }

    match command {
        Command::Approve { time_conflict } => approve(current, time_conflict, clock),
        Command::Decline { reason } => decline(current, reason, clock),
        Command::Cancel {
            by,
            reason,
            refund_amount_cents,
            refund_reason,
        } => cancel(current, by, reason, refund_amount_cents, refund_reason, clock),
        Command::Expire { request_expiry_hours } => expire(current, request_expiry_hours, clock),
        Command::StartSession => start_session(current, clock),
        Command::EndSession {
            outcome,
            manual,
            grace,
        } => end_session(current, outcome, manual, grace, clock),
        Command::Reschedule {
            new_start,
            new_end,
            new_timezone,
            time_conflict,
            min_session_duration_minutes,
        } => reschedule(
            current,
            new_start,
            new_end,
            new_timezone,
            time_conflict,
            min_session_duration_minutes,
            clock,
        ),
        Command::MarkNoShow {
            party,
            refund_amount_cents,
            refund_reason,
        } => mark_no_show(current, party, refund_amount_cents, refund_reason, clock),
        Command::OpenDispute { reason } => open_dispute(current, reason, clock),
        Command::ResolveDispute {
            resolution,
            admin_id,
            refund_amount_cents,
        } => resolve_dispute(current, resolution, admin_id, refund_amount_cents, clock),
    }
}

fn bump(mut booking: Booking, now: DateTime<Utc>) -> Booking {
    booking.version += 1;
    booking.updated_at = now;
    booking
}

fn approve(current: &Booking, time_conflict: bool, clock: &dyn Clock) -> TransitionResult {
    if current.session_state != SessionState::Requested {
        return Err(Rejection::WrongState {
            expected: SessionState::Requested,
            actual: current.session_state,
        });
    }
    if current.payment_state != PaymentState::Captured {
        return Err(Rejection::PaymentNotCaptured(current.payment_state));
    }
    if time_conflict {
        return Err(Rejection::TimeConflict);
    }

    let now = clock.now();
    let mut booking = current.clone();
    booking.session_state = SessionState::Scheduled;
    booking.confirmed_at = Some(now);
    let booking = bump(booking, now);

    Ok(Transition {
        booking,
        intents: vec![
            SideEffectIntent::CreateMeeting { booking_id: current.id },
            SideEffectIntent::CreateCalendarEvent { booking_id: current.id },
            SideEffectIntent::SendConfirmationEmail { booking_id: current.id },
        ],
    })
}

fn decline(current: &Booking, reason: Option<String>, clock: &dyn Clock) -> TransitionResult {
    if current.session_state != SessionState::Requested {
        return Err(Rejection::WrongState {
            expected: SessionState::Requested,
            actual: current.session_state,
        });
    }

    let now = clock.now();
    let mut booking = current.clone();
    booking.session_state = SessionState::Cancelled;
    booking.cancelled_by = Some(CancelledByRole::Tutor);
    booking.cancellation_reason = reason;
    booking.cancelled_at = Some(now);
    let booking = bump(booking, now);

    Ok(Transition {
        booking,
        intents: vec![SideEffectIntent::SendDeclineEmail { booking_id: current.id }],
    })
}

fn cancel(
    current: &Booking,
    by: CancelledByRole,
    reason: Option<String>,
    refund_amount_cents: Option<i64>,
    refund_reason: Option<RefundReason>,
    clock: &dyn Clock,
) -> TransitionResult {
    match current.session_state {
        SessionState::Requested | SessionState::Scheduled => {}
        SessionState::Active if by == CancelledByRole::Admin => {}
        SessionState::Active => return Err(Rejection::ActiveCancelRequiresAdmin),
        other => return Err(Rejection::Terminal(other)),
    }

    let now = clock.now();
    let mut booking = current.clone();
    booking.session_state = SessionState::Cancelled;
    booking.cancelled_by = Some(by);
    booking.cancellation_reason = reason;
    booking.cancelled_at = Some(now);
    let booking = bump(booking, now);

    let mut intents = vec![SideEffectIntent::SendCancellationEmail { booking_id: current.id }];
    if let (Some(meeting_id), true) = (&current.meeting_id, current.session_state == SessionState::Scheduled) {
        intents.push(SideEffectIntent::CancelMeeting {
            booking_id: current.id,
            meeting_id: meeting_id.clone(),
        });
    }
    if let (Some(event_id), true) = (&current.calendar_event_id, current.session_state == SessionState::Scheduled) {
        intents.push(SideEffectIntent::CancelCalendarEvent {
            booking_id: current.id,
            event_id: event_id.clone(),
        });
    }
    if let (Some(amount), Some(reason)) = (refund_amount_cents, refund_reason) {
        if amount > 0 {
            intents.push(SideEffectIntent::RefundPayment {
                booking_id: current.id,
                amount_cents: amount,
                reason,
            });
        }
    }

    Ok(Transition { booking, intents })
}

fn expire(current: &Booking, request_expiry_hours: i64, clock: &dyn Clock) -> TransitionResult {
    if current.session_state != SessionState::Requested {
        return Err(Rejection::WrongState {
            expected: SessionState::Requested,
            actual: current.session_state,
        });
    }
    let now = clock.now();
    if now - current.created_at < Duration::hours(request_expiry_hours) {
        return Err(Rejection::NotYetExpired);
    }

    let mut booking = current.clone();
    booking.session_state = SessionState::Expired;
    let booking = bump(booking, now);

    Ok(Transition {
        booking,
        intents: vec![SideEffectIntent::SendDeclineEmail { booking_id: current.id }],
    })
}

fn start_session(current: &Booking, clock: &dyn Clock) -> TransitionResult {
    if current.session_state != SessionState::Scheduled {
        return Err(Rejection::WrongState {
            expected: SessionState::Scheduled,
            actual: current.session_state,
        });
    }
    let now = clock.now();
    if now < current.start {
        return Err(Rejection::NotYetStartTime);
    }

    let mut booking = current.clone();
    booking.session_state = SessionState::Active;
    let booking = bump(booking, now);

    Ok(Transition {
        booking,
        intents: vec![SideEffectIntent::SendSessionStartedEvent { booking_id: current.id }],
    })
}

fn end_session(
    current: &Booking,
    outcome: Option<SessionOutcome>,
    manual: bool,
    grace: Duration,
    clock: &dyn Clock,
) -> TransitionResult {
    if current.session_state != SessionState::Active {
        return Err(Rejection::WrongState {
            expected: SessionState::Active,
            actual: current.session_state,
        });
    }
    let now = clock.now();
    if !manual && now < current.end + grace {
        return Err(Rejection::NotYetEndTime);
    }

    let resolved_outcome = outcome.unwrap_or(SessionOutcome::Completed);

    let mut booking = current.clone();
    booking.session_state = SessionState::Ended;
    booking.session_outcome = Some(resolved_outcome);
    booking.ended_at = Some(now);
    let booking = bump(booking, now);

    let mut intents = vec![SideEffectIntent::SendSessionEndedEmail { booking_id: current.id }];
    if resolved_outcome == SessionOutcome::Completed {
        intents.push(SideEffectIntent::ReleasePackageSession {
            package_id: current.package_id.unwrap_or_default(),
        });
        intents.push(SideEffectIntent::SendReviewRequestEmail { booking_id: current.id });
    }

    Ok(Transition { booking, intents })
}

fn reschedule(
    current: &Booking,
    new_start: DateTime<Utc>,
    new_end: DateTime<Utc>,
    new_timezone: Option<String>,
    time_conflict: bool,
    min_session_duration_minutes: i64,
    clock: &dyn Clock,
) -> TransitionResult {
    if current.session_state != SessionState::Scheduled {
        return Err(Rejection::WrongState {
            expected: SessionState::Scheduled,
            actual: current.session_state,
        });
    }
    if new_start >= new_end || new_end - new_start < Duration::minutes(min_session_duration_minutes) {
        return Err(Rejection::InvalidWindow);
    }
    if time_conflict {
        return Err(Rejection::TimeConflict);
    }

    let mut booking = current.clone();
    booking.start = new_start;
    booking.end = new_end;
    if let Some(tz) = new_timezone {
        booking.timezone = tz;
    }
    let booking = bump(booking, clock.now());

    let mut intents = vec![SideEffectIntent::SendRescheduleEmail { booking_id: current.id }];
    if let Some(meeting_id) = &current.meeting_id {
        intents.push(SideEffectIntent::UpdateMeeting {
            booking_id: current.id,
            meeting_id: meeting_id.clone(),
        });
    }
    if let Some(event_id) = &current.calendar_event_id {
        intents.push(SideEffectIntent::UpdateCalendarEvent {
            booking_id: current.id,
            event_id: event_id.clone(),
        });
    }

    Ok(Transition { booking, intents })
}

fn mark_no_show(
    current: &Booking,
    party: NoShowParty,
    refund_amount_cents: Option<i64>,
    refund_reason: Option<RefundReason>,
    clock: &dyn Clock,
) -> TransitionResult {
    if current.session_state != SessionState::Active {
        return Err(Rejection::NoShowRequiresActiveSession);
    }
    let now = clock.now();
    let outcome = match party {
        NoShowParty::Student => SessionOutcome::NoShowStudent,
        NoShowParty::Tutor => SessionOutcome::NoShowTutor,
    };

    let mut booking = current.clone();
    booking.session_state = SessionState::Ended;
    booking.session_outcome = Some(outcome);
    booking.ended_at = Some(now);
    let booking = bump(booking, now);

    let party_label = match party {
        NoShowParty::Student => "student",
        NoShowParty::Tutor => "tutor",
    };
    let mut intents = vec![SideEffectIntent::SendNoShowEmail {
        booking_id: current.id,
        party: party_label,
    }];
    if let (Some(amount), Some(reason)) = (refund_amount_cents, refund_reason) {
        if amount > 0 {
            intents.push(SideEffectIntent::RefundPayment {
                booking_id: current.id,
                amount_cents: amount,
                reason,
            });
        }
    }

    Ok(Transition { booking, intents })
}

fn open_dispute(current: &Booking, reason: String, clock: &dyn Clock) -> TransitionResult {
    if current.session_state != SessionState::Ended {
        return Err(Rejection::WrongState {
            expected: SessionState::Ended,
            actual: current.session_state,
        });
    }
    if current.dispute_state != DisputeState::None {
        return Err(Rejection::DisputeAlreadyOpen);
    }

    let mut booking = current.clone();
    booking.dispute_state = DisputeState::Open;
    booking.cancellation_reason = Some(reason);
    let now = clock.now();
    let booking = bump(booking, now);

    Ok(Transition {
        booking,
        intents: vec![SideEffectIntent::HoldTutorPayout { booking_id: current.id }],
    })
}

fn resolve_dispute(
    current: &Booking,
    resolution: DisputeResolution,
    _admin_id: i64,
    refund_amount_cents: Option<i64>,
    clock: &dyn Clock,
) -> TransitionResult {
    if current.dispute_state != DisputeState::Open {
        return Err(Rejection::DisputeNotOpen);
    }

    let mut booking = current.clone();
    booking.dispute_state = match resolution {
        DisputeResolution::FavorStudent => DisputeState::ResolvedStudent,
        DisputeResolution::FavorTutor => DisputeState::ResolvedTutor,
    };
    let now = clock.now();
    let booking = bump(booking, now);

    let mut intents = Vec::new();
    match (resolution, refund_amount_cents) {
        (DisputeResolution::FavorStudent, Some(amount)) if amount > 0 => {
            intents.push(SideEffectIntent::RefundPayment {
                booking_id: current.id,
                amount_cents: amount,
                reason: RefundReason::Admin,
            });
        }
        (DisputeResolution::FavorTutor, _) => {
            let payout = current.amount_cents - current.platform_fee_cents;
            intents.push(SideEffectIntent::ReleaseTutorPayout {
                booking_id: current.id,
                amount_cents: payout,
            });
        }
        _ => {}
    }

    Ok(Transition { booking, intents })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::TimeZone;

    fn sample_at(state: SessionState, payment: PaymentState) -> Booking {
        let now = Utc.with_ymd_and_hms(2030, 1, 10, 9, 0, 0).unwrap();
        let mut b = Booking::new_request(
            1,
            101,
            202,
            9001,
            Utc.with_ymd_and_hms(2030, 1, 15, 14, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2030, 1, 15, 15, 0, 0).unwrap(),
            "UTC".to_string(),
            5000,
            "USD".to_string(),
            500,
            now,
        );
        b.session_state = state;
        b.payment_state = payment;
        b
    }

    #[test]
    fn totality_never_panics_for_any_state_command_pair() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2030, 1, 15, 14, 0, 0).unwrap());
        let states = [
            SessionState::Requested,
            SessionState::Scheduled,
            SessionState::Active,
            SessionState::Ended,
            SessionState::Cancelled,
            SessionState::Expired,
        ];
        for state in states {
            let b = sample_at(state, PaymentState::Captured);
            let _ = transition(&b, Command::Approve { time_conflict: false }, &clock);
            let _ = transition(&b, Command::StartSession, &clock);
            let _ = transition(
                &b,
                Command::EndSession {
                    outcome: None,
                    manual: false,
                    grace: Duration::minutes(5),
                },
                &clock,
            );
            let _ = transition(
                &b,
                Command::Cancel {
                    by: CancelledByRole::Student,
                    reason: None,
                    refund_amount_cents: None,
                    refund_reason: None,
                },
                &clock,
            );
        }
    }

    #[test]
    fn terminal_states_reject_every_command() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2030, 1, 15, 14, 0, 0).unwrap());
        for state in [SessionState::Ended, SessionState::Cancelled, SessionState::Expired] {
            let b = sample_at(state, PaymentState::Captured);
            let result = transition(&b, Command::StartSession, &clock);
            assert_eq!(result.unwrap_err(), Rejection::Terminal(state));
        }
    }

    #[test]
    fn approve_requires_captured_payment() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2030, 1, 10, 9, 0, 0).unwrap());
        let b = sample_at(SessionState::Requested, PaymentState::Pending);
        let result = transition(&b, Command::Approve { time_conflict: false }, &clock);
        assert_eq!(result.unwrap_err(), Rejection::PaymentNotCaptured(PaymentState::Pending));
    }

    #[test]
    fn approve_emits_meeting_calendar_email_in_order() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2030, 1, 10, 9, 0, 0).unwrap());
        let b = sample_at(SessionState::Requested, PaymentState::Captured);
        let t = transition(&b, Command::Approve { time_conflict: false }, &clock).unwrap();
        assert_eq!(t.booking.session_state, SessionState::Scheduled);
        assert_eq!(t.booking.version, b.version + 1);
        assert_eq!(
            t.intents,
            vec![
                SideEffectIntent::CreateMeeting { booking_id: b.id },
                SideEffectIntent::CreateCalendarEvent { booking_id: b.id },
                SideEffectIntent::SendConfirmationEmail { booking_id: b.id },
            ]
        );
    }

    #[test]
    fn approve_rejects_on_time_conflict() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2030, 1, 10, 9, 0, 0).unwrap());
        let b = sample_at(SessionState::Requested, PaymentState::Captured);
        let result = transition(&b, Command::Approve { time_conflict: true }, &clock);
        assert_eq!(result.unwrap_err(), Rejection::TimeConflict);
    }

    #[test]
    fn expire_requires_24_hours_elapsed() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2030, 1, 10, 10, 0, 0).unwrap());
        let b = sample_at(SessionState::Requested, PaymentState::Pending);
        let too_soon = transition(&b, Command::Expire { request_expiry_hours: 24 }, &clock);
        assert_eq!(too_soon.unwrap_err(), Rejection::NotYetExpired);

        clock.set(Utc.with_ymd_and_hms(2030, 1, 11, 9, 1, 0).unwrap());
        let expired = transition(&b, Command::Expire { request_expiry_hours: 24 }, &clock).unwrap();
        assert_eq!(expired.booking.session_state, SessionState::Expired);
    }

    #[test]
    fn start_session_waits_for_start_time() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2030, 1, 15, 13, 59, 0).unwrap());
        let b = sample_at(SessionState::Scheduled, PaymentState::Captured);
        let too_soon = transition(&b, Command::StartSession, &clock);
        assert_eq!(too_soon.unwrap_err(), Rejection::NotYetStartTime);

        clock.set(Utc.with_ymd_and_hms(2030, 1, 15, 14, 0, 30).unwrap());
        let started = transition(&b, Command::StartSession, &clock).unwrap();
        assert_eq!(started.booking.session_state, SessionState::Active);
    }

    #[test]
    fn end_session_defaults_to_completed_outcome() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2030, 1, 15, 15, 6, 0).unwrap());
        let b = sample_at(SessionState::Active, PaymentState::Captured);
        let t = transition(
            &b,
            Command::EndSession {
                outcome: None,
                manual: false,
                grace: Duration::minutes(5),
            },
            &clock,
        )
        .unwrap();
        assert_eq!(t.booking.session_outcome, Some(SessionOutcome::Completed));
        assert!(t.intents.contains(&SideEffectIntent::SendReviewRequestEmail { booking_id: b.id }));
    }

    #[test]
    fn end_session_before_grace_is_rejected_unless_manual() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2030, 1, 15, 15, 1, 0).unwrap());
        let b = sample_at(SessionState::Active, PaymentState::Captured);
        let rejected = transition(
            &b,
            Command::EndSession {
                outcome: None,
                manual: false,
                grace: Duration::minutes(5),
            },
            &clock,
        );
        assert_eq!(rejected.unwrap_err(), Rejection::NotYetEndTime);

        let manual = transition(
            &b,
            Command::EndSession {
                outcome: Some(SessionOutcome::Abandoned),
                manual: true,
                grace: Duration::minutes(5),
            },
            &clock,
        )
        .unwrap();
        assert_eq!(manual.booking.session_outcome, Some(SessionOutcome::Abandoned));
    }

    #[test]
    fn active_cancel_requires_admin() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2030, 1, 15, 14, 30, 0).unwrap());
        let b = sample_at(SessionState::Active, PaymentState::Captured);
        let rejected = transition(
            &b,
            Command::Cancel {
                by: CancelledByRole::Student,
                reason: None,
                refund_amount_cents: None,
                refund_reason: None,
            },
            &clock,
        );
        assert_eq!(rejected.unwrap_err(), Rejection::ActiveCancelRequiresAdmin);

        let admin_ok = transition(
            &b,
            Command::Cancel {
                by: CancelledByRole::Admin,
                reason: Some("dispute".into()),
                refund_amount_cents: None,
                refund_reason: None,
            },
            &clock,
        )
        .unwrap();
        assert_eq!(admin_ok.booking.session_state, SessionState::Cancelled);
    }

    #[test]
    fn cancel_with_refund_emits_refund_intent() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2030, 1, 15, 1, 0, 0).unwrap());
        let b = sample_at(SessionState::Scheduled, PaymentState::Captured);
        let t = transition(
            &b,
            Command::Cancel {
                by: CancelledByRole::Student,
                reason: Some("schedule conflict".into()),
                refund_amount_cents: Some(5000),
                refund_reason: Some(RefundReason::CancelledByStudentEarly),
            },
            &clock,
        )
        .unwrap();
        assert!(t.intents.iter().any(|i| matches!(
            i,
            SideEffectIntent::RefundPayment { amount_cents: 5000, .. }
        )));
        assert_eq!(t.booking.cancelled_by, Some(CancelledByRole::Student));
        assert!(t.booking.cancelled_at.is_some());
    }

    #[test]
    fn dispute_lifecycle_requires_ended_and_open_states() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2030, 1, 15, 16, 0, 0).unwrap());
        let mut ended = sample_at(SessionState::Ended, PaymentState::Captured);
        ended.session_outcome = Some(SessionOutcome::NoShowTutor);

        let opened = transition(&ended, Command::OpenDispute { reason: "no show".into() }, &clock).unwrap();
        assert_eq!(opened.booking.dispute_state, DisputeState::Open);

        let double_open = transition(&opened.booking, Command::OpenDispute { reason: "again".into() }, &clock);
        assert_eq!(double_open.unwrap_err(), Rejection::DisputeAlreadyOpen);

        let resolved = transition(
            &opened.booking,
            Command::ResolveDispute {
                resolution: DisputeResolution::FavorStudent,
                admin_id: 1,
                refund_amount_cents: Some(5000),
            },
            &clock,
        )
        .unwrap();
        assert_eq!(resolved.booking.dispute_state, DisputeState::ResolvedStudent);
        assert!(resolved
            .intents
            .iter()
            .any(|i| matches!(i, SideEffectIntent::RefundPayment { amount_cents: 5000, .. })));
    }

    #[test]
    fn mark_no_show_requires_active_state() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2030, 1, 15, 14, 30, 0).unwrap());
        let scheduled = sample_at(SessionState::Scheduled, PaymentState::Captured);
        let rejected = transition(
            &scheduled,
            Command::MarkNoShow {
                party: NoShowParty::Student,
                refund_amount_cents: None,
                refund_reason: None,
            },
            &clock,
        );
        assert_eq!(rejected.unwrap_err(), Rejection::NoShowRequiresActiveSession);

        let active = sample_at(SessionState::Active, PaymentState::Captured);
        let ended = transition(
            &active,
            Command::MarkNoShow {
                party: NoShowParty::Tutor,
                refund_amount_cents: Some(5000),
                refund_reason: Some(RefundReason::NoShowTutor),
            },
            &clock,
        )
        .unwrap();
        assert_eq!(ended.booking.session_state, SessionState::Ended);
        assert_eq!(ended.booking.session_outcome, Some(SessionOutcome::NoShowTutor));
    }

    #[test]
    fn reschedule_validates_window_and_conflict() {
        let b = sample_at(SessionState::Scheduled, PaymentState::Captured);
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2030, 1, 10, 9, 0, 0).unwrap());

        let bad_window = transition(
            &b,
            Command::Reschedule {
                new_start: b.start,
                new_end: b.start,
                new_timezone: None,
                time_conflict: false,
                min_session_duration_minutes: 30,
            },
            &clock,
        );
        assert_eq!(bad_window.unwrap_err(), Rejection::InvalidWindow);

        let conflict = transition(
            &b,
            Command::Reschedule {
                new_start: b.start + Duration::days(1),
                new_end: b.end + Duration::days(1),
                new_timezone: None,
                time_conflict: true,
                min_session_duration_minutes: 30,
            },
            &clock,
        );
        assert_eq!(conflict.unwrap_err(), Rejection::TimeConflict);

        let ok = transition(
            &b,
            Command::Reschedule {
                new_start: b.start + Duration::days(1),
                new_end: b.end + Duration::days(1),
                new_timezone: None,
                time_conflict: false,
                min_session_duration_minutes: 30,
            },
            &clock,
        )
        .unwrap();
        assert_eq!(ok.booking.start, b.start + Duration::days(1));
    }
}
