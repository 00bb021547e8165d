//! Deterministic refund/payout sizing.
//!
//! Every function here is a pure function of (cancellation role,
//! time-to-session, payment state) — no I/O, called by the orchestrator
//! *before* it builds a [`crate::state_machine::Command`]: the state
//! machine produces intents, this module decides amounts.

use chrono::{DateTime, Duration, Utc};

use crate::domain::payment::RefundReason;
use crate::domain::status::{CancelledByRole, SessionOutcome};

/// Result of applying the refund policy: what the student gets back and
/// what the tutor is paid out, plus the reason code recorded on the
/// resulting [`crate::domain::payment::Refund`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundDecision {
    pub refund_amount_cents: i64,
    pub tutor_payout_cents: i64,
    pub reason: RefundReason,
}

/// Cancellation sizing.
///
/// - Tutor cancels a scheduled session: full refund regardless of timing.
/// - Student cancels `>= cutoff_hours` before start: full refund.
/// - Student cancels `< cutoff_hours` before start: no refund; tutor
///   receives the full payout minus the platform fee.
/// - Admin/system cancellations with no stated policy fall back to a
///   full refund, since the state machine only reaches this path for
///   admin-driven dispute resolutions, which carry their own explicit
///   amount via [`resolve_dispute`].
pub fn resolve_cancellation(
    by: CancelledByRole,
    now: DateTime<Utc>,
    session_start: DateTime<Utc>,
    amount_cents: i64,
    platform_fee_cents: i64,
    cutoff_hours: i64,
) -> RefundDecision {
    let payout_minus_fee = amount_cents - platform_fee_cents;

    match by {
        CancelledByRole::Tutor => RefundDecision {
            refund_amount_cents: amount_cents,
            tutor_payout_cents: 0,
            reason: RefundReason::CancelledByTutor,
        },
        CancelledByRole::Student => {
            if session_start - now >= Duration::hours(cutoff_hours) {
                RefundDecision {
                    refund_amount_cents: amount_cents,
                    tutor_payout_cents: 0,
                    reason: RefundReason::CancelledByStudentEarly,
                }
            } else {
                RefundDecision {
                    refund_amount_cents: 0,
                    tutor_payout_cents: payout_minus_fee,
                    reason: RefundReason::CancelledByStudentLate,
                }
            }
        }
        CancelledByRole::System | CancelledByRole::Admin => RefundDecision {
            refund_amount_cents: amount_cents,
            tutor_payout_cents: 0,
            reason: RefundReason::Admin,
        },
    }
}

/// No-show sizing: `NO_SHOW_STUDENT` keeps the payment,
/// `NO_SHOW_TUTOR` refunds it in full.
pub fn resolve_no_show(
    outcome: SessionOutcome,
    amount_cents: i64,
    platform_fee_cents: i64,
) -> RefundDecision {
    match outcome {
        SessionOutcome::NoShowStudent => RefundDecision {
            refund_amount_cents: 0,
            tutor_payout_cents: amount_cents - platform_fee_cents,
            reason: RefundReason::NotApplicable,
        },
        SessionOutcome::NoShowTutor => RefundDecision {
            refund_amount_cents: amount_cents,
            tutor_payout_cents: 0,
            reason: RefundReason::NoShowTutor,
        },
        SessionOutcome::Completed | SessionOutcome::Abandoned => RefundDecision {
            refund_amount_cents: 0,
            tutor_payout_cents: amount_cents - platform_fee_cents,
            reason: RefundReason::Admin,
        },
    }
}

/// Explicit admin resolution of an open dispute: the admin names the
/// refund amount directly; payout is whatever remains.
pub fn resolve_dispute(
    refund_amount_cents: i64,
    amount_cents: i64,
    platform_fee_cents: i64,
) -> RefundDecision {
    let refund = refund_amount_cents.clamp(0, amount_cents);
    RefundDecision {
        refund_amount_cents: refund,
        tutor_payout_cents: (amount_cents - platform_fee_cents - refund).max(0),
        reason: RefundReason::Admin,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn tutor_cancellation_is_always_full_refund() {
        let now = Utc.with_ymd_and_hms(2030, 1, 15, 13, 59, 0).unwrap();
        let start = Utc.with_ymd_and_hms(2030, 1, 15, 14, 0, 0).unwrap();
        let d = resolve_cancellation(CancelledByRole::Tutor, now, start, 5000, 500, 12);
        assert_eq!(d.refund_amount_cents, 5000);
        assert_eq!(d.tutor_payout_cents, 0);
        assert_eq!(d.reason, RefundReason::CancelledByTutor);
    }

    #[test]
    fn student_cancel_exactly_at_cutoff_is_full_refund() {
        // S3: cancel at 02:00 for a 14:00 start is exactly 12h before.
        let now = Utc.with_ymd_and_hms(2030, 1, 15, 2, 0, 0).unwrap();
        let start = Utc.with_ymd_and_hms(2030, 1, 15, 14, 0, 0).unwrap();
        let d = resolve_cancellation(CancelledByRole::Student, now, start, 5000, 500, 12);
        assert_eq!(d.refund_amount_cents, 5000);
        assert_eq!(d.reason, RefundReason::CancelledByStudentEarly);
    }

    #[test]
    fn student_cancel_inside_cutoff_forfeits_refund() {
        let now = Utc.with_ymd_and_hms(2030, 1, 15, 6, 0, 0).unwrap();
        let start = Utc.with_ymd_and_hms(2030, 1, 15, 14, 0, 0).unwrap();
        let d = resolve_cancellation(CancelledByRole::Student, now, start, 5000, 500, 12);
        assert_eq!(d.refund_amount_cents, 0);
        assert_eq!(d.tutor_payout_cents, 4500);
        assert_eq!(d.reason, RefundReason::CancelledByStudentLate);
    }

    #[test]
    fn no_show_student_pays_tutor_in_full_minus_fee() {
        let d = resolve_no_show(SessionOutcome::NoShowStudent, 5000, 500);
        assert_eq!(d.refund_amount_cents, 0);
        assert_eq!(d.tutor_payout_cents, 4500);
    }

    #[test]
    fn no_show_tutor_refunds_student_in_full() {
        let d = resolve_no_show(SessionOutcome::NoShowTutor, 5000, 500);
        assert_eq!(d.refund_amount_cents, 5000);
        assert_eq!(d.tutor_payout_cents, 0);
    }

    #[test]
    fn admin_dispute_resolution_clamps_to_payment_amount() {
        let d = resolve_dispute(10_000, 5000, 500);
        assert_eq!(d.refund_amount_cents, 5000);
        assert_eq!(d.tutor_payout_cents, 0);

        let partial = resolve_dispute(2000, 5000, 500);
        assert_eq!(partial.refund_amount_cents, 2000);
        assert_eq!(partial.tutor_payout_cents, 2500);
    }
}
