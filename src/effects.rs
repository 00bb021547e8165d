//! Side-effect intent execution: turns the state
//! machine's declarative [`SideEffectIntent`] list into real calls
//! against the integration ports, payment ledger, and package store,
//! outside the transaction that committed the booking.
//!
//! Shared by [`crate::orchestrator`] and [`crate::scheduler`] so both
//! callers apply the same independently-idempotent execution and
//! failure-isolation rules: one intent failing never blocks the rest,
//! and nothing here rolls back the already-committed booking state.

use std::sync::Arc;

use crate::domain::booking::Booking;
use crate::domain::status::CancelledByRole;
use crate::events::{DomainEvent, DispatchMode, EventDispatcher};
use crate::ports::{CalendarPort, EmailPort, MeetingPort, MeetingResult};
use crate::state_machine::SideEffectIntent;
use crate::store::{PackageStore, PaymentLedger};

/// The integration surface [`execute_intents`] needs. Bundled so the
/// orchestrator and scheduler can each build one and pass it down
/// without threading five separate `Arc`s through every call site.
#[derive(Clone)]
pub struct EffectContext {
    pub meeting: Arc<dyn MeetingPort>,
    pub calendar: Arc<dyn CalendarPort>,
    pub email: Arc<dyn EmailPort>,
    pub payment_ledger: Arc<dyn PaymentLedger>,
    pub package_store: Arc<dyn PackageStore>,
    pub dispatcher: Arc<EventDispatcher>,
}

/// Results the caller must fold back into the booking via a follow-up
/// `update` — the state-carrying side effects (a newly created meeting
/// or calendar event) can't be known until after the intent runs, but
/// still belong on the booking row for later cancel/update calls.
#[derive(Debug, Clone, Default)]
pub struct EffectOutcome {
    pub meeting: Option<MeetingResult>,
    pub calendar_event_id: Option<String>,
    pub failures: Vec<(SideEffectIntent, String)>,
}

/// Placeholder address derivation: no user-directory port exists yet,
/// so notification intents target a deterministic address derived
/// from the id. A real deployment wires this to a directory service
/// instead.
pub(crate) fn student_email(booking: &Booking) -> String {
    format!("student-{}@example.test", booking.student_id)
}

pub(crate) fn tutor_email(booking: &Booking) -> String {
    format!("tutor-{}@example.test", booking.tutor_id)
}

/// Execute every intent in order, collecting state to fold back and
/// logging (not propagating) individual failures.
pub async fn execute_intents(
    ctx: &EffectContext,
    booking: &Booking,
    intents: &[SideEffectIntent],
) -> EffectOutcome {
    let mut outcome = EffectOutcome::default();
    for intent in intents {
        if let Err(reason) = execute_one(ctx, booking, intent, &mut outcome).await {
            tracing::warn!(
                booking_id = booking.id,
                intent = ?intent,
                error = %reason,
                "side-effect intent failed, left for the retry queue"
            );
            outcome.failures.push((intent.clone(), reason));
        }
    }
    outcome
}

async fn execute_one(
    ctx: &EffectContext,
    booking: &Booking,
    intent: &SideEffectIntent,
    outcome: &mut EffectOutcome,
) -> Result<(), String> {
    match intent {
        SideEffectIntent::CreateMeeting { booking_id } => {
            let result = ctx
                .meeting
                .create_meeting(
                    "Tutoring session",
                    booking.start,
                    booking.duration().num_minutes(),
                    Some(&tutor_email(booking)),
                    &[student_email(booking)],
                    *booking_id,
                )
                .await
                .map_err(|e| e.to_string())?;
            outcome.meeting = Some(result);
            Ok(())
        }
        SideEffectIntent::CreateCalendarEvent { booking_id } => {
            let result = ctx
                .calendar
                .create_event(booking.tutor_id, "Tutoring session", booking.start, booking.end, *booking_id)
                .await
                .map_err(|e| e.to_string())?;
            outcome.calendar_event_id = Some(result.event_id);
            Ok(())
        }
        SideEffectIntent::SendConfirmationEmail { booking_id } => {
            ctx.email.send_confirmation(*booking_id, &student_email(booking)).await;
            Ok(())
        }
        SideEffectIntent::SendDeclineEmail { booking_id } => {
            ctx.email.send_decline(*booking_id, &student_email(booking)).await;
            Ok(())
        }
        SideEffectIntent::CancelMeeting { meeting_id, .. } => {
            ctx.meeting.cancel_meeting(meeting_id).await.map_err(|e| e.to_string())
        }
        SideEffectIntent::CancelCalendarEvent { event_id, .. } => {
            ctx.calendar.delete_event(event_id).await.map_err(|e| e.to_string())
        }
        SideEffectIntent::SendCancellationEmail { booking_id } => {
            let to = match booking.cancelled_by {
                Some(CancelledByRole::Tutor) => student_email(booking),
                _ => tutor_email(booking),
            };
            ctx.email.send_cancellation(*booking_id, &to).await;
            Ok(())
        }
        SideEffectIntent::UpdateMeeting { meeting_id, .. } => {
            let result = ctx
                .meeting
                .update_meeting(meeting_id, None, Some(booking.start), Some(booking.duration().num_minutes()))
                .await
                .map_err(|e| e.to_string())?;
            outcome.meeting = Some(result);
            Ok(())
        }
        SideEffectIntent::UpdateCalendarEvent { event_id, .. } => {
            let result = ctx
                .calendar
                .update_event(event_id, None, Some(booking.start), Some(booking.end))
                .await
                .map_err(|e| e.to_string())?;
            outcome.calendar_event_id = Some(result.event_id);
            Ok(())
        }
        SideEffectIntent::SendRescheduleEmail { booking_id } => {
            ctx.email.send_reschedule(*booking_id, &student_email(booking)).await;
            ctx.email.send_reschedule(*booking_id, &tutor_email(booking)).await;
            Ok(())
        }
        SideEffectIntent::RefundPayment { booking_id, amount_cents, reason } => {
            let payment = ctx
                .payment_ledger
                .latest_payment_for_booking(*booking_id)
                .await
                .ok_or_else(|| format!("no payment on record for booking {booking_id}"))?;
            let external_refund_id = format!("refund:{booking_id}:{}", payment.id);
            let (refund, was_existing) = ctx
                .payment_ledger
                .record_refund(payment.id, *booking_id, &external_refund_id, *amount_cents, *reason)
                .await
                .map_err(|e| e.to_string())?;
            if !was_existing {
                ctx.dispatcher
                    .publish(
                        DomainEvent::RefundIssued {
                            booking_id: *booking_id,
                            refund_id: refund.id,
                            amount_cents: refund.amount_cents,
                            reason: refund.reason,
                        },
                        DispatchMode::Wait,
                    )
                    .await;
            }
            Ok(())
        }
        SideEffectIntent::ReleaseTutorPayout { booking_id, amount_cents } => {
            if *amount_cents > 0 {
                ctx.payment_ledger.wallet_add(booking.tutor_id, *amount_cents).await;
            }
            tracing::info!(booking_id, amount_cents, "tutor payout released");
            Ok(())
        }
        SideEffectIntent::HoldTutorPayout { booking_id } => {
            tracing::info!(booking_id, "tutor payout held pending dispute resolution");
            Ok(())
        }
        SideEffectIntent::ReleasePackageSession { package_id } => {
            if *package_id == 0 {
                return Ok(());
            }
            ctx.package_store.consume_one(*package_id).await.map_err(|e| e.to_string())?;
            Ok(())
        }
        SideEffectIntent::SendSessionStartedEvent { booking_id } => {
            ctx.dispatcher
                .publish(DomainEvent::SessionStarted { booking_id: *booking_id }, DispatchMode::Wait)
                .await;
            Ok(())
        }
        SideEffectIntent::SendSessionEndedEmail { booking_id } => {
            ctx.email.send_session_ended(*booking_id, &student_email(booking)).await;
            ctx.email.send_session_ended(*booking_id, &tutor_email(booking)).await;
            Ok(())
        }
        SideEffectIntent::SendReviewRequestEmail { booking_id } => {
            ctx.email.send_review_request(*booking_id, &student_email(booking)).await;
            Ok(())
        }
        SideEffectIntent::SendNoShowEmail { booking_id, party } => {
            let to = if *party == "student" { tutor_email(booking) } else { student_email(booking) };
            ctx.email.send_no_show(*booking_id, &to, party).await;
            Ok(())
        }
    }
}
