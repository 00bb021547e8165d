//! The transactional composition point: fetches a booking under its row
//! lock, runs the pure state machine, persists with bounded optimistic
//! retry, then executes side-effect intents and publishes domain events
//! outside the transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::{Clock, IdempotencyKey};
use crate::domain::booking::Booking;
use crate::domain::status::{CancelledByRole, PaymentState, SessionOutcome};
use crate::effects::{self, EffectContext, EffectOutcome};
use crate::events::{DispatchMode, DomainEvent};
use crate::refund_policy;
use crate::state_machine::{self, Command, DisputeResolution, NoShowParty, SideEffectIntent};
use crate::store::BookingStore;
use crate::{Error, Result};

/// Fields needed to propose a new booking; mirrors
/// [`Booking::new_request`]'s parameters plus the optional package a
/// session is drawn from.
#[allow(clippy::too_many_arguments)]
pub struct NewBookingRequest {
    pub student_id: i64,
    pub tutor_id: i64,
    pub tutor_profile_id: i64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub timezone: String,
    pub amount_cents: i64,
    pub currency: String,
    pub platform_fee_cents: i64,
    pub package_id: Option<i64>,
}

/// The application service wiring the booking store, payment ledger,
/// integration ports, and event dispatcher around the pure state
/// machine.
pub struct BookingOrchestrator {
    booking_store: Arc<dyn BookingStore>,
    clock: Arc<dyn Clock>,
    effects: EffectContext,
    cancellation_cutoff_hours: i64,
    min_session_duration_minutes: i64,
}

impl BookingOrchestrator {
    pub fn new(
        booking_store: Arc<dyn BookingStore>,
        clock: Arc<dyn Clock>,
        effects: EffectContext,
        cfg: &crate::config::Config,
    ) -> Self {
        Self {
            booking_store,
            clock,
            effects,
            cancellation_cutoff_hours: cfg.cancellation_cutoff_hours,
            min_session_duration_minutes: cfg.min_session_duration_minutes,
        }
    }

    /// Student requests a session. No payment action happens here — the
    /// checkout session that produces `external_session_id` is created
    /// upstream by a payment-intent flow this crate doesn't implement;
    /// the ledger row is seeded so `approve_booking` has something to
    /// capture.
    pub async fn create_booking(&self, req: NewBookingRequest) -> Result<Booking> {
        let now = self.clock.now();
        let mut booking = Booking::new_request(
            0,
            req.student_id,
            req.tutor_id,
            req.tutor_profile_id,
            req.start,
            req.end,
            req.timezone,
            req.amount_cents,
            req.currency,
            req.platform_fee_cents,
            now,
        );
        booking.package_id = req.package_id;

        if !booking.has_valid_window(self.min_session_duration_minutes) {
            return Err(Error::Validation("booking window is below the minimum session duration".to_string()));
        }

        let created = self.booking_store.create(booking).await?;
        self.effects
            .payment_ledger
            .record_payment(created.id, &format!("cs_{}", created.id), created.amount_cents, &created.currency)
            .await;

        self.effects
            .dispatcher
            .publish(
                DomainEvent::BookingCreated {
                    booking_id: created.id,
                    student_id: created.student_id,
                    tutor_id: created.tutor_id,
                },
                DispatchMode::Wait,
            )
            .await;

        Ok(created)
    }

    /// Tutor approves a REQUESTED booking: capture payment idempotently,
    /// re-check the time conflict window, transition, persist, then run
    /// intents and publish `BookingConfirmed`.
    pub async fn approve_booking(&self, booking_id: i64) -> Result<Booking> {
        let mut attempts = 0;
        loop {
            let Some((booking, row_lock)) = self.booking_store.get_with_lock(booking_id).await else {
                return Err(Error::NotFound(format!("booking {booking_id}")));
            };

            let time_conflict = self
                .booking_store
                .time_conflict_exists(booking.tutor_id, booking.start, booking.end, Some(booking.id))
                .await;

            // Validate the transition against the booking as it stands
            // *before* touching the ledger — a terminal/wrong-state
            // booking is rejected here, up front, so a non-approvable
            // booking never gets its payment captured.
            let command = Command::Approve { time_conflict };
            let transition = match state_machine::transition(&booking, command.clone(), self.clock.as_ref()) {
                Ok(transition) => transition,
                Err(state_machine::Rejection::PaymentNotCaptured(_)) => {
                    let payment = match self.effects.payment_ledger.latest_payment_for_booking(booking.id).await {
                        Some(payment) => payment,
                        None => {
                            self.effects
                                .payment_ledger
                                .record_payment(booking.id, &format!("cs_{}", booking.id), booking.amount_cents, &booking.currency)
                                .await
                        }
                    };
                    let idempotency_key = IdempotencyKey::for_operation(booking.id, "approve");
                    self.effects.payment_ledger.capture(payment.id, idempotency_key.as_str()).await?;

                    let mut working = booking.clone();
                    working.payment_state = PaymentState::Captured;
                    state_machine::transition(&working, command, self.clock.as_ref())?
                }
                Err(rejection) => return Err(rejection.into()),
            };

            match self.booking_store.update(transition.booking.clone(), booking.version).await {
                Ok(updated) => {
                    drop(row_lock);
                    let outcome = effects::execute_intents(&self.effects, &updated, &transition.intents).await;
                    let updated = self.fold_effect_outcome(updated, outcome).await;
                    self.effects
                        .dispatcher
                        .publish(DomainEvent::BookingConfirmed { booking_id: updated.id }, DispatchMode::Wait)
                        .await;
                    return Ok(updated);
                }
                Err(Error::OptimisticLockConflict { .. }) if attempts < crate::MAX_OPTIMISTIC_RETRY => {
                    attempts += 1;
                    drop(row_lock);
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Tutor declines a REQUESTED booking before it is ever scheduled.
    pub async fn decline_booking(&self, booking_id: i64, reason: Option<String>) -> Result<Booking> {
        let mut attempts = 0;
        loop {
            let Some((booking, row_lock)) = self.booking_store.get_with_lock(booking_id).await else {
                return Err(Error::NotFound(format!("booking {booking_id}")));
            };

            let transition =
                state_machine::transition(&booking, Command::Decline { reason: reason.clone() }, self.clock.as_ref())?;

            match self.booking_store.update(transition.booking.clone(), booking.version).await {
                Ok(updated) => {
                    drop(row_lock);
                    effects::execute_intents(&self.effects, &updated, &transition.intents).await;
                    self.effects
                        .dispatcher
                        .publish(
                            DomainEvent::BookingCancelled { booking_id: updated.id, cancelled_by: CancelledByRole::Tutor },
                            DispatchMode::Wait,
                        )
                        .await;
                    return Ok(updated);
                }
                Err(Error::OptimisticLockConflict { .. }) if attempts < crate::MAX_OPTIMISTIC_RETRY => {
                    attempts += 1;
                    drop(row_lock);
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Cancel a REQUESTED or SCHEDULED booking (or an ACTIVE one, for
    /// `by = Admin`), sizing the refund per [`refund_policy::resolve_cancellation`]
    /// when a successful payment exists.
    pub async fn cancel_booking(&self, booking_id: i64, by: CancelledByRole, reason: Option<String>) -> Result<Booking> {
        let mut attempts = 0;
        loop {
            let Some((booking, row_lock)) = self.booking_store.get_with_lock(booking_id).await else {
                return Err(Error::NotFound(format!("booking {booking_id}")));
            };

            let (refund_amount_cents, refund_reason, tutor_payout_cents) = if booking.payment_state.implies_successful_payment()
            {
                let decision = refund_policy::resolve_cancellation(
                    by,
                    self.clock.now(),
                    booking.start,
                    booking.amount_cents,
                    booking.platform_fee_cents,
                    self.cancellation_cutoff_hours,
                );
                (Some(decision.refund_amount_cents), Some(decision.reason), decision.tutor_payout_cents)
            } else {
                (None, None, 0)
            };

            let command = Command::Cancel { by, reason: reason.clone(), refund_amount_cents, refund_reason };
            let transition = state_machine::transition(&booking, command, self.clock.as_ref())?;

            match self.booking_store.update(transition.booking.clone(), booking.version).await {
                Ok(updated) => {
                    drop(row_lock);
                    let mut intents = transition.intents.clone();
                    if tutor_payout_cents > 0 {
                        intents.push(SideEffectIntent::ReleaseTutorPayout { booking_id: updated.id, amount_cents: tutor_payout_cents });
                    }
                    effects::execute_intents(&self.effects, &updated, &intents).await;
                    self.effects
                        .dispatcher
                        .publish(DomainEvent::BookingCancelled { booking_id: updated.id, cancelled_by: by }, DispatchMode::Wait)
                        .await;
                    return Ok(updated);
                }
                Err(Error::OptimisticLockConflict { .. }) if attempts < crate::MAX_OPTIMISTIC_RETRY => {
                    attempts += 1;
                    drop(row_lock);
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Move a SCHEDULED booking to a new window, re-checking the
    /// conflict for the *new* time range.
    pub async fn reschedule_booking(
        &self,
        booking_id: i64,
        new_start: DateTime<Utc>,
        new_end: DateTime<Utc>,
        new_timezone: Option<String>,
    ) -> Result<Booking> {
        let mut attempts = 0;
        loop {
            let Some((booking, row_lock)) = self.booking_store.get_with_lock(booking_id).await else {
                return Err(Error::NotFound(format!("booking {booking_id}")));
            };

            let time_conflict = self
                .booking_store
                .time_conflict_exists(booking.tutor_id, new_start, new_end, Some(booking.id))
                .await;

            let command = Command::Reschedule {
                new_start,
                new_end,
                new_timezone: new_timezone.clone(),
                time_conflict,
                min_session_duration_minutes: self.min_session_duration_minutes,
            };
            let transition = state_machine::transition(&booking, command, self.clock.as_ref())?;

            match self.booking_store.update(transition.booking.clone(), booking.version).await {
                Ok(updated) => {
                    drop(row_lock);
                    let outcome = effects::execute_intents(&self.effects, &updated, &transition.intents).await;
                    let updated = self.fold_effect_outcome(updated, outcome).await;
                    return Ok(updated);
                }
                Err(Error::OptimisticLockConflict { .. }) if attempts < crate::MAX_OPTIMISTIC_RETRY => {
                    attempts += 1;
                    drop(row_lock);
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Mark one party absent from an ACTIVE session, sizing refund and
    /// payout per [`refund_policy::resolve_no_show`].
    pub async fn mark_no_show(&self, booking_id: i64, party: NoShowParty) -> Result<Booking> {
        let mut attempts = 0;
        loop {
            let Some((booking, row_lock)) = self.booking_store.get_with_lock(booking_id).await else {
                return Err(Error::NotFound(format!("booking {booking_id}")));
            };

            let outcome = match party {
                NoShowParty::Student => SessionOutcome::NoShowStudent,
                NoShowParty::Tutor => SessionOutcome::NoShowTutor,
            };
            let decision = refund_policy::resolve_no_show(outcome, booking.amount_cents, booking.platform_fee_cents);
            let (refund_amount_cents, refund_reason) = if decision.refund_amount_cents > 0 {
                (Some(decision.refund_amount_cents), Some(decision.reason))
            } else {
                (None, None)
            };

            let command = Command::MarkNoShow { party, refund_amount_cents, refund_reason };
            let transition = state_machine::transition(&booking, command, self.clock.as_ref())?;

            match self.booking_store.update(transition.booking.clone(), booking.version).await {
                Ok(updated) => {
                    drop(row_lock);
                    let mut intents = transition.intents.clone();
                    if decision.tutor_payout_cents > 0 {
                        intents.push(SideEffectIntent::ReleaseTutorPayout { booking_id: updated.id, amount_cents: decision.tutor_payout_cents });
                    }
                    effects::execute_intents(&self.effects, &updated, &intents).await;
                    self.effects
                        .dispatcher
                        .publish(DomainEvent::SessionEnded { booking_id: updated.id, outcome }, DispatchMode::Wait)
                        .await;
                    return Ok(updated);
                }
                Err(Error::OptimisticLockConflict { .. }) if attempts < crate::MAX_OPTIMISTIC_RETRY => {
                    attempts += 1;
                    drop(row_lock);
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Manually end an ACTIVE session ahead of its scheduled `end`
    /// (the scheduler drives the ordinary, time-triggered path).
    pub async fn end_session_manually(&self, booking_id: i64, outcome: Option<SessionOutcome>) -> Result<Booking> {
        let mut attempts = 0;
        loop {
            let Some((booking, row_lock)) = self.booking_store.get_with_lock(booking_id).await else {
                return Err(Error::NotFound(format!("booking {booking_id}")));
            };

            let command = Command::EndSession { outcome, manual: true, grace: chrono::Duration::zero() };
            let transition = state_machine::transition(&booking, command, self.clock.as_ref())?;

            match self.booking_store.update(transition.booking.clone(), booking.version).await {
                Ok(updated) => {
                    drop(row_lock);
                    effects::execute_intents(&self.effects, &updated, &transition.intents).await;
                    self.effects
                        .dispatcher
                        .publish(
                            DomainEvent::SessionEnded {
                                booking_id: updated.id,
                                outcome: updated.session_outcome.unwrap_or(SessionOutcome::Completed),
                            },
                            DispatchMode::Wait,
                        )
                        .await;
                    return Ok(updated);
                }
                Err(Error::OptimisticLockConflict { .. }) if attempts < crate::MAX_OPTIMISTIC_RETRY => {
                    attempts += 1;
                    drop(row_lock);
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn open_dispute(&self, booking_id: i64, reason: String) -> Result<Booking> {
        let mut attempts = 0;
        loop {
            let Some((booking, row_lock)) = self.booking_store.get_with_lock(booking_id).await else {
                return Err(Error::NotFound(format!("booking {booking_id}")));
            };

            let transition =
                state_machine::transition(&booking, Command::OpenDispute { reason: reason.clone() }, self.clock.as_ref())?;

            match self.booking_store.update(transition.booking.clone(), booking.version).await {
                Ok(updated) => {
                    drop(row_lock);
                    effects::execute_intents(&self.effects, &updated, &transition.intents).await;
                    return Ok(updated);
                }
                Err(Error::OptimisticLockConflict { .. }) if attempts < crate::MAX_OPTIMISTIC_RETRY => {
                    attempts += 1;
                    drop(row_lock);
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Admin resolves an open dispute, naming the refund amount
    /// directly; the remainder (after the platform fee) is released to
    /// the tutor when it favors them, per [`refund_policy::resolve_dispute`].
    pub async fn resolve_dispute(
        &self,
        booking_id: i64,
        resolution: DisputeResolution,
        admin_id: i64,
        refund_amount_cents: i64,
    ) -> Result<Booking> {
        let mut attempts = 0;
        loop {
            let Some((booking, row_lock)) = self.booking_store.get_with_lock(booking_id).await else {
                return Err(Error::NotFound(format!("booking {booking_id}")));
            };

            let command = Command::ResolveDispute { resolution, admin_id, refund_amount_cents: Some(refund_amount_cents) };
            let transition = state_machine::transition(&booking, command, self.clock.as_ref())?;

            match self.booking_store.update(transition.booking.clone(), booking.version).await {
                Ok(updated) => {
                    drop(row_lock);
                    let mut intents = transition.intents.clone();
                    if resolution == DisputeResolution::FavorStudent {
                        let decision =
                            refund_policy::resolve_dispute(refund_amount_cents, booking.amount_cents, booking.platform_fee_cents);
                        if decision.tutor_payout_cents > 0 {
                            intents.push(SideEffectIntent::ReleaseTutorPayout {
                                booking_id: updated.id,
                                amount_cents: decision.tutor_payout_cents,
                            });
                        }
                    }
                    effects::execute_intents(&self.effects, &updated, &intents).await;
                    return Ok(updated);
                }
                Err(Error::OptimisticLockConflict { .. }) if attempts < crate::MAX_OPTIMISTIC_RETRY => {
                    attempts += 1;
                    drop(row_lock);
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Fold a newly created meeting/calendar event id back onto the
    /// booking row with a best-effort follow-up update. Failure here is
    /// logged, not propagated — the booking's state transition already
    /// committed and must not be undone by an enrichment step.
    async fn fold_effect_outcome(&self, mut booking: Booking, outcome: EffectOutcome) -> Booking {
        if outcome.meeting.is_none() && outcome.calendar_event_id.is_none() {
            return booking;
        }
        if let Some(meeting) = &outcome.meeting {
            booking.meeting_id = Some(meeting.meeting_id.clone());
            booking.meeting_join_url = Some(meeting.join_url.clone());
        }
        if let Some(event_id) = &outcome.calendar_event_id {
            booking.calendar_event_id = Some(event_id.clone());
        }
        let expected_version = booking.version;
        booking.version += 1;
        booking.updated_at = self.clock.now();

        match self.booking_store.update(booking.clone(), expected_version).await {
            Ok(updated) => updated,
            Err(err) => {
                tracing::warn!(booking_id = booking.id, error = %err, "failed to persist integration ids, left for reconciliation");
                booking
            }
        }
    }
}
