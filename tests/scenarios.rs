//! End-to-end scenario tests, one module per scenario.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use booking_core::clock::FixedClock;
use booking_core::config::Config;
use booking_core::domain::status::{CancelledByRole, PaymentState, SessionState};
use booking_core::effects::EffectContext;
use booking_core::events::{DomainEvent, Envelope, EventDispatcher, EventHandler};
use booking_core::lock::InMemoryDistributedLock;
use booking_core::orchestrator::{BookingOrchestrator, NewBookingRequest};
use booking_core::ports::{InMemoryCalendarPort, InMemoryEmailPort, InMemoryMeetingPort};
use booking_core::scheduler::Scheduler;
use booking_core::store::{InMemoryBookingStore, InMemoryPackageStore, InMemoryPaymentLedger};
use booking_core::webhook::{FakeWebhookVerifier, IngestOutcome, WebhookIngress};
use booking_core::Error;
use chrono::{TimeZone, Utc};

/// Records every published event for inline assertion.
#[derive(Default)]
struct EventRecorder {
    events: Mutex<Vec<DomainEvent>>,
}

#[async_trait]
impl EventHandler for EventRecorder {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(envelope.event.clone());
        Ok(())
    }
}

struct Harness {
    booking_store: Arc<InMemoryBookingStore>,
    payment_ledger: Arc<InMemoryPaymentLedger>,
    recorder: Arc<EventRecorder>,
    clock: Arc<FixedClock>,
    orchestrator: BookingOrchestrator,
}

async fn harness(now: chrono::DateTime<Utc>) -> Harness {
    let booking_store = Arc::new(InMemoryBookingStore::new());
    let payment_ledger = Arc::new(InMemoryPaymentLedger::new());
    let recorder = Arc::new(EventRecorder::default());
    let dispatcher = Arc::new(EventDispatcher::new());
    for event_type in [
        "BookingCreated",
        "BookingConfirmed",
        "BookingCancelled",
        "SessionStarted",
        "SessionEnded",
        "RefundIssued",
    ] {
        dispatcher.register(event_type, recorder.clone(), 0).await;
    }

    let effects = EffectContext {
        meeting: Arc::new(InMemoryMeetingPort::new()),
        calendar: Arc::new(InMemoryCalendarPort::new()),
        email: Arc::new(InMemoryEmailPort::new()),
        payment_ledger: payment_ledger.clone(),
        package_store: Arc::new(InMemoryPackageStore::new()),
        dispatcher,
    };

    let clock = Arc::new(FixedClock::new(now));
    let orchestrator = BookingOrchestrator::new(booking_store.clone(), clock.clone(), effects, &Config::default());

    Harness { booking_store, payment_ledger, recorder, clock, orchestrator }
}

fn sample_request() -> NewBookingRequest {
    NewBookingRequest {
        student_id: 101,
        tutor_id: 202,
        tutor_profile_id: 9001,
        start: Utc.with_ymd_and_hms(2030, 1, 15, 14, 0, 0).unwrap(),
        end: Utc.with_ymd_and_hms(2030, 1, 15, 15, 0, 0).unwrap(),
        timezone: "UTC".to_string(),
        amount_cents: 5000,
        currency: "USD".to_string(),
        platform_fee_cents: 500,
        package_id: None,
    }
}

#[tokio::test]
async fn s1_happy_path_request_then_approve() {
    let h = harness(Utc.with_ymd_and_hms(2030, 1, 10, 9, 0, 0).unwrap()).await;

    let created = h.orchestrator.create_booking(sample_request()).await.unwrap();
    assert_eq!(created.session_state, SessionState::Requested);

    let approved = h.orchestrator.approve_booking(created.id).await.unwrap();

    assert_eq!(approved.session_state, SessionState::Scheduled);
    assert_eq!(approved.payment_state, PaymentState::Captured);
    assert_eq!(approved.version, 2);
    assert!(approved.meeting_id.is_some());
    assert!(approved.calendar_event_id.is_some());

    let events = h.recorder.events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(e, DomainEvent::BookingCreated { .. })));
    assert!(events.iter().any(|e| matches!(e, DomainEvent::BookingConfirmed { .. })));
}

#[tokio::test]
async fn s2_expiry_never_approved() {
    let created_at = Utc.with_ymd_and_hms(2030, 1, 10, 9, 0, 0).unwrap();
    let h = harness(created_at).await;
    let created = h.orchestrator.create_booking(sample_request()).await.unwrap();

    let tick_time = created_at + chrono::Duration::hours(24) + chrono::Duration::minutes(1);
    let clock = Arc::new(FixedClock::new(tick_time));
    let scheduler = Scheduler::new(
        h.booking_store.clone(),
        Arc::new(InMemoryDistributedLock::new()),
        clock,
        EffectContext {
            meeting: Arc::new(InMemoryMeetingPort::new()),
            calendar: Arc::new(InMemoryCalendarPort::new()),
            email: Arc::new(InMemoryEmailPort::new()),
            payment_ledger: h.payment_ledger.clone(),
            package_store: Arc::new(InMemoryPackageStore::new()),
            dispatcher: Arc::new(EventDispatcher::new()),
        },
        &Config::default(),
    );

    let report = scheduler.tick_expire_requests().await.unwrap();
    assert_eq!(report.succeeded, 1);

    let expired = h.booking_store.get_by_id(created.id).await.unwrap();
    assert_eq!(expired.session_state, SessionState::Expired);
    assert!(expired.meeting_id.is_none());
}

#[tokio::test]
async fn s3_late_cancel_refund_split() {
    let created_at = Utc.with_ymd_and_hms(2030, 1, 10, 9, 0, 0).unwrap();
    let h = harness(created_at).await;
    let created = h.orchestrator.create_booking(sample_request()).await.unwrap();
    let approved = h.orchestrator.approve_booking(created.id).await.unwrap();
    assert_eq!(approved.session_state, SessionState::Scheduled);

    // 12 hours before the 14:00 start is exactly the cutoff, still a
    // full refund per `refund_policy::resolve_cancellation`'s `>=` check.
    h.clock.set(Utc.with_ymd_and_hms(2030, 1, 15, 2, 0, 0).unwrap());

    let cancelled = h
        .orchestrator
        .cancel_booking(approved.id, CancelledByRole::Student, Some("schedule conflict".to_string()))
        .await
        .unwrap();

    assert_eq!(cancelled.session_state, SessionState::Cancelled);
    assert_eq!(cancelled.cancelled_by, Some(CancelledByRole::Student));

    let payment = h.payment_ledger.latest_payment_for_booking(cancelled.id).await.unwrap();
    assert_eq!(payment.state, PaymentState::Refunded);
    let refunds = h.payment_ledger.refunds_for_payment(payment.id).await;
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].amount_cents, 5000);
}

#[tokio::test]
async fn s4_duplicate_webhook_applied_twice() {
    let created_at = Utc.with_ymd_and_hms(2030, 1, 10, 9, 0, 0).unwrap();
    let h = harness(created_at).await;
    let created = h.orchestrator.create_booking(sample_request()).await.unwrap();
    let payment = h.payment_ledger.latest_payment_for_booking(created.id).await.unwrap();

    let webhook_dispatcher = Arc::new(EventDispatcher::new());
    webhook_dispatcher.register("PaymentCaptured", h.recorder.clone(), 0).await;
    let ingress = WebhookIngress::new(
        Arc::new(FakeWebhookVerifier),
        h.booking_store.clone(),
        h.payment_ledger.clone(),
        h.clock.clone(),
        webhook_dispatcher,
    );

    let payload = format!(
        r#"{{"event_id":"evt_abc","occurred_at":"2030-01-10T09:05:00Z","type":"payment_succeeded","booking_id":{},"payment_id":{},"external_intent_id":"pi_1"}}"#,
        created.id, payment.id
    );

    let first = ingress.ingest(payload.as_bytes(), "valid").await.unwrap();
    assert_eq!(first, IngestOutcome::Applied);

    let second = ingress.ingest(payload.as_bytes(), "valid").await.unwrap();
    assert_eq!(second, IngestOutcome::Duplicate);

    let payment_row = h.payment_ledger.get_payment(payment.id).await.unwrap();
    assert_eq!(payment_row.state, PaymentState::Captured);

    let booking = h.booking_store.get_by_id(created.id).await.unwrap();
    assert_eq!(booking.payment_state, PaymentState::Captured);
    assert_eq!(booking.version, 2);

    let events = h.recorder.events.lock().unwrap();
    let captured = events.iter().filter(|e| matches!(e, DomainEvent::PaymentCaptured { .. })).count();
    assert_eq!(captured, 1);
}

#[tokio::test]
async fn s5_optimistic_conflict_then_rejection() {
    let created_at = Utc.with_ymd_and_hms(2030, 1, 10, 9, 0, 0).unwrap();
    let h = harness(created_at).await;
    let created = h.orchestrator.create_booking(sample_request()).await.unwrap();
    let approved = h.orchestrator.approve_booking(created.id).await.unwrap();

    // A writer bypassing the orchestrator applies a change and persists
    // it first, advancing the version the orchestrator last observed.
    let mut stale_view = approved.clone();
    h.orchestrator.cancel_booking(approved.id, CancelledByRole::Tutor, None).await.unwrap();

    stale_view.meeting_id = Some("mtg_stale".to_string());
    let result = h.booking_store.update(stale_view.clone(), stale_view.version).await;
    assert!(matches!(result, Err(Error::OptimisticLockConflict { .. })));

    // The booking is now CANCELLED (terminal); any further command is a
    // StateRejection, not a silent no-op.
    let second = h.orchestrator.approve_booking(approved.id).await;
    assert!(matches!(second, Err(Error::StateRejection(_))));
}

#[tokio::test]
async fn s6_clock_skew_does_not_block_session_start() {
    let created_at = Utc.with_ymd_and_hms(2030, 1, 10, 9, 0, 0).unwrap();
    let h = harness(created_at).await;
    let created = h.orchestrator.create_booking(sample_request()).await.unwrap();
    let approved = h.orchestrator.approve_booking(created.id).await.unwrap();
    let join_url_before = approved.meeting_join_url.clone();
    assert!(join_url_before.is_some());

    // The scheduler's own clock is pinned 30s past the booking's start;
    // `Utc::now()` inside `check_clock_skew` stands in for a real
    // database NOW() and will differ by far more than the warning
    // threshold in any test run, which must not block the transition.
    let start_plus_30s = Utc.with_ymd_and_hms(2030, 1, 15, 14, 0, 30).unwrap();
    let clock = Arc::new(FixedClock::new(start_plus_30s));
    let dispatcher = Arc::new(EventDispatcher::new());
    dispatcher.register("SessionStarted", h.recorder.clone(), 0).await;
    let scheduler = Scheduler::new(
        h.booking_store.clone(),
        Arc::new(InMemoryDistributedLock::new()),
        clock,
        EffectContext {
            meeting: Arc::new(InMemoryMeetingPort::new()),
            calendar: Arc::new(InMemoryCalendarPort::new()),
            email: Arc::new(InMemoryEmailPort::new()),
            payment_ledger: h.payment_ledger.clone(),
            package_store: Arc::new(InMemoryPackageStore::new()),
            dispatcher,
        },
        &Config::default(),
    );

    let report = scheduler.tick_start_sessions().await.unwrap();
    assert_eq!(report.succeeded, 1);

    let active = h.booking_store.get_by_id(approved.id).await.unwrap();
    assert_eq!(active.session_state, SessionState::Active);
    assert_eq!(active.meeting_join_url, join_url_before);

    let events = h.recorder.events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(e, DomainEvent::SessionStarted { .. })));
}
