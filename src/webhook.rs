//! Webhook ingress: signature-verified event intake, idempotent
//! application, and out-of-order tolerance.
//!
//! Signature verification is a port the core calls, not a scheme it
//! implements itself — a provider's HMAC signing is a concern of the
//! real adapter, not of this crate.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::domain::payment::RefundReason;
use crate::domain::status::PaymentState;
use crate::events::{DispatchMode, DomainEvent, EventDispatcher};
use crate::ports::PortError;
use crate::store::{BookingStore, PaymentLedger};
use crate::{Error, Result};

/// A verified, normalized webhook event. Wire format is provider-defined
/// and opaque to the core; only the verifier produces this.
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub event_id: String,
    pub occurred_at: DateTime<Utc>,
    pub kind: WebhookEventKind,
}

/// One variant per event type this core understands — tagged variants,
/// never an untyped payload dict.
#[derive(Debug, Clone)]
pub enum WebhookEventKind {
    PaymentSucceeded { booking_id: i64, payment_id: i64, external_intent_id: String },
    PaymentFailed { booking_id: i64, payment_id: i64 },
    PaymentRefunded {
        booking_id: i64,
        payment_id: i64,
        external_refund_id: String,
        amount_cents: i64,
        reason: RefundReason,
    },
}

impl WebhookEventKind {
    pub fn booking_id(&self) -> i64 {
        match self {
            Self::PaymentSucceeded { booking_id, .. }
            | Self::PaymentFailed { booking_id, .. }
            | Self::PaymentRefunded { booking_id, .. } => *booking_id,
        }
    }
}

/// Signature verification port. Pure computation (HMAC-style), not an
/// I/O boundary, so it is not `async_trait` like the meeting/calendar/
/// email ports.
pub trait WebhookVerifier: Send + Sync {
    fn verify(&self, payload: &[u8], signature: &str) -> Result<ParsedEvent>;
}

/// Test double that trusts any payload whose signature is the literal
/// string `"valid"` — real adapters perform the provider's HMAC check.
pub struct FakeWebhookVerifier;

impl WebhookVerifier for FakeWebhookVerifier {
    fn verify(&self, payload: &[u8], signature: &str) -> Result<ParsedEvent> {
        if signature != "valid" {
            return Err(PortError::Terminal("signature verification failed".to_string()).into());
        }
        serde_json::from_slice::<ParsedEventWire>(payload)
            .map(ParsedEventWire::into_parsed)
            .map_err(Error::from)
    }
}

/// Wire shape the fake verifier deserializes from JSON in tests; a real
/// adapter would parse the provider's own event envelope instead.
#[derive(serde::Deserialize)]
struct ParsedEventWire {
    event_id: String,
    occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    kind: WireKind,
}

#[derive(serde::Deserialize)]
#[serde(tag = "type")]
enum WireKind {
    #[serde(rename = "payment_succeeded")]
    PaymentSucceeded { booking_id: i64, payment_id: i64, external_intent_id: String },
    #[serde(rename = "payment_failed")]
    PaymentFailed { booking_id: i64, payment_id: i64 },
    #[serde(rename = "payment_refunded")]
    PaymentRefunded {
        booking_id: i64,
        payment_id: i64,
        external_refund_id: String,
        amount_cents: i64,
        reason: RefundReason,
    },
}

impl ParsedEventWire {
    fn into_parsed(self) -> ParsedEvent {
        let kind = match self.kind {
            WireKind::PaymentSucceeded { booking_id, payment_id, external_intent_id } => {
                WebhookEventKind::PaymentSucceeded { booking_id, payment_id, external_intent_id }
            }
            WireKind::PaymentFailed { booking_id, payment_id } => {
                WebhookEventKind::PaymentFailed { booking_id, payment_id }
            }
            WireKind::PaymentRefunded { booking_id, payment_id, external_refund_id, amount_cents, reason } => {
                WebhookEventKind::PaymentRefunded { booking_id, payment_id, external_refund_id, amount_cents, reason }
            }
        };
        ParsedEvent { event_id: self.event_id, occurred_at: self.occurred_at, kind }
    }
}

/// Result of [`WebhookIngress::ingest`]: the caller's HTTP boundary maps
/// this to a 200 either way — duplicates are a no-op 200, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied,
    Duplicate,
    /// A later-arriving event with an earlier logical timestamp than
    /// what's already applied; the persisted state is left untouched.
    Stale,
}

/// Dedupe primary-key table. An `INSERT … ON CONFLICT DO NOTHING` on
/// `event_id` in a real store.
#[derive(Default)]
struct ProcessedWebhookStore {
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
    last_applied_per_booking: Mutex<HashMap<i64, DateTime<Utc>>>,
}

impl ProcessedWebhookStore {
    /// Returns `false` if `event_id` was already recorded (duplicate).
    async fn try_insert(&self, event_id: &str, occurred_at: DateTime<Utc>) -> bool {
        let mut seen = self.seen.lock().await;
        if seen.contains_key(event_id) {
            return false;
        }
        seen.insert(event_id.to_string(), occurred_at);
        true
    }

    /// `true` if `occurred_at` is not older than the last event this
    /// booking already applied.
    async fn is_fresh(&self, booking_id: i64, occurred_at: DateTime<Utc>) -> bool {
        let last_applied = self.last_applied_per_booking.lock().await;
        match last_applied.get(&booking_id) {
            Some(last) => occurred_at > *last,
            None => true,
        }
    }

    async fn mark_applied(&self, booking_id: i64, occurred_at: DateTime<Utc>) {
        let mut last_applied = self.last_applied_per_booking.lock().await;
        last_applied.insert(booking_id, occurred_at);
    }
}

/// Signature-verified event intake with idempotent, out-of-order-
/// tolerant application against the payment ledger and booking store.
pub struct WebhookIngress {
    verifier: Arc<dyn WebhookVerifier>,
    booking_store: Arc<dyn BookingStore>,
    payment_ledger: Arc<dyn PaymentLedger>,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<EventDispatcher>,
    processed: ProcessedWebhookStore,
}

impl WebhookIngress {
    pub fn new(
        verifier: Arc<dyn WebhookVerifier>,
        booking_store: Arc<dyn BookingStore>,
        payment_ledger: Arc<dyn PaymentLedger>,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            verifier,
            booking_store,
            payment_ledger,
            clock,
            dispatcher,
            processed: ProcessedWebhookStore::default(),
        }
    }

    /// Verify, dedupe, and apply `payload`. Rejects with
    /// [`Error::IntegrationTerminal`] on signature failure, mapped by
    /// the HTTP boundary to 400.
    pub async fn ingest(&self, payload: &[u8], signature: &str) -> Result<IngestOutcome> {
        let event = self.verifier.verify(payload, signature)?;

        if !self.processed.try_insert(&event.event_id, event.occurred_at).await {
            tracing::info!(event_id = %event.event_id, "duplicate webhook, no-op");
            return Ok(IngestOutcome::Duplicate);
        }

        let booking_id = event.kind.booking_id();
        if !self.processed.is_fresh(booking_id, event.occurred_at).await {
            tracing::warn!(
                booking_id,
                event_id = %event.event_id,
                "stale webhook event, skipping out-of-order update"
            );
            return Ok(IngestOutcome::Stale);
        }

        self.apply(&event).await?;
        self.processed.mark_applied(booking_id, event.occurred_at).await;
        Ok(IngestOutcome::Applied)
    }

    async fn apply(&self, event: &ParsedEvent) -> Result<()> {
        match &event.kind {
            WebhookEventKind::PaymentSucceeded { booking_id, payment_id, external_intent_id } => {
                let payment = self.payment_ledger.capture(*payment_id, external_intent_id).await?;
                self.set_booking_payment_state(*booking_id, PaymentState::Captured).await?;
                self.dispatcher
                    .publish(
                        DomainEvent::PaymentCaptured {
                            booking_id: *booking_id,
                            payment_id: *payment_id,
                            amount_cents: payment.amount_cents,
                        },
                        DispatchMode::Wait,
                    )
                    .await;
                Ok(())
            }
            WebhookEventKind::PaymentFailed { booking_id, .. } => {
                self.set_booking_payment_state(*booking_id, PaymentState::Failed).await
            }
            WebhookEventKind::PaymentRefunded {
                booking_id,
                payment_id,
                external_refund_id,
                amount_cents,
                reason,
            } => {
                let (_, was_existing) = self
                    .payment_ledger
                    .record_refund(*payment_id, *booking_id, external_refund_id, *amount_cents, *reason)
                    .await?;
                if was_existing {
                    return Ok(());
                }
                let payment = self
                    .payment_ledger
                    .get_payment(*payment_id)
                    .await
                    .ok_or_else(|| Error::NotFound(format!("payment {payment_id}")))?;
                self.set_booking_payment_state(*booking_id, payment.state).await
            }
        }
    }

    async fn set_booking_payment_state(&self, booking_id: i64, payment_state: PaymentState) -> Result<()> {
        let Some((mut booking, _lock)) = self.booking_store.get_with_lock(booking_id).await else {
            return Err(Error::NotFound(format!("booking {booking_id}")));
        };
        let expected_version = booking.version;
        booking.payment_state = payment_state;
        booking.updated_at = self.clock.now();
        booking.version += 1;
        self.booking_store.update(booking, expected_version).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::booking::Booking;
    use crate::store::{InMemoryBookingStore, InMemoryPaymentLedger};
    use chrono::TimeZone;

    fn sample_event(json: &str) -> Vec<u8> {
        json.as_bytes().to_vec()
    }

    async fn seeded() -> (WebhookIngress, Arc<InMemoryBookingStore>, Arc<InMemoryPaymentLedger>, i64, i64) {
        let booking_store = Arc::new(InMemoryBookingStore::new());
        let payment_ledger = Arc::new(InMemoryPaymentLedger::new());

        let now = Utc.with_ymd_and_hms(2030, 1, 10, 9, 0, 0).unwrap();
        let booking = Booking::new_request(
            0, 101, 202, 9001,
            Utc.with_ymd_and_hms(2030, 1, 15, 14, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2030, 1, 15, 15, 0, 0).unwrap(),
            "UTC".to_string(), 5000, "USD".to_string(), 500, now,
        );
        let booking = booking_store.create(booking).await.unwrap();
        let payment = payment_ledger.record_payment(booking.id, "cs_1", 5000, "USD").await;

        let ingress = WebhookIngress::new(
            Arc::new(FakeWebhookVerifier),
            booking_store.clone(),
            payment_ledger.clone(),
            Arc::new(crate::clock::FixedClock::new(now)),
            Arc::new(EventDispatcher::new()),
        );
        (ingress, booking_store, payment_ledger, booking.id, payment.id)
    }

    #[tokio::test]
    async fn duplicate_event_id_is_a_noop_on_replay() {
        let (ingress, booking_store, _ledger, booking_id, payment_id) = seeded().await;
        let payload = sample_event(&format!(
            r#"{{"event_id":"evt_abc","occurred_at":"2030-01-10T09:05:00Z","type":"payment_succeeded","booking_id":{booking_id},"payment_id":{payment_id},"external_intent_id":"pi_1"}}"#
        ));

        let first = ingress.ingest(&payload, "valid").await.unwrap();
        assert_eq!(first, IngestOutcome::Applied);
        let booking_after_first = booking_store.get_by_id(booking_id).await.unwrap();

        let second = ingress.ingest(&payload, "valid").await.unwrap();
        assert_eq!(second, IngestOutcome::Duplicate);
        let booking_after_second = booking_store.get_by_id(booking_id).await.unwrap();

        assert_eq!(booking_after_first.version, booking_after_second.version);
        assert_eq!(booking_after_second.payment_state, PaymentState::Captured);
    }

    #[tokio::test]
    async fn invalid_signature_is_rejected() {
        let (ingress, _booking_store, _ledger, booking_id, payment_id) = seeded().await;
        let payload = sample_event(&format!(
            r#"{{"event_id":"evt_x","occurred_at":"2030-01-10T09:05:00Z","type":"payment_succeeded","booking_id":{booking_id},"payment_id":{payment_id},"external_intent_id":"pi_1"}}"#
        ));
        let result = ingress.ingest(&payload, "forged").await;
        assert!(matches!(result, Err(Error::IntegrationTerminal(_))));
    }

    #[tokio::test]
    async fn out_of_order_succeeded_after_refunded_does_not_unrefund() {
        let (ingress, booking_store, _ledger, booking_id, payment_id) = seeded().await;

        let succeeded = sample_event(&format!(
            r#"{{"event_id":"evt_1","occurred_at":"2030-01-10T09:00:00Z","type":"payment_succeeded","booking_id":{booking_id},"payment_id":{payment_id},"external_intent_id":"pi_1"}}"#
        ));
        ingress.ingest(&succeeded, "valid").await.unwrap();

        let refunded = sample_event(&format!(
            r#"{{"event_id":"evt_2","occurred_at":"2030-01-10T10:00:00Z","type":"payment_refunded","booking_id":{booking_id},"payment_id":{payment_id},"external_refund_id":"re_1","amount_cents":5000,"reason":"cancelled_by_student_early"}}"#
        ));
        let outcome = ingress.ingest(&refunded, "valid").await.unwrap();
        assert_eq!(outcome, IngestOutcome::Applied);

        // A late-arriving duplicate "succeeded" with an earlier logical
        // timestamp must not flip the booking back to Captured.
        let stale_succeeded = sample_event(&format!(
            r#"{{"event_id":"evt_3","occurred_at":"2030-01-10T09:30:00Z","type":"payment_succeeded","booking_id":{booking_id},"payment_id":{payment_id},"external_intent_id":"pi_1"}}"#
        ));
        let stale_outcome = ingress.ingest(&stale_succeeded, "valid").await.unwrap();
        assert_eq!(stale_outcome, IngestOutcome::Stale);

        let booking = booking_store.get_by_id(booking_id).await.unwrap();
        assert_eq!(booking.payment_state, PaymentState::Refunded);
    }
}
