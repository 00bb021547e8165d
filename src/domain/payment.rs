//! Payment, Refund, Wallet, and Processed-Webhook records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::status::PaymentState;

/// Per-booking charge record. A booking may accrue multiple rows over
/// its lifetime (retry, authorization then capture), but only one is in
/// state `Captured` at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub booking_id: i64,
    pub external_session_id: String,
    pub external_intent_id: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub state: PaymentState,
    pub created_at: DateTime<Utc>,
}

/// Why a refund was issued, per the refund policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    CancelledByStudentLate,
    CancelledByStudentEarly,
    CancelledByTutor,
    NoShowTutor,
    Admin,
    /// No refund was issued; carried on a [`RefundDecision`] whose
    /// `refund_amount_cents` is zero so no [`Refund`] row is ever
    /// created with this reason attached.
    ///
    /// [`RefundDecision`]: crate::refund_policy::RefundDecision
    NotApplicable,
}

/// Partial or full reversal of a [`Payment`].
///
/// Sum of non-failed refund amounts for a payment must never exceed the
/// payment's amount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refund {
    pub id: i64,
    pub payment_id: i64,
    pub booking_id: i64,
    /// Idempotency key from the payment provider.
    pub external_refund_id: String,
    pub amount_cents: i64,
    pub reason: RefundReason,
    pub created_at: DateTime<Utc>,
}

/// Per-student credit balance in the platform's currency.
///
/// All mutation is atomic read-modify-write at the store layer — never
/// "load, add in Rust, store back", which would race under concurrent
/// writers the same way an ORM-style `balance += amount` assignment
/// does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub student_id: i64,
    pub credit_balance_cents: i64,
}

/// An (event-id) record that causes idempotent webhook replay to be a
/// no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedWebhook {
    pub event_id: String,
    pub event_type: String,
    /// The provider's logical event timestamp, used for out-of-order
    /// tolerance: a later-arriving event with an earlier logical
    /// timestamp than what's already applied is stale and skipped.
    pub event_timestamp: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refund_reasons_are_distinct_values() {
        assert_ne!(RefundReason::CancelledByTutor, RefundReason::NoShowTutor);
    }
}
