//! Payment, refund, and wallet persistence contract.
//!
//! Wallet arithmetic is always a single atomic read-modify-write at the
//! store layer — never "load the balance, add in application code,
//! write it back". An ORM-level `balance += amount` assignment race is
//! the usual way this kind of ledger gets corrupted under concurrent
//! writers; the real adapter must use `UPDATE … SET credit_balance =
//! credit_balance + :amount` and never the read-then-write pattern.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::domain::payment::{Payment, Refund, RefundReason};
use crate::domain::status::PaymentState;
use crate::{Error, Result};

/// Durable record of payments, refunds, and wallet balances.
#[async_trait]
pub trait PaymentLedger: Send + Sync {
    async fn record_payment(
        &self,
        booking_id: i64,
        external_session_id: &str,
        amount_cents: i64,
        currency: &str,
    ) -> Payment;

    /// Idempotent when called twice with the same external intent id:
    /// returns the already-captured payment unchanged on replay.
    async fn capture(&self, payment_id: i64, external_intent_id: &str) -> Result<Payment>;

    /// Idempotent on `external_refund_id`; returns the existing refund
    /// (with `was_existing = true`) if this id was already applied.
    async fn record_refund(
        &self,
        payment_id: i64,
        booking_id: i64,
        external_refund_id: &str,
        amount_cents: i64,
        reason: RefundReason,
    ) -> Result<(Refund, bool)>;

    async fn get_payment(&self, payment_id: i64) -> Option<Payment>;

    /// Most recently recorded payment for a booking, used by intent
    /// execution to resolve a bare `booking_id` into the payment row a
    /// refund applies against.
    async fn latest_payment_for_booking(&self, booking_id: i64) -> Option<Payment>;

    async fn refunds_for_payment(&self, payment_id: i64) -> Vec<Refund>;

    async fn wallet_balance(&self, student_id: i64) -> i64;

    async fn wallet_add(&self, student_id: i64, amount_cents: i64) -> i64;

    async fn wallet_deduct(&self, student_id: i64, amount_cents: i64) -> Result<i64>;
}

#[derive(Default)]
pub struct InMemoryPaymentLedger {
    payments: Mutex<HashMap<i64, Payment>>,
    refunds_by_external_id: Mutex<HashMap<String, Refund>>,
    next_payment_id: AtomicI64,
    next_refund_id: AtomicI64,
    wallets: Mutex<HashMap<i64, i64>>,
}

impl InMemoryPaymentLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentLedger for InMemoryPaymentLedger {
    async fn record_payment(
        &self,
        booking_id: i64,
        external_session_id: &str,
        amount_cents: i64,
        currency: &str,
    ) -> Payment {
        let id = self.next_payment_id.fetch_add(1, Ordering::SeqCst) + 1;
        let payment = Payment {
            id,
            booking_id,
            external_session_id: external_session_id.to_string(),
            external_intent_id: None,
            amount_cents,
            currency: currency.to_string(),
            state: PaymentState::Pending,
            created_at: Utc::now(),
        };
        self.payments.lock().await.insert(id, payment.clone());
        payment
    }

    async fn capture(&self, payment_id: i64, external_intent_id: &str) -> Result<Payment> {
        let mut payments = self.payments.lock().await;
        let payment = payments
            .get_mut(&payment_id)
            .ok_or_else(|| Error::NotFound(format!("payment {payment_id}")))?;

        if payment.state == PaymentState::Captured
            && payment.external_intent_id.as_deref() == Some(external_intent_id)
        {
            return Ok(payment.clone());
        }

        payment.state = PaymentState::Captured;
        payment.external_intent_id = Some(external_intent_id.to_string());
        Ok(payment.clone())
    }

    async fn record_refund(
        &self,
        payment_id: i64,
        booking_id: i64,
        external_refund_id: &str,
        amount_cents: i64,
        reason: RefundReason,
    ) -> Result<(Refund, bool)> {
        {
            let refunds = self.refunds_by_external_id.lock().await;
            if let Some(existing) = refunds.get(external_refund_id) {
                return Ok((existing.clone(), true));
            }
        }

        let mut payments = self.payments.lock().await;
        let payment = payments
            .get_mut(&payment_id)
            .ok_or_else(|| Error::NotFound(format!("payment {payment_id}")))?;

        let mut refunds_by_external_id = self.refunds_by_external_id.lock().await;
        let already_refunded: i64 = refunds_by_external_id
            .values()
            .filter(|r| r.payment_id == payment_id)
            .map(|r| r.amount_cents)
            .sum();

        if already_refunded + amount_cents > payment.amount_cents {
            return Err(Error::Validation(format!(
                "refund {amount_cents} would exceed payment {payment_id}'s amount ({} already refunded of {})",
                already_refunded, payment.amount_cents
            )));
        }

        let id = self.next_refund_id.fetch_add(1, Ordering::SeqCst) + 1;
        let refund = Refund {
            id,
            payment_id,
            booking_id,
            external_refund_id: external_refund_id.to_string(),
            amount_cents,
            reason,
            created_at: Utc::now(),
        };

        payment.state = if already_refunded + amount_cents == payment.amount_cents {
            PaymentState::Refunded
        } else {
            PaymentState::PartiallyRefunded
        };

        refunds_by_external_id.insert(external_refund_id.to_string(), refund.clone());
        Ok((refund, false))
    }

    async fn get_payment(&self, payment_id: i64) -> Option<Payment> {
        self.payments.lock().await.get(&payment_id).cloned()
    }

    async fn latest_payment_for_booking(&self, booking_id: i64) -> Option<Payment> {
        self.payments
            .lock()
            .await
            .values()
            .filter(|p| p.booking_id == booking_id)
            .max_by_key(|p| p.created_at)
            .cloned()
    }

    async fn refunds_for_payment(&self, payment_id: i64) -> Vec<Refund> {
        self.refunds_by_external_id
            .lock()
            .await
            .values()
            .filter(|r| r.payment_id == payment_id)
            .cloned()
            .collect()
    }

    async fn wallet_balance(&self, student_id: i64) -> i64 {
        *self.wallets.lock().await.get(&student_id).unwrap_or(&0)
    }

    async fn wallet_add(&self, student_id: i64, amount_cents: i64) -> i64 {
        let mut wallets = self.wallets.lock().await;
        let balance = wallets.entry(student_id).or_insert(0);
        *balance += amount_cents;
        *balance
    }

    async fn wallet_deduct(&self, student_id: i64, amount_cents: i64) -> Result<i64> {
        let mut wallets = self.wallets.lock().await;
        let balance = wallets.entry(student_id).or_insert(0);
        if *balance < amount_cents {
            return Err(Error::InsufficientFunds { balance: *balance, requested: amount_cents });
        }
        *balance -= amount_cents;
        Ok(*balance)
    }
}
