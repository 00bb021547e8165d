//! Email provider port: fire-and-forget transactional notifications,
//! one method per template.

use async_trait::async_trait;
use std::sync::Mutex;

/// Delivery outcome: `Transient` is retried with bounded attempts by
/// the caller; `Permanent` is surfaced for operator attention;
/// `Disabled`/`Unconfigured` mean no attempt was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailOutcome {
    Success,
    Transient,
    Permanent,
    Disabled,
    Unconfigured,
}

/// One method per transactional template (booking confirmation,
/// decline, cancellation, reschedule, session-ended review request,
/// no-show). The core never renders a template body — it only names
/// which template and supplies its data.
#[async_trait]
pub trait EmailPort: Send + Sync {
    async fn send_confirmation(&self, booking_id: i64, to: &str) -> EmailOutcome;
    async fn send_decline(&self, booking_id: i64, to: &str) -> EmailOutcome;
    async fn send_cancellation(&self, booking_id: i64, to: &str) -> EmailOutcome;
    async fn send_reschedule(&self, booking_id: i64, to: &str) -> EmailOutcome;
    async fn send_session_ended(&self, booking_id: i64, to: &str) -> EmailOutcome;
    async fn send_review_request(&self, booking_id: i64, to: &str) -> EmailOutcome;
    async fn send_no_show(&self, booking_id: i64, to: &str, party: &str) -> EmailOutcome;
    async fn send_reminder(&self, booking_id: i64, to: &str) -> EmailOutcome;
}

/// Records every send for assertion in tests; always reports `Success`
/// unless preloaded with a different canned outcome.
#[derive(Default)]
pub struct InMemoryEmailPort {
    sent: Mutex<Vec<(i64, String)>>,
    canned: Mutex<Option<EmailOutcome>>,
}

impl InMemoryEmailPort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_canned_outcome(outcome: EmailOutcome) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            canned: Mutex::new(Some(outcome)),
        }
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn record_and_resolve(&self, booking_id: i64, template: &str) -> EmailOutcome {
        self.sent.lock().unwrap().push((booking_id, template.to_string()));
        self.canned.lock().unwrap().unwrap_or(EmailOutcome::Success)
    }
}

#[async_trait]
impl EmailPort for InMemoryEmailPort {
    async fn send_confirmation(&self, booking_id: i64, _to: &str) -> EmailOutcome {
        self.record_and_resolve(booking_id, "confirmation")
    }

    async fn send_decline(&self, booking_id: i64, _to: &str) -> EmailOutcome {
        self.record_and_resolve(booking_id, "decline")
    }

    async fn send_cancellation(&self, booking_id: i64, _to: &str) -> EmailOutcome {
        self.record_and_resolve(booking_id, "cancellation")
    }

    async fn send_reschedule(&self, booking_id: i64, _to: &str) -> EmailOutcome {
        self.record_and_resolve(booking_id, "reschedule")
    }

    async fn send_session_ended(&self, booking_id: i64, _to: &str) -> EmailOutcome {
        self.record_and_resolve(booking_id, "session_ended")
    }

    async fn send_review_request(&self, booking_id: i64, _to: &str) -> EmailOutcome {
        self.record_and_resolve(booking_id, "review_request")
    }

    async fn send_no_show(&self, booking_id: i64, _to: &str, _party: &str) -> EmailOutcome {
        self.record_and_resolve(booking_id, "no_show")
    }

    async fn send_reminder(&self, booking_id: i64, _to: &str) -> EmailOutcome {
        self.record_and_resolve(booking_id, "reminder")
    }
}
