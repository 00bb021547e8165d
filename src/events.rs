//! In-process domain event publish/subscribe.
//!
//! Every event is a concrete, tagged [`DomainEvent`] variant rather than
//! an untyped payload, and the dispatcher is a constructed value
//! threaded through composition rather than a global — handlers
//! register against one of them directly, nothing reaches for a
//! process-wide singleton.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::payment::RefundReason;
use crate::domain::status::SessionOutcome;

/// One concrete event per notifiable lifecycle moment. Each carries
/// exactly the facts a handler needs — no free-form metadata dict.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    BookingCreated {
        booking_id: i64,
        student_id: i64,
        tutor_id: i64,
    },
    BookingConfirmed {
        booking_id: i64,
    },
    BookingCancelled {
        booking_id: i64,
        cancelled_by: crate::domain::status::CancelledByRole,
    },
    SessionStarted {
        booking_id: i64,
    },
    SessionEnded {
        booking_id: i64,
        outcome: SessionOutcome,
    },
    PaymentCaptured {
        booking_id: i64,
        payment_id: i64,
        amount_cents: i64,
    },
    RefundIssued {
        booking_id: i64,
        refund_id: i64,
        amount_cents: i64,
        reason: RefundReason,
    },
}

impl DomainEvent {
    /// Stable type name, used as the dispatch key.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::BookingCreated { .. } => "BookingCreated",
            Self::BookingConfirmed { .. } => "BookingConfirmed",
            Self::BookingCancelled { .. } => "BookingCancelled",
            Self::SessionStarted { .. } => "SessionStarted",
            Self::SessionEnded { .. } => "SessionEnded",
            Self::PaymentCaptured { .. } => "PaymentCaptured",
            Self::RefundIssued { .. } => "RefundIssued",
        }
    }
}

/// Envelope wrapping a [`DomainEvent`] with the dispatch bookkeeping
/// every published event carries regardless of its variant.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub event_id: String,
    pub occurred_at: DateTime<Utc>,
    pub event: DomainEvent,
}

impl Envelope {
    pub fn new(event: DomainEvent) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            occurred_at: Utc::now(),
            event,
        }
    }
}

/// A handler registered against one event type. Isolation contract: a
/// handler that errors never stops its siblings from running.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Envelope) -> anyhow::Result<()>;
}

struct Registration {
    priority: i32,
    handler: Arc<dyn EventHandler>,
}

/// Dispatch mode for [`EventDispatcher::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// All handlers complete before `publish` returns.
    Wait,
    /// Handlers are scheduled concurrently; `publish` returns immediately.
    FireAndForget,
}

/// Central event dispatcher. Not a durable bus — consumers needing
/// durability subscribe to the write-ahead outbox, which is a store
/// implementation detail.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: tokio::sync::RwLock<HashMap<&'static str, Vec<Registration>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`. Higher `priority` runs first.
    pub async fn register(
        &self,
        event_type: &'static str,
        handler: Arc<dyn EventHandler>,
        priority: i32,
    ) {
        let mut handlers = self.handlers.write().await;
        let bucket = handlers.entry(event_type).or_default();
        bucket.push(Registration { priority, handler });
        bucket.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Publish `event` to every handler registered for its type.
    pub async fn publish(&self, event: DomainEvent, mode: DispatchMode) {
        let envelope = Envelope::new(event);
        let type_name = envelope.event.event_type();

        let registrations: Vec<Arc<dyn EventHandler>> = {
            let handlers = self.handlers.read().await;
            match handlers.get(type_name) {
                Some(bucket) => bucket.iter().map(|r| r.handler.clone()).collect(),
                None => {
                    tracing::debug!(event_type = type_name, "no handlers registered");
                    return;
                }
            }
        };

        tracing::info!(
            event_type = type_name,
            event_id = %envelope.event_id,
            handler_count = registrations.len(),
            "publishing domain event"
        );

        match mode {
            DispatchMode::Wait => {
                let mut tasks = Vec::with_capacity(registrations.len());
                for handler in registrations {
                    let envelope = envelope.clone();
                    tasks.push(tokio::spawn(async move { run_isolated(handler, envelope).await }));
                }
                for task in tasks {
                    let _ = task.await;
                }
            }
            DispatchMode::FireAndForget => {
                for handler in registrations {
                    let envelope = envelope.clone();
                    tokio::spawn(async move { run_isolated(handler, envelope).await });
                }
            }
        }
    }

    pub async fn publish_all(&self, events: Vec<DomainEvent>, mode: DispatchMode) {
        for event in events {
            self.publish(event, mode).await;
        }
    }

    pub async fn clear(&self, event_type: Option<&'static str>) {
        let mut handlers = self.handlers.write().await;
        match event_type {
            Some(t) => {
                handlers.remove(t);
            }
            None => handlers.clear(),
        }
    }
}

async fn run_isolated(handler: Arc<dyn EventHandler>, envelope: Envelope) {
    if let Err(err) = handler.handle(&envelope).await {
        tracing::error!(
            event_type = envelope.event.event_type(),
            error = %err,
            "event handler failed"
        );
    }
}
