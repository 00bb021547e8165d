//! Booking Lifecycle Core
//!
//! The subsystem that governs how a tutoring session proposal becomes a
//! scheduled, paid, attended, and reviewed session — or is cancelled,
//! expired, disputed, or refunded along the way.
//!
//! This crate provides:
//! - The four-field booking status model and its transition rules
//!   ([`state_machine`]), including optimistic concurrency
//!   ([`store::booking_store`]).
//! - Payment capture, refund, and wallet accounting driven by external
//!   webhook events ([`domain::payment`], [`webhook`]).
//! - Background schedulers that expire requests, start sessions, end
//!   sessions, and dispatch reminders across worker instances
//!   ([`scheduler`], [`lock`]).
//! - Conflict detection and idempotent side-effect dispatch
//!   ([`ports`], [`events`]).

pub mod cache;
pub mod clock;
pub mod config;
pub mod domain;
pub mod effects;
pub mod events;
pub mod lock;
pub mod orchestrator;
pub mod ports;
pub mod refund_policy;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod webhook;

/// Default REQUESTED -> EXPIRED threshold, hours.
pub const REQUEST_EXPIRY_HOURS: i64 = 24;

/// Default ACTIVE -> ENDED grace period after `end`, minutes.
pub const SESSION_END_GRACE_MINUTES: i64 = 5;

/// Minimum booking duration.
pub const MIN_SESSION_DURATION_MINUTES: i64 = 30;

/// Default student-cancellation full-refund cutoff, hours before start.
pub const CANCELLATION_CUTOFF_HOURS: i64 = 12;

/// Default clock-skew warning threshold, seconds.
pub const DEFAULT_CLOCK_SKEW_THRESHOLD_SECONDS: i64 = 5;

/// Bounded retry count for optimistic-lock conflicts at the orchestrator.
pub const MAX_OPTIMISTIC_RETRY: u32 = 3;

/// Scheduler job retry backoff base, seconds. Actual delay is
/// `JOB_RETRY_BASE_SECONDS * 2^retry`.
pub const JOB_RETRY_BASE_SECONDS: u64 = 60;

/// Scheduler job max attempts before dead-lettering.
pub const JOB_MAX_RETRIES: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("state rejection: {0}")]
    StateRejection(#[from] state_machine::Rejection),

    #[error("optimistic lock conflict on booking {booking_id} (expected version {expected}, found {found})")]
    OptimisticLockConflict {
        booking_id: i64,
        expected: i64,
        found: i64,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("integration retryable: {0}")]
    IntegrationRetryable(String),

    #[error("integration terminal: {0}")]
    IntegrationTerminal(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient funds: balance {balance} cents, requested {requested} cents")]
    InsufficientFunds { balance: i64, requested: i64 },

    #[error("fatal invariant violation: {0}")]
    Fatal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_constants_have_expected_values() {
        assert_eq!(REQUEST_EXPIRY_HOURS, 24);
        assert_eq!(SESSION_END_GRACE_MINUTES, 5);
        assert_eq!(MIN_SESSION_DURATION_MINUTES, 30);
        assert_eq!(CANCELLATION_CUTOFF_HOURS, 12);
        assert_eq!(MAX_OPTIMISTIC_RETRY, 3);
        assert_eq!(JOB_MAX_RETRIES, 5);
    }

    #[test]
    fn error_display_is_human_readable() {
        let err = Error::OptimisticLockConflict {
            booking_id: 42,
            expected: 2,
            found: 3,
        };
        assert!(err.to_string().contains("booking 42"));
    }
}
