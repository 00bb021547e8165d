//! Capability-set interfaces the core consumes for external
//! integrations: meeting, calendar, and email providers.
//!
//! Each is an async-trait object with an in-memory fake alongside the
//! contract for unit testing, matching the pattern of shipping fakes
//! next to the real adapter boundary it never implements (the adapters
//! themselves — a video provider's API, a calendar provider's API, a
//! transactional email provider's wire format — live outside this
//! crate).

pub mod calendar;
pub mod email;
pub mod meeting;

pub use calendar::{CalendarPort, CalendarResult, FreeBusyResult, InMemoryCalendarPort};
pub use email::{EmailOutcome, EmailPort, InMemoryEmailPort};
pub use meeting::{InMemoryMeetingPort, MeetingPort, MeetingResult};

/// Error classification every port must return: the orchestrator sees
/// a clean `Result` and decides retry/escalation policy from this tag,
/// never from provider-specific status codes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    /// Provider timeout or 5xx: safe to retry.
    #[error("integration retryable: {0}")]
    Retryable(String),

    /// Provider 4xx, signature mismatch, permanent misconfiguration.
    #[error("integration terminal: {0}")]
    Terminal(String),
}

impl From<PortError> for crate::Error {
    fn from(err: PortError) -> Self {
        match err {
            PortError::Retryable(msg) => crate::Error::IntegrationRetryable(msg),
            PortError::Terminal(msg) => crate::Error::IntegrationTerminal(msg),
        }
    }
}
