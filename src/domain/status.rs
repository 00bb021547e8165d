//! The four-field status model.

use serde::{Deserialize, Serialize};

/// Primary lifecycle state of a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Requested,
    Scheduled,
    Active,
    Ended,
    Cancelled,
    Expired,
}

impl SessionState {
    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Cancelled | Self::Expired)
    }
}

/// Why a session ended; only meaningful when `session_state = Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    NoShowStudent,
    NoShowTutor,
    Abandoned,
}

/// Payment lifecycle state for a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Authorized,
    Captured,
    Refunded,
    PartiallyRefunded,
    Failed,
}

impl PaymentState {
    /// States that imply at least one successful Payment record exists.
    pub fn implies_successful_payment(self) -> bool {
        matches!(
            self,
            Self::Captured | Self::Refunded | Self::PartiallyRefunded
        )
    }
}

/// Dispute lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeState {
    None,
    Open,
    ResolvedStudent,
    ResolvedTutor,
}

/// Who cancelled a booking, or who triggered some other role-scoped action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelledByRole {
    Student,
    Tutor,
    System,
    Admin,
}
