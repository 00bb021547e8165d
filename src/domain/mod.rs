//! Domain entities: [`booking`], [`payment`], [`package`], and the status
//! enums ([`status`]) that make up the four-field booking status model.

pub mod booking;
pub mod package;
pub mod payment;
pub mod status;

pub use booking::{Booking, BookingStatusChange};
pub use package::{AvailabilitySlot, Blackout, Package};
pub use payment::{Payment, ProcessedWebhook, Refund, RefundReason, Wallet};
pub use status::{CancelledByRole, DisputeState, PaymentState, SessionOutcome, SessionState};
