//! Durable persistence contracts: the booking store and payment ledger.
//! Each is a trait — the contract an adapter over a real relational
//! store (row-level locks, `SELECT … FOR UPDATE`, unique constraints)
//! must satisfy — plus an in-memory fake used by the orchestrator's and
//! scheduler's own tests, matching the pattern of shipping a fake
//! alongside every port that isn't implemented against a wire protocol.

pub mod booking_store;
pub mod package_store;
pub mod payment_ledger;

pub use booking_store::{BookingStore, InMemoryBookingStore, RowLock};
pub use package_store::{InMemoryPackageStore, PackageStore};
pub use payment_ledger::{InMemoryPaymentLedger, PaymentLedger};
