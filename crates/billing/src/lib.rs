// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries full transaction state for diagnostics
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Credit ledger
//!
//! Credits are issued as grants with their own validity window. Work is paid
//! for by reserving credits up front, then confirming (spend) or cancelling
//! (release) the reservation, with partial refunds after confirmation.
//!
//! ## Features
//!
//! - **Reservations**: All-or-nothing holds across grants, expiring grants first
//! - **Settlement**: Confirm or cancel a hold, with a 24h TTL sweep
//! - **Refunds**: Return credit to the grants that stay usable longest
//! - **Backends**: Postgres (`PgCreditLedger`) and in-process (`MemoryCreditLedger`)
//! - **Invariants**: Runnable SQL consistency checks

pub mod allocation;
pub mod error;
pub mod grant;
pub mod invariants;
pub mod ledger;
pub mod postgres;
pub mod refund;
pub mod transaction;
pub mod users;

#[cfg(test)]
mod edge_case_tests;

// Error
pub use error::{BillingError, BillingResult};

// Grants
pub use grant::{CreditAccount, CreditGrant};

// Transactions
pub use transaction::{
    CreditTransaction, CreditTransactionDetail, GrantMovement, RefundHistoryEntry,
    TransactionMetadata, TransactionStatus, TransactionType, RESERVATION_TTL,
};

// Ledger
pub use allocation::{GrantSet, Reservation};
pub use ledger::{CreditLedger, MemoryCreditLedger};
pub use postgres::PgCreditLedger;
pub use refund::RefundReceipt;

// Users
pub use users::{BillingUser, BillingUserDirectory};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};
