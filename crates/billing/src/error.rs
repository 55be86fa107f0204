//! Billing error types

use uuid::Uuid;

use crate::transaction::{TransactionStatus, TransactionType};

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Insufficient credits: requested {requested}, available {available}")]
    InsufficientCredits { requested: i64, available: i64 },

    #[error("Invalid credit amount: {0}")]
    InvalidAmount(i64),

    #[error("Credit transaction not found: {0}")]
    TransactionNotFound(Uuid),

    #[error(
        "Transaction {transaction_id} is {status}/{transaction_type}, expected {expected}"
    )]
    InvalidTransactionState {
        transaction_id: Uuid,
        status: TransactionStatus,
        transaction_type: TransactionType,
        expected: &'static str,
    },

    /// The ledger's own bookkeeping disagrees with itself. Never recovered locally.
    #[error("Ledger invariant violated on grant {grant_id}: {invariant} (expected {expected}, actual {actual})")]
    LedgerInvariantViolation {
        grant_id: Uuid,
        invariant: &'static str,
        expected: i64,
        actual: i64,
    },

    #[error("Refund of {requested} exceeds refundable usage {refundable} on transaction {transaction_id}")]
    RefundExceedsUsage {
        transaction_id: Uuid,
        requested: i64,
        refundable: i64,
    },

    #[error("Stored ledger data is malformed: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl BillingError {
    /// Errors worth retrying: the operation never reached a decision
    pub fn is_transient(&self) -> bool {
        matches!(self, BillingError::Database(_))
    }

    /// Bookkeeping errors that must surface to operators
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BillingError::LedgerInvariantViolation { .. }
                | BillingError::RefundExceedsUsage { .. }
                | BillingError::Corrupt(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::Corrupt(err.to_string())
    }
}
