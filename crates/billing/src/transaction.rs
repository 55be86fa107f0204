//! Credit transactions and their per-grant details

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingError;

/// How long a reservation may stay pending before the sweeper cancels it
pub const RESERVATION_TTL: time::Duration = time::Duration::hours(24);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Reserve,
    Deduct,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Reserve => "RESERVE",
            TransactionType::Deduct => "DEDUCT",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RESERVE" => Ok(TransactionType::Reserve),
            "DEDUCT" => Ok(TransactionType::Deduct),
            other => Err(BillingError::Corrupt(format!(
                "unknown transaction type: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Confirmed => "CONFIRMED",
            TransactionStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransactionStatus::Pending),
            "CONFIRMED" => Ok(TransactionStatus::Confirmed),
            "CANCELLED" => Ok(TransactionStatus::Cancelled),
            other => Err(BillingError::Corrupt(format!(
                "unknown transaction status: {}",
                other
            ))),
        }
    }
}

/// One entry of a transaction's refund audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundHistoryEntry {
    pub amount: i64,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub refunded_at: OffsetDateTime,
    pub allocations: Vec<GrantMovement>,
}

/// Structured transaction metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refund_history: Vec<RefundHistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub billing_user_id: Uuid,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub total_amount: i64,
    pub refund_amount: i64,
    pub expire_at: Option<OffsetDateTime>,
    pub metadata: TransactionMetadata,
    pub confirmed_at: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl CreditTransaction {
    /// A new pending reservation
    pub fn reservation(
        billing_user_id: Uuid,
        total_amount: i64,
        task_id: Option<Uuid>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            billing_user_id,
            transaction_type: TransactionType::Reserve,
            status: TransactionStatus::Pending,
            total_amount,
            refund_amount: 0,
            expire_at: Some(now + RESERVATION_TTL),
            metadata: TransactionMetadata {
                task_id,
                ..Default::default()
            },
            confirmed_at: None,
            cancelled_at: None,
            created_at: now,
        }
    }

    pub fn is_open_reservation(&self) -> bool {
        self.transaction_type == TransactionType::Reserve
            && self.status == TransactionStatus::Pending
    }

    pub fn is_settled_deduction(&self) -> bool {
        self.transaction_type == TransactionType::Deduct
            && self.status == TransactionStatus::Confirmed
    }

    /// Credits that can still be refunded
    pub fn refundable(&self) -> i64 {
        self.total_amount - self.refund_amount
    }

    pub(crate) fn require_open_reservation(&self) -> Result<(), BillingError> {
        if self.is_open_reservation() {
            Ok(())
        } else {
            Err(BillingError::InvalidTransactionState {
                transaction_id: self.id,
                status: self.status,
                transaction_type: self.transaction_type,
                expected: "PENDING/RESERVE",
            })
        }
    }

    pub(crate) fn require_settled_deduction(&self) -> Result<(), BillingError> {
        if self.is_settled_deduction() {
            Ok(())
        } else {
            Err(BillingError::InvalidTransactionState {
                transaction_id: self.id,
                status: self.status,
                transaction_type: self.transaction_type,
                expected: "CONFIRMED/DEDUCT",
            })
        }
    }

    pub(crate) fn mark_confirmed(&mut self, now: OffsetDateTime) {
        self.transaction_type = TransactionType::Deduct;
        self.status = TransactionStatus::Confirmed;
        self.confirmed_at = Some(now);
        self.expire_at = None;
    }

    pub(crate) fn mark_cancelled(&mut self, now: OffsetDateTime, reason: Option<&str>) {
        self.status = TransactionStatus::Cancelled;
        self.cancelled_at = Some(now);
        self.expire_at = None;
        if let Some(reason) = reason {
            self.metadata.cancel_reason = Some(reason.to_string());
        }
    }
}

/// Row shape of `credit_transactions`
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct CreditTransactionRow {
    pub id: Uuid,
    pub billing_user_id: Uuid,
    #[sqlx(rename = "type")]
    pub transaction_type: String,
    pub status: String,
    pub total_amount: i64,
    pub refund_amount: i64,
    pub expire_at: Option<OffsetDateTime>,
    pub metadata: sqlx::types::Json<TransactionMetadata>,
    pub confirmed_at: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl TryFrom<CreditTransactionRow> for CreditTransaction {
    type Error = BillingError;

    fn try_from(row: CreditTransactionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            billing_user_id: row.billing_user_id,
            transaction_type: row.transaction_type.parse()?,
            status: row.status.parse()?,
            total_amount: row.total_amount,
            refund_amount: row.refund_amount,
            expire_at: row.expire_at,
            metadata: row.metadata.0,
            confirmed_at: row.confirmed_at,
            cancelled_at: row.cancelled_at,
            created_at: row.created_at,
        })
    }
}

/// How much of one grant an operation moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantMovement {
    pub grant_id: Uuid,
    pub amount: i64,
}

/// Immutable record of how a transaction was sourced across grants
///
/// Positive amounts fund a reservation; refunds append negative rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CreditTransactionDetail {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub grant_id: Uuid,
    pub amount: i64,
    pub balance_after: i64,
    pub created_at: OffsetDateTime,
}

impl CreditTransactionDetail {
    pub fn new(
        transaction_id: Uuid,
        grant_id: Uuid,
        amount: i64,
        balance_after: i64,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id,
            grant_id,
            amount,
            balance_after,
            created_at: now,
        }
    }
}
