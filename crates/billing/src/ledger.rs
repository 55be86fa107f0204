//! Credit ledger
//!
//! The four state transitions of a credit hold (reserve, confirm, cancel,
//! refund) behind one trait. Each call is atomic: either every grant,
//! transaction and detail write lands, or none does.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::allocation::{self, GrantSet};
use crate::error::{BillingError, BillingResult};
use crate::grant::{CreditAccount, CreditGrant};
use crate::refund::{self, RefundReceipt};
use crate::transaction::{CreditTransaction, CreditTransactionDetail};

#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Hold `amount` credits for an account, optionally linked to a task
    async fn reserve(
        &self,
        account: &CreditAccount,
        amount: i64,
        task_id: Option<Uuid>,
    ) -> BillingResult<CreditTransaction>;

    /// Spend a pending reservation
    async fn confirm(&self, transaction_id: Uuid) -> BillingResult<()>;

    /// Release a pending reservation
    async fn cancel(&self, transaction_id: Uuid) -> BillingResult<()>;

    /// Return credits from a confirmed deduction
    async fn refund(
        &self,
        transaction_id: Uuid,
        amount: i64,
        description: Option<&str>,
    ) -> BillingResult<RefundReceipt>;

    /// The confirmed deduction that paid for a task
    async fn find_task_deduction(&self, task_id: Uuid) -> BillingResult<Option<CreditTransaction>>;

    /// Credits an account could reserve right now
    async fn available_balance(&self, account: &CreditAccount) -> BillingResult<i64>;

    /// Cancel reservations whose TTL passed, returning their ids
    async fn cancel_expired_reservations(&self, now: OffsetDateTime) -> BillingResult<Vec<Uuid>>;
}

#[derive(Debug, Default)]
struct MemoryState {
    grants: HashMap<Uuid, CreditGrant>,
    transactions: HashMap<Uuid, CreditTransaction>,
    details: Vec<CreditTransactionDetail>,
}

impl MemoryState {
    fn transaction(&self, id: Uuid) -> BillingResult<CreditTransaction> {
        self.transactions
            .get(&id)
            .cloned()
            .ok_or(BillingError::TransactionNotFound(id))
    }

    fn details_of(&self, transaction_id: Uuid) -> Vec<CreditTransactionDetail> {
        self.details
            .iter()
            .filter(|d| d.transaction_id == transaction_id)
            .cloned()
            .collect()
    }

    fn grants_of(&self, details: &[CreditTransactionDetail]) -> GrantSet {
        details
            .iter()
            .filter_map(|d| self.grants.get(&d.grant_id))
            .map(|g| (g.id, g.clone()))
            .collect()
    }

    fn commit(&mut self, transaction: CreditTransaction, grants: GrantSet) {
        self.grants.extend(grants);
        self.transactions.insert(transaction.id, transaction);
    }

    fn settle(
        &mut self,
        transaction_id: Uuid,
        now: OffsetDateTime,
        cancel_reason: Option<&str>,
        confirm: bool,
    ) -> BillingResult<()> {
        let mut transaction = self.transaction(transaction_id)?;
        let details = self.details_of(transaction_id);
        let mut grants = self.grants_of(&details);

        if confirm {
            allocation::confirm(&mut transaction, &details, &mut grants, now)?;
        } else {
            allocation::cancel(&mut transaction, &details, &mut grants, now, cancel_reason)?;
        }

        self.commit(transaction, grants);
        Ok(())
    }
}

/// Ledger held in process memory
///
/// Every operation runs under one lock on copies of the rows it touches, so a
/// failed operation leaves the state exactly as it was.
#[derive(Debug, Clone, Default)]
pub struct MemoryCreditLedger {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryCreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a grant issued elsewhere (purchase, subscription renewal)
    pub async fn issue_grant(&self, grant: CreditGrant) -> BillingResult<()> {
        grant.verify()?;
        self.state.lock().await.grants.insert(grant.id, grant);
        Ok(())
    }

    pub async fn grant(&self, id: Uuid) -> Option<CreditGrant> {
        self.state.lock().await.grants.get(&id).cloned()
    }

    pub async fn grants(&self) -> Vec<CreditGrant> {
        self.state.lock().await.grants.values().cloned().collect()
    }

    pub async fn transaction(&self, id: Uuid) -> Option<CreditTransaction> {
        self.state.lock().await.transactions.get(&id).cloned()
    }

    pub async fn transactions(&self) -> Vec<CreditTransaction> {
        self.state
            .lock()
            .await
            .transactions
            .values()
            .cloned()
            .collect()
    }

    pub async fn details(&self, transaction_id: Uuid) -> Vec<CreditTransactionDetail> {
        self.state.lock().await.details_of(transaction_id)
    }
}

#[async_trait]
impl CreditLedger for MemoryCreditLedger {
    async fn reserve(
        &self,
        account: &CreditAccount,
        amount: i64,
        task_id: Option<Uuid>,
    ) -> BillingResult<CreditTransaction> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().await;

        let mut candidates: Vec<CreditGrant> = state
            .grants
            .values()
            .filter(|g| g.is_eligible(account, now))
            .cloned()
            .collect();
        let reservation = allocation::reserve(&mut candidates, account, amount, task_id, now)?;

        let touched: GrantSet = candidates
            .into_iter()
            .filter(|g| reservation.details.iter().any(|d| d.grant_id == g.id))
            .map(|g| (g.id, g))
            .collect();
        state.details.extend(reservation.details);
        state.commit(reservation.transaction.clone(), touched);

        tracing::info!(
            transaction_id = %reservation.transaction.id,
            billing_user_id = %account.billing_user_id,
            amount = amount,
            task_id = ?task_id,
            "Reserved credits"
        );
        Ok(reservation.transaction)
    }

    async fn confirm(&self, transaction_id: Uuid) -> BillingResult<()> {
        let now = OffsetDateTime::now_utc();
        self.state
            .lock()
            .await
            .settle(transaction_id, now, None, true)?;
        tracing::info!(transaction_id = %transaction_id, "Confirmed credit reservation");
        Ok(())
    }

    async fn cancel(&self, transaction_id: Uuid) -> BillingResult<()> {
        let now = OffsetDateTime::now_utc();
        self.state
            .lock()
            .await
            .settle(transaction_id, now, None, false)?;
        tracing::info!(transaction_id = %transaction_id, "Cancelled credit reservation");
        Ok(())
    }

    async fn refund(
        &self,
        transaction_id: Uuid,
        amount: i64,
        description: Option<&str>,
    ) -> BillingResult<RefundReceipt> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().await;

        let mut transaction = state.transaction(transaction_id)?;
        let details = state.details_of(transaction_id);
        let mut grants = state.grants_of(&details);

        let entries = refund::refund(
            &mut transaction,
            &details,
            &mut grants,
            amount,
            description,
            now,
        )?;

        state.details.extend(entries.details);
        state.commit(transaction, grants);

        tracing::info!(
            transaction_id = %transaction_id,
            refunded = amount,
            total_refunded = entries.receipt.transaction.refund_amount,
            "Refunded credits"
        );
        Ok(entries.receipt)
    }

    async fn find_task_deduction(&self, task_id: Uuid) -> BillingResult<Option<CreditTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .values()
            .find(|t| t.metadata.task_id == Some(task_id) && t.is_settled_deduction())
            .cloned())
    }

    async fn available_balance(&self, account: &CreditAccount) -> BillingResult<i64> {
        let now = OffsetDateTime::now_utc();
        let state = self.state.lock().await;
        Ok(state
            .grants
            .values()
            .filter(|g| g.is_eligible(account, now))
            .map(|g| g.available_amount)
            .sum())
    }

    async fn cancel_expired_reservations(&self, now: OffsetDateTime) -> BillingResult<Vec<Uuid>> {
        let mut state = self.state.lock().await;
        let expired: Vec<Uuid> = state
            .transactions
            .values()
            .filter(|t| t.is_open_reservation() && t.expire_at.is_some_and(|at| at < now))
            .map(|t| t.id)
            .collect();

        for id in &expired {
            state.settle(*id, now, Some("expired"), false)?;
            tracing::info!(transaction_id = %id, "Cancelled expired credit reservation");
        }

        Ok(expired)
    }
}
