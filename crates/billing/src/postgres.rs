//! Postgres-backed credit ledger
//!
//! Each operation runs in one database transaction. Grant rows are re-read
//! with `FOR UPDATE` immediately before their deltas are computed, and the
//! grant invariants are checked in Rust before any write (and again by the
//! table's CHECK constraints).

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::allocation::{self, GrantSet};
use crate::error::{BillingError, BillingResult};
use crate::grant::{CreditAccount, CreditGrant};
use crate::ledger::CreditLedger;
use crate::refund::{self, RefundReceipt};
use crate::transaction::{CreditTransaction, CreditTransactionDetail, CreditTransactionRow};

const GRANT_COLUMNS: &str = r#"
    g.id, g.billing_user_id, g.subscription_id, g.purchase_id,
    COALESCE(s.team_id, p.team_id) AS team_id,
    g.amount, g.remaining_amount, g.reserved_amount, g.used_amount, g.available_amount,
    g.valid_from, g.valid_until, g.created_at, g.updated_at
"#;

const GRANT_JOINS: &str = r#"
    FROM credit_grants g
    LEFT JOIN subscriptions s ON s.id = g.subscription_id
    LEFT JOIN purchases p ON p.id = g.purchase_id
"#;

const TRANSACTION_COLUMNS: &str = r#"
    id, billing_user_id, type, status, total_amount, refund_amount, expire_at,
    metadata, confirmed_at, cancelled_at, created_at
"#;

/// Ledger stored in the `credit_*` tables
#[derive(Clone)]
pub struct PgCreditLedger {
    pool: PgPool,
}

impl PgCreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_eligible_grants(
        tx: &mut Transaction<'_, Postgres>,
        account: &CreditAccount,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<CreditGrant>> {
        let sql = format!(
            r#"
            SELECT {GRANT_COLUMNS}
            {GRANT_JOINS}
            WHERE (g.billing_user_id = $1
                   OR ($2::uuid IS NOT NULL AND COALESCE(s.team_id, p.team_id) = $2))
              AND g.available_amount > 0
              AND g.valid_from <= $3
              AND (g.valid_until IS NULL OR g.valid_until >= $3)
            ORDER BY g.valid_until ASC NULLS LAST, g.created_at ASC, g.id ASC
            FOR UPDATE OF g
            "#
        );

        let grants = sqlx::query_as::<_, CreditGrant>(&sql)
            .bind(account.billing_user_id)
            .bind(account.team_id)
            .bind(now)
            .fetch_all(&mut **tx)
            .await?;

        Ok(grants)
    }

    async fn lock_grants(
        tx: &mut Transaction<'_, Postgres>,
        details: &[CreditTransactionDetail],
    ) -> BillingResult<GrantSet> {
        let mut ids: Vec<Uuid> = details.iter().map(|d| d.grant_id).collect();
        ids.sort();
        ids.dedup();

        let sql = format!(
            r#"
            SELECT {GRANT_COLUMNS}
            {GRANT_JOINS}
            WHERE g.id = ANY($1)
            ORDER BY g.id
            FOR UPDATE OF g
            "#
        );

        let grants = sqlx::query_as::<_, CreditGrant>(&sql)
            .bind(&ids)
            .fetch_all(&mut **tx)
            .await?;

        Ok(grants.into_iter().map(|g| (g.id, g)).collect())
    }

    async fn lock_transaction(
        tx: &mut Transaction<'_, Postgres>,
        transaction_id: Uuid,
    ) -> BillingResult<CreditTransaction> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions WHERE id = $1 FOR UPDATE"
        );

        let row = sqlx::query_as::<_, CreditTransactionRow>(&sql)
            .bind(transaction_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(BillingError::TransactionNotFound(transaction_id))?;

        row.try_into()
    }

    async fn load_details(
        tx: &mut Transaction<'_, Postgres>,
        transaction_id: Uuid,
    ) -> BillingResult<Vec<CreditTransactionDetail>> {
        let details = sqlx::query_as::<_, CreditTransactionDetail>(
            r#"
            SELECT id, transaction_id, grant_id, amount, balance_after, created_at
            FROM credit_transaction_details
            WHERE transaction_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(transaction_id)
        .fetch_all(&mut **tx)
        .await?;

        Ok(details)
    }

    async fn write_grant(
        tx: &mut Transaction<'_, Postgres>,
        grant: &CreditGrant,
    ) -> BillingResult<()> {
        grant.verify()?;

        sqlx::query(
            r#"
            UPDATE credit_grants
            SET remaining_amount = $2,
                reserved_amount = $3,
                used_amount = $4,
                available_amount = $5,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(grant.id)
        .bind(grant.remaining_amount)
        .bind(grant.reserved_amount)
        .bind(grant.used_amount)
        .bind(grant.available_amount)
        .bind(grant.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn insert_details(
        tx: &mut Transaction<'_, Postgres>,
        details: &[CreditTransactionDetail],
    ) -> BillingResult<()> {
        for detail in details {
            sqlx::query(
                r#"
                INSERT INTO credit_transaction_details
                    (id, transaction_id, grant_id, amount, balance_after, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(detail.id)
            .bind(detail.transaction_id)
            .bind(detail.grant_id)
            .bind(detail.amount)
            .bind(detail.balance_after)
            .bind(detail.created_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn write_transaction(
        tx: &mut Transaction<'_, Postgres>,
        transaction: &CreditTransaction,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE credit_transactions
            SET type = $2,
                status = $3,
                refund_amount = $4,
                expire_at = $5,
                metadata = $6,
                confirmed_at = $7,
                cancelled_at = $8
            WHERE id = $1
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.transaction_type.as_str())
        .bind(transaction.status.as_str())
        .bind(transaction.refund_amount)
        .bind(transaction.expire_at)
        .bind(sqlx::types::Json(&transaction.metadata))
        .bind(transaction.confirmed_at)
        .bind(transaction.cancelled_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Confirm or cancel a reservation inside one database transaction
    async fn settle(
        &self,
        transaction_id: Uuid,
        confirm: bool,
        cancel_reason: Option<&str>,
    ) -> BillingResult<()> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        let mut transaction = Self::lock_transaction(&mut tx, transaction_id).await?;
        let details = Self::load_details(&mut tx, transaction_id).await?;
        let mut grants = Self::lock_grants(&mut tx, &details).await?;

        if confirm {
            allocation::confirm(&mut transaction, &details, &mut grants, now)?;
        } else {
            allocation::cancel(&mut transaction, &details, &mut grants, now, cancel_reason)?;
        }

        for grant in grants.values() {
            Self::write_grant(&mut tx, grant).await?;
        }
        Self::write_transaction(&mut tx, &transaction).await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl CreditLedger for PgCreditLedger {
    #[tracing::instrument(skip(self), fields(billing_user_id = %account.billing_user_id))]
    async fn reserve(
        &self,
        account: &CreditAccount,
        amount: i64,
        task_id: Option<Uuid>,
    ) -> BillingResult<CreditTransaction> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        let mut grants = Self::lock_eligible_grants(&mut tx, account, now).await?;
        // Dropping `tx` on error rolls back; nothing has been written yet
        let reservation = allocation::reserve(&mut grants, account, amount, task_id, now)?;

        for grant in grants
            .iter()
            .filter(|g| reservation.details.iter().any(|d| d.grant_id == g.id))
        {
            Self::write_grant(&mut tx, grant).await?;
        }

        let transaction = &reservation.transaction;
        sqlx::query(
            r#"
            INSERT INTO credit_transactions
                (id, billing_user_id, type, status, total_amount, refund_amount,
                 expire_at, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.billing_user_id)
        .bind(transaction.transaction_type.as_str())
        .bind(transaction.status.as_str())
        .bind(transaction.total_amount)
        .bind(transaction.refund_amount)
        .bind(transaction.expire_at)
        .bind(sqlx::types::Json(&transaction.metadata))
        .bind(transaction.created_at)
        .execute(&mut *tx)
        .await?;

        Self::insert_details(&mut tx, &reservation.details).await?;
        tx.commit().await?;

        tracing::info!(
            transaction_id = %transaction.id,
            amount = amount,
            grants = reservation.details.len(),
            "Reserved credits"
        );

        Ok(reservation.transaction)
    }

    #[tracing::instrument(skip(self))]
    async fn confirm(&self, transaction_id: Uuid) -> BillingResult<()> {
        self.settle(transaction_id, true, None).await?;
        tracing::info!(transaction_id = %transaction_id, "Confirmed credit reservation");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn cancel(&self, transaction_id: Uuid) -> BillingResult<()> {
        self.settle(transaction_id, false, None).await?;
        tracing::info!(transaction_id = %transaction_id, "Cancelled credit reservation");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn refund(
        &self,
        transaction_id: Uuid,
        amount: i64,
        description: Option<&str>,
    ) -> BillingResult<RefundReceipt> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        let mut transaction = Self::lock_transaction(&mut tx, transaction_id).await?;
        let details = Self::load_details(&mut tx, transaction_id).await?;
        let mut grants = Self::lock_grants(&mut tx, &details).await?;

        let entries = refund::refund(
            &mut transaction,
            &details,
            &mut grants,
            amount,
            description,
            now,
        )?;

        for movement in &entries.receipt.allocations {
            let grant = grants
                .get(&movement.grant_id)
                .ok_or_else(|| allocation::missing_grant(transaction_id, movement.grant_id))?;
            Self::write_grant(&mut tx, grant).await?;
        }
        Self::insert_details(&mut tx, &entries.details).await?;
        Self::write_transaction(&mut tx, &transaction).await?;

        if let Some((task_id, actual_credits)) = entries.receipt.task_actual_credits {
            sqlx::query("UPDATE tasks SET actual_credits = $2, updated_at = $3 WHERE id = $1")
                .bind(task_id)
                .bind(actual_credits)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        tracing::info!(
            transaction_id = %transaction_id,
            refunded = amount,
            total_refunded = transaction.refund_amount,
            "Refunded credits"
        );

        Ok(entries.receipt)
    }

    async fn find_task_deduction(&self, task_id: Uuid) -> BillingResult<Option<CreditTransaction>> {
        let sql = format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM credit_transactions
            WHERE metadata->>'taskId' = $1
              AND type = 'DEDUCT'
              AND status = 'CONFIRMED'
            ORDER BY created_at DESC
            LIMIT 1
            "#
        );

        let row = sqlx::query_as::<_, CreditTransactionRow>(&sql)
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(CreditTransaction::try_from).transpose()
    }

    async fn available_balance(&self, account: &CreditAccount) -> BillingResult<i64> {
        let sql = format!(
            r#"
            SELECT COALESCE(SUM(g.available_amount), 0)::BIGINT
            {GRANT_JOINS}
            WHERE (g.billing_user_id = $1
                   OR ($2::uuid IS NOT NULL AND COALESCE(s.team_id, p.team_id) = $2))
              AND g.available_amount > 0
              AND g.valid_from <= NOW()
              AND (g.valid_until IS NULL OR g.valid_until >= NOW())
            "#
        );

        let (balance,): (i64,) = sqlx::query_as(&sql)
            .bind(account.billing_user_id)
            .bind(account.team_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(balance)
    }

    async fn cancel_expired_reservations(&self, now: OffsetDateTime) -> BillingResult<Vec<Uuid>> {
        let candidates: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM credit_transactions
            WHERE type = 'RESERVE' AND status = 'PENDING' AND expire_at < $1
            ORDER BY expire_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut cancelled = Vec::with_capacity(candidates.len());
        for (id,) in candidates {
            match self.settle(id, false, Some("expired")).await {
                Ok(()) => {
                    tracing::info!(transaction_id = %id, "Cancelled expired credit reservation");
                    cancelled.push(id);
                }
                // Settled by its task between the scan and the lock
                Err(BillingError::InvalidTransactionState { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(cancelled)
    }
}
