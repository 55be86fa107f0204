//! Ledger invariant checks
//!
//! Read-only SQL queries that re-derive the ledger's conservation rules from
//! the stored rows. Run them after incidents, migrations or on a schedule;
//! any violation means the grant counters and the transaction history no
//! longer agree.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// One failed check, for one grant or transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    /// Grant, transaction or task ids involved
    pub entity_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Credits were created or destroyed
    Critical,
    /// History and counters disagree
    High,
    /// Cleanup lagging behind
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }

    /// Highest severity present, if any violation was found
    pub fn worst_severity(&self) -> Option<ViolationSeverity> {
        self.violations.iter().map(|v| v.severity).min_by_key(|s| *s as u8)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct GrantCountersRow {
    id: Uuid,
    amount: i64,
    remaining_amount: i64,
    reserved_amount: i64,
    used_amount: i64,
    available_amount: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct ReservedMismatchRow {
    id: Uuid,
    reserved_amount: i64,
    open_reserved: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct RefundMismatchRow {
    id: Uuid,
    total_amount: i64,
    refund_amount: i64,
    refunded_in_details: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct StaleReservationRow {
    id: Uuid,
    billing_user_id: Uuid,
    expire_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct ActualCreditsRow {
    task_id: Uuid,
    transaction_id: Uuid,
    actual_credits: i64,
    charged: i64,
}

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for name in Self::available_checks() {
            violations.extend(self.run_check(name).await?);
        }

        let summary = InvariantCheckSummary::from_violations(
            now,
            Self::available_checks().len(),
            violations,
        );

        if summary.healthy {
            tracing::info!(checks = summary.checks_run, "Ledger invariants hold");
        } else {
            tracing::error!(
                failed = summary.checks_failed,
                violations = summary.violations.len(),
                "Ledger invariant violations found"
            );
        }

        Ok(summary)
    }

    /// remaining + used == amount
    async fn check_grant_balance_identity(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<GrantCountersRow> = sqlx::query_as(
            r#"
            SELECT id, amount, remaining_amount, reserved_amount, used_amount, available_amount
            FROM credit_grants
            WHERE remaining_amount + used_amount <> amount
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "grant_balance_identity".to_string(),
                entity_ids: vec![row.id],
                description: format!(
                    "Grant remaining ({}) + used ({}) does not equal amount ({})",
                    row.remaining_amount, row.used_amount, row.amount
                ),
                context: serde_json::json!({
                    "amount": row.amount,
                    "remaining_amount": row.remaining_amount,
                    "used_amount": row.used_amount,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// available == remaining - reserved
    async fn check_grant_available_identity(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<GrantCountersRow> = sqlx::query_as(
            r#"
            SELECT id, amount, remaining_amount, reserved_amount, used_amount, available_amount
            FROM credit_grants
            WHERE available_amount <> remaining_amount - reserved_amount
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "grant_available_identity".to_string(),
                entity_ids: vec![row.id],
                description: format!(
                    "Grant available ({}) is not remaining ({}) minus reserved ({})",
                    row.available_amount, row.remaining_amount, row.reserved_amount
                ),
                context: serde_json::json!({
                    "remaining_amount": row.remaining_amount,
                    "reserved_amount": row.reserved_amount,
                    "available_amount": row.available_amount,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_grant_non_negative(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<GrantCountersRow> = sqlx::query_as(
            r#"
            SELECT id, amount, remaining_amount, reserved_amount, used_amount, available_amount
            FROM credit_grants
            WHERE remaining_amount < 0
               OR reserved_amount < 0
               OR used_amount < 0
               OR available_amount < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "grant_non_negative".to_string(),
                entity_ids: vec![row.id],
                description: "Grant has a negative counter".to_string(),
                context: serde_json::json!({
                    "remaining_amount": row.remaining_amount,
                    "reserved_amount": row.reserved_amount,
                    "used_amount": row.used_amount,
                    "available_amount": row.available_amount,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// A grant's hold equals the positive details of its open reservations
    async fn check_reserved_matches_open_reservations(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ReservedMismatchRow> = sqlx::query_as(
            r#"
            SELECT g.id, g.reserved_amount, COALESCE(open.held, 0)::BIGINT AS open_reserved
            FROM credit_grants g
            LEFT JOIN (
                SELECT d.grant_id, SUM(d.amount) AS held
                FROM credit_transaction_details d
                JOIN credit_transactions t ON t.id = d.transaction_id
                WHERE t.type = 'RESERVE' AND t.status = 'PENDING' AND d.amount > 0
                GROUP BY d.grant_id
            ) open ON open.grant_id = g.id
            WHERE g.reserved_amount <> COALESCE(open.held, 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "reserved_matches_open_reservations".to_string(),
                entity_ids: vec![row.id],
                description: format!(
                    "Grant holds {} credits but open reservations account for {}",
                    row.reserved_amount, row.open_reserved
                ),
                context: serde_json::json!({
                    "reserved_amount": row.reserved_amount,
                    "open_reserved": row.open_reserved,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// refund_amount stays within total and matches the negative details
    async fn check_refund_within_total(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RefundMismatchRow> = sqlx::query_as(
            r#"
            SELECT t.id, t.total_amount, t.refund_amount,
                   COALESCE(-SUM(d.amount) FILTER (WHERE d.amount < 0), 0)::BIGINT
                       AS refunded_in_details
            FROM credit_transactions t
            LEFT JOIN credit_transaction_details d ON d.transaction_id = t.id
            GROUP BY t.id, t.total_amount, t.refund_amount
            HAVING t.refund_amount > t.total_amount
                OR t.refund_amount <> COALESCE(-SUM(d.amount) FILTER (WHERE d.amount < 0), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "refund_within_total".to_string(),
                entity_ids: vec![row.id],
                description: format!(
                    "Transaction refunded {} of {} but details record {}",
                    row.refund_amount, row.total_amount, row.refunded_in_details
                ),
                context: serde_json::json!({
                    "total_amount": row.total_amount,
                    "refund_amount": row.refund_amount,
                    "refunded_in_details": row.refunded_in_details,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Reservations the sweeper should already have released
    async fn check_stale_reservations(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleReservationRow> = sqlx::query_as(
            r#"
            SELECT id, billing_user_id, expire_at
            FROM credit_transactions
            WHERE type = 'RESERVE'
              AND status = 'PENDING'
              AND expire_at < NOW() - INTERVAL '1 hour'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "stale_reservations".to_string(),
                entity_ids: vec![row.id, row.billing_user_id],
                description: format!("Reservation expired at {:?} is still pending", row.expire_at),
                context: serde_json::json!({
                    "expire_at": row.expire_at.map(|t| t.unix_timestamp()),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Task.actual_credits follows its deduction's net charge
    async fn check_task_actual_credits(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ActualCreditsRow> = sqlx::query_as(
            r#"
            SELECT k.id AS task_id, t.id AS transaction_id, k.actual_credits,
                   (t.total_amount - t.refund_amount) AS charged
            FROM credit_transactions t
            JOIN tasks k ON k.id::text = t.metadata->>'taskId'
            WHERE t.type = 'DEDUCT'
              AND t.status = 'CONFIRMED'
              AND k.actual_credits <> t.total_amount - t.refund_amount
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "task_actual_credits".to_string(),
                entity_ids: vec![row.task_id, row.transaction_id],
                description: format!(
                    "Task records {} actual credits but its deduction charged {}",
                    row.actual_credits, row.charged
                ),
                context: serde_json::json!({
                    "actual_credits": row.actual_credits,
                    "charged": row.charged,
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "grant_balance_identity" => self.check_grant_balance_identity().await,
            "grant_available_identity" => self.check_grant_available_identity().await,
            "grant_non_negative" => self.check_grant_non_negative().await,
            "reserved_matches_open_reservations" => {
                self.check_reserved_matches_open_reservations().await
            }
            "refund_within_total" => self.check_refund_within_total().await,
            "stale_reservations" => self.check_stale_reservations().await,
            "task_actual_credits" => self.check_task_actual_credits().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "grant_balance_identity",
            "grant_available_identity",
            "grant_non_negative",
            "reserved_matches_open_reservations",
            "refund_within_total",
            "stale_reservations",
            "task_actual_credits",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(invariant: &str, severity: ViolationSeverity) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            entity_ids: vec![Uuid::new_v4()],
            description: String::new(),
            context: serde_json::Value::Null,
            severity,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 7);
        assert!(checks.contains(&"grant_balance_identity"));
        assert!(checks.contains(&"reserved_matches_open_reservations"));
    }

    #[test]
    fn test_summary_counts_failed_checks_not_violations() {
        let summary = InvariantCheckSummary::from_violations(
            OffsetDateTime::now_utc(),
            7,
            vec![
                violation("grant_balance_identity", ViolationSeverity::Critical),
                violation("grant_balance_identity", ViolationSeverity::Critical),
                violation("stale_reservations", ViolationSeverity::Medium),
            ],
        );

        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 5);
        assert!(!summary.healthy);
        assert_eq!(summary.worst_severity(), Some(ViolationSeverity::Critical));
    }

    #[test]
    fn test_empty_summary_is_healthy() {
        let summary = InvariantCheckSummary::from_violations(OffsetDateTime::now_utc(), 7, vec![]);
        assert!(summary.healthy);
        assert_eq!(summary.checks_passed, 7);
        assert_eq!(summary.worst_severity(), None);
    }
}
