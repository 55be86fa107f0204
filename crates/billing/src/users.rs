//! Billing users
//!
//! Maps application users onto the billing identity that owns grants and
//! transactions. Rows are created lazily on first use.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::grant::CreditAccount;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingUser {
    pub id: Uuid,
    pub user_id: Uuid,
    pub team_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
}

impl BillingUser {
    /// The grant pool this user spends from
    pub fn account(&self) -> CreditAccount {
        CreditAccount {
            billing_user_id: self.id,
            team_id: self.team_id,
        }
    }
}

/// Subscription statuses that still entitle the team to private tasks
const ENTITLED_SUBSCRIPTION_STATUSES: &[&str] = &["active", "trialing"];

pub struct BillingUserDirectory {
    pool: PgPool,
}

impl BillingUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fetch the billing user for an application user, creating it if needed
    pub async fn get_or_create_by_user_id(&self, user_id: Uuid) -> BillingResult<BillingUser> {
        // Concurrent first requests race on the unique user_id; the loser's
        // insert is a no-op and both read the same row back.
        let inserted = sqlx::query(
            r#"
            INSERT INTO billing_users (id, user_id, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            tracing::info!(user_id = %user_id, "Created billing user");
        }

        let user: BillingUser = sqlx::query_as(
            "SELECT id, user_id, team_id, created_at FROM billing_users WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(user)
    }

    /// Whether the user holds a currently valid subscription grant
    pub async fn has_valid_private_task_permission(&self, user_id: Uuid) -> BillingResult<bool> {
        let statuses: Vec<String> = ENTITLED_SUBSCRIPTION_STATUSES
            .iter()
            .map(|s| s.to_string())
            .collect();

        let (permitted,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM billing_users b
                JOIN credit_grants g ON TRUE
                JOIN subscriptions s ON s.id = g.subscription_id
                WHERE b.user_id = $1
                  AND (g.billing_user_id = b.id OR s.team_id = b.team_id)
                  AND s.status = ANY($2)
                  AND g.valid_from <= NOW()
                  AND (g.valid_until IS NULL OR g.valid_until >= NOW())
            )
            "#,
        )
        .bind(user_id)
        .bind(&statuses)
        .fetch_one(&self.pool)
        .await?;

        Ok(permitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_carries_team() {
        let team_id = Uuid::new_v4();
        let user = BillingUser {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            team_id: Some(team_id),
            created_at: OffsetDateTime::now_utc(),
        };

        let account = user.account();
        assert_eq!(account.billing_user_id, user.id);
        assert_eq!(account.team_id, Some(team_id));
    }
}
