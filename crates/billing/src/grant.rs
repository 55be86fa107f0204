//! Credit grants
//!
//! A grant is a pool of spendable credits with its own validity window and
//! four mutually constrained counters:
//!
//! - `remaining_amount + used_amount == amount`
//! - `available_amount == remaining_amount - reserved_amount`
//! - every counter is non-negative
//!
//! Grants are issued outside the ledger and only ever drained by it.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Whose grants may fund an operation
///
/// A billing user spends grants issued to them directly plus grants issued to
/// their team through a subscription or a purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditAccount {
    pub billing_user_id: Uuid,
    pub team_id: Option<Uuid>,
}

impl CreditAccount {
    pub fn user(billing_user_id: Uuid) -> Self {
        Self {
            billing_user_id,
            team_id: None,
        }
    }

    pub fn with_team(billing_user_id: Uuid, team_id: Uuid) -> Self {
        Self {
            billing_user_id,
            team_id: Some(team_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CreditGrant {
    pub id: Uuid,
    pub billing_user_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub purchase_id: Option<Uuid>,
    /// Team reached through the subscription or purchase
    pub team_id: Option<Uuid>,
    pub amount: i64,
    pub remaining_amount: i64,
    pub reserved_amount: i64,
    pub used_amount: i64,
    pub available_amount: i64,
    pub valid_from: OffsetDateTime,
    pub valid_until: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl CreditGrant {
    /// A fresh, untouched grant owned directly by a billing user
    pub fn issue(
        billing_user_id: Uuid,
        amount: i64,
        valid_from: OffsetDateTime,
        valid_until: Option<OffsetDateTime>,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            billing_user_id: Some(billing_user_id),
            subscription_id: None,
            purchase_id: None,
            team_id: None,
            amount,
            remaining_amount: amount,
            reserved_amount: 0,
            used_amount: 0,
            available_amount: amount,
            valid_from,
            valid_until,
            created_at: now,
            updated_at: now,
        }
    }

    /// A fresh grant that reaches a team through a subscription
    pub fn issue_to_team(
        team_id: Uuid,
        subscription_id: Uuid,
        amount: i64,
        valid_from: OffsetDateTime,
        valid_until: Option<OffsetDateTime>,
    ) -> Self {
        let mut grant = Self::issue(Uuid::nil(), amount, valid_from, valid_until);
        grant.billing_user_id = None;
        grant.subscription_id = Some(subscription_id);
        grant.team_id = Some(team_id);
        grant
    }

    pub fn owned_by(&self, account: &CreditAccount) -> bool {
        self.billing_user_id == Some(account.billing_user_id)
            || (account.team_id.is_some() && self.team_id == account.team_id)
    }

    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        self.valid_from <= now && self.valid_until.map_or(true, |until| until >= now)
    }

    /// Can fund a new reservation right now
    pub fn is_eligible(&self, account: &CreditAccount, now: OffsetDateTime) -> bool {
        self.available_amount > 0 && self.is_valid_at(now) && self.owned_by(account)
    }

    pub fn expires(&self) -> bool {
        self.valid_until.is_some()
    }

    /// Recompute the stored available amount from its parts
    pub(crate) fn refresh_available(&mut self) {
        self.available_amount = self.remaining_amount - self.reserved_amount;
    }

    /// Check the counter identities before a write is persisted
    pub fn verify(&self) -> BillingResult<()> {
        if self.remaining_amount + self.used_amount != self.amount {
            return Err(self.violation(
                "remaining_amount + used_amount == amount",
                self.amount,
                self.remaining_amount + self.used_amount,
            ));
        }

        let expected_available = self.remaining_amount - self.reserved_amount;
        if self.available_amount != expected_available {
            return Err(self.violation(
                "available_amount == remaining_amount - reserved_amount",
                expected_available,
                self.available_amount,
            ));
        }

        for (invariant, value) in [
            ("remaining_amount >= 0", self.remaining_amount),
            ("reserved_amount >= 0", self.reserved_amount),
            ("used_amount >= 0", self.used_amount),
            ("available_amount >= 0", self.available_amount),
        ] {
            if value < 0 {
                return Err(self.violation(invariant, 0, value));
            }
        }

        Ok(())
    }

    fn violation(&self, invariant: &'static str, expected: i64, actual: i64) -> BillingError {
        tracing::error!(
            grant_id = %self.id,
            invariant = invariant,
            expected = expected,
            actual = actual,
            amount = self.amount,
            remaining_amount = self.remaining_amount,
            reserved_amount = self.reserved_amount,
            used_amount = self.used_amount,
            available_amount = self.available_amount,
            "Credit grant invariant violated"
        );
        BillingError::LedgerInvariantViolation {
            grant_id: self.id,
            invariant,
            expected,
            actual,
        }
    }
}

/// Order in which grants fund a reservation
///
/// Soonest-expiring first; grants that never expire come last.
pub fn reservation_order(a: &CreditGrant, b: &CreditGrant) -> Ordering {
    match (a.valid_until, b.valid_until) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.created_at.cmp(&b.created_at))
    .then_with(|| a.id.cmp(&b.id))
}

/// Order in which grants receive a refund
///
/// Never-expiring first, then the latest expiry, then the newest grant, so
/// returned credit stays usable for as long as possible.
pub fn refund_order(a: &CreditGrant, b: &CreditGrant) -> Ordering {
    match (a.valid_until, b.valid_until) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => y.cmp(&x),
    }
    .then_with(|| b.created_at.cmp(&a.created_at))
    .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn grant(valid_until: Option<OffsetDateTime>) -> CreditGrant {
        CreditGrant::issue(
            Uuid::new_v4(),
            10,
            OffsetDateTime::now_utc() - Duration::days(1),
            valid_until,
        )
    }

    #[test]
    fn test_fresh_grant_satisfies_invariants() {
        assert!(grant(None).verify().is_ok());
    }

    #[test]
    fn test_verify_detects_drifted_available_amount() {
        let mut g = grant(None);
        g.reserved_amount = 3;
        let err = g.verify().unwrap_err();
        assert!(matches!(
            err,
            BillingError::LedgerInvariantViolation {
                expected: 7,
                actual: 10,
                ..
            }
        ));
    }

    #[test]
    fn test_verify_detects_broken_balance_identity() {
        let mut g = grant(None);
        g.used_amount = 1;
        assert!(g.verify().is_err());
    }

    #[test]
    fn test_expired_grant_not_eligible() {
        let now = OffsetDateTime::now_utc();
        let g = grant(Some(now - Duration::hours(1)));
        let account = CreditAccount::user(g.billing_user_id.unwrap());
        assert!(!g.is_eligible(&account, now));
    }

    #[test]
    fn test_future_grant_not_eligible() {
        let now = OffsetDateTime::now_utc();
        let mut g = grant(None);
        g.valid_from = now + Duration::hours(1);
        let account = CreditAccount::user(g.billing_user_id.unwrap());
        assert!(!g.is_eligible(&account, now));
    }

    #[test]
    fn test_team_grant_owned_through_team() {
        let now = OffsetDateTime::now_utc();
        let team = Uuid::new_v4();
        let g = CreditGrant::issue_to_team(team, Uuid::new_v4(), 5, now - Duration::days(1), None);
        assert!(g.is_eligible(&CreditAccount::with_team(Uuid::new_v4(), team), now));
        assert!(!g.is_eligible(&CreditAccount::user(Uuid::new_v4()), now));
    }

    #[test]
    fn test_reservation_order_prefers_soonest_expiry() {
        let now = OffsetDateTime::now_utc();
        let never = grant(None);
        let late = grant(Some(now + Duration::days(30)));
        let soon = grant(Some(now + Duration::days(1)));

        let mut grants = vec![never.clone(), late.clone(), soon.clone()];
        grants.sort_by(reservation_order);
        let ids: Vec<Uuid> = grants.iter().map(|g| g.id).collect();
        assert_eq!(ids, vec![soon.id, late.id, never.id]);
    }

    #[test]
    fn test_refund_order_prefers_longest_lived() {
        let now = OffsetDateTime::now_utc();
        let never = grant(None);
        let late = grant(Some(now + Duration::days(30)));
        let soon = grant(Some(now + Duration::days(1)));

        let mut grants = vec![soon.clone(), late.clone(), never.clone()];
        grants.sort_by(refund_order);
        let ids: Vec<Uuid> = grants.iter().map(|g| g.id).collect();
        assert_eq!(ids, vec![never.id, late.id, soon.id]);
    }
}
