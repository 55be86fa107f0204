//! Grant arithmetic for reserve, confirm and cancel
//!
//! These functions are shared by every ledger backend. They mutate the grants
//! they are handed, verify the invariants on each touched grant and return
//! the rows to persist. Callers must discard all mutations when an error is
//! returned.

use std::collections::HashMap;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::grant::{reservation_order, CreditAccount, CreditGrant};
use crate::transaction::{CreditTransaction, CreditTransactionDetail, GrantMovement};

/// Grants keyed by id, as loaded for one ledger operation
pub type GrantSet = HashMap<Uuid, CreditGrant>;

/// Rows produced by a successful reservation
#[derive(Debug, Clone)]
pub struct Reservation {
    pub transaction: CreditTransaction,
    pub details: Vec<CreditTransactionDetail>,
}

/// Decide which grants fund `amount` without touching them
///
/// Fails with `InsufficientCredits` when the eligible grants cannot cover it.
pub fn plan_reservation(
    grants: &[CreditGrant],
    account: &CreditAccount,
    amount: i64,
    now: OffsetDateTime,
) -> BillingResult<Vec<GrantMovement>> {
    if amount <= 0 {
        return Err(BillingError::InvalidAmount(amount));
    }

    let mut eligible: Vec<&CreditGrant> = grants
        .iter()
        .filter(|g| g.is_eligible(account, now))
        .collect();
    eligible.sort_by(|a, b| reservation_order(a, b));

    let available: i64 = eligible.iter().map(|g| g.available_amount).sum();
    if available < amount {
        return Err(BillingError::InsufficientCredits {
            requested: amount,
            available,
        });
    }

    let mut need = amount;
    let mut plan = Vec::new();
    for grant in eligible {
        if need == 0 {
            break;
        }
        let take = need.min(grant.available_amount);
        plan.push(GrantMovement {
            grant_id: grant.id,
            amount: take,
        });
        need -= take;
    }

    Ok(plan)
}

/// Hold `amount` across the account's eligible grants
pub fn reserve(
    grants: &mut [CreditGrant],
    account: &CreditAccount,
    amount: i64,
    task_id: Option<Uuid>,
    now: OffsetDateTime,
) -> BillingResult<Reservation> {
    let plan = plan_reservation(grants, account, amount, now)?;

    let transaction = CreditTransaction::reservation(account.billing_user_id, amount, task_id, now);
    let mut details = Vec::with_capacity(plan.len());

    for movement in &plan {
        let grant = grants
            .iter_mut()
            .find(|g| g.id == movement.grant_id)
            .ok_or_else(|| missing_grant(transaction.id, movement.grant_id))?;

        grant.reserved_amount += movement.amount;
        grant.refresh_available();
        grant.updated_at = now;
        grant.verify()?;

        details.push(CreditTransactionDetail::new(
            transaction.id,
            grant.id,
            movement.amount,
            grant.remaining_amount,
            now,
        ));
    }

    Ok(Reservation {
        transaction,
        details,
    })
}

/// Turn held credits into spent credits
pub fn confirm(
    transaction: &mut CreditTransaction,
    details: &[CreditTransactionDetail],
    grants: &mut GrantSet,
    now: OffsetDateTime,
) -> BillingResult<()> {
    transaction.require_open_reservation()?;

    for detail in reservation_details(transaction.id, details) {
        let grant = grants
            .get_mut(&detail.grant_id)
            .ok_or_else(|| missing_grant(transaction.id, detail.grant_id))?;

        grant.remaining_amount -= detail.amount;
        grant.reserved_amount -= detail.amount;
        grant.used_amount += detail.amount;
        grant.refresh_available();
        grant.updated_at = now;
        grant.verify()?;
    }

    transaction.mark_confirmed(now);
    Ok(())
}

/// Release held credits without spending them
pub fn cancel(
    transaction: &mut CreditTransaction,
    details: &[CreditTransactionDetail],
    grants: &mut GrantSet,
    now: OffsetDateTime,
    reason: Option<&str>,
) -> BillingResult<()> {
    transaction.require_open_reservation()?;

    for detail in reservation_details(transaction.id, details) {
        let grant = grants
            .get_mut(&detail.grant_id)
            .ok_or_else(|| missing_grant(transaction.id, detail.grant_id))?;

        grant.reserved_amount -= detail.amount;
        grant.refresh_available();
        grant.updated_at = now;
        grant.verify()?;
    }

    transaction.mark_cancelled(now, reason);
    Ok(())
}

fn reservation_details<'a>(
    transaction_id: Uuid,
    details: &'a [CreditTransactionDetail],
) -> impl Iterator<Item = &'a CreditTransactionDetail> {
    details
        .iter()
        .filter(move |d| d.transaction_id == transaction_id && d.amount > 0)
}

pub(crate) fn missing_grant(transaction_id: Uuid, grant_id: Uuid) -> BillingError {
    tracing::error!(
        transaction_id = %transaction_id,
        grant_id = %grant_id,
        "Transaction detail references a grant that could not be loaded"
    );
    BillingError::Corrupt(format!(
        "transaction {} references missing grant {}",
        transaction_id, grant_id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn grant_for(owner: Uuid, amount: i64, valid_until: Option<OffsetDateTime>) -> CreditGrant {
        CreditGrant::issue(owner, amount, now() - Duration::days(1), valid_until)
    }

    #[test]
    fn test_reservation_drains_expiring_grant_first() {
        let owner = Uuid::new_v4();
        let expiring = grant_for(owner, 5, Some(now() + Duration::days(1)));
        let forever = grant_for(owner, 10, None);
        let mut grants = vec![forever.clone(), expiring.clone()];

        let reservation = reserve(&mut grants, &CreditAccount::user(owner), 7, None, now()).unwrap();

        let taken: HashMap<Uuid, i64> = reservation
            .details
            .iter()
            .map(|d| (d.grant_id, d.amount))
            .collect();
        assert_eq!(taken[&expiring.id], 5);
        assert_eq!(taken[&forever.id], 2);

        for g in &grants {
            g.verify().unwrap();
            assert_eq!(g.remaining_amount, g.amount, "reserve must not touch remaining");
        }
    }

    #[test]
    fn test_reservation_details_record_unchanged_remaining() {
        let owner = Uuid::new_v4();
        let mut grants = vec![grant_for(owner, 10, None)];

        let reservation = reserve(&mut grants, &CreditAccount::user(owner), 4, None, now()).unwrap();
        assert_eq!(reservation.details.len(), 1);
        assert_eq!(reservation.details[0].balance_after, 10);
        assert_eq!(grants[0].available_amount, 6);
        assert_eq!(grants[0].reserved_amount, 4);
    }

    #[test]
    fn test_insufficient_reservation_leaves_grants_untouched() {
        let owner = Uuid::new_v4();
        let mut grants = vec![grant_for(owner, 3, None), grant_for(owner, 2, None)];
        let before = grants.clone();

        let err = reserve(&mut grants, &CreditAccount::user(owner), 6, None, now()).unwrap_err();
        assert!(matches!(
            err,
            BillingError::InsufficientCredits {
                requested: 6,
                available: 5
            }
        ));
        assert_eq!(grants, before);
    }

    #[test]
    fn test_other_users_grants_are_ignored() {
        let owner = Uuid::new_v4();
        let mut grants = vec![grant_for(Uuid::new_v4(), 100, None)];
        let err = reserve(&mut grants, &CreditAccount::user(owner), 1, None, now()).unwrap_err();
        assert!(matches!(err, BillingError::InsufficientCredits { .. }));
    }

    #[test]
    fn test_zero_amount_rejected() {
        let owner = Uuid::new_v4();
        let mut grants = vec![grant_for(owner, 10, None)];
        assert!(matches!(
            reserve(&mut grants, &CreditAccount::user(owner), 0, None, now()),
            Err(BillingError::InvalidAmount(0))
        ));
    }

    #[test]
    fn test_confirm_moves_reserved_into_used() {
        let owner = Uuid::new_v4();
        let mut list = vec![grant_for(owner, 10, None)];
        let mut reservation = reserve(&mut list, &CreditAccount::user(owner), 4, None, now()).unwrap();
        let mut grants: GrantSet = list.into_iter().map(|g| (g.id, g)).collect();

        confirm(
            &mut reservation.transaction,
            &reservation.details,
            &mut grants,
            now(),
        )
        .unwrap();

        let g = grants.values().next().unwrap();
        assert_eq!(g.remaining_amount, 6);
        assert_eq!(g.used_amount, 4);
        assert_eq!(g.reserved_amount, 0);
        assert_eq!(g.available_amount, 6);
        assert!(reservation.transaction.is_settled_deduction());
    }

    #[test]
    fn test_cancel_releases_hold_only() {
        let owner = Uuid::new_v4();
        let mut list = vec![grant_for(owner, 10, None)];
        let mut reservation = reserve(&mut list, &CreditAccount::user(owner), 10, None, now()).unwrap();
        let mut grants: GrantSet = list.into_iter().map(|g| (g.id, g)).collect();

        cancel(
            &mut reservation.transaction,
            &reservation.details,
            &mut grants,
            now(),
            None,
        )
        .unwrap();

        let g = grants.values().next().unwrap();
        assert_eq!(g.remaining_amount, 10);
        assert_eq!(g.used_amount, 0);
        assert_eq!(g.reserved_amount, 0);
        assert_eq!(g.available_amount, 10);
    }

    #[test]
    fn test_confirm_twice_is_invalid_state() {
        let owner = Uuid::new_v4();
        let mut list = vec![grant_for(owner, 10, None)];
        let mut reservation = reserve(&mut list, &CreditAccount::user(owner), 4, None, now()).unwrap();
        let mut grants: GrantSet = list.into_iter().map(|g| (g.id, g)).collect();

        confirm(&mut reservation.transaction, &reservation.details, &mut grants, now()).unwrap();
        let err = confirm(&mut reservation.transaction, &reservation.details, &mut grants, now())
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidTransactionState { .. }));
    }

    #[test]
    fn test_confirm_with_corrupted_grant_is_fatal() {
        let owner = Uuid::new_v4();
        let mut list = vec![grant_for(owner, 10, None)];
        let mut reservation = reserve(&mut list, &CreditAccount::user(owner), 4, None, now()).unwrap();
        let mut grants: GrantSet = list.into_iter().map(|g| (g.id, g)).collect();

        // Someone drained the hold behind the ledger's back
        for g in grants.values_mut() {
            g.reserved_amount = 0;
            g.available_amount = 10;
        }

        let err = confirm(&mut reservation.transaction, &reservation.details, &mut grants, now())
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(reservation.transaction.is_open_reservation());
    }
}
