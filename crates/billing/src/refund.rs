//! Refunds against confirmed deductions
//!
//! Returns credit to the grants that funded the original deduction. Grants
//! that stay usable longest are refilled first: never-expiring, then latest
//! expiry, then newest. A grant never receives more than this transaction
//! took from it (net of earlier refunds) nor more than it has used.

use std::collections::HashMap;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::allocation::{missing_grant, GrantSet};
use crate::error::{BillingError, BillingResult};
use crate::grant::refund_order;
use crate::transaction::{
    CreditTransaction, CreditTransactionDetail, GrantMovement, RefundHistoryEntry,
};

/// Outcome of a refund
#[derive(Debug, Clone, Serialize)]
pub struct RefundReceipt {
    /// The original deduction after the refund was recorded
    pub transaction: CreditTransaction,
    /// Credits returned by this call
    pub refunded: i64,
    pub allocations: Vec<GrantMovement>,
    /// Task linked to the deduction and its credits actually charged now
    pub task_actual_credits: Option<(Uuid, i64)>,
}

/// Rows produced by a refund
#[derive(Debug, Clone)]
pub struct RefundEntries {
    pub receipt: RefundReceipt,
    pub details: Vec<CreditTransactionDetail>,
}

/// Net credits each grant contributed to a transaction
fn net_contributions(
    transaction_id: Uuid,
    details: &[CreditTransactionDetail],
) -> HashMap<Uuid, i64> {
    let mut net: HashMap<Uuid, i64> = HashMap::new();
    for detail in details.iter().filter(|d| d.transaction_id == transaction_id) {
        *net.entry(detail.grant_id).or_default() += detail.amount;
    }
    net
}

/// Decide how `amount` flows back to the contributing grants
pub fn plan_refund(
    transaction: &CreditTransaction,
    details: &[CreditTransactionDetail],
    grants: &GrantSet,
    amount: i64,
) -> BillingResult<Vec<GrantMovement>> {
    transaction.require_settled_deduction()?;

    if amount <= 0 {
        return Err(BillingError::InvalidAmount(amount));
    }
    if amount > transaction.refundable() {
        return Err(BillingError::RefundExceedsUsage {
            transaction_id: transaction.id,
            requested: amount,
            refundable: transaction.refundable(),
        });
    }

    let net = net_contributions(transaction.id, details);
    let mut contributors = Vec::new();
    for (grant_id, contributed) in &net {
        if *contributed <= 0 {
            continue;
        }
        let grant = grants
            .get(grant_id)
            .ok_or_else(|| missing_grant(transaction.id, *grant_id))?;
        contributors.push((grant, *contributed));
    }
    contributors.sort_by(|(a, _), (b, _)| refund_order(a, b));

    let mut need = amount;
    let mut plan = Vec::new();
    for (grant, contributed) in contributors {
        if need == 0 {
            break;
        }
        let give = need.min(contributed).min(grant.used_amount);
        if give > 0 {
            plan.push(GrantMovement {
                grant_id: grant.id,
                amount: give,
            });
            need -= give;
        }
    }

    if need > 0 {
        let refundable = amount - need;
        tracing::error!(
            transaction_id = %transaction.id,
            requested = amount,
            refundable = refundable,
            "Refund exceeds usage recorded on contributing grants"
        );
        return Err(BillingError::RefundExceedsUsage {
            transaction_id: transaction.id,
            requested: amount,
            refundable,
        });
    }

    Ok(plan)
}

/// Return `amount` credits from a confirmed deduction
pub fn refund(
    transaction: &mut CreditTransaction,
    details: &[CreditTransactionDetail],
    grants: &mut GrantSet,
    amount: i64,
    description: Option<&str>,
    now: OffsetDateTime,
) -> BillingResult<RefundEntries> {
    let plan = plan_refund(transaction, details, grants, amount)?;

    let mut new_details = Vec::with_capacity(plan.len());
    for movement in &plan {
        let grant = grants
            .get_mut(&movement.grant_id)
            .ok_or_else(|| missing_grant(transaction.id, movement.grant_id))?;

        grant.used_amount -= movement.amount;
        grant.remaining_amount += movement.amount;
        grant.refresh_available();
        grant.updated_at = now;
        grant.verify()?;

        new_details.push(CreditTransactionDetail::new(
            transaction.id,
            grant.id,
            -movement.amount,
            grant.remaining_amount,
            now,
        ));
    }

    transaction.refund_amount += amount;
    transaction.metadata.refund_history.push(RefundHistoryEntry {
        amount,
        description: description.map(str::to_string),
        refunded_at: now,
        allocations: plan.clone(),
    });

    let task_actual_credits = transaction
        .metadata
        .task_id
        .map(|task_id| (task_id, transaction.total_amount - transaction.refund_amount));

    Ok(RefundEntries {
        receipt: RefundReceipt {
            transaction: transaction.clone(),
            refunded: amount,
            allocations: plan,
            task_actual_credits,
        },
        details: new_details,
    })
}
