//! Pairwise / net balance calculator for a single expense.
//!
//! net[p] = paid - cost for every split participant. When the recorded
//! payments fall short of the declared amount the shortfall is credited to
//! the payer, who may not appear in the split at all. The positions are then
//! matched greedily into the transfers that settle this one expense.

use crate::{
    error::{LedgerError, LedgerResult},
    model::{NewExpense, PartyRef, Split},
    simplify::Transfer,
};
use std::collections::{BTreeMap, BTreeSet};

/// Net positions and settling transfers of one expense.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpenseSettlement {
    pub positions: BTreeMap<PartyRef, f64>,
    pub transfers: Vec<Transfer>,
}

impl ExpenseSettlement {
    /// Signed amount `b` owes `a` under this expense (negative when `a` owes `b`).
    pub fn debt_between(&self, a: &PartyRef, b: &PartyRef) -> f64 {
        pairwise_debt(&self.transfers, a, b)
    }
}

/// Net position per participant, including the payer's shortfall credit.
pub fn net_positions(amount: f64, payer: &PartyRef, splits: &[Split]) -> BTreeMap<PartyRef, f64> {
    let mut positions: BTreeMap<PartyRef, f64> = BTreeMap::new();
    let mut total_paid = 0.0;
    for split in splits {
        *positions.entry(split.participant.clone()).or_insert(0.0) += split.paid - split.cost;
        total_paid += split.paid;
    }
    let shortfall = amount - total_paid;
    if shortfall > 0.0 {
        *positions.entry(payer.clone()).or_insert(0.0) += shortfall;
    }
    positions
}

/// Reduce one expense to transfers.
///
/// Fails when the positions do not net to zero, which only happens for
/// split data that would have been rejected by [`validate_expense`].
pub fn settle_expense(
    amount: f64,
    payer: &PartyRef,
    splits: &[Split],
    epsilon: f64,
    tolerance: f64,
) -> LedgerResult<ExpenseSettlement> {
    let positions = net_positions(amount, payer, splits);
    let residual: f64 = positions.values().sum();
    if residual.abs() > tolerance {
        return Err(LedgerError::InvalidExpense {
            reason: format!("net positions sum to {residual:.4} instead of zero"),
        });
    }

    let mut debtors: Vec<(&PartyRef, f64)> = positions
        .iter()
        .filter(|(_, net)| **net < -epsilon)
        .map(|(p, net)| (p, *net))
        .collect();
    let mut creditors: Vec<(&PartyRef, f64)> = positions
        .iter()
        .filter(|(_, net)| **net > epsilon)
        .map(|(p, net)| (p, *net))
        .collect();
    // Debtors most-negative first, creditors largest first, ids break ties.
    debtors.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
    creditors.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let mut transfers = Vec::new();
    let (mut d, mut c) = (0, 0);
    while d < debtors.len() && c < creditors.len() {
        let step = (-debtors[d].1).min(creditors[c].1);
        if step > epsilon {
            transfers.push(Transfer {
                from: debtors[d].0.clone(),
                to: creditors[c].0.clone(),
                amount: step,
            });
        }
        debtors[d].1 += step;
        creditors[c].1 -= step;
        if debtors[d].1 >= -epsilon {
            d += 1;
        }
        if creditors[c].1 <= epsilon {
            c += 1;
        }
    }

    Ok(ExpenseSettlement { positions, transfers })
}

/// Signed amount `b` owes `a` across `transfers`.
pub fn pairwise_debt(transfers: &[Transfer], a: &PartyRef, b: &PartyRef) -> f64 {
    transfers.iter().fold(0.0, |acc, t| {
        if &t.from == b && &t.to == a {
            acc + t.amount
        } else if &t.from == a && &t.to == b {
            acc - t.amount
        } else {
            acc
        }
    })
}

/// Shape checks for an expense before anything is written.
/// Existence of the referenced participants is checked by the ledger.
pub fn validate_expense(expense: &NewExpense, tolerance: f64) -> LedgerResult<()> {
    let invalid = |reason: String| Err(LedgerError::InvalidExpense { reason });

    if !expense.amount.is_finite() || expense.amount < 0.0 {
        return invalid(format!("amount must be a non-negative number, got {}", expense.amount));
    }
    if expense.splits.is_empty() && expense.amount > 0.0 {
        return invalid("a non-zero expense needs at least one split".into());
    }

    let mut seen = BTreeSet::new();
    let (mut total_cost, mut total_paid) = (0.0, 0.0);
    for split in &expense.splits {
        if !seen.insert(&split.participant) {
            return invalid(format!("{} appears in the split twice", split.participant));
        }
        if !split.cost.is_finite() || split.cost < 0.0 || !split.paid.is_finite() || split.paid < 0.0 {
            return invalid(format!(
                "split for {} has cost {} and paid {}",
                split.participant, split.cost, split.paid
            ));
        }
        total_cost += split.cost;
        total_paid += split.paid;
    }

    if (total_cost - expense.amount).abs() > tolerance {
        return invalid(format!(
            "split costs sum to {total_cost:.2} but the expense amount is {:.2}",
            expense.amount
        ));
    }
    if total_paid > expense.amount + tolerance {
        return invalid(format!(
            "payments sum to {total_paid:.2}, more than the expense amount {:.2}",
            expense.amount
        ));
    }
    Ok(())
}
