//! Debt simplification: reduce a closed set of net balances to a short
//! list of settle-up transfers.
//!
//! Balances are positive when the participant is owed money and negative
//! when they owe. The input must net to zero. Work is done in whole cents
//! and the result is replayed against the input before it is returned, so
//! a caller either gets a plan that reproduces every balance or an error.
//!
//! The greedy largest-creditor / largest-debtor match is optimal for
//! chains and stars but is not guaranteed to produce the fewest transfers
//! for every debt topology.

use crate::{
    model::PartyRef,
    money::{from_minor, to_minor},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use thiserror::Error;

/// `from` pays `to`. Derived output only, never stored as ledger state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer<P = PartyRef> {
    pub from: P,
    pub to: P,
    pub amount: f64,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimplifyError {
    #[error("Balances do not net to zero (sum {sum:.4}, tolerance {tolerance})")]
    Unbalanced { sum: f64, tolerance: f64 },

    #[error("Plan does not reproduce balance of {participant}: expected {expected:.2}, replayed {replayed:.2}")]
    ReplayMismatch {
        participant: String,
        expected: f64,
        replayed: f64,
    },
}

/// Simplify `balances` into transfers.
///
/// Duplicate entries for one participant are summed. Output order is fully
/// determined by the amounts and ids, so any permutation of the input
/// yields the same list.
pub fn simplify<P>(
    balances: &[(P, f64)],
    tolerance: f64,
) -> Result<Vec<Transfer<P>>, SimplifyError>
where
    P: Ord + Clone + Debug,
{
    let sum: f64 = balances.iter().map(|(_, b)| b).sum();
    if !sum.is_finite() || to_minor(sum).abs() > to_minor(tolerance) {
        return Err(SimplifyError::Unbalanced { sum, tolerance });
    }

    let mut merged: BTreeMap<P, f64> = BTreeMap::new();
    for (participant, balance) in balances {
        *merged.entry(participant.clone()).or_insert(0.0) += balance;
    }

    let mut debtors: Vec<(P, i64)> = Vec::new();
    let mut creditors: Vec<(P, i64)> = Vec::new();
    for (participant, balance) in &merged {
        let minor = to_minor(*balance);
        if minor < 0 {
            debtors.push((participant.clone(), -minor));
        } else if minor > 0 {
            creditors.push((participant.clone(), minor));
        }
    }
    // Largest first, then id ascending.
    debtors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    creditors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut transfers = Vec::new();
    let (mut d, mut c) = (0, 0);
    while d < debtors.len() && c < creditors.len() {
        let step = debtors[d].1.min(creditors[c].1);
        transfers.push(Transfer {
            from: debtors[d].0.clone(),
            to: creditors[c].0.clone(),
            amount: from_minor(step),
        });
        debtors[d].1 -= step;
        creditors[c].1 -= step;
        if debtors[d].1 == 0 {
            d += 1;
        }
        if creditors[c].1 == 0 {
            c += 1;
        }
    }

    verify_replay(&merged, &transfers, tolerance)?;
    Ok(transfers)
}

/// Replay `transfers` into an empty ledger and check every expected
/// balance comes back within `tolerance`, compared in whole cents.
pub fn verify_replay<P>(
    expected: &BTreeMap<P, f64>,
    transfers: &[Transfer<P>],
    tolerance: f64,
) -> Result<(), SimplifyError>
where
    P: Ord + Clone + Debug,
{
    let mut replayed: BTreeMap<P, i64> = BTreeMap::new();
    for t in transfers {
        let minor = to_minor(t.amount);
        *replayed.entry(t.to.clone()).or_insert(0) += minor;
        *replayed.entry(t.from.clone()).or_insert(0) -= minor;
    }

    let allowed = to_minor(tolerance);
    for (participant, balance) in expected {
        let got = replayed.remove(participant).unwrap_or(0);
        if (got - to_minor(*balance)).abs() > allowed {
            return Err(SimplifyError::ReplayMismatch {
                participant: format!("{participant:?}"),
                expected: *balance,
                replayed: from_minor(got),
            });
        }
    }
    // Anyone left was never in the input.
    if let Some((participant, minor)) = replayed.into_iter().find(|(_, m)| *m != 0) {
        return Err(SimplifyError::ReplayMismatch {
            participant: format!("{participant:?}"),
            expected: 0.0,
            replayed: from_minor(minor),
        });
    }
    Ok(())
}
