//! Relationship registry: the working set of directed ledger slots for one
//! recalculation pass.
//!
//! RULE: the two records of a linked pair are only ever changed together,
//! through `apply_pair`. Nothing else adds to a linked slot.
//!
//! Routing of "debtor owes creditor `amount`":
//!   (a) both global      → creditor's record +amount, debtor's record -amount
//!   (b) contact → global → the contact's record only, if the global side owns it
//!   (c) global → contact → symmetric reverse of (b)
//!   (d) contact → contact → not supported, skipped

use crate::{
    error::{LedgerError, LedgerResult},
    model::{Counterparty, PartyRef, Relationship},
    money::round2,
    types::{GroupId, ParticipantId, RelationshipId},
};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Recomputed value of one relationship record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Slot {
    pub total: f64,
    pub groups: BTreeMap<GroupId, f64>,
}

impl Slot {
    fn add(&mut self, amount: f64, group: Option<&GroupId>) {
        self.total += amount;
        if let Some(g) = group {
            *self.groups.entry(g.clone()).or_insert(0.0) += amount;
        }
    }
}

/// What a split or settlement party resolves to at routing time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Global(ParticipantId),
    Contact {
        relationship_id: RelationshipId,
        owner_id: ParticipantId,
    },
}

impl Resolved {
    /// Party key used for group balance caches.
    pub fn party(&self) -> PartyRef {
        match self {
            Self::Global(id) => PartyRef::Participant(id.clone()),
            Self::Contact { relationship_id, .. } => PartyRef::Contact(relationship_id.clone()),
        }
    }
}

/// How a single routed amount was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Pair,
    Contact,
    MissingLink,
    Skipped,
}

#[derive(Debug, Default)]
pub struct RelationshipRegistry {
    records: BTreeMap<RelationshipId, Relationship>,
    by_pair: HashMap<(ParticipantId, ParticipantId), RelationshipId>,
    slots: BTreeMap<RelationshipId, Slot>,
    missing: BTreeSet<(ParticipantId, ParticipantId)>,
    /// Opposite side of every contact-routed amount, for the zero-sum check.
    contact_shadow: f64,
    skipped: usize,
}

impl RelationshipRegistry {
    pub fn new(records: Vec<Relationship>) -> Self {
        let mut registry = Self::default();
        for record in records {
            if let Some(counterparty) = record.linked_counterparty() {
                registry.by_pair.insert(
                    (record.owner_id.clone(), counterparty.clone()),
                    record.relationship_id.clone(),
                );
            }
            registry
                .slots
                .insert(record.relationship_id.clone(), Slot::default());
            registry
                .records
                .insert(record.relationship_id.clone(), record);
        }
        registry
    }

    pub fn record(&self, id: &str) -> Option<&Relationship> {
        self.records.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &Relationship> {
        self.records.values()
    }

    pub fn slot(&self, id: &str) -> Option<&Slot> {
        self.slots.get(id)
    }

    pub fn pair_id(&self, owner: &str, counterparty: &str) -> Option<&RelationshipId> {
        self.by_pair.get(&(owner.to_string(), counterparty.to_string()))
    }

    pub fn missing_links(&self) -> &BTreeSet<(ParticipantId, ParticipantId)> {
        &self.missing
    }

    pub fn skipped_routes(&self) -> usize {
        self.skipped
    }

    /// Resolve a split or settlement party against the loaded records.
    pub fn resolve(&self, party: &PartyRef) -> LedgerResult<Resolved> {
        match party {
            PartyRef::Participant(id) => Ok(Resolved::Global(id.clone())),
            PartyRef::Contact(rel_id) => {
                let record = self.records.get(rel_id).ok_or_else(|| LedgerError::NotFound {
                    kind: "Contact relationship",
                    id: rel_id.clone(),
                })?;
                Ok(match &record.counterparty {
                    // Linked since the expense was recorded.
                    Counterparty::Linked { participant_id } => {
                        Resolved::Global(participant_id.clone())
                    }
                    Counterparty::Contact { .. } => Resolved::Contact {
                        relationship_id: rel_id.clone(),
                        owner_id: record.owner_id.clone(),
                    },
                })
            }
        }
    }

    /// Record that `debtor` owes `creditor` `amount`, optionally inside a group.
    pub fn route(
        &mut self,
        debtor: &Resolved,
        creditor: &Resolved,
        amount: f64,
        group: Option<&GroupId>,
    ) -> Routed {
        match (debtor, creditor) {
            (Resolved::Global(d), Resolved::Global(c)) => self.apply_pair(c, d, amount, group),
            (
                Resolved::Contact { relationship_id, owner_id },
                Resolved::Global(c),
            ) => self.apply_contact(relationship_id, owner_id, c, amount, group),
            (
                Resolved::Global(d),
                Resolved::Contact { relationship_id, owner_id },
            ) => self.apply_contact(relationship_id, owner_id, d, -amount, group),
            (Resolved::Contact { .. }, Resolved::Contact { .. }) => {
                log::warn!(
                    "Skipping {amount:.2} between two unlinked contacts ({debtor:?} -> {creditor:?})"
                );
                self.skipped += 1;
                Routed::Skipped
            }
        }
    }

    /// The symmetric update: `creditor` is owed `amount` by `debtor`.
    /// Either record missing → nothing is applied and the gap is recorded.
    pub fn apply_pair(
        &mut self,
        creditor: &ParticipantId,
        debtor: &ParticipantId,
        amount: f64,
        group: Option<&GroupId>,
    ) -> Routed {
        if creditor == debtor {
            return Routed::Skipped;
        }
        let forward = self.pair_id(creditor, debtor).cloned();
        let reverse = self.pair_id(debtor, creditor).cloned();
        match (forward, reverse) {
            (Some(f), Some(r)) => {
                self.slot_mut(&f).add(amount, group);
                self.slot_mut(&r).add(-amount, group);
                Routed::Pair
            }
            (f, r) => {
                if f.is_none() {
                    self.missing.insert((creditor.clone(), debtor.clone()));
                }
                if r.is_none() {
                    self.missing.insert((debtor.clone(), creditor.clone()));
                }
                Routed::MissingLink
            }
        }
    }

    /// Apply `amount` (positive = contact owes owner) to a contact record.
    fn apply_contact(
        &mut self,
        relationship_id: &RelationshipId,
        owner_id: &ParticipantId,
        global: &ParticipantId,
        amount: f64,
        group: Option<&GroupId>,
    ) -> Routed {
        if owner_id != global {
            log::warn!(
                "Contact {relationship_id} belongs to {owner_id}, cannot hold {amount:.2} against {global}"
            );
            self.skipped += 1;
            return Routed::Skipped;
        }
        self.slot_mut(relationship_id).add(amount, group);
        self.contact_shadow -= amount;
        Routed::Contact
    }

    fn slot_mut(&mut self, id: &RelationshipId) -> &mut Slot {
        self.slots.entry(id.clone()).or_default()
    }

    /// Sum of every recomputed slot plus the implicit contact side.
    pub fn touched_sum(&self) -> f64 {
        self.slots.values().map(|s| s.total).sum::<f64>() + self.contact_shadow
    }

    /// Zero-sum and pair-symmetry checks over the recomputed slots.
    pub fn verify(&self, tolerance: f64) -> LedgerResult<()> {
        let sum = self.touched_sum();
        if sum.abs() > tolerance {
            return Err(LedgerError::ZeroSumViolation { sum, tolerance });
        }
        for ((owner, counterparty), id) in &self.by_pair {
            if owner > counterparty {
                continue;
            }
            let Some(reverse) = self.pair_id(counterparty, owner) else {
                continue;
            };
            let a = self.slots.get(id).map(|s| s.total).unwrap_or(0.0);
            let b = self.slots.get(reverse).map(|s| s.total).unwrap_or(0.0);
            if (a + b).abs() > tolerance {
                return Err(LedgerError::AsymmetricPair {
                    a: id.clone(),
                    b: reverse.clone(),
                    a_balance: round2(a),
                    b_balance: round2(b),
                });
            }
        }
        Ok(())
    }
}
