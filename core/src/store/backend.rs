use super::{now_millis, LedgerStore};
use crate::{
    backend::{CommitOutcome, LedgerBackend, Scope, WritePlan},
    error::LedgerResult,
    guard::ActivitySignature,
    model::{Expense, Relationship, SettlementTransaction},
    types::{GroupId, ParticipantId, RelationshipId},
};
use rusqlite::{Transaction, TransactionBehavior};
use std::collections::BTreeSet;

impl LedgerBackend for LedgerStore {
    fn activity_signature(&self, scope: &Scope) -> LedgerResult<ActivitySignature> {
        Self::signature_on(&self.conn, scope)
    }

    fn live_expenses(&self, scope: &Scope) -> LedgerResult<Vec<Expense>> {
        self.live_expenses_in(scope.group_id().map(String::as_str))
    }

    fn live_settlements(&self, scope: &Scope) -> LedgerResult<Vec<SettlementTransaction>> {
        self.live_settlements_in(scope.group_id().map(String::as_str))
    }

    fn all_relationships(&self) -> LedgerResult<Vec<Relationship>> {
        self.load_all_relationships()
    }

    fn relationships_among(
        &self,
        participants: &BTreeSet<ParticipantId>,
        extra: &BTreeSet<RelationshipId>,
    ) -> LedgerResult<Vec<Relationship>> {
        self.load_relationships_among(participants, extra)
    }

    fn relationships_in_group(&self, group_id: &GroupId) -> LedgerResult<Vec<Relationship>> {
        self.load_relationships_in_group(group_id)
    }

    fn group_member_ids(&self, group_id: &GroupId) -> LedgerResult<Vec<ParticipantId>> {
        self.load_group_member_ids(group_id)
    }

    fn all_group_ids(&self) -> LedgerResult<Vec<GroupId>> {
        self.load_group_ids()
    }

    fn ensure_link(&self, owner: &ParticipantId, counterparty: &ParticipantId) -> LedgerResult<bool> {
        self.ensure_relationship(owner, counterparty)
    }

    fn commit_pass(
        &self,
        scope: &Scope,
        expected: &ActivitySignature,
        plan: &WritePlan,
    ) -> LedgerResult<CommitOutcome> {
        // IMMEDIATE takes the write lock up front, so no mutation can slip in
        // between the signature check and the writes.
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let current = Self::signature_on(&tx, scope)?;
        if current != *expected {
            log::debug!("Commit for {scope:?} rejected: {expected:?} -> {current:?}");
            tx.rollback()?;
            return Ok(CommitOutcome::Stale);
        }

        let now = now_millis();
        for update in &plan.relationships {
            Self::write_relationship(&tx, update, now)?;
        }
        for share in &plan.group_shares {
            Self::apply_group_share(&tx, share, now)?;
        }
        if plan.clear_other_caches {
            Self::clear_group_caches(&tx)?;
        }
        for (group_id, entries) in &plan.group_caches {
            Self::replace_group_cache(&tx, group_id, entries, now)?;
        }
        tx.commit()?;
        Ok(CommitOutcome::Committed)
    }
}
