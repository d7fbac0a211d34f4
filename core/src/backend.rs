//! The storage contract the recalculation core consumes.
//!
//! RULE: the orchestrator talks to storage only through LedgerBackend.
//! The SQLite store implements it; tests wrap it to inject interference.

use crate::{
    error::LedgerResult,
    guard::ActivitySignature,
    model::{Expense, GroupBalance, GroupBalanceEntry, Relationship, SettlementTransaction},
    types::{GroupId, ParticipantId, RelationshipId},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The portion of the ledger one pass recalculates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "group_id", rename_all = "snake_case")]
pub enum Scope {
    Global,
    Group(GroupId),
}

impl Scope {
    pub fn group_id(&self) -> Option<&GroupId> {
        match self {
            Self::Global => None,
            Self::Group(id) => Some(id),
        }
    }
}

/// New stored state for one relationship record.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipUpdate {
    pub relationship_id: RelationshipId,
    pub balance: f64,
    pub group_balances: Vec<GroupBalance>,
}

/// New share of one group in a relationship record. The store applies it
/// against the record as it stands at commit time, moving the total by
/// the difference to the stored share.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupShareUpdate {
    pub relationship_id: RelationshipId,
    pub group_id: GroupId,
    pub amount: f64,
}

/// Everything one pass writes, applied atomically by `commit_pass`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WritePlan {
    pub relationships: Vec<RelationshipUpdate>,
    pub group_shares: Vec<GroupShareUpdate>,
    pub group_caches: Vec<(GroupId, Vec<GroupBalanceEntry>)>,
    /// Drop caches of groups not listed in `group_caches`.
    pub clear_other_caches: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The signature no longer matched; nothing was written.
    Stale,
}

pub trait LedgerBackend {
    /// Latest-activity fingerprint of expenses and settlements in `scope`.
    fn activity_signature(&self, scope: &Scope) -> LedgerResult<ActivitySignature>;

    /// Non-deleted expenses in `scope`, with their splits.
    fn live_expenses(&self, scope: &Scope) -> LedgerResult<Vec<Expense>>;

    /// Non-deleted settlement transactions in `scope`.
    fn live_settlements(&self, scope: &Scope) -> LedgerResult<Vec<SettlementTransaction>>;

    fn all_relationships(&self) -> LedgerResult<Vec<Relationship>>;

    /// Records owned by one of `participants` whose linked counterparty is
    /// also in `participants`, plus the records named in `extra`.
    fn relationships_among(
        &self,
        participants: &BTreeSet<ParticipantId>,
        extra: &BTreeSet<RelationshipId>,
    ) -> LedgerResult<Vec<Relationship>>;

    /// Records whose stored breakdown still carries a share of `group_id`.
    fn relationships_in_group(&self, group_id: &GroupId) -> LedgerResult<Vec<Relationship>>;

    fn group_member_ids(&self, group_id: &GroupId) -> LedgerResult<Vec<ParticipantId>>;

    fn all_group_ids(&self) -> LedgerResult<Vec<GroupId>>;

    /// Duplicate-tolerant creation of the record `owner -> counterparty`.
    /// Returns true if this call created it.
    fn ensure_link(&self, owner: &ParticipantId, counterparty: &ParticipantId) -> LedgerResult<bool>;

    /// Re-check the signature and apply `plan` in one transaction.
    fn commit_pass(
        &self,
        scope: &Scope,
        expected: &ActivitySignature,
        plan: &WritePlan,
    ) -> LedgerResult<CommitOutcome>;
}
