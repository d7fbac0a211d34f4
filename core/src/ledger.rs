//! The ledger service: every mutation the outside world can make.
//!
//! MUTATION ORDER (fixed for every event-log write):
//!   1. Validate the input against the stored participants, contacts, groups.
//!   2. Write the event (one transaction, fresh activity stamp).
//!   3. Recalculate synchronously: the event's group, or the whole ledger.
//!
//! RULES:
//!   - Nothing is written when validation fails.
//!   - A failed recalculation is returned to the caller. The event row stays
//!     written; the next successful pass over its scope repairs the balances.
//!   - Relationship balances are never edited directly, only derived.

use crate::{
    backend::LedgerBackend,
    calculator::validate_expense,
    config::LedgerConfig,
    error::{LedgerError, LedgerResult},
    model::{Expense, Group, GroupBalanceEntry, NewExpense, NewSettlement, PartyRef, Relationship},
    recalc::{Orchestrator, PassReport},
    simplify::{simplify, Transfer},
    store::LedgerStore,
    types::{ExpenseId, GroupId, ParticipantId, RelationshipId, SettlementId},
};
use serde::{Deserialize, Serialize};

/// Result of a settle-up request for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "items", rename_all = "snake_case")]
pub enum SettlePlan {
    /// Simplified transfers that reproduce every cached balance.
    Simplified(Vec<Transfer>),
    /// Simplification failed; the cached balances as they stand.
    Raw(Vec<GroupBalanceEntry>),
}

pub struct Ledger {
    pub store: LedgerStore,
    orchestrator: Orchestrator,
    last_report: Option<PassReport>,
}

impl Ledger {
    pub fn new(store: LedgerStore, config: LedgerConfig) -> Self {
        Self {
            store,
            orchestrator: Orchestrator::new(config),
            last_report: None,
        }
    }

    /// Open (or create) a database file and bring its schema up to date.
    pub fn open(path: &str, config: LedgerConfig) -> LedgerResult<Self> {
        let store = LedgerStore::open(path)?;
        store.migrate()?;
        Ok(Self::new(store, config))
    }

    /// In-memory ledger with test config. Used in tests.
    pub fn open_test() -> LedgerResult<Self> {
        Self::open_test_with(LedgerConfig::default_test())
    }

    pub fn open_test_with(config: LedgerConfig) -> LedgerResult<Self> {
        let store = LedgerStore::in_memory()?;
        store.migrate()?;
        Ok(Self::new(store, config))
    }

    pub fn config(&self) -> &LedgerConfig {
        self.orchestrator.config()
    }

    /// Report of the most recent recalculation pass, if any ran.
    pub fn last_report(&self) -> Option<&PassReport> {
        self.last_report.as_ref()
    }

    // ── Participants and relationships ────────────────────────────

    pub fn register_participant(&mut self, display_name: &str) -> LedgerResult<ParticipantId> {
        let id = self.store.insert_participant(display_name)?;
        log::info!("Registered participant {id} ({display_name})");
        Ok(id)
    }

    /// Add an unlinked contact to `owner_id`'s ledger.
    pub fn add_contact(&mut self, owner_id: &str, name: &str) -> LedgerResult<RelationshipId> {
        self.require_participant(owner_id)?;
        self.store.insert_contact(owner_id, name)
    }

    /// Create both directed records between two participants.
    pub fn befriend(&mut self, a: &str, b: &str) -> LedgerResult<()> {
        if a == b {
            return Err(LedgerError::InvalidRelationship {
                reason: format!("{a} cannot befriend themselves"),
            });
        }
        self.require_participant(a)?;
        self.require_participant(b)?;
        self.store.ensure_relationship(a, b)?;
        self.store.ensure_relationship(b, a)?;
        Ok(())
    }

    /// Link a contact to a real participant (an accepted invite).
    ///
    /// Amounts already recorded against the contact now belong to the pair,
    /// so the whole ledger is recalculated.
    pub fn link_contact(
        &mut self,
        relationship_id: &str,
        participant_id: &str,
    ) -> LedgerResult<PassReport> {
        let record = self.require_relationship(relationship_id)?;
        self.require_participant(participant_id)?;
        let invalid = |reason: String| Err(LedgerError::InvalidRelationship { reason });

        if let Some(linked) = record.linked_counterparty() {
            return invalid(format!("{relationship_id} is already linked to {linked}"));
        }
        if record.owner_id == participant_id {
            return invalid(format!("{participant_id} cannot link their own contact to themselves"));
        }
        if let Some(existing) = self.store.relationship_between(&record.owner_id, participant_id)? {
            return invalid(format!(
                "{} already has record {} for {participant_id}",
                record.owner_id, existing.relationship_id
            ));
        }

        if !self.store.link_contact(relationship_id, participant_id)? {
            return invalid(format!("{relationship_id} was linked concurrently"));
        }
        self.store.ensure_relationship(participant_id, &record.owner_id)?;
        log::info!("Linked contact {relationship_id} to {participant_id}");
        self.recalculate_all()
    }

    pub fn relationships_of(&self, participant_id: &str) -> LedgerResult<Vec<Relationship>> {
        self.require_participant(participant_id)?;
        self.store.relationships_for_owner(participant_id)
    }

    /// What `counterparty_id` owes `owner_id` (negative: owner owes).
    pub fn balance_between(&self, owner_id: &str, counterparty_id: &str) -> LedgerResult<f64> {
        Ok(self
            .store
            .relationship_between(owner_id, counterparty_id)?
            .map(|r| r.balance)
            .unwrap_or(0.0))
    }

    // ── Groups ────────────────────────────────────────────────────

    pub fn create_group(&mut self, name: &str, members: &[ParticipantId]) -> LedgerResult<GroupId> {
        for member in members {
            self.require_participant(member)?;
        }
        let group_id = self.store.insert_group(name)?;
        for member in members {
            self.join_group(&group_id, member)?;
        }
        log::info!("Created group {group_id} ({name}) with {} member(s)", members.len());
        Ok(group_id)
    }

    /// Add a member and make sure they hold a record for every other member.
    pub fn join_group(&mut self, group_id: &str, participant_id: &str) -> LedgerResult<bool> {
        let group = self.require_group(group_id)?;
        self.require_participant(participant_id)?;
        if !self.store.insert_group_member(group_id, participant_id)? {
            return Ok(false);
        }
        for other in group.members.iter().filter(|m| m.as_str() != participant_id) {
            self.store.ensure_relationship(participant_id, other)?;
            self.store.ensure_relationship(other, participant_id)?;
        }
        Ok(true)
    }

    /// Cached participant → net balance map for a group.
    pub fn group_balances(&self, group_id: &str) -> LedgerResult<Vec<GroupBalanceEntry>> {
        self.require_group(group_id)?;
        self.store.group_balances(group_id)
    }

    /// Simplified settle-up transfers for a group, or its raw balances if
    /// they cannot be simplified.
    pub fn settle_up_plan(&self, group_id: &str) -> LedgerResult<SettlePlan> {
        let entries = self.group_balances(group_id)?;
        let balances: Vec<(PartyRef, f64)> =
            entries.iter().map(|e| (e.party.clone(), e.balance)).collect();
        match simplify(&balances, self.config().simplify_tolerance) {
            Ok(transfers) => Ok(SettlePlan::Simplified(transfers)),
            Err(err) => {
                log::warn!("Group {group_id}: {err}; returning raw balances");
                Ok(SettlePlan::Raw(entries))
            }
        }
    }

    // ── Expenses ──────────────────────────────────────────────────

    pub fn add_expense(&mut self, expense: &NewExpense) -> LedgerResult<ExpenseId> {
        self.validate_new_expense(expense)?;
        let expense_id = self.store.insert_expense(expense)?;
        log::debug!("Added expense {expense_id} ({:.2})", expense.amount);
        self.recalculate_scope(expense.group_id.as_ref())?;
        Ok(expense_id)
    }

    /// Replace an expense. Moving it between groups recalculates both.
    pub fn edit_expense(&mut self, expense_id: &str, expense: &NewExpense) -> LedgerResult<()> {
        let previous = self.require_expense(expense_id)?;
        self.validate_new_expense(expense)?;
        self.store.replace_expense(expense_id, expense)?;

        if previous.group_id != expense.group_id {
            log::debug!(
                "Expense {expense_id} moved from {:?} to {:?}",
                previous.group_id,
                expense.group_id
            );
            self.recalculate_scope(previous.group_id.as_ref())?;
        }
        self.recalculate_scope(expense.group_id.as_ref())?;
        Ok(())
    }

    pub fn delete_expense(&mut self, expense_id: &str) -> LedgerResult<()> {
        self.set_expense_deleted(expense_id, true)
    }

    pub fn restore_expense(&mut self, expense_id: &str) -> LedgerResult<()> {
        self.set_expense_deleted(expense_id, false)
    }

    fn set_expense_deleted(&mut self, expense_id: &str, deleted: bool) -> LedgerResult<()> {
        let expense = self.require_expense(expense_id)?;
        self.store.set_expense_deleted(expense_id, deleted)?;
        self.recalculate_scope(expense.group_id.as_ref())?;
        Ok(())
    }

    // ── Settlements ───────────────────────────────────────────────

    pub fn record_settlement(&mut self, settlement: &NewSettlement) -> LedgerResult<SettlementId> {
        self.validate_new_settlement(settlement)?;
        let settlement_id = self.store.insert_settlement(settlement)?;
        log::debug!(
            "Recorded settlement {settlement_id}: {} {} {:.2} on {}",
            settlement.creator_id,
            settlement.direction.as_str(),
            settlement.amount,
            settlement.relationship_id
        );
        self.recalculate_scope(settlement.group_id.as_ref())?;
        Ok(settlement_id)
    }

    pub fn delete_settlement(&mut self, settlement_id: &str) -> LedgerResult<()> {
        self.set_settlement_deleted(settlement_id, true)
    }

    pub fn restore_settlement(&mut self, settlement_id: &str) -> LedgerResult<()> {
        self.set_settlement_deleted(settlement_id, false)
    }

    fn set_settlement_deleted(&mut self, settlement_id: &str, deleted: bool) -> LedgerResult<()> {
        let settlement = self
            .store
            .settlement(settlement_id)?
            .ok_or_else(|| not_found("Settlement", settlement_id))?;
        self.store.set_settlement_deleted(settlement_id, deleted)?;
        self.recalculate_scope(settlement.group_id.as_ref())?;
        Ok(())
    }

    // ── Recalculation ─────────────────────────────────────────────

    /// Rebuild every balance from the full event log.
    pub fn recalculate_all(&mut self) -> LedgerResult<PassReport> {
        let report = self.orchestrator.recalculate_global(&self.store)?;
        self.last_report = Some(report.clone());
        Ok(report)
    }

    /// Rebuild one group's share, falling back to a global pass if needed.
    pub fn recalculate_group(&mut self, group_id: &str) -> LedgerResult<PassReport> {
        self.require_group(group_id)?;
        self.recalculate_scope(Some(&group_id.to_string()))
    }

    fn recalculate_scope(&mut self, group_id: Option<&GroupId>) -> LedgerResult<PassReport> {
        let backend: &dyn LedgerBackend = &self.store;
        let report = self.orchestrator.recalculate_group(backend, group_id)?;
        self.last_report = Some(report.clone());
        Ok(report)
    }

    // ── Validation ────────────────────────────────────────────────

    fn validate_new_expense(&self, expense: &NewExpense) -> LedgerResult<()> {
        validate_expense(expense, self.config().split_tolerance)?;
        self.require_party(&expense.payer)?;
        for split in &expense.splits {
            self.require_party(&split.participant)?;
        }
        if let Some(group_id) = &expense.group_id {
            self.require_group(group_id)?;
        }
        Ok(())
    }

    fn validate_new_settlement(&self, settlement: &NewSettlement) -> LedgerResult<()> {
        let invalid = |reason: String| Err(LedgerError::InvalidSettlement { reason });
        if !settlement.amount.is_finite() || settlement.amount <= 0.0 {
            return invalid(format!("amount must be positive, got {}", settlement.amount));
        }
        self.require_participant(&settlement.creator_id)?;
        let record = self.require_relationship(&settlement.relationship_id)?;
        if record.owner_id != settlement.creator_id {
            return invalid(format!(
                "{} does not own relationship {}",
                settlement.creator_id, settlement.relationship_id
            ));
        }
        if let Some(group_id) = &settlement.group_id {
            self.require_group(group_id)?;
        }
        Ok(())
    }

    fn require_party(&self, party: &PartyRef) -> LedgerResult<()> {
        match party {
            PartyRef::Participant(id) => self.require_participant(id),
            PartyRef::Contact(id) => self.require_relationship(id).map(|_| ()),
        }
    }

    fn require_participant(&self, participant_id: &str) -> LedgerResult<()> {
        if self.store.participant_exists(participant_id)? {
            Ok(())
        } else {
            Err(not_found("Participant", participant_id))
        }
    }

    fn require_relationship(&self, relationship_id: &str) -> LedgerResult<Relationship> {
        self.store
            .relationship(relationship_id)?
            .ok_or_else(|| not_found("Relationship", relationship_id))
    }

    fn require_group(&self, group_id: &str) -> LedgerResult<Group> {
        self.store
            .group(group_id)?
            .ok_or_else(|| not_found("Group", group_id))
    }

    fn require_expense(&self, expense_id: &str) -> LedgerResult<Expense> {
        self.store
            .expense(expense_id)?
            .ok_or_else(|| not_found("Expense", expense_id))
    }
}

fn not_found(kind: &'static str, id: &str) -> LedgerError {
    LedgerError::NotFound {
        kind,
        id: id.to_string(),
    }
}
