//! Recalculation orchestrator.
//!
//! PASS ORDER (both modes):
//!   1. Capture the scope's activity signature.
//!   2. Load live expenses, settlements and the relationship records in play.
//!   3. Reduce each expense to transfers, then fold in settlements, routing
//!      every amount through the registry.
//!   4. Missing links → create them, re-fetch, run step 2-3 exactly once more.
//!   5. Verify zero-sum and pair symmetry. Never persist on failure.
//!   6. Commit only changed records, guarded by the signature.
//!
//! Global passes rebuild every balance from the log. Group passes rebuild
//! one group's share; the store swaps it into each record inside the commit
//! transaction, so passes over other groups are never overwritten.

use crate::{
    backend::{CommitOutcome, GroupShareUpdate, LedgerBackend, RelationshipUpdate, Scope, WritePlan},
    backoff::Backoff,
    calculator::settle_expense,
    config::LedgerConfig,
    error::{LedgerError, LedgerResult},
    guard::{Attempt, ConcurrencyGuard},
    model::{
        Direction, Expense, GroupBalance, GroupBalanceEntry, PartyRef, Relationship,
        SettlementTransaction,
    },
    money::round2,
    registry::{RelationshipRegistry, Resolved, Routed, Slot},
    types::{GroupId, ParticipantId, RelationshipId},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Summary of one completed pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    pub scope: Scope,
    pub attempts: u32,
    pub relationships_written: usize,
    pub links_created: usize,
    /// Amounts that could not be routed (contact ↔ contact, foreign contact).
    pub skipped_routes: usize,
    pub groups_cached: usize,
    pub fell_back_to_global: bool,
}

pub struct Orchestrator {
    config: LedgerConfig,
    backoff: Backoff,
}

impl Orchestrator {
    pub fn new(config: LedgerConfig) -> Self {
        let backoff = Backoff::from_config(&config);
        Self { config, backoff }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Rebuild every relationship balance from the whole event log.
    /// Exhausting the retry bound is a hard failure.
    pub fn recalculate_global(&mut self, backend: &dyn LedgerBackend) -> LedgerResult<PassReport> {
        let config = &self.config;
        let mut guard = ConcurrencyGuard::new(config.max_retries, &mut self.backoff);
        let (mut report, attempts) =
            guard.run("global pass", |_| global_attempt(backend, config))?;
        report.attempts = attempts;
        log::debug!(
            "Global pass done: {} record(s) written in {} attempt(s)",
            report.relationships_written,
            attempts
        );
        Ok(report)
    }

    /// Rebuild one group's share of the ledger, falling back to a global
    /// pass when scoping is off, there is no group, or the scoped pass fails.
    pub fn recalculate_group(
        &mut self,
        backend: &dyn LedgerBackend,
        group_id: Option<&GroupId>,
    ) -> LedgerResult<PassReport> {
        let Some(group_id) = group_id.filter(|_| self.config.scoped_recalc_enabled) else {
            log::debug!("Scoped recalculation not applicable, running global pass");
            return self.fallback(backend);
        };

        match self.run_scoped(backend, group_id) {
            Ok(report) => Ok(report),
            Err(err) => {
                log::warn!("Group {group_id} pass failed ({err}); falling back to global");
                self.fallback(backend)
            }
        }
    }

    fn run_scoped(&mut self, backend: &dyn LedgerBackend, group_id: &GroupId) -> LedgerResult<PassReport> {
        let config = &self.config;
        let mut guard = ConcurrencyGuard::new(config.max_retries, &mut self.backoff);
        let (mut report, attempts) =
            guard.run("group pass", |_| scoped_attempt(backend, config, group_id))?;
        report.attempts = attempts;
        log::debug!(
            "Group {group_id} pass done: {} record(s) written in {} attempt(s)",
            report.relationships_written,
            attempts
        );
        Ok(report)
    }

    fn fallback(&mut self, backend: &dyn LedgerBackend) -> LedgerResult<PassReport> {
        let mut report = self.recalculate_global(backend)?;
        report.fell_back_to_global = true;
        Ok(report)
    }
}

// ── Attempts ───────────────────────────────────────────────────────

fn global_attempt(
    backend: &dyn LedgerBackend,
    config: &LedgerConfig,
) -> LedgerResult<Attempt<PassReport>> {
    let scope = Scope::Global;
    let before = backend.activity_signature(&scope)?;

    let load_and_compute = || -> LedgerResult<Computed> {
        let expenses = backend.live_expenses(&scope)?;
        let settlements = backend.live_settlements(&scope)?;
        compute(backend.all_relationships()?, &expenses, &settlements, config)
    };

    let mut computed = load_and_compute()?;
    // Counted per attempt; only the committed attempt is reported.
    let mut links_created = 0;
    if !computed.registry.missing_links().is_empty() {
        links_created = repair_links(backend, &computed.registry)?;
        computed = load_and_compute()?;
        ensure_linked(&computed.registry)?;
    }
    computed.registry.verify(config.zero_sum_tolerance)?;

    let plan = global_plan(&computed, backend.all_group_ids()?);
    let report = PassReport {
        scope: scope.clone(),
        attempts: 0,
        relationships_written: plan.relationships.len(),
        links_created,
        skipped_routes: computed.registry.skipped_routes(),
        groups_cached: plan.group_caches.len(),
        fell_back_to_global: false,
    };
    Ok(match backend.commit_pass(&scope, &before, &plan)? {
        CommitOutcome::Committed => Attempt::Done(report),
        CommitOutcome::Stale => Attempt::Stale,
    })
}

fn scoped_attempt(
    backend: &dyn LedgerBackend,
    config: &LedgerConfig,
    group_id: &GroupId,
) -> LedgerResult<Attempt<PassReport>> {
    let scope = Scope::Group(group_id.clone());
    let before = backend.activity_signature(&scope)?;

    let load_and_compute = || -> LedgerResult<Computed> {
        let expenses = backend.live_expenses(&scope)?;
        let settlements = backend.live_settlements(&scope)?;
        let records = scoped_relationships(backend, group_id, &expenses, &settlements)?;
        compute(records, &expenses, &settlements, config)
    };

    let mut computed = load_and_compute()?;
    let mut links_created = 0;
    if !computed.registry.missing_links().is_empty() {
        links_created = repair_links(backend, &computed.registry)?;
        computed = load_and_compute()?;
        ensure_linked(&computed.registry)?;
    }
    computed.registry.verify(config.zero_sum_tolerance)?;

    let plan = scoped_plan(&computed, group_id);
    let report = PassReport {
        scope: scope.clone(),
        attempts: 0,
        relationships_written: plan.group_shares.len(),
        links_created,
        skipped_routes: computed.registry.skipped_routes(),
        groups_cached: plan.group_caches.len(),
        fell_back_to_global: false,
    };
    Ok(match backend.commit_pass(&scope, &before, &plan)? {
        CommitOutcome::Committed => Attempt::Done(report),
        CommitOutcome::Stale => Attempt::Stale,
    })
}

/// Relationship records for a group pass: every pair among the global
/// participants who co-occur in the group, not only its members, the
/// contact records its events reference, and every record still holding a
/// share of the group from events that have since left it.
fn scoped_relationships(
    backend: &dyn LedgerBackend,
    group_id: &GroupId,
    expenses: &[Expense],
    settlements: &[SettlementTransaction],
) -> LedgerResult<Vec<Relationship>> {
    let mut participants: BTreeSet<ParticipantId> =
        backend.group_member_ids(group_id)?.into_iter().collect();
    let mut contacts: BTreeSet<RelationshipId> = backend
        .relationships_in_group(group_id)?
        .into_iter()
        .map(|r| r.relationship_id)
        .collect();

    let mut note = |party: &PartyRef| match party {
        PartyRef::Participant(id) => {
            participants.insert(id.clone());
        }
        PartyRef::Contact(id) => {
            contacts.insert(id.clone());
        }
    };
    for expense in expenses {
        note(&expense.payer);
        for split in &expense.splits {
            note(&split.participant);
        }
    }
    for settlement in settlements {
        note(&PartyRef::Participant(settlement.creator_id.clone()));
        note(&PartyRef::Contact(settlement.relationship_id.clone()));
    }

    let records = backend.relationships_among(&participants, &contacts)?;

    // Records pulled in by id name their owner, and a linked one resolves
    // to a participant; both must be in the set for pair lookups to work.
    let extra: BTreeSet<ParticipantId> = records
        .iter()
        .filter(|r| contacts.contains(&r.relationship_id))
        .flat_map(|r| std::iter::once(r.owner_id.clone()).chain(r.linked_counterparty().cloned()))
        .filter(|p| !participants.contains(p))
        .collect();
    if extra.is_empty() {
        return Ok(records);
    }
    participants.extend(extra);
    backend.relationships_among(&participants, &contacts)
}

fn repair_links(backend: &dyn LedgerBackend, registry: &RelationshipRegistry) -> LedgerResult<usize> {
    let mut created = 0;
    for (owner, counterparty) in registry.missing_links() {
        if backend.ensure_link(owner, counterparty)? {
            created += 1;
        }
    }
    log::info!(
        "Repaired {} missing relationship link(s) ({} newly created)",
        registry.missing_links().len(),
        created
    );
    Ok(created)
}

fn ensure_linked(registry: &RelationshipRegistry) -> LedgerResult<()> {
    match registry.missing_links().iter().next() {
        None => Ok(()),
        Some((owner, counterparty)) => Err(LedgerError::UnresolvedLinks {
            count: registry.missing_links().len(),
            owner: owner.clone(),
            counterparty: counterparty.clone(),
        }),
    }
}

// ── Computation ────────────────────────────────────────────────────

struct Computed {
    registry: RelationshipRegistry,
    /// Per-group participant nets, for the balance cache.
    group_nets: BTreeMap<GroupId, BTreeMap<PartyRef, f64>>,
}

impl Computed {
    fn route(&mut self, debtor: &Resolved, creditor: &Resolved, amount: f64, group: Option<&GroupId>) {
        let routed = self.registry.route(debtor, creditor, amount, group);
        if let (Some(g), Routed::Pair | Routed::Contact) = (group, routed) {
            let nets = self.group_nets.entry(g.clone()).or_default();
            *nets.entry(creditor.party()).or_insert(0.0) += amount;
            *nets.entry(debtor.party()).or_insert(0.0) -= amount;
        }
    }
}

fn compute(
    records: Vec<Relationship>,
    expenses: &[Expense],
    settlements: &[SettlementTransaction],
    config: &LedgerConfig,
) -> LedgerResult<Computed> {
    let mut computed = Computed {
        registry: RelationshipRegistry::new(records),
        group_nets: BTreeMap::new(),
    };

    for expense in expenses {
        let settled = settle_expense(
            expense.amount,
            &expense.payer,
            &expense.splits,
            config.epsilon,
            config.split_tolerance,
        )
        .map_err(|err| match err {
            LedgerError::InvalidExpense { reason } => LedgerError::InvalidExpense {
                reason: format!("stored expense {}: {reason}", expense.expense_id),
            },
            other => other,
        })?;
        for transfer in &settled.transfers {
            let debtor = computed.registry.resolve(&transfer.from)?;
            let creditor = computed.registry.resolve(&transfer.to)?;
            computed.route(&debtor, &creditor, transfer.amount, expense.group_id.as_ref());
        }
    }

    for settlement in settlements {
        let record = computed
            .registry
            .record(&settlement.relationship_id)
            .ok_or_else(|| LedgerError::NotFound {
                kind: "Settlement relationship",
                id: settlement.relationship_id.clone(),
            })?;
        if record.owner_id != settlement.creator_id {
            return Err(LedgerError::InvalidSettlement {
                reason: format!(
                    "settlement {} was created by {} on a relationship owned by {}",
                    settlement.settlement_id, settlement.creator_id, record.owner_id
                ),
            });
        }
        let creator = Resolved::Global(settlement.creator_id.clone());
        let other = computed
            .registry
            .resolve(&PartyRef::Contact(settlement.relationship_id.clone()))?;
        // Paying someone moves the balance as if they now owed you.
        let (debtor, creditor) = match settlement.direction {
            Direction::Paid => (other, creator),
            Direction::Received => (creator, other),
        };
        computed.route(&debtor, &creditor, settlement.amount, settlement.group_id.as_ref());
    }

    Ok(computed)
}

// ── Write plans ────────────────────────────────────────────────────

/// Rounded, sorted, zero-free breakdown.
fn breakdown<'a>(entries: impl Iterator<Item = (&'a GroupId, f64)>) -> Vec<GroupBalance> {
    let mut out: Vec<GroupBalance> = entries
        .map(|(g, amount)| GroupBalance {
            group_id: g.clone(),
            amount: round2(amount),
        })
        .filter(|g| g.amount != 0.0)
        .collect();
    out.sort_by(|a, b| a.group_id.cmp(&b.group_id));
    out
}

fn stored_breakdown(record: &Relationship) -> Vec<GroupBalance> {
    breakdown(record.group_balances.iter().map(|g| (&g.group_id, g.amount)))
}

fn cache_entries(nets: Option<&BTreeMap<PartyRef, f64>>) -> Vec<GroupBalanceEntry> {
    nets.into_iter()
        .flatten()
        .map(|(party, balance)| GroupBalanceEntry {
            party: party.clone(),
            balance: round2(*balance),
        })
        .filter(|e| e.balance != 0.0)
        .collect()
}

fn global_plan(computed: &Computed, group_ids: Vec<GroupId>) -> WritePlan {
    let empty = Slot::default();
    let relationships = computed
        .registry
        .records()
        .filter_map(|record| {
            let slot = computed.registry.slot(&record.relationship_id).unwrap_or(&empty);
            let balance = round2(slot.total);
            let groups = breakdown(slot.groups.iter().map(|(g, a)| (g, *a)));
            let unchanged = round2(record.balance) == balance && stored_breakdown(record) == groups;
            (!unchanged).then(|| RelationshipUpdate {
                relationship_id: record.relationship_id.clone(),
                balance,
                group_balances: groups,
            })
        })
        .collect();

    let mut all_groups: BTreeSet<GroupId> = group_ids.into_iter().collect();
    all_groups.extend(computed.group_nets.keys().cloned());
    let group_caches = all_groups
        .into_iter()
        .map(|g| {
            let entries = cache_entries(computed.group_nets.get(&g));
            (g, entries)
        })
        .collect();

    WritePlan {
        relationships,
        group_shares: Vec::new(),
        group_caches,
        clear_other_caches: true,
    }
}

fn scoped_plan(computed: &Computed, group_id: &GroupId) -> WritePlan {
    let empty = Slot::default();
    let group_shares = computed
        .registry
        .records()
        .filter_map(|record| {
            let slot = computed.registry.slot(&record.relationship_id).unwrap_or(&empty);
            let amount = round2(slot.total);
            (round2(record.group_amount(group_id)) != amount).then(|| GroupShareUpdate {
                relationship_id: record.relationship_id.clone(),
                group_id: group_id.clone(),
                amount,
            })
        })
        .collect();

    WritePlan {
        relationships: Vec::new(),
        group_shares,
        group_caches: vec![(group_id.clone(), cache_entries(computed.group_nets.get(group_id)))],
        clear_other_caches: false,
    }
}
