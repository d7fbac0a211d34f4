//! Optimistic concurrency: a pass whose scope changes underneath it must
//! discard its result, retry, and never persist stale balances.

use splitledger_core::{
    backend::{CommitOutcome, LedgerBackend, Scope, WritePlan},
    config::LedgerConfig,
    error::{LedgerError, LedgerResult},
    guard::ActivitySignature,
    ledger::Ledger,
    model::{Expense, NewExpense, PartyRef, Relationship, SettlementTransaction, Split},
    recalc::Orchestrator,
    store::LedgerStore,
    types::{GroupId, ParticipantId, RelationshipId},
};
use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;

/// Wraps the real store and touches an expense every time a pass loads
/// expenses, as if another writer got in between read and commit.
struct Meddler<'a> {
    store: &'a LedgerStore,
    expense_id: String,
    /// Interfere with at most this many loads.
    budget: Cell<u32>,
    /// Only interfere with group-scoped passes.
    groups_only: bool,
    hits: Cell<u32>,
    /// A pass over this group commits right before our next commit.
    cut_in: RefCell<Option<GroupId>>,
}

impl<'a> Meddler<'a> {
    fn new(store: &'a LedgerStore, expense_id: &str, budget: u32) -> Self {
        Self {
            store,
            expense_id: expense_id.to_string(),
            budget: Cell::new(budget),
            groups_only: false,
            hits: Cell::new(0),
            cut_in: RefCell::new(None),
        }
    }

    fn meddle(&self, scope: &Scope) -> LedgerResult<()> {
        if self.budget.get() == 0 || (self.groups_only && *scope == Scope::Global) {
            return Ok(());
        }
        self.budget.set(self.budget.get() - 1);
        self.hits.set(self.hits.get() + 1);
        // Restoring a live expense changes nothing but its stamp.
        self.store.set_expense_deleted(&self.expense_id, false)?;
        Ok(())
    }
}

impl LedgerBackend for Meddler<'_> {
    fn activity_signature(&self, scope: &Scope) -> LedgerResult<ActivitySignature> {
        self.store.activity_signature(scope)
    }

    fn live_expenses(&self, scope: &Scope) -> LedgerResult<Vec<Expense>> {
        self.meddle(scope)?;
        self.store.live_expenses(scope)
    }

    fn live_settlements(&self, scope: &Scope) -> LedgerResult<Vec<SettlementTransaction>> {
        self.store.live_settlements(scope)
    }

    fn all_relationships(&self) -> LedgerResult<Vec<Relationship>> {
        self.store.all_relationships()
    }

    fn relationships_among(
        &self,
        participants: &BTreeSet<ParticipantId>,
        extra: &BTreeSet<RelationshipId>,
    ) -> LedgerResult<Vec<Relationship>> {
        self.store.relationships_among(participants, extra)
    }

    fn relationships_in_group(&self, group_id: &GroupId) -> LedgerResult<Vec<Relationship>> {
        self.store.relationships_in_group(group_id)
    }

    fn group_member_ids(&self, group_id: &GroupId) -> LedgerResult<Vec<ParticipantId>> {
        self.store.group_member_ids(group_id)
    }

    fn all_group_ids(&self) -> LedgerResult<Vec<GroupId>> {
        self.store.all_group_ids()
    }

    fn ensure_link(&self, owner: &ParticipantId, counterparty: &ParticipantId) -> LedgerResult<bool> {
        self.store.ensure_link(owner, counterparty)
    }

    fn commit_pass(
        &self,
        scope: &Scope,
        expected: &ActivitySignature,
        plan: &WritePlan,
    ) -> LedgerResult<CommitOutcome> {
        let pending = self.cut_in.borrow_mut().take();
        if let Some(group_id) = pending {
            Orchestrator::new(LedgerConfig::default_test()).recalculate_group(self.store, Some(&group_id))?;
        }
        self.store.commit_pass(scope, expected, plan)
    }
}

fn p(id: &str) -> PartyRef {
    PartyRef::participant(id)
}

fn halves(amount: f64, payer: &str, other: &str, group_id: Option<GroupId>) -> NewExpense {
    NewExpense {
        description: "halves".into(),
        amount,
        payer: p(payer),
        group_id,
        splits: vec![
            Split::new(p(payer), amount / 2.0, amount),
            Split::new(p(other), amount / 2.0, 0.0),
        ],
    }
}

/// A and B with one settled 100.0 expense, optionally in a group.
fn setup(grouped: bool) -> LedgerResult<(Ledger, ParticipantId, ParticipantId, Option<GroupId>, String)> {
    let mut ledger = Ledger::open_test()?;
    let a = ledger.register_participant("A")?;
    let b = ledger.register_participant("B")?;
    let group = if grouped {
        Some(ledger.create_group("pair", &[a.clone(), b.clone()])?)
    } else {
        ledger.befriend(&a, &b)?;
        None
    };
    let expense = ledger.add_expense(&halves(100.0, &a, &b, group.clone()))?;
    Ok((ledger, a, b, group, expense))
}

#[test]
fn stale_attempts_are_retried() -> LedgerResult<()> {
    let (ledger, _, _, _, expense) = setup(false)?;
    let meddler = Meddler::new(&ledger.store, &expense, 2);
    let mut orchestrator = Orchestrator::new(LedgerConfig::default_test());

    let report = orchestrator.recalculate_global(&meddler)?;
    assert_eq!(report.attempts, 3);
    assert_eq!(meddler.hits.get(), 2);
    Ok(())
}

#[test]
fn exhausted_retries_fail_and_write_nothing() -> LedgerResult<()> {
    let (ledger, a, b, _, expense) = setup(false)?;
    assert_eq!(ledger.balance_between(&a, &b)?, 50.0);

    // Change the expense behind the ledger's back, without recalculating.
    ledger.store.replace_expense(&expense, &halves(200.0, &a, &b, None))?;

    let meddler = Meddler::new(&ledger.store, &expense, u32::MAX);
    let mut orchestrator = Orchestrator::new(LedgerConfig::default_test());
    let err = orchestrator.recalculate_global(&meddler).unwrap_err();
    assert!(matches!(err, LedgerError::ConcurrencyExhausted { attempts: 4 }));
    assert_eq!(meddler.hits.get(), 4);
    assert_eq!(ledger.balance_between(&a, &b)?, 50.0, "stale result was never persisted");

    // Once the interference stops, the next pass catches up.
    orchestrator.recalculate_global(&ledger.store)?;
    assert_eq!(ledger.balance_between(&a, &b)?, 100.0);
    Ok(())
}

#[test]
fn retry_bound_follows_config() -> LedgerResult<()> {
    let (ledger, _, _, _, expense) = setup(false)?;
    let meddler = Meddler::new(&ledger.store, &expense, u32::MAX);
    let config = LedgerConfig {
        max_retries: 0,
        ..LedgerConfig::default_test()
    };
    let err = Orchestrator::new(config).recalculate_global(&meddler).unwrap_err();
    assert!(matches!(err, LedgerError::ConcurrencyExhausted { attempts: 1 }));
    Ok(())
}

#[test]
fn failing_group_pass_falls_back_to_global() -> LedgerResult<()> {
    let (ledger, a, b, group, expense) = setup(true)?;
    ledger
        .store
        .replace_expense(&expense, &halves(60.0, &b, &a, group.clone()))?;

    let mut meddler = Meddler::new(&ledger.store, &expense, u32::MAX);
    meddler.groups_only = true;
    let mut orchestrator = Orchestrator::new(LedgerConfig::default_test());

    let report = orchestrator.recalculate_group(&meddler, group.as_ref())?;
    assert!(report.fell_back_to_global);
    assert_eq!(report.scope, Scope::Global);
    assert_eq!(meddler.hits.get(), 4, "every scoped attempt went stale");
    assert_eq!(ledger.balance_between(&b, &a)?, 30.0);
    Ok(())
}

#[test]
fn every_write_moves_the_signature() -> LedgerResult<()> {
    let (ledger, _, _, _, expense) = setup(false)?;
    let scope = Scope::Global;

    let first = ledger.store.activity_signature(&scope)?;
    ledger.store.set_expense_deleted(&expense, true)?;
    let second = ledger.store.activity_signature(&scope)?;
    ledger.store.set_expense_deleted(&expense, false)?;
    let third = ledger.store.activity_signature(&scope)?;

    assert_ne!(first, second);
    assert_ne!(second, third);
    assert_ne!(first, third, "same rows, same flags, newer stamp");
    assert!(third.latest_expense > second.latest_expense);
    Ok(())
}

#[test]
fn writes_from_another_connection_are_seen() -> LedgerResult<()> {
    let path = std::env::temp_dir().join(format!("splitledger-{}.db", uuid::Uuid::new_v4()));
    let path = path.to_string_lossy().to_string();

    let result = (|| -> LedgerResult<()> {
        let mut ledger = Ledger::open(&path, LedgerConfig::default_test())?;
        let a = ledger.register_participant("A")?;
        let b = ledger.register_participant("B")?;
        ledger.befriend(&a, &b)?;
        let expense = ledger.add_expense(&halves(80.0, &a, &b, None))?;
        assert_eq!(ledger.balance_between(&a, &b)?, 40.0);

        let other = ledger.store.reopen()?;
        let before = ledger.store.activity_signature(&Scope::Global)?;
        other.set_expense_deleted(&expense, true)?;
        assert_ne!(ledger.store.activity_signature(&Scope::Global)?, before);

        ledger.recalculate_all()?;
        assert_eq!(ledger.balance_between(&a, &b)?, 0.0);
        Ok(())
    })();

    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{path}{suffix}"));
    }
    result
}

#[test]
fn group_passes_committing_in_between_are_kept() -> LedgerResult<()> {
    let mut ledger = Ledger::open_test()?;
    let a = ledger.register_participant("A")?;
    let b = ledger.register_participant("B")?;
    let g1 = ledger.create_group("g1", &[a.clone(), b.clone()])?;
    let g2 = ledger.create_group("g2", &[a.clone(), b.clone()])?;

    // Written behind the ledger's back so both groups still need a pass.
    ledger.store.insert_expense(&halves(100.0, &a, &b, Some(g1.clone())))?;
    ledger.store.insert_expense(&halves(60.0, &a, &b, Some(g2.clone())))?;

    let meddler = Meddler::new(&ledger.store, "", 0);
    *meddler.cut_in.borrow_mut() = Some(g1.clone());
    let report = Orchestrator::new(LedgerConfig::default_test()).recalculate_group(&meddler, Some(&g2))?;
    assert!(!report.fell_back_to_global);
    assert_eq!(report.attempts, 1);

    let record = ledger.store.relationship_between(&a, &b)?.expect("record A -> B");
    assert_eq!(record.balance, 80.0);
    assert_eq!(record.group_amount(&g1), 50.0);
    assert_eq!(record.group_amount(&g2), 30.0);
    assert_eq!(ledger.balance_between(&b, &a)?, -80.0);

    assert_eq!(ledger.recalculate_all()?.relationships_written, 0);
    Ok(())
}

#[test]
fn links_from_a_discarded_attempt_are_not_reported() -> LedgerResult<()> {
    let mut ledger = Ledger::open_test()?;
    let a = ledger.register_participant("A")?;
    let b = ledger.register_participant("B")?;
    // No records between A and B yet; the first attempt creates them.
    let expense = ledger.store.insert_expense(&halves(100.0, &a, &b, None))?;

    let meddler = Meddler::new(&ledger.store, &expense, 1);
    let report = Orchestrator::new(LedgerConfig::default_test()).recalculate_global(&meddler)?;
    assert_eq!(report.attempts, 2);
    assert_eq!(report.links_created, 0, "the committed attempt found both records");
    assert_eq!(ledger.balance_between(&a, &b)?, 50.0);
    Ok(())
}
