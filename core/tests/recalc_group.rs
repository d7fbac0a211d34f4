//! Group-scoped recalculation.
//!
//! A group pass rebuilds one group's share of every record it touches and
//! must land on exactly what a global pass would produce.

use splitledger_core::{
    config::LedgerConfig,
    error::LedgerResult,
    ledger::Ledger,
    model::{Direction, GroupBalance, NewExpense, NewSettlement, PartyRef, Split},
    backend::Scope,
    types::{GroupId, ParticipantId},
};

fn build() -> Ledger {
    Ledger::open_test().expect("build test ledger")
}

fn p(id: &str) -> PartyRef {
    PartyRef::participant(id)
}

fn even_split(amount: f64, payer: &str, members: &[&ParticipantId], group: &GroupId) -> NewExpense {
    let share = amount / members.len() as f64;
    NewExpense {
        description: "group expense".into(),
        amount,
        payer: p(payer),
        group_id: Some(group.clone()),
        splits: members
            .iter()
            .map(|m| Split::new(p(m), share, if m.as_str() == payer { amount } else { 0.0 }))
            .collect(),
    }
}

fn trip(ledger: &mut Ledger) -> LedgerResult<(Vec<ParticipantId>, GroupId)> {
    let ids = ["A", "B", "C"]
        .iter()
        .map(|n| ledger.register_participant(n))
        .collect::<LedgerResult<Vec<_>>>()?;
    let group = ledger.create_group("trip", &ids)?;
    Ok((ids, group))
}

fn breakdown(ledger: &Ledger, owner: &str, counterparty: &str) -> LedgerResult<Vec<GroupBalance>> {
    Ok(ledger
        .store
        .relationship_between(owner, counterparty)?
        .map(|r| r.group_balances)
        .unwrap_or_default())
}

#[test]
fn group_expense_updates_totals_breakdown_and_cache() -> LedgerResult<()> {
    let mut ledger = build();
    let (ids, g) = trip(&mut ledger)?;
    let (a, b, c) = (&ids[0], &ids[1], &ids[2]);

    ledger.add_expense(&even_split(90.0, a, &[a, b, c], &g))?;

    let report = ledger.last_report().expect("a pass ran");
    assert_eq!(report.scope, Scope::Group(g.clone()));
    assert!(!report.fell_back_to_global);
    assert_eq!(report.links_created, 0, "create_group made every pair");

    assert_eq!(ledger.balance_between(a, b)?, 30.0);
    assert_eq!(ledger.balance_between(c, a)?, -30.0);
    assert_eq!(
        breakdown(&ledger, a, b)?,
        vec![GroupBalance { group_id: g.clone(), amount: 30.0 }]
    );

    let cache = ledger.group_balances(&g)?;
    assert_eq!(cache.len(), 3);
    assert_eq!(cache[0].party, p(a));
    assert_eq!(cache[0].balance, 60.0);
    assert!(cache[1..].iter().all(|e| e.balance == -30.0));
    Ok(())
}

#[test]
fn other_groups_survive_a_scoped_pass() -> LedgerResult<()> {
    let mut ledger = build();
    let (ids, g1) = trip(&mut ledger)?;
    let (a, b) = (&ids[0], &ids[1]);
    let g2 = ledger.create_group("flat", &[a.clone(), b.clone()])?;

    let dinner = ledger.add_expense(&even_split(100.0, a, &[a, b], &g1))?;
    ledger.add_expense(&even_split(40.0, b, &[a, b], &g2))?;
    assert_eq!(ledger.balance_between(a, b)?, 30.0);

    let mut expected = vec![
        GroupBalance { group_id: g1.clone(), amount: 50.0 },
        GroupBalance { group_id: g2.clone(), amount: -20.0 },
    ];
    expected.sort_by(|x, y| x.group_id.cmp(&y.group_id));
    assert_eq!(breakdown(&ledger, a, b)?, expected);

    ledger.delete_expense(&dinner)?;
    assert_eq!(ledger.balance_between(a, b)?, -20.0);
    assert_eq!(
        breakdown(&ledger, a, b)?,
        vec![GroupBalance { group_id: g2.clone(), amount: -20.0 }]
    );
    assert!(ledger.group_balances(&g1)?.is_empty());
    assert_eq!(ledger.group_balances(&g2)?.len(), 2);
    Ok(())
}

#[test]
fn scoped_passes_agree_with_a_global_pass() -> LedgerResult<()> {
    let mut ledger = build();
    let (ids, g1) = trip(&mut ledger)?;
    let (a, b, c) = (&ids[0], &ids[1], &ids[2]);
    let g2 = ledger.create_group("flat", &[b.clone(), c.clone()])?;

    ledger.add_expense(&even_split(90.0, a, &[a, b, c], &g1))?;
    let taxi = ledger.add_expense(&even_split(25.0, c, &[a, c], &g1))?;
    ledger.add_expense(&even_split(60.0, b, &[b, c], &g2))?;
    ledger.edit_expense(&taxi, &even_split(35.0, c, &[a, b, c], &g1))?;
    let c_to_b = ledger.store.relationship_between(c, b)?.expect("record C -> B");
    ledger.record_settlement(&NewSettlement {
        amount: 15.0,
        direction: Direction::Paid,
        creator_id: c.clone(),
        relationship_id: c_to_b.relationship_id,
        group_id: Some(g2.clone()),
    })?;

    let report = ledger.recalculate_all()?;
    assert_eq!(report.relationships_written, 0, "global pass found nothing to fix");
    Ok(())
}

#[test]
fn moving_an_expense_recalculates_both_groups() -> LedgerResult<()> {
    let mut ledger = build();
    let (ids, g1) = trip(&mut ledger)?;
    let (a, b) = (&ids[0], &ids[1]);
    let g2 = ledger.create_group("flat", &[a.clone(), b.clone()])?;

    let expense = ledger.add_expense(&even_split(50.0, a, &[a, b], &g1))?;
    ledger.edit_expense(&expense, &even_split(50.0, a, &[a, b], &g2))?;

    assert_eq!(ledger.balance_between(a, b)?, 25.0);
    assert_eq!(
        breakdown(&ledger, a, b)?,
        vec![GroupBalance { group_id: g2.clone(), amount: 25.0 }]
    );
    assert!(ledger.group_balances(&g1)?.is_empty());
    assert_eq!(ledger.group_balances(&g2)?[0].balance, 25.0);
    Ok(())
}

#[test]
fn non_member_participants_are_included() -> LedgerResult<()> {
    let mut ledger = build();
    let (ids, g) = trip(&mut ledger)?;
    let a = &ids[0];
    let guest = ledger.register_participant("Guest")?;
    ledger.befriend(a, &guest)?;
    let stranger = ledger.register_participant("Stranger")?;

    ledger.add_expense(&even_split(40.0, a, &[a, &guest], &g))?;
    let report = ledger.last_report().expect("a pass ran").clone();
    assert!(!report.fell_back_to_global);
    assert_eq!(ledger.balance_between(a, &guest)?, 20.0);

    // No records between A and Stranger yet: the group pass creates them.
    ledger.add_expense(&even_split(10.0, a, &[a, &stranger], &g))?;
    let report = ledger.last_report().expect("a pass ran").clone();
    assert!(!report.fell_back_to_global);
    assert_eq!(report.links_created, 2);
    assert_eq!(ledger.balance_between(&stranger, a)?, -5.0);
    Ok(())
}

#[test]
fn group_contact_shows_up_in_cache() -> LedgerResult<()> {
    let mut ledger = build();
    let (ids, g) = trip(&mut ledger)?;
    let a = &ids[0];
    let dan = ledger.add_contact(a, "Dan")?;

    ledger.add_expense(&NewExpense {
        description: "boat".into(),
        amount: 30.0,
        payer: p(a),
        group_id: Some(g.clone()),
        splits: vec![
            Split::new(p(a), 15.0, 30.0),
            Split::new(PartyRef::contact(dan.clone()), 15.0, 0.0),
        ],
    })?;

    assert_eq!(ledger.store.relationship(&dan)?.expect("contact").balance, 15.0);
    let cache = ledger.group_balances(&g)?;
    assert!(cache.iter().any(|e| e.party == PartyRef::contact(dan.clone()) && e.balance == -15.0));
    Ok(())
}

#[test]
fn disabled_scoping_runs_globally() -> LedgerResult<()> {
    let config = LedgerConfig {
        scoped_recalc_enabled: false,
        ..LedgerConfig::default_test()
    };
    let mut ledger = Ledger::open_test_with(config)?;
    let (ids, g) = trip(&mut ledger)?;
    let (a, b) = (&ids[0], &ids[1]);

    ledger.add_expense(&even_split(20.0, b, &[a, b], &g))?;

    let report = ledger.last_report().expect("a pass ran");
    assert!(report.fell_back_to_global);
    assert_eq!(report.scope, Scope::Global);
    assert_eq!(ledger.balance_between(b, a)?, 10.0);
    assert_eq!(ledger.group_balances(&g)?.len(), 2);
    Ok(())
}

#[test]
fn explicit_group_recalculation_is_a_no_op_when_current() -> LedgerResult<()> {
    let mut ledger = build();
    let (ids, g) = trip(&mut ledger)?;
    let (a, b, c) = (&ids[0], &ids[1], &ids[2]);
    ledger.add_expense(&even_split(66.0, c, &[a, b, c], &g))?;

    let report = ledger.recalculate_group(&g)?;
    assert_eq!(report.relationships_written, 0);
    assert_eq!(report.groups_cached, 1);
    assert_eq!(ledger.balance_between(c, b)?, 22.0);
    Ok(())
}

/// A global pass over the current log must find nothing left to fix.
fn assert_matches_global(ledger: &mut Ledger, step: &str) -> LedgerResult<()> {
    let report = ledger.recalculate_all()?;
    assert_eq!(report.relationships_written, 0, "group passes drifted after {step}");
    Ok(())
}

#[test]
fn non_member_share_follows_the_expense() -> LedgerResult<()> {
    let mut ledger = build();
    let (ids, g) = trip(&mut ledger)?;
    let (a, b) = (&ids[0], &ids[1]);
    let flat = ledger.create_group("flat", &[a.clone(), b.clone()])?;
    let x = ledger.register_participant("X")?;

    let lunch = ledger.add_expense(&even_split(100.0, a, &[a, &x], &g))?;
    assert_eq!(ledger.balance_between(a, &x)?, 50.0);

    ledger.delete_expense(&lunch)?;
    assert_eq!(ledger.balance_between(a, &x)?, 0.0);
    assert_eq!(ledger.balance_between(&x, a)?, 0.0);
    assert!(breakdown(&ledger, a, &x)?.is_empty());
    assert!(ledger.group_balances(&g)?.is_empty());
    assert_matches_global(&mut ledger, "delete")?;

    ledger.restore_expense(&lunch)?;
    assert_eq!(ledger.balance_between(&x, a)?, -50.0);
    assert_matches_global(&mut ledger, "restore")?;

    // X drops out of the expense but stays out of the group.
    ledger.edit_expense(&lunch, &even_split(100.0, a, &[a, b], &g))?;
    assert_eq!(ledger.balance_between(a, &x)?, 0.0);
    assert!(breakdown(&ledger, &x, a)?.is_empty());
    assert_eq!(ledger.balance_between(a, b)?, 50.0);
    assert_matches_global(&mut ledger, "edit")?;

    ledger.edit_expense(&lunch, &even_split(100.0, a, &[a, &x], &g))?;
    ledger.edit_expense(&lunch, &even_split(100.0, a, &[a, &x], &flat))?;
    assert_eq!(ledger.balance_between(a, &x)?, 50.0);
    assert_eq!(
        breakdown(&ledger, a, &x)?,
        vec![GroupBalance { group_id: flat.clone(), amount: 50.0 }]
    );
    assert_eq!(ledger.balance_between(a, b)?, 0.0);
    assert!(ledger.group_balances(&g)?.is_empty());
    assert_matches_global(&mut ledger, "move")?;
    Ok(())
}

#[test]
fn contact_share_follows_the_expense() -> LedgerResult<()> {
    let mut ledger = build();
    let (ids, g) = trip(&mut ledger)?;
    let (a, b) = (&ids[0], &ids[1]);
    let flat = ledger.create_group("flat", &[a.clone(), b.clone()])?;
    let dan = ledger.add_contact(a, "Dan")?;
    let contact_balance = |ledger: &Ledger| -> LedgerResult<f64> {
        Ok(ledger.store.relationship(&dan)?.expect("contact").balance)
    };
    let with_dan = |group: &GroupId| NewExpense {
        description: "boat".into(),
        amount: 30.0,
        payer: p(a),
        group_id: Some(group.clone()),
        splits: vec![
            Split::new(p(a), 15.0, 30.0),
            Split::new(PartyRef::contact(dan.clone()), 15.0, 0.0),
        ],
    };

    let boat = ledger.add_expense(&with_dan(&g))?;
    assert_eq!(contact_balance(&ledger)?, 15.0);

    ledger.delete_expense(&boat)?;
    assert_eq!(contact_balance(&ledger)?, 0.0);
    assert!(ledger.store.relationship(&dan)?.expect("contact").group_balances.is_empty());
    assert_matches_global(&mut ledger, "delete")?;

    ledger.restore_expense(&boat)?;
    assert_eq!(contact_balance(&ledger)?, 15.0);
    assert_matches_global(&mut ledger, "restore")?;

    ledger.edit_expense(&boat, &even_split(30.0, a, &[a, b], &g))?;
    assert_eq!(contact_balance(&ledger)?, 0.0);
    assert_matches_global(&mut ledger, "edit")?;

    ledger.edit_expense(&boat, &with_dan(&g))?;
    ledger.edit_expense(&boat, &with_dan(&flat))?;
    let record = ledger.store.relationship(&dan)?.expect("contact");
    assert_eq!(record.balance, 15.0);
    assert_eq!(record.group_balances, vec![GroupBalance { group_id: flat.clone(), amount: 15.0 }]);
    assert!(ledger.group_balances(&g)?.is_empty());
    assert_matches_global(&mut ledger, "move")?;
    Ok(())
}
