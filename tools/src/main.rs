//! ledger-runner: command-line front end for the shared-expense ledger.
//!
//! Usage:
//!   ledger-runner --db ledger.db recalc [--group G]
//!   ledger-runner --db ledger.db balances --participant P
//!   ledger-runner --db ledger.db plan --group G
//!   ledger-runner demo
//!   ledger-runner --db ledger.db --ipc-mode

use anyhow::{Context, Result};
use serde_json::{json, Value};
use splitledger_core::{
    config::LedgerConfig,
    ledger::{Ledger, SettlePlan},
    model::{Direction, NewExpense, NewSettlement, PartyRef, Split},
    recalc::PassReport,
};
use std::env;
use std::io::{self, BufRead, Write};

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcCommand {
    Register { name: String },
    AddContact { owner_id: String, name: String },
    LinkContact { relationship_id: String, participant_id: String },
    Befriend { a: String, b: String },
    CreateGroup { name: String, #[serde(default)] members: Vec<String> },
    JoinGroup { group_id: String, participant_id: String },
    AddExpense { expense: NewExpense },
    EditExpense { expense_id: String, expense: NewExpense },
    DeleteExpense { expense_id: String },
    RestoreExpense { expense_id: String },
    RecordSettlement { settlement: NewSettlement },
    DeleteSettlement { settlement_id: String },
    RestoreSettlement { settlement_id: String },
    Recalc { #[serde(default)] group_id: Option<String> },
    Balances { participant_id: String },
    Plan { group_id: String },
    Quit,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let db = flag_value(&args, "--db").unwrap_or(":memory:");
    let config = match flag_value(&args, "--config") {
        Some(path) => LedgerConfig::load(path)?,
        None => LedgerConfig::default(),
    };
    let command = args
        .iter()
        .skip(1)
        .enumerate()
        .find(|(i, a)| !a.starts_with("--") && !is_flag_value(&args, i + 1))
        .map(|(_, a)| a.as_str());

    // :memory: goes through a shared-cache URI so a second connection from
    // the same process sees the same database.
    let db_effective = if db == ":memory:" {
        format!(
            "file:ledger_{}?mode=memory&cache=shared",
            chrono::Utc::now().timestamp_millis()
        )
    } else {
        db.to_string()
    };
    let mut ledger = Ledger::open(&db_effective, config)
        .with_context(|| format!("Cannot open ledger at {db}"))?;

    if ipc_mode {
        return run_ipc_loop(&mut ledger);
    }

    match command {
        Some("recalc") => {
            let report = match flag_value(&args, "--group") {
                Some(group_id) => ledger.recalculate_group(group_id)?,
                None => ledger.recalculate_all()?,
            };
            print_report(&report);
        }
        Some("balances") => {
            let participant = flag_value(&args, "--participant")
                .context("balances needs --participant P")?;
            print_balances(&ledger, participant)?;
        }
        Some("plan") => {
            let group_id = flag_value(&args, "--group").context("plan needs --group G")?;
            print_plan(&ledger, group_id)?;
        }
        Some("demo") => run_demo(&mut ledger)?,
        Some(other) => anyhow::bail!("Unknown command '{other}'"),
        None => anyhow::bail!("No command given (recalc, balances, plan, demo or --ipc-mode)"),
    }
    Ok(())
}

fn run_ipc_loop(ledger: &mut Ledger) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        let bytes_read = handle.read_line(&mut buffer)?;
        if bytes_read == 0 {
            break; // EOF
        }
        if buffer.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<IpcCommand>(&buffer) {
            Ok(IpcCommand::Quit) => break,
            Ok(cmd) => match handle_command(ledger, cmd) {
                Ok(value) => json!({ "ok": value }),
                Err(e) => {
                    log::warn!("Command failed: {e}");
                    json!({ "error": e.to_string() })
                }
            },
            Err(e) => json!({ "error": format!("Bad command: {e}") }),
        };
        writeln!(stdout, "{reply}")?;
        stdout.flush()?;
    }
    Ok(())
}

fn handle_command(ledger: &mut Ledger, cmd: IpcCommand) -> Result<Value> {
    let value = match cmd {
        IpcCommand::Register { name } => json!(ledger.register_participant(&name)?),
        IpcCommand::AddContact { owner_id, name } => json!(ledger.add_contact(&owner_id, &name)?),
        IpcCommand::LinkContact { relationship_id, participant_id } => {
            json!(ledger.link_contact(&relationship_id, &participant_id)?)
        }
        IpcCommand::Befriend { a, b } => {
            ledger.befriend(&a, &b)?;
            Value::Null
        }
        IpcCommand::CreateGroup { name, members } => json!(ledger.create_group(&name, &members)?),
        IpcCommand::JoinGroup { group_id, participant_id } => {
            json!(ledger.join_group(&group_id, &participant_id)?)
        }
        IpcCommand::AddExpense { expense } => json!(ledger.add_expense(&expense)?),
        IpcCommand::EditExpense { expense_id, expense } => {
            ledger.edit_expense(&expense_id, &expense)?;
            json!(ledger.last_report())
        }
        IpcCommand::DeleteExpense { expense_id } => {
            ledger.delete_expense(&expense_id)?;
            json!(ledger.last_report())
        }
        IpcCommand::RestoreExpense { expense_id } => {
            ledger.restore_expense(&expense_id)?;
            json!(ledger.last_report())
        }
        IpcCommand::RecordSettlement { settlement } => json!(ledger.record_settlement(&settlement)?),
        IpcCommand::DeleteSettlement { settlement_id } => {
            ledger.delete_settlement(&settlement_id)?;
            json!(ledger.last_report())
        }
        IpcCommand::RestoreSettlement { settlement_id } => {
            ledger.restore_settlement(&settlement_id)?;
            json!(ledger.last_report())
        }
        IpcCommand::Recalc { group_id } => match group_id {
            Some(g) => json!(ledger.recalculate_group(&g)?),
            None => json!(ledger.recalculate_all()?),
        },
        IpcCommand::Balances { participant_id } => json!(ledger.relationships_of(&participant_id)?),
        IpcCommand::Plan { group_id } => json!(ledger.settle_up_plan(&group_id)?),
        IpcCommand::Quit => Value::Null,
    };
    Ok(value)
}

/// Three friends, one trip, one outside contact.
fn run_demo(ledger: &mut Ledger) -> Result<()> {
    let ana = ledger.register_participant("Ana")?;
    let ben = ledger.register_participant("Ben")?;
    let cai = ledger.register_participant("Cai")?;
    let trip = ledger.create_group("Lisbon trip", &[ana.clone(), ben.clone(), cai.clone()])?;

    let p = |id: &String| PartyRef::participant(id.clone());
    ledger.add_expense(&NewExpense {
        description: "Apartment".into(),
        amount: 300.0,
        payer: p(&ana),
        group_id: Some(trip.clone()),
        splits: vec![
            Split::new(p(&ana), 100.0, 300.0),
            Split::new(p(&ben), 100.0, 0.0),
            Split::new(p(&cai), 100.0, 0.0),
        ],
    })?;
    ledger.add_expense(&NewExpense {
        description: "Dinner".into(),
        amount: 90.0,
        payer: p(&ben),
        group_id: Some(trip.clone()),
        splits: vec![
            Split::new(p(&ana), 30.0, 0.0),
            Split::new(p(&ben), 30.0, 90.0),
            Split::new(p(&cai), 30.0, 0.0),
        ],
    })?;

    let dan = ledger.add_contact(&ana, "Dan")?;
    ledger.add_expense(&NewExpense {
        description: "Concert tickets".into(),
        amount: 80.0,
        payer: p(&ana),
        group_id: None,
        splits: vec![
            Split::new(p(&ana), 40.0, 80.0),
            Split::new(PartyRef::contact(dan.clone()), 40.0, 0.0),
        ],
    })?;

    let ana_ben = ledger
        .store
        .relationship_between(&ben, &ana)?
        .context("Ben has no record for Ana")?;
    ledger.record_settlement(&NewSettlement {
        amount: 20.0,
        direction: Direction::Paid,
        creator_id: ben.clone(),
        relationship_id: ana_ben.relationship_id,
        group_id: Some(trip.clone()),
    })?;

    println!("=== DEMO LEDGER ===");
    for (name, id) in [("Ana", &ana), ("Ben", &ben), ("Cai", &cai)] {
        println!("  {name} ({id})");
        print_balances(ledger, id)?;
    }
    println!();
    print_plan(ledger, &trip)?;
    Ok(())
}

fn print_report(report: &PassReport) {
    println!("=== RECALCULATION ===");
    println!("  scope:          {:?}", report.scope);
    println!("  attempts:       {}", report.attempts);
    println!("  records written:{:>4}", report.relationships_written);
    println!("  links created:  {}", report.links_created);
    println!("  skipped routes: {}", report.skipped_routes);
    println!("  groups cached:  {}", report.groups_cached);
    println!("  fell back:      {}", report.fell_back_to_global);
}

fn print_balances(ledger: &Ledger, participant_id: &str) -> Result<()> {
    for record in ledger.relationships_of(participant_id)? {
        let who = match record.linked_counterparty() {
            Some(id) => id.clone(),
            None => format!("contact {}", record.relationship_id),
        };
        println!("    {who:<40} {:>10.2}", record.balance);
    }
    Ok(())
}

fn print_plan(ledger: &Ledger, group_id: &str) -> Result<()> {
    println!("=== SETTLE-UP PLAN ({group_id}) ===");
    match ledger.settle_up_plan(group_id)? {
        SettlePlan::Simplified(transfers) if transfers.is_empty() => println!("  (all settled)"),
        SettlePlan::Simplified(transfers) => {
            for t in transfers {
                println!("  {} pays {} {:.2}", t.from, t.to, t.amount);
            }
        }
        SettlePlan::Raw(entries) => {
            println!("  (could not simplify; raw balances)");
            for e in entries {
                println!("  {} {:>10.2}", e.party, e.balance);
            }
        }
    }
    Ok(())
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}

/// True if `args[index]` is the value of a `--flag value` pair.
fn is_flag_value(args: &[String], index: usize) -> bool {
    const VALUED: [&str; 4] = ["--db", "--config", "--group", "--participant"];
    index > 0 && VALUED.contains(&args[index - 1].as_str())
}
