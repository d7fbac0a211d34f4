//! SQLite persistence layer.
//!
//! RULE: Only the store talks to the database.
//! The orchestrator reaches it through LedgerBackend; the ledger service
//! calls the mutation methods directly. Nothing else executes SQL.

mod backend;
mod expense;
mod group;
mod participant;
mod relationship;
mod settlement;

use crate::{
    backend::Scope,
    error::LedgerResult,
    guard::ActivitySignature,
    model::PartyRef,
    types::Stamp,
};
use rusqlite::{params, types::Type, Connection};

pub struct LedgerStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file or URI
}

impl LedgerStore {
    pub fn open(path: &str) -> LedgerResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        // Concurrent passes on separate connections wait for each other's
        // commit instead of failing with SQLITE_BUSY.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> LedgerResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn, path: None })
    }

    /// Open a second connection to the same database.
    /// For a plain in-memory database this returns a new, isolated one.
    pub fn reopen(&self) -> LedgerResult<Self> {
        match &self.path {
            Some(p) => Self::open(p),
            None => Self::in_memory(),
        }
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> LedgerResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_foundation.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_groups.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_event_log.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_group_balance.sql"))?;
        Ok(())
    }

    // ── Activity stamps ────────────────────────────────────────

    /// Next activity stamp: wall-clock milliseconds, bumped past the last
    /// issued stamp so two writes never share one.
    fn issue_stamp(conn: &Connection) -> LedgerResult<Stamp> {
        let now = chrono::Utc::now().timestamp_millis();
        let stamp = conn.query_row(
            "UPDATE ledger_clock SET last_stamp = MAX(last_stamp + 1, ?1)
             WHERE id = 1 RETURNING last_stamp",
            params![now],
            |row| row.get(0),
        )?;
        Ok(stamp)
    }

    fn signature_on(conn: &Connection, scope: &Scope) -> LedgerResult<ActivitySignature> {
        let group = scope.group_id().map(String::as_str);
        let (latest_expense, expense_rows) = conn.query_row(
            "SELECT MAX(updated_at), COUNT(*) FROM expense
             WHERE (?1 IS NULL OR group_id = ?1)",
            params![group],
            |row| Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, i64>(1)?)),
        )?;
        let (latest_settlement, settlement_rows) = conn.query_row(
            "SELECT MAX(updated_at), COUNT(*) FROM settlement
             WHERE (?1 IS NULL OR group_id = ?1)",
            params![group],
            |row| Ok((row.get::<_, Option<i64>>(0)?, row.get::<_, i64>(1)?)),
        )?;
        Ok(ActivitySignature {
            latest_expense,
            expense_rows,
            latest_settlement,
            settlement_rows,
        })
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

/// Decode a (kind, ref) column pair.
fn party_from_columns(kind: &str, id: String, column: usize) -> rusqlite::Result<PartyRef> {
    match kind {
        "participant" => Ok(PartyRef::Participant(id)),
        "contact" => Ok(PartyRef::Contact(id)),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            column,
            Type::Text,
            format!("unknown party kind '{other}'").into(),
        )),
    }
}

/// Decode a JSON text column.
fn json_column<T: serde::de::DeserializeOwned>(raw: &str, column: usize) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

/// `?, ?, ?` for an IN list of `n` values.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
