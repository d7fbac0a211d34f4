use super::{new_id, party_from_columns, LedgerStore};
use crate::{
    error::LedgerResult,
    model::{Expense, NewExpense, Split},
    types::ExpenseId,
};
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use std::collections::HashMap;

impl LedgerStore {
    // ── Expenses ──────────────────────────────────────────────────

    /// Insert an expense and its splits in one transaction.
    pub fn insert_expense(&self, expense: &NewExpense) -> LedgerResult<ExpenseId> {
        let expense_id = new_id("e");
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let stamp = Self::issue_stamp(&tx)?;
        tx.execute(
            "INSERT INTO expense
             (expense_id, description, amount, payer_kind, payer_ref, group_id,
              deleted, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)",
            params![
                expense_id,
                expense.description,
                expense.amount,
                expense.payer.kind(),
                expense.payer.id(),
                expense.group_id,
                stamp,
            ],
        )?;
        Self::write_splits(&tx, &expense_id, &expense.splits)?;
        tx.commit()?;
        Ok(expense_id)
    }

    /// Replace an expense's content, keeping its id and deleted flag.
    /// Returns false if no such expense exists.
    pub fn replace_expense(&self, expense_id: &str, expense: &NewExpense) -> LedgerResult<bool> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let stamp = Self::issue_stamp(&tx)?;
        let updated = tx.execute(
            "UPDATE expense SET description = ?2, amount = ?3, payer_kind = ?4,
                    payer_ref = ?5, group_id = ?6, updated_at = ?7
             WHERE expense_id = ?1",
            params![
                expense_id,
                expense.description,
                expense.amount,
                expense.payer.kind(),
                expense.payer.id(),
                expense.group_id,
                stamp,
            ],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        tx.execute("DELETE FROM expense_split WHERE expense_id = ?1", params![expense_id])?;
        Self::write_splits(&tx, expense_id, &expense.splits)?;
        tx.commit()?;
        Ok(true)
    }

    /// Soft-delete or restore. Always bumps the activity stamp.
    pub fn set_expense_deleted(&self, expense_id: &str, deleted: bool) -> LedgerResult<bool> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let stamp = Self::issue_stamp(&tx)?;
        let updated = tx.execute(
            "UPDATE expense SET deleted = ?2, updated_at = ?3 WHERE expense_id = ?1",
            params![expense_id, deleted as i32, stamp],
        )?;
        tx.commit()?;
        Ok(updated == 1)
    }

    /// Fetch one expense, deleted or not.
    pub fn expense(&self, expense_id: &str) -> LedgerResult<Option<Expense>> {
        let mut found = self.query_expenses(false, None, Some(expense_id))?;
        Ok(found.pop())
    }

    pub(super) fn live_expenses_in(&self, group_id: Option<&str>) -> LedgerResult<Vec<Expense>> {
        self.query_expenses(true, group_id, None)
    }

    fn write_splits(conn: &Connection, expense_id: &str, splits: &[Split]) -> LedgerResult<()> {
        let mut stmt = conn.prepare(
            "INSERT INTO expense_split (expense_id, position, party_kind, party_ref, cost, paid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for (position, split) in splits.iter().enumerate() {
            stmt.execute(params![
                expense_id,
                position as i64,
                split.participant.kind(),
                split.participant.id(),
                split.cost,
                split.paid,
            ])?;
        }
        Ok(())
    }

    fn query_expenses(
        &self,
        live_only: bool,
        group_id: Option<&str>,
        expense_id: Option<&str>,
    ) -> LedgerResult<Vec<Expense>> {
        let filter = "(?1 = 0 OR e.deleted = 0)
                      AND (?2 IS NULL OR e.group_id = ?2)
                      AND (?3 IS NULL OR e.expense_id = ?3)";

        let mut split_stmt = self.conn.prepare(&format!(
            "SELECT s.expense_id, s.party_kind, s.party_ref, s.cost, s.paid
             FROM expense_split s JOIN expense e ON e.expense_id = s.expense_id
             WHERE {filter}
             ORDER BY s.expense_id, s.position"
        ))?;
        let mut splits: HashMap<String, Vec<Split>> = HashMap::new();
        let split_rows = split_stmt.query_map(params![live_only, group_id, expense_id], |row| {
            let kind: String = row.get(1)?;
            Ok((
                row.get::<_, String>(0)?,
                Split {
                    participant: party_from_columns(&kind, row.get(2)?, 1)?,
                    cost: row.get(3)?,
                    paid: row.get(4)?,
                },
            ))
        })?;
        for row in split_rows {
            let (id, split) = row?;
            splits.entry(id).or_default().push(split);
        }

        let mut stmt = self.conn.prepare(&format!(
            "SELECT e.expense_id, e.description, e.amount, e.payer_kind, e.payer_ref,
                    e.group_id, e.deleted, e.updated_at
             FROM expense e
             WHERE {filter}
             ORDER BY e.created_at, e.expense_id"
        ))?;
        let expenses = stmt
            .query_map(params![live_only, group_id, expense_id], |row| {
                let kind: String = row.get(3)?;
                Ok(Expense {
                    expense_id: row.get(0)?,
                    description: row.get(1)?,
                    amount: row.get(2)?,
                    payer: party_from_columns(&kind, row.get(4)?, 3)?,
                    group_id: row.get(5)?,
                    deleted: row.get::<_, i32>(6)? != 0,
                    updated_at: row.get(7)?,
                    splits: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|mut e| {
                e.splits = splits.remove(&e.expense_id).unwrap_or_default();
                e
            })
            .collect();
        Ok(expenses)
    }
}
