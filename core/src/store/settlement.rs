use super::{new_id, LedgerStore};
use crate::{
    error::LedgerResult,
    model::{Direction, NewSettlement, SettlementTransaction},
    types::SettlementId,
};
use rusqlite::{params, types::Type, Transaction, TransactionBehavior};

impl LedgerStore {
    // ── Settlements ───────────────────────────────────────────────

    pub fn insert_settlement(&self, settlement: &NewSettlement) -> LedgerResult<SettlementId> {
        let settlement_id = new_id("s");
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let stamp = Self::issue_stamp(&tx)?;
        tx.execute(
            "INSERT INTO settlement
             (settlement_id, amount, direction, creator_id, relationship_id, group_id,
              deleted, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)",
            params![
                settlement_id,
                settlement.amount,
                settlement.direction.as_str(),
                settlement.creator_id,
                settlement.relationship_id,
                settlement.group_id,
                stamp,
            ],
        )?;
        tx.commit()?;
        Ok(settlement_id)
    }

    /// Soft-delete or restore. Always bumps the activity stamp.
    pub fn set_settlement_deleted(&self, settlement_id: &str, deleted: bool) -> LedgerResult<bool> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let stamp = Self::issue_stamp(&tx)?;
        let updated = tx.execute(
            "UPDATE settlement SET deleted = ?2, updated_at = ?3 WHERE settlement_id = ?1",
            params![settlement_id, deleted as i32, stamp],
        )?;
        tx.commit()?;
        Ok(updated == 1)
    }

    pub fn settlement(&self, settlement_id: &str) -> LedgerResult<Option<SettlementTransaction>> {
        let mut found = self.query_settlements(false, None, Some(settlement_id))?;
        Ok(found.pop())
    }

    pub(super) fn live_settlements_in(
        &self,
        group_id: Option<&str>,
    ) -> LedgerResult<Vec<SettlementTransaction>> {
        self.query_settlements(true, group_id, None)
    }

    fn query_settlements(
        &self,
        live_only: bool,
        group_id: Option<&str>,
        settlement_id: Option<&str>,
    ) -> LedgerResult<Vec<SettlementTransaction>> {
        let mut stmt = self.conn.prepare(
            "SELECT settlement_id, amount, direction, creator_id, relationship_id,
                    group_id, deleted, updated_at
             FROM settlement
             WHERE (?1 = 0 OR deleted = 0)
               AND (?2 IS NULL OR group_id = ?2)
               AND (?3 IS NULL OR settlement_id = ?3)
             ORDER BY created_at, settlement_id",
        )?;
        let rows = stmt
            .query_map(params![live_only, group_id, settlement_id], |row| {
                let raw: String = row.get(2)?;
                let direction = Direction::parse(&raw).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        Type::Text,
                        format!("unknown direction '{raw}'").into(),
                    )
                })?;
                Ok(SettlementTransaction {
                    settlement_id: row.get(0)?,
                    amount: row.get(1)?,
                    direction,
                    creator_id: row.get(3)?,
                    relationship_id: row.get(4)?,
                    group_id: row.get(5)?,
                    deleted: row.get::<_, i32>(6)? != 0,
                    updated_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
