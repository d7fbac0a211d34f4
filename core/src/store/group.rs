use super::{new_id, now_millis, party_from_columns, LedgerStore};
use crate::{
    error::LedgerResult,
    model::{Group, GroupBalanceEntry},
    types::{GroupId, ParticipantId},
};
use rusqlite::{params, Connection, OptionalExtension};

impl LedgerStore {
    // ── Groups ────────────────────────────────────────────────────

    pub fn insert_group(&self, name: &str) -> LedgerResult<GroupId> {
        let group_id = new_id("g");
        self.conn.execute(
            "INSERT INTO grp (group_id, name, created_at) VALUES (?1, ?2, ?3)",
            params![group_id, name, now_millis()],
        )?;
        Ok(group_id)
    }

    /// Returns false if the participant was already a member.
    pub fn insert_group_member(&self, group_id: &str, participant_id: &str) -> LedgerResult<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO group_member (group_id, participant_id, joined_at)
             VALUES (?1, ?2, ?3)",
            params![group_id, participant_id, now_millis()],
        )?;
        Ok(inserted == 1)
    }

    pub fn group(&self, group_id: &str) -> LedgerResult<Option<Group>> {
        let name: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM grp WHERE group_id = ?1",
                params![group_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(name) = name else {
            return Ok(None);
        };
        Ok(Some(Group {
            group_id: group_id.to_string(),
            name,
            members: self.load_group_member_ids(group_id)?,
        }))
    }

    pub(super) fn load_group_member_ids(&self, group_id: &str) -> LedgerResult<Vec<ParticipantId>> {
        let mut stmt = self.conn.prepare(
            "SELECT participant_id FROM group_member
             WHERE group_id = ?1 ORDER BY joined_at, participant_id",
        )?;
        let rows = stmt
            .query_map(params![group_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub(super) fn load_group_ids(&self) -> LedgerResult<Vec<GroupId>> {
        let mut stmt = self.conn.prepare("SELECT group_id FROM grp ORDER BY group_id")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Group balance cache ───────────────────────────────────────

    /// Cached participant → net balance for a group, largest creditor first.
    pub fn group_balances(&self, group_id: &str) -> LedgerResult<Vec<GroupBalanceEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT party_kind, party_ref, balance FROM group_balance
             WHERE group_id = ?1
             ORDER BY balance DESC, party_kind, party_ref",
        )?;
        let rows = stmt
            .query_map(params![group_id], |row| {
                let kind: String = row.get(0)?;
                Ok(GroupBalanceEntry {
                    party: party_from_columns(&kind, row.get(1)?, 0)?,
                    balance: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub(super) fn clear_group_caches(conn: &Connection) -> LedgerResult<()> {
        conn.execute("DELETE FROM group_balance", [])?;
        Ok(())
    }

    pub(super) fn replace_group_cache(
        conn: &Connection,
        group_id: &str,
        entries: &[GroupBalanceEntry],
        now: i64,
    ) -> LedgerResult<()> {
        conn.execute("DELETE FROM group_balance WHERE group_id = ?1", params![group_id])?;
        let mut stmt = conn.prepare(
            "INSERT INTO group_balance (group_id, party_kind, party_ref, balance, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for entry in entries {
            stmt.execute(params![
                group_id,
                entry.party.kind(),
                entry.party.id(),
                entry.balance,
                now
            ])?;
        }
        Ok(())
    }
}
