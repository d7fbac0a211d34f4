use super::{json_column, new_id, now_millis, placeholders, LedgerStore};
use crate::{
    backend::{GroupShareUpdate, RelationshipUpdate},
    error::{LedgerError, LedgerResult},
    model::{Counterparty, GroupBalance, Relationship},
    money::round2,
    types::{ParticipantId, RelationshipId},
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::BTreeSet;

const RELATIONSHIP_COLUMNS: &str = "relationship_id, owner_id, counterparty_id, contact_name,
                                    balance, group_balances, updated_at";

impl LedgerStore {
    // ── Relationship records ──────────────────────────────────────

    /// Add an unlinked contact to `owner`'s ledger.
    pub fn insert_contact(&self, owner_id: &str, name: &str) -> LedgerResult<RelationshipId> {
        let relationship_id = new_id("r");
        let now = now_millis();
        self.conn.execute(
            "INSERT INTO relationship
             (relationship_id, owner_id, counterparty_id, contact_name, created_at, updated_at)
             VALUES (?1, ?2, NULL, ?3, ?4, ?4)",
            params![relationship_id, owner_id, name, now],
        )?;
        Ok(relationship_id)
    }

    /// Duplicate-tolerant upsert of `owner -> counterparty`.
    /// Two passes discovering the same gap both succeed; only one inserts.
    pub fn ensure_relationship(&self, owner_id: &str, counterparty_id: &str) -> LedgerResult<bool> {
        let now = now_millis();
        let inserted = self.conn.execute(
            "INSERT INTO relationship
             (relationship_id, owner_id, counterparty_id, contact_name, created_at, updated_at)
             VALUES (?1, ?2, ?3, NULL, ?4, ?4)
             ON CONFLICT DO NOTHING",
            params![new_id("r"), owner_id, counterparty_id, now],
        )?;
        Ok(inserted == 1)
    }

    /// Turn an unlinked contact into a link to `participant_id`.
    /// Returns false if the record was already linked.
    pub fn link_contact(&self, relationship_id: &str, participant_id: &str) -> LedgerResult<bool> {
        let updated = self.conn.execute(
            "UPDATE relationship SET counterparty_id = ?2, updated_at = ?3
             WHERE relationship_id = ?1 AND counterparty_id IS NULL",
            params![relationship_id, participant_id, now_millis()],
        )?;
        Ok(updated == 1)
    }

    pub fn relationship(&self, relationship_id: &str) -> LedgerResult<Option<Relationship>> {
        let sql = format!("SELECT {RELATIONSHIP_COLUMNS} FROM relationship WHERE relationship_id = ?1");
        let record = self
            .conn
            .query_row(&sql, params![relationship_id], Self::map_relationship_row)
            .optional()?;
        Ok(record)
    }

    pub fn relationship_between(
        &self,
        owner_id: &str,
        counterparty_id: &str,
    ) -> LedgerResult<Option<Relationship>> {
        let sql = format!(
            "SELECT {RELATIONSHIP_COLUMNS} FROM relationship
             WHERE owner_id = ?1 AND counterparty_id = ?2"
        );
        let record = self
            .conn
            .query_row(&sql, params![owner_id, counterparty_id], Self::map_relationship_row)
            .optional()?;
        Ok(record)
    }

    pub fn relationships_for_owner(&self, owner_id: &str) -> LedgerResult<Vec<Relationship>> {
        let sql = format!(
            "SELECT {RELATIONSHIP_COLUMNS} FROM relationship
             WHERE owner_id = ?1 ORDER BY relationship_id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![owner_id], Self::map_relationship_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub(super) fn load_all_relationships(&self) -> LedgerResult<Vec<Relationship>> {
        let sql = format!("SELECT {RELATIONSHIP_COLUMNS} FROM relationship ORDER BY relationship_id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], Self::map_relationship_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub(super) fn load_relationships_among(
        &self,
        participants: &BTreeSet<ParticipantId>,
        extra: &BTreeSet<RelationshipId>,
    ) -> LedgerResult<Vec<Relationship>> {
        let people = placeholders(participants.len());
        let sql = format!(
            "SELECT {RELATIONSHIP_COLUMNS} FROM relationship
             WHERE (owner_id IN ({people}) AND counterparty_id IN ({people}))
                OR relationship_id IN ({})
             ORDER BY relationship_id",
            placeholders(extra.len())
        );
        let values = participants
            .iter()
            .chain(participants.iter())
            .chain(extra.iter())
            .map(String::as_str);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), Self::map_relationship_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub(super) fn load_relationships_in_group(&self, group_id: &str) -> LedgerResult<Vec<Relationship>> {
        let sql = format!(
            "SELECT {RELATIONSHIP_COLUMNS} FROM relationship
             WHERE EXISTS (
                 SELECT 1 FROM json_each(relationship.group_balances)
                 WHERE json_extract(json_each.value, '$.group_id') = ?1
             )
             ORDER BY relationship_id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![group_id], Self::map_relationship_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Swap one group's share on the record as currently stored.
    pub(super) fn apply_group_share(
        conn: &Connection,
        share: &GroupShareUpdate,
        now: i64,
    ) -> LedgerResult<()> {
        let current = conn
            .query_row(
                "SELECT balance, group_balances FROM relationship WHERE relationship_id = ?1",
                params![share.relationship_id],
                |row| {
                    let raw: String = row.get(1)?;
                    let groups: Vec<GroupBalance> = json_column(&raw, 1)?;
                    Ok((row.get::<_, f64>(0)?, groups))
                },
            )
            .optional()?;
        let Some((balance, mut groups)) = current else {
            return Err(LedgerError::NotFound {
                kind: "Relationship",
                id: share.relationship_id.clone(),
            });
        };

        let old: f64 = groups
            .iter()
            .filter(|g| g.group_id == share.group_id)
            .map(|g| g.amount)
            .sum();
        groups.retain(|g| g.group_id != share.group_id);
        let amount = round2(share.amount);
        if amount != 0.0 {
            groups.push(GroupBalance {
                group_id: share.group_id.clone(),
                amount,
            });
            groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        }

        let update = RelationshipUpdate {
            relationship_id: share.relationship_id.clone(),
            balance: round2(balance - old + amount),
            group_balances: groups,
        };
        Self::write_relationship(conn, &update, now)
    }

    pub(super) fn write_relationship(
        conn: &Connection,
        update: &RelationshipUpdate,
        now: i64,
    ) -> LedgerResult<()> {
        conn.execute(
            "UPDATE relationship SET balance = ?1, group_balances = ?2, updated_at = ?3
             WHERE relationship_id = ?4",
            params![
                update.balance,
                serde_json::to_string(&update.group_balances)?,
                now,
                update.relationship_id,
            ],
        )?;
        Ok(())
    }

    fn map_relationship_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Relationship> {
        let counterparty_id: Option<String> = row.get(2)?;
        let contact_name: Option<String> = row.get(3)?;
        let counterparty = match counterparty_id {
            Some(participant_id) => Counterparty::Linked { participant_id },
            None => Counterparty::Contact {
                name: contact_name.unwrap_or_default(),
            },
        };
        let raw: String = row.get(5)?;
        Ok(Relationship {
            relationship_id: row.get(0)?,
            owner_id: row.get(1)?,
            counterparty,
            balance: row.get(4)?,
            group_balances: json_column(&raw, 5)?,
            updated_at: row.get(6)?,
        })
    }
}
