use super::{new_id, now_millis, LedgerStore};
use crate::{error::LedgerResult, model::Participant, types::ParticipantId};
use rusqlite::{params, OptionalExtension};

impl LedgerStore {
    // ── Participant ───────────────────────────────────────────────

    pub fn insert_participant(&self, display_name: &str) -> LedgerResult<ParticipantId> {
        let participant_id = new_id("p");
        self.conn.execute(
            "INSERT INTO participant (participant_id, display_name, created_at)
             VALUES (?1, ?2, ?3)",
            params![participant_id, display_name, now_millis()],
        )?;
        Ok(participant_id)
    }

    pub fn participant(&self, participant_id: &str) -> LedgerResult<Option<Participant>> {
        let participant = self
            .conn
            .query_row(
                "SELECT participant_id, display_name FROM participant WHERE participant_id = ?1",
                params![participant_id],
                |row| {
                    Ok(Participant {
                        participant_id: row.get(0)?,
                        display_name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(participant)
    }

    pub fn participant_exists(&self, participant_id: &str) -> LedgerResult<bool> {
        Ok(self.participant(participant_id)?.is_some())
    }
}
