use crate::types::{ParticipantId, RelationshipId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ── Input validation ──────────────────────────────────────
    #[error("Invalid expense: {reason}")]
    InvalidExpense { reason: String },

    #[error("Invalid settlement: {reason}")]
    InvalidSettlement { reason: String },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid relationship: {reason}")]
    InvalidRelationship { reason: String },

    // ── Concurrency ───────────────────────────────────────────
    #[error("Ledger changed during recalculation on every one of {attempts} attempts")]
    ConcurrencyExhausted { attempts: u32 },

    // ── Invariants ────────────────────────────────────────────
    #[error("Zero-sum invariant violated: touched balances sum to {sum:.4} (tolerance {tolerance})")]
    ZeroSumViolation { sum: f64, tolerance: f64 },

    #[error("Relationship pair {a} / {b} is not symmetric: {a_balance:.2} vs {b_balance:.2}")]
    AsymmetricPair {
        a: RelationshipId,
        b: RelationshipId,
        a_balance: f64,
        b_balance: f64,
    },

    #[error("{count} relationship link(s) still missing after repair, first {owner} -> {counterparty}")]
    UnresolvedLinks {
        count: usize,
        owner: ParticipantId,
        counterparty: ParticipantId,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LedgerError {
    /// Validation failures are raised before anything is written.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidExpense { .. }
                | Self::InvalidSettlement { .. }
                | Self::NotFound { .. }
                | Self::InvalidRelationship { .. }
        )
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::ZeroSumViolation { .. } | Self::AsymmetricPair { .. } | Self::UnresolvedLinks { .. }
        )
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
