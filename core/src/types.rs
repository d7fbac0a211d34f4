//! Shared primitive types used across the ledger.

/// Stable identifier of a global account holder.
pub type ParticipantId = String;

/// Identifier of a directed relationship record.
/// Unlinked contacts are addressed through the record that holds them.
pub type RelationshipId = String;

pub type GroupId = String;

pub type ExpenseId = String;

pub type SettlementId = String;

/// Activity stamp in milliseconds. Issued by the store, strictly increasing.
pub type Stamp = i64;
