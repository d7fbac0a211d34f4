//! Ledger data model: participants, relationship records, and the
//! expense / settlement event log that balances are derived from.

use crate::types::{ExpenseId, GroupId, ParticipantId, RelationshipId, SettlementId, Stamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Anyone who can appear in a split.
///
/// Unlinked contacts have no account; they are addressed through the
/// relationship record their owner holds for them. Once the contact is
/// linked to an account the same reference resolves to that participant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PartyRef {
    Participant(ParticipantId),
    Contact(RelationshipId),
}

impl PartyRef {
    pub fn participant(id: impl Into<String>) -> Self {
        Self::Participant(id.into())
    }

    pub fn contact(relationship_id: impl Into<String>) -> Self {
        Self::Contact(relationship_id.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Participant(_) => "participant",
            Self::Contact(_) => "contact",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Participant(id) | Self::Contact(id) => id,
        }
    }
}

impl fmt::Display for PartyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub participant_id: ParticipantId,
    pub display_name: String,
}

/// Who sits on the other side of a relationship record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Counterparty {
    Linked { participant_id: ParticipantId },
    Contact { name: String },
}

/// One group's share of a relationship balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupBalance {
    pub group_id: GroupId,
    pub amount: f64,
}

/// A directed ledger slot. `balance > 0` means the counterparty owes the owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub relationship_id: RelationshipId,
    pub owner_id: ParticipantId,
    pub counterparty: Counterparty,
    pub balance: f64,
    /// Sorted by group id. Groups with a zero share are omitted.
    pub group_balances: Vec<GroupBalance>,
    pub updated_at: Stamp,
}

impl Relationship {
    pub fn linked_counterparty(&self) -> Option<&ParticipantId> {
        match &self.counterparty {
            Counterparty::Linked { participant_id } => Some(participant_id),
            Counterparty::Contact { .. } => None,
        }
    }

    pub fn group_amount(&self, group_id: &str) -> f64 {
        self.group_balances
            .iter()
            .find(|g| g.group_id == group_id)
            .map(|g| g.amount)
            .unwrap_or(0.0)
    }
}

/// One participant's cost share and actual payment for an expense.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub participant: PartyRef,
    pub cost: f64,
    pub paid: f64,
}

impl Split {
    pub fn new(participant: PartyRef, cost: f64, paid: f64) -> Self {
        Self { participant, cost, paid }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub expense_id: ExpenseId,
    pub description: String,
    pub amount: f64,
    pub payer: PartyRef,
    pub group_id: Option<GroupId>,
    pub deleted: bool,
    pub updated_at: Stamp,
    pub splits: Vec<Split>,
}

/// Input for creating or editing an expense.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewExpense {
    #[serde(default)]
    pub description: String,
    pub amount: f64,
    pub payer: PartyRef,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    pub splits: Vec<Split>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// The creator paid the counterparty.
    Paid,
    /// The creator received money from the counterparty.
    Received,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paid => "paid",
            Self::Received => "received",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "paid" => Some(Self::Paid),
            "received" => Some(Self::Received),
            _ => None,
        }
    }
}

/// A direct payment between the creator and the counterparty of one of
/// the creator's relationship records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementTransaction {
    pub settlement_id: SettlementId,
    pub amount: f64,
    pub direction: Direction,
    pub creator_id: ParticipantId,
    pub relationship_id: RelationshipId,
    pub group_id: Option<GroupId>,
    pub deleted: bool,
    pub updated_at: Stamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSettlement {
    pub amount: f64,
    pub direction: Direction,
    pub creator_id: ParticipantId,
    pub relationship_id: RelationshipId,
    #[serde(default)]
    pub group_id: Option<GroupId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub group_id: GroupId,
    pub name: String,
    pub members: Vec<ParticipantId>,
}

/// One row of a group's cached participant → net balance map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupBalanceEntry {
    pub party: PartyRef,
    pub balance: f64,
}
