//! Escrow types for the ACTP core
//!
//! An escrow is a locked fund balance tied to exactly one transaction and
//! releasable only by the kernel. Funds never move directly between
//! counterparties.
//!
//! # Invariants
//!
//! 1. Amount is fixed at link time and equals the transaction amount
//! 2. An escrow is released or refunded exactly once
//! 3. The payouts of that single release conserve the locked amount

use crate::{AgentId, Amount, EscrowId, TransactionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A locked fund balance linked to a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escrow {
    /// Unique escrow ID, generated at link time
    pub id: EscrowId,
    /// Back-reference to the linked transaction
    pub transaction_id: TransactionId,
    /// Account the funds were debited from
    pub payer: AgentId,
    /// Locked amount, equals the transaction amount at link time (immutable)
    pub amount: Amount,
    /// True from creation until release/refund
    pub locked: bool,
    /// True after funds are paid out (full or split) - terminal
    pub released: bool,
    /// When the escrow was created
    pub created_at: DateTime<Utc>,
    /// When the funds were paid out
    pub released_at: Option<DateTime<Utc>>,
}

impl Escrow {
    /// Locked balance: the full amount until release, zero afterwards
    pub fn balance(&self) -> Amount {
        if self.locked {
            self.amount
        } else {
            Amount::zero()
        }
    }

    /// Check if the escrow can still be paid out
    pub fn can_release(&self) -> bool {
        self.locked && !self.released
    }
}

/// A single payout leg of a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    /// Receiving account
    pub to: AgentId,
    /// Amount in micro-units
    pub amount: Amount,
}

impl Payout {
    pub fn new(to: AgentId, amount: Amount) -> Self {
        Self { to, amount }
    }
}
