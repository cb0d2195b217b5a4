//! Transaction lifecycle events
//!
//! Events are broadcast to all subscribers (SDK tiers, monitors, logs).
//! They are informational, not authoritative: the transaction store holds
//! the committed state. Delivery order matches commit order per transaction.

use crate::{AgentId, Amount, EscrowId, Payout, TransactionId, TxState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events emitted by the kernel at each committed mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransactionEvent {
    /// A transaction entered the store in INITIATED
    Created {
        tx_id: TransactionId,
        requester: AgentId,
        provider: AgentId,
        amount: Amount,
        timestamp: DateTime<Utc>,
    },

    /// A state transition was committed
    StateChanged {
        tx_id: TransactionId,
        old_state: TxState,
        new_state: TxState,
        timestamp: DateTime<Utc>,
    },

    /// Escrow was funded and linked to the transaction
    EscrowLinked {
        tx_id: TransactionId,
        escrow_id: EscrowId,
        amount: Amount,
        timestamp: DateTime<Utc>,
    },

    /// Escrowed funds were paid out (full settlement or dispute split)
    EscrowReleased {
        tx_id: TransactionId,
        escrow_id: EscrowId,
        payouts: Vec<Payout>,
        timestamp: DateTime<Utc>,
    },

    /// A dispute was raised within the window
    DisputeRaised {
        tx_id: TransactionId,
        raised_by: AgentId,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A mediator resolved a dispute
    DisputeResolved {
        tx_id: TransactionId,
        decided_by: AgentId,
        requester_amount: Amount,
        provider_amount: Amount,
        mediator_amount: Amount,
        timestamp: DateTime<Utc>,
    },
}

impl TransactionEvent {
    /// Transaction the event concerns
    pub fn tx_id(&self) -> &TransactionId {
        match self {
            Self::Created { tx_id, .. } => tx_id,
            Self::StateChanged { tx_id, .. } => tx_id,
            Self::EscrowLinked { tx_id, .. } => tx_id,
            Self::EscrowReleased { tx_id, .. } => tx_id,
            Self::DisputeRaised { tx_id, .. } => tx_id,
            Self::DisputeResolved { tx_id, .. } => tx_id,
        }
    }

    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Created { timestamp, .. } => *timestamp,
            Self::StateChanged { timestamp, .. } => *timestamp,
            Self::EscrowLinked { timestamp, .. } => *timestamp,
            Self::EscrowReleased { timestamp, .. } => *timestamp,
            Self::DisputeRaised { timestamp, .. } => *timestamp,
            Self::DisputeResolved { timestamp, .. } => *timestamp,
        }
    }

    /// New state carried by the event, if it is a state change
    pub fn new_state(&self) -> Option<TxState> {
        match self {
            Self::StateChanged { new_state, .. } => Some(*new_state),
            _ => None,
        }
    }

    /// Get a short description for logging
    pub fn summary(&self) -> String {
        match self {
            Self::Created { tx_id, amount, .. } => {
                format!("{}: created ({})", tx_id, amount)
            }
            Self::StateChanged {
                tx_id,
                old_state,
                new_state,
                ..
            } => format!("{}: {} -> {}", tx_id, old_state, new_state),
            Self::EscrowLinked {
                tx_id, amount, ..
            } => format!("{}: escrow linked ({})", tx_id, amount),
            Self::EscrowReleased {
                tx_id, payouts, ..
            } => format!("{}: escrow released ({} payouts)", tx_id, payouts.len()),
            Self::DisputeRaised { tx_id, reason, .. } => {
                format!("{}: dispute raised ({})", tx_id, reason)
            }
            Self::DisputeResolved {
                tx_id,
                requester_amount,
                provider_amount,
                mediator_amount,
                ..
            } => format!(
                "{}: resolved {}/{}/{}",
                tx_id, requester_amount, provider_amount, mediator_amount
            ),
        }
    }
}
