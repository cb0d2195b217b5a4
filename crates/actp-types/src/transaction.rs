//! Transaction and state-machine types
//!
//! A transaction walks the lifecycle
//! `INITIATED -> [QUOTED] -> COMMITTED -> [IN_PROGRESS] -> DELIVERED ->
//! {SETTLED | DISPUTED -> SETTLED}`, with cancellation possible before
//! delivery. Transitions are strictly forward; terminal states freeze the
//! record.

use crate::{ActpError, AgentId, Amount, EscrowId, Result, TransactionId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a transaction in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxState {
    /// Created, no escrow linked yet
    Initiated,
    /// Provider quoted terms (optional, advisory)
    Quoted,
    /// Escrow linked and funded
    Committed,
    /// Provider signalled work has started (optional, advisory)
    InProgress,
    /// Deliverable submitted; dispute window running
    Delivered,
    /// Requester contested the outcome within the window
    Disputed,
    /// Funds paid out (final state)
    Settled,
    /// Cancelled before delivery, escrow refunded (final state)
    Cancelled,
}

impl TxState {
    /// Position of this state in the forward ordering.
    /// `Cancelled` sits outside the forward chain and has no ordinal.
    pub fn ordinal(&self) -> Option<u8> {
        match self {
            Self::Initiated => Some(0),
            Self::Quoted => Some(1),
            Self::Committed => Some(2),
            Self::InProgress => Some(3),
            Self::Delivered => Some(4),
            Self::Disputed => Some(5),
            Self::Settled => Some(6),
            Self::Cancelled => None,
        }
    }

    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Settled | Self::Cancelled)
    }

    /// Advisory states carry no escrow or timing effect
    pub fn is_advisory(&self) -> bool {
        matches!(self, Self::Quoted | Self::InProgress)
    }

    /// Check whether a transition from `self` to `target` is legal.
    ///
    /// Forward-only: the target ordinal must strictly exceed the current
    /// ordinal. `Disputed -> Settled` is the only edge out of `Disputed`,
    /// and `Cancelled` is reachable only before delivery.
    pub fn can_transition_to(&self, target: TxState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match target {
            TxState::Cancelled => !matches!(self, Self::Delivered | Self::Disputed),
            TxState::Settled if *self == Self::Disputed => true,
            _ => match (self.ordinal(), target.ordinal()) {
                (Some(from), Some(to)) => to > from,
                _ => false,
            },
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initiated => "INITIATED",
            Self::Quoted => "QUOTED",
            Self::Committed => "COMMITTED",
            Self::InProgress => "IN_PROGRESS",
            Self::Delivered => "DELIVERED",
            Self::Disputed => "DISPUTED",
            Self::Settled => "SETTLED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

/// An ACTP transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction ID (immutable)
    pub id: TransactionId,
    /// Party paying for the service (immutable)
    pub requester: AgentId,
    /// Party delivering the service (immutable)
    pub provider: AgentId,
    /// Amount in micro-units (immutable)
    pub amount: Amount,
    /// Absolute time after which an un-escrowed transaction is invalid
    /// for progress transitions
    pub deadline: DateTime<Utc>,
    /// Duration in seconds after DELIVERED during which a dispute may be raised
    pub dispute_window_secs: i64,
    /// Current state; mutated only via the kernel
    pub state: TxState,
    /// Linked escrow, set exactly once at COMMITTED
    pub escrow_id: Option<EscrowId>,
    /// When the deliverable was submitted; anchors the dispute window
    pub delivered_at: Option<DateTime<Utc>>,
    /// Opaque delivery proof reference (e.g. content hash or attestation UID)
    pub proof_reference: Option<String>,
    /// When the transaction was created
    pub created_at: DateTime<Utc>,
    /// When the transaction was last mutated
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Dispute window as a duration
    pub fn dispute_window(&self) -> Duration {
        Duration::seconds(self.dispute_window_secs)
    }

    /// Absolute end of the dispute window, once delivered
    pub fn dispute_window_closes_at(&self) -> Option<DateTime<Utc>> {
        self.delivered_at.map(|at| at + self.dispute_window())
    }

    /// Check if the transaction is complete
    pub fn is_complete(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Parameters for creating a transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTransactionRequest {
    pub requester: AgentId,
    pub provider: AgentId,
    pub amount: Amount,
    pub deadline: DateTime<Utc>,
    /// Dispute window in seconds; must meet the kernel's policy minimum
    pub dispute_window_secs: i64,
}

impl CreateTransactionRequest {
    /// Validate creation-time invariants against the given clock reading
    /// and policy minimum.
    pub fn validate(&self, now: DateTime<Utc>, min_dispute_window_secs: i64) -> Result<()> {
        if self.amount.is_zero() {
            return Err(ActpError::InvalidAmount {
                reason: "amount must be greater than zero".to_string(),
            });
        }
        if self.deadline <= now {
            return Err(ActpError::DeadlinePassed {
                deadline: self.deadline.to_rfc3339(),
            });
        }
        if self.dispute_window_secs < min_dispute_window_secs {
            return Err(ActpError::DisputeWindowTooShort {
                window_secs: self.dispute_window_secs,
                min_secs: min_dispute_window_secs,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only_ordering() {
        assert!(TxState::Initiated.can_transition_to(TxState::Committed));
        assert!(TxState::Initiated.can_transition_to(TxState::Quoted));
        assert!(TxState::Committed.can_transition_to(TxState::Delivered));
        assert!(TxState::Committed.can_transition_to(TxState::InProgress));

        // Backward and self transitions are rejected
        assert!(!TxState::Committed.can_transition_to(TxState::Initiated));
        assert!(!TxState::Delivered.can_transition_to(TxState::Delivered));
        assert!(!TxState::Delivered.can_transition_to(TxState::Committed));
    }

    #[test]
    fn test_disputed_resolves_only_to_settled() {
        assert!(TxState::Disputed.can_transition_to(TxState::Settled));
        assert!(!TxState::Disputed.can_transition_to(TxState::Cancelled));
        assert!(!TxState::Disputed.can_transition_to(TxState::Delivered));
    }

    #[test]
    fn test_cancellation_window() {
        assert!(TxState::Initiated.can_transition_to(TxState::Cancelled));
        assert!(TxState::Quoted.can_transition_to(TxState::Cancelled));
        assert!(TxState::Committed.can_transition_to(TxState::Cancelled));
        assert!(TxState::InProgress.can_transition_to(TxState::Cancelled));
        assert!(!TxState::Delivered.can_transition_to(TxState::Cancelled));
    }

    #[test]
    fn test_terminal_states_frozen() {
        for target in [
            TxState::Initiated,
            TxState::Committed,
            TxState::Delivered,
            TxState::Settled,
            TxState::Cancelled,
        ] {
            assert!(!TxState::Settled.can_transition_to(target));
            assert!(!TxState::Cancelled.can_transition_to(target));
        }
    }

    #[test]
    fn test_create_request_validation() {
        let req = CreateTransactionRequest {
            requester: AgentId::new(),
            provider: AgentId::new(),
            amount: Amount::from_units(10),
            deadline: Utc::now() + Duration::hours(1),
            dispute_window_secs: 3600,
        };
        assert!(req.validate(Utc::now(), 3600).is_ok());

        let zero = CreateTransactionRequest {
            amount: Amount::zero(),
            ..req.clone()
        };
        assert!(matches!(
            zero.validate(Utc::now(), 3600),
            Err(ActpError::InvalidAmount { .. })
        ));

        let past = CreateTransactionRequest {
            deadline: Utc::now() - Duration::hours(1),
            ..req.clone()
        };
        assert!(matches!(
            past.validate(Utc::now(), 3600),
            Err(ActpError::DeadlinePassed { .. })
        ));

        let short = CreateTransactionRequest {
            dispute_window_secs: 120,
            ..req
        };
        assert!(matches!(
            short.validate(Utc::now(), 3600),
            Err(ActpError::DisputeWindowTooShort { .. })
        ));
    }
}
