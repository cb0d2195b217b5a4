//! Dispute and resolution types
//!
//! A requester or provider may contest a delivered transaction within the
//! dispute window. A mediator then resolves the dispute by splitting the
//! escrowed funds; the split must conserve the escrow amount exactly.

use crate::{ActpError, AgentId, Amount, Result, TransactionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A recorded dispute against a delivered transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispute {
    /// Disputed transaction
    pub transaction_id: TransactionId,
    /// Who raised the dispute (requester or provider)
    pub raised_by: AgentId,
    /// Reason for the dispute
    pub reason: String,
    /// Opaque reference to supporting evidence
    pub evidence_ref: Option<String>,
    /// When the dispute was raised
    pub raised_at: DateTime<Utc>,
}

/// A mediator's fund split for a disputed transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionSplit {
    /// Amount returned to the requester
    pub requester_amount: Amount,
    /// Amount paid to the provider
    pub provider_amount: Amount,
    /// Amount paid to the mediator
    pub mediator_amount: Amount,
}

impl ResolutionSplit {
    pub fn new(requester_amount: Amount, provider_amount: Amount, mediator_amount: Amount) -> Self {
        Self {
            requester_amount,
            provider_amount,
            mediator_amount,
        }
    }

    /// Total of the split with overflow checking
    pub fn total(&self) -> Result<Amount> {
        Amount::checked_sum([
            &self.requester_amount,
            &self.provider_amount,
            &self.mediator_amount,
        ])
    }

    /// Validate that the split conserves the escrow amount exactly.
    /// Rejected before any fund movement.
    pub fn validate_against(&self, tx_id: &TransactionId, escrow_amount: Amount) -> Result<()> {
        let total = self.total()?;
        if total != escrow_amount {
            return Err(ActpError::ResolutionAmountMismatch {
                tx_id: tx_id.to_string(),
                resolution_sum: total.to_string(),
                escrow_amount: escrow_amount.to_string(),
            });
        }
        Ok(())
    }
}

/// A resolved dispute, kept for the audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeResolution {
    /// Transaction the resolution applies to
    pub transaction_id: TransactionId,
    /// The fund split applied
    pub split: ResolutionSplit,
    /// Mediator that decided
    pub decided_by: AgentId,
    /// Mediator reasoning
    pub reasoning: String,
    /// When the resolution was applied
    pub resolved_at: DateTime<Utc>,
}
