//! ACTP Dispute Resolution - Mediator-gated escrow splits
//!
//! When a dispute is raised within the window, a mediator decides how the
//! escrowed funds split between requester, provider, and mediator. The split
//! must conserve the escrow amount exactly and is rejected before any fund
//! movement otherwise. Only registered mediators may resolve.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use actp_ledger::EscrowLedger;
use actp_types::{
    ActpError, AgentId, Clock, DisputeResolution, Escrow, Payout, ResolutionSplit, Result,
    SystemClock, Transaction,
};

/// Explicit capability set of accounts authorized to resolve disputes
pub struct MediatorSet {
    mediators: RwLock<HashSet<AgentId>>,
}

impl MediatorSet {
    pub fn new() -> Self {
        Self {
            mediators: RwLock::new(HashSet::new()),
        }
    }

    /// Grant the mediator capability to an account
    pub async fn grant(&self, mediator: &AgentId) {
        self.mediators.write().await.insert(mediator.clone());
    }

    /// Revoke the mediator capability
    pub async fn revoke(&self, mediator: &AgentId) {
        self.mediators.write().await.remove(mediator);
    }

    /// Check whether an account holds the capability
    pub async fn is_mediator(&self, account: &AgentId) -> bool {
        self.mediators.read().await.contains(account)
    }
}

impl Default for MediatorSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies a mediator's resolution split to a disputed transaction's escrow
pub struct DisputeResolver {
    ledger: EscrowLedger,
    mediators: Arc<MediatorSet>,
    clock: Arc<dyn Clock>,
}

impl DisputeResolver {
    pub fn new(ledger: EscrowLedger, mediators: Arc<MediatorSet>) -> Self {
        Self {
            ledger,
            mediators,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used for resolution timestamps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Apply `split` to the transaction's escrow.
    ///
    /// Authorization and conservation are checked before any fund movement;
    /// the underlying single-release primitive enforces that the escrow pays
    /// out exactly once.
    pub async fn resolve(
        &self,
        tx: &Transaction,
        mediator: &AgentId,
        split: ResolutionSplit,
        reasoning: impl Into<String>,
    ) -> Result<(Escrow, DisputeResolution)> {
        if !self.mediators.is_mediator(mediator).await {
            return Err(ActpError::unauthorized(format!(
                "{} does not hold the mediator capability",
                mediator
            )));
        }

        let escrow_id = tx
            .escrow_id
            .clone()
            .ok_or_else(|| ActpError::EscrowNotFound {
                escrow_id: format!("none linked to {}", tx.id),
            })?;
        let escrow = self.ledger.get(&escrow_id).await?;

        split.validate_against(&tx.id, escrow.amount)?;

        let payouts = [
            Payout::new(tx.requester.clone(), split.requester_amount),
            Payout::new(tx.provider.clone(), split.provider_amount),
            Payout::new(mediator.clone(), split.mediator_amount),
        ];
        let escrow = self.ledger.release(&escrow_id, &payouts).await?;

        let resolution = DisputeResolution {
            transaction_id: tx.id.clone(),
            split,
            decided_by: mediator.clone(),
            reasoning: reasoning.into(),
            resolved_at: self.clock.now(),
        };
        info!(tx_id = %tx.id, mediator = %mediator, "dispute resolved");
        Ok((escrow, resolution))
    }
}
