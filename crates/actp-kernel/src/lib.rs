//! ACTP Kernel - Transaction state machine and orchestration
//!
//! The kernel is the single authority that mutates transaction state. It
//! drives the lifecycle
//! `INITIATED -> [QUOTED] -> COMMITTED -> [IN_PROGRESS] -> DELIVERED ->
//! {SETTLED | DISPUTED -> SETTLED}` and owns the coupling between state
//! transitions and fund movement.
//!
//! # Invariants
//!
//! 1. Transitions are strictly forward; terminal states freeze the record
//! 2. State mutation and fund movement commit as one logical unit - a failed
//!    operation leaves the pre-operation state observable, never a torn one
//! 3. Mutations on the same transaction ID are linearized; the loser of a
//!    race fails with `ConcurrentModification` instead of overwriting
//! 4. Dispute-window timing is an absolute deadline evaluated lazily at
//!    `release_escrow`/`raise_dispute` call time - no background timers

pub mod events;
pub mod policy;
pub mod store;

pub use actp_types::{Clock, ManualClock, SystemClock};
pub use events::{EventBus, Subscription};
pub use policy::KernelPolicy;
pub use store::TransactionStore;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::info;

use actp_attestation::AttestationVerifier;
use actp_dispute::{DisputeResolver, MediatorSet};
use actp_ledger::EscrowLedger;
use actp_types::{
    ActpError, AgentId, Amount, AttestationUid, CreateTransactionRequest, Dispute,
    DisputeResolution, Escrow, EscrowId, Payout, ResolutionSplit, Result, Transaction,
    TransactionEvent, TransactionId, TxState,
};

/// The ACTP orchestration kernel
///
/// Every SDK tier ultimately calls through here: the basic tier wraps
/// `create_transaction` + `link_escrow` + `wait_for_state`, the advanced
/// tier calls the operations directly.
pub struct Kernel {
    store: TransactionStore,
    ledger: EscrowLedger,
    verifier: AttestationVerifier,
    resolver: DisputeResolver,
    mediators: Arc<MediatorSet>,
    policy: KernelPolicy,
    clock: Arc<dyn Clock>,
    events: EventBus,
    /// Per-transaction serialization locks; entries are dropped once the
    /// transaction reaches a terminal state
    tx_locks: DashMap<TransactionId, Arc<Mutex<()>>>,
    disputes: RwLock<HashMap<TransactionId, Dispute>>,
    resolutions: RwLock<HashMap<TransactionId, DisputeResolution>>,
}

impl Kernel {
    pub fn new(
        ledger: EscrowLedger,
        verifier: AttestationVerifier,
        mediators: Arc<MediatorSet>,
        policy: KernelPolicy,
    ) -> Self {
        let resolver = DisputeResolver::new(ledger.clone(), mediators.clone());
        Self {
            store: TransactionStore::new(),
            ledger,
            verifier,
            resolver,
            mediators,
            policy,
            clock: Arc::new(SystemClock),
            events: EventBus::default(),
            tx_locks: DashMap::new(),
            disputes: RwLock::new(HashMap::new()),
            resolutions: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the clock (deterministic tests).
    ///
    /// The ledger and resolver stamp escrow and resolution records from the
    /// same clock, so every protocol timestamp moves together.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ledger = self.ledger.clone().with_clock(clock.clone());
        self.resolver = DisputeResolver::new(self.ledger.clone(), self.mediators.clone())
            .with_clock(clock.clone());
        self.clock = clock;
        self
    }

    /// The event surface consumed by monitors and SDK tiers
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Create a transaction in `INITIATED`.
    ///
    /// Rejects a zero amount, a deadline not in the future, and a dispute
    /// window below the policy minimum.
    pub async fn create_transaction(&self, req: CreateTransactionRequest) -> Result<Transaction> {
        let now = self.clock.now();
        req.validate(now, self.policy.min_dispute_window_secs)?;

        let tx = Transaction {
            id: TransactionId::new(),
            requester: req.requester,
            provider: req.provider,
            amount: req.amount,
            deadline: req.deadline,
            dispute_window_secs: req.dispute_window_secs,
            state: TxState::Initiated,
            escrow_id: None,
            delivered_at: None,
            proof_reference: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(tx.clone()).await;
        info!(tx_id = %tx.id, amount = %tx.amount, "transaction created");

        self.events.emit(TransactionEvent::Created {
            tx_id: tx.id.clone(),
            requester: tx.requester.clone(),
            provider: tx.provider.clone(),
            amount: tx.amount,
            timestamp: now,
        });
        Ok(tx)
    }

    /// Fund and link an escrow for the transaction's amount, transitioning
    /// to `COMMITTED`.
    ///
    /// Legal only from `INITIATED`/`QUOTED`. A funding failure surfaces
    /// unchanged with no state mutation.
    pub async fn link_escrow(&self, tx_id: &TransactionId) -> Result<Escrow> {
        let _guard = self.lock_for(tx_id)?;
        let mut tx = self.store.get(tx_id).await?;

        if !matches!(tx.state, TxState::Initiated | TxState::Quoted) {
            return Err(self.invalid_state(&tx, TxState::Committed));
        }
        if let Some(escrow_id) = &tx.escrow_id {
            return Err(ActpError::EscrowAlreadyLinked {
                tx_id: tx_id.to_string(),
                escrow_id: escrow_id.to_string(),
            });
        }
        let now = self.clock.now();
        if now > tx.deadline {
            return Err(ActpError::DeadlinePassed {
                deadline: tx.deadline.to_rfc3339(),
            });
        }

        // Fund movement first; the state commit follows only on success
        let escrow = self
            .ledger
            .create_escrow(tx_id, &tx.requester, tx.amount)
            .await?;

        let old_state = tx.state;
        tx.escrow_id = Some(escrow.id.clone());
        tx.state = TxState::Committed;
        tx.updated_at = now;
        self.store.commit(tx).await;

        self.events.emit(TransactionEvent::EscrowLinked {
            tx_id: tx_id.clone(),
            escrow_id: escrow.id.clone(),
            amount: escrow.amount,
            timestamp: now,
        });
        self.emit_state_change(tx_id, old_state, TxState::Committed);
        Ok(escrow)
    }

    /// Advance the transaction to `QUOTED`, `IN_PROGRESS`, or `DELIVERED`.
    ///
    /// Other states have dedicated operations and are rejected here. A
    /// `DELIVERED` target requires a proof reference and starts the
    /// dispute-window clock from this transition's timestamp.
    pub async fn transition_state(
        &self,
        tx_id: &TransactionId,
        target: TxState,
        proof: Option<String>,
    ) -> Result<Transaction> {
        let _guard = self.lock_for(tx_id)?;
        let mut tx = self.store.get(tx_id).await?;

        if !matches!(target, TxState::Quoted | TxState::InProgress | TxState::Delivered) {
            return Err(self.invalid_state(&tx, target));
        }
        if !tx.state.can_transition_to(target) {
            return Err(self.invalid_state(&tx, target));
        }
        // Progress past INITIATED/QUOTED requires a linked escrow
        if matches!(target, TxState::InProgress | TxState::Delivered) && tx.escrow_id.is_none() {
            return Err(self.invalid_state(&tx, target));
        }

        let now = self.clock.now();
        if tx.escrow_id.is_none() && now > tx.deadline {
            return Err(ActpError::DeadlinePassed {
                deadline: tx.deadline.to_rfc3339(),
            });
        }

        if target == TxState::Delivered {
            let proof = proof.ok_or_else(|| ActpError::MissingDeliveryProof {
                tx_id: tx_id.to_string(),
            })?;
            tx.proof_reference = Some(proof);
            tx.delivered_at = Some(now);
        }

        let old_state = tx.state;
        tx.state = target;
        tx.updated_at = now;
        self.store.commit(tx.clone()).await;

        self.emit_state_change(tx_id, old_state, target);
        Ok(tx)
    }

    /// Contest a delivered transaction within its dispute window.
    ///
    /// Only the requester or provider may raise; afterwards the transaction
    /// is `DISPUTED` and only a mediator resolution can settle it.
    pub async fn raise_dispute(
        &self,
        tx_id: &TransactionId,
        raised_by: &AgentId,
        reason: impl Into<String>,
        evidence_ref: Option<String>,
    ) -> Result<Dispute> {
        let _guard = self.lock_for(tx_id)?;
        let mut tx = self.store.get(tx_id).await?;

        if tx.state != TxState::Delivered {
            return Err(self.invalid_state(&tx, TxState::Disputed));
        }
        if raised_by != &tx.requester && raised_by != &tx.provider {
            return Err(ActpError::unauthorized(format!(
                "{} is not a party to {}",
                raised_by, tx_id
            )));
        }

        let now = self.clock.now();
        let closes_at = tx
            .dispute_window_closes_at()
            .ok_or_else(|| self.invalid_state(&tx, TxState::Disputed))?;
        if now >= closes_at {
            return Err(ActpError::DisputeWindowExpired {
                tx_id: tx_id.to_string(),
                closed_at: closes_at.to_rfc3339(),
            });
        }

        let dispute = Dispute {
            transaction_id: tx_id.clone(),
            raised_by: raised_by.clone(),
            reason: reason.into(),
            evidence_ref,
            raised_at: now,
        };
        self.disputes
            .write()
            .await
            .insert(tx_id.clone(), dispute.clone());

        let old_state = tx.state;
        tx.state = TxState::Disputed;
        tx.updated_at = now;
        self.store.commit(tx).await;

        self.events.emit(TransactionEvent::DisputeRaised {
            tx_id: tx_id.clone(),
            raised_by: raised_by.clone(),
            reason: dispute.reason.clone(),
            timestamp: now,
        });
        self.emit_state_change(tx_id, old_state, TxState::Disputed);
        Ok(dispute)
    }

    /// Apply a mediator's fund split to a disputed transaction and settle it.
    ///
    /// Restricted to accounts holding the mediator capability; a split that
    /// does not conserve the escrow amount is rejected before any movement.
    pub async fn resolve_dispute(
        &self,
        tx_id: &TransactionId,
        mediator: &AgentId,
        split: ResolutionSplit,
        reasoning: impl Into<String>,
    ) -> Result<DisputeResolution> {
        let _guard = self.lock_for(tx_id)?;
        let mut tx = self.store.get(tx_id).await?;

        if tx.state != TxState::Disputed {
            return Err(self.invalid_state(&tx, TxState::Settled));
        }

        let (escrow, resolution) = self.resolver.resolve(&tx, mediator, split, reasoning).await?;

        let now = self.clock.now();
        let old_state = tx.state;
        tx.state = TxState::Settled;
        tx.updated_at = now;
        self.store.commit(tx.clone()).await;
        self.resolutions
            .write()
            .await
            .insert(tx_id.clone(), resolution.clone());

        self.events.emit(TransactionEvent::EscrowReleased {
            tx_id: tx_id.clone(),
            escrow_id: escrow.id,
            payouts: vec![
                Payout::new(tx.requester.clone(), split.requester_amount),
                Payout::new(tx.provider.clone(), split.provider_amount),
                Payout::new(mediator.clone(), split.mediator_amount),
            ],
            timestamp: now,
        });
        self.events.emit(TransactionEvent::DisputeResolved {
            tx_id: tx_id.clone(),
            decided_by: mediator.clone(),
            requester_amount: split.requester_amount,
            provider_amount: split.provider_amount,
            mediator_amount: split.mediator_amount,
            timestamp: now,
        });
        self.emit_state_change(tx_id, old_state, TxState::Settled);
        self.tx_locks.remove(tx_id);
        Ok(resolution)
    }

    /// Pay the full escrow to the provider once the dispute window has
    /// elapsed with no dispute, transitioning to `SETTLED`.
    ///
    /// When policy requires attestation, verification must pass first;
    /// verification failure aborts with no fund movement. A release before
    /// the window closes fails with `DisputeWindowActive`.
    pub async fn release_escrow(
        &self,
        tx_id: &TransactionId,
        attestation_uid: Option<&AttestationUid>,
    ) -> Result<Escrow> {
        let _guard = self.lock_for(tx_id)?;
        let mut tx = self.store.get(tx_id).await?;

        if tx.state != TxState::Delivered {
            return Err(self.invalid_state(&tx, TxState::Settled));
        }

        let now = self.clock.now();
        let closes_at = tx
            .dispute_window_closes_at()
            .ok_or_else(|| self.invalid_state(&tx, TxState::Settled))?;
        if now < closes_at {
            return Err(ActpError::DisputeWindowActive {
                tx_id: tx_id.to_string(),
                open_until: closes_at.to_rfc3339(),
            });
        }

        match attestation_uid {
            Some(uid) => self.verifier.verify(&tx, uid).await?,
            None if self.policy.require_attestation => {
                return Err(ActpError::AttestationRequired {
                    tx_id: tx_id.to_string(),
                });
            }
            None => {}
        }

        let escrow_id = tx
            .escrow_id
            .clone()
            .ok_or_else(|| ActpError::EscrowNotFound {
                escrow_id: format!("none linked to {}", tx_id),
            })?;
        let payouts = vec![Payout::new(tx.provider.clone(), tx.amount)];
        let escrow = self.ledger.release(&escrow_id, &payouts).await?;

        let old_state = tx.state;
        tx.state = TxState::Settled;
        tx.updated_at = now;
        self.store.commit(tx).await;
        info!(tx_id = %tx_id, escrow_id = %escrow_id, "escrow released to provider");

        self.events.emit(TransactionEvent::EscrowReleased {
            tx_id: tx_id.clone(),
            escrow_id,
            payouts,
            timestamp: now,
        });
        self.emit_state_change(tx_id, old_state, TxState::Settled);
        self.tx_locks.remove(tx_id);
        Ok(escrow)
    }

    /// Cancel a transaction before delivery, refunding any locked escrow.
    pub async fn cancel_transaction(&self, tx_id: &TransactionId) -> Result<Transaction> {
        let _guard = self.lock_for(tx_id)?;
        let mut tx = self.store.get(tx_id).await?;

        if !tx.state.can_transition_to(TxState::Cancelled) {
            return Err(self.invalid_state(&tx, TxState::Cancelled));
        }

        let now = self.clock.now();
        if let Some(escrow_id) = &tx.escrow_id {
            let escrow = self.ledger.refund(escrow_id).await?;
            self.events.emit(TransactionEvent::EscrowReleased {
                tx_id: tx_id.clone(),
                escrow_id: escrow.id,
                payouts: vec![Payout::new(tx.requester.clone(), tx.amount)],
                timestamp: now,
            });
        }

        let old_state = tx.state;
        tx.state = TxState::Cancelled;
        tx.updated_at = now;
        self.store.commit(tx.clone()).await;
        info!(tx_id = %tx_id, "transaction cancelled");

        self.emit_state_change(tx_id, old_state, TxState::Cancelled);
        self.tx_locks.remove(tx_id);
        Ok(tx)
    }

    // ========================================================================
    // Reads & observation
    // ========================================================================

    /// Snapshot of a transaction (lock-free against committed state)
    pub async fn get_transaction(&self, tx_id: &TransactionId) -> Result<Transaction> {
        self.store.get(tx_id).await
    }

    /// Snapshot of an escrow record
    pub async fn get_escrow(&self, escrow_id: &EscrowId) -> Result<Escrow> {
        self.ledger.get(escrow_id).await
    }

    /// Locked balance of an escrow
    pub async fn escrow_balance(&self, escrow_id: &EscrowId) -> Result<Amount> {
        self.ledger.balance(escrow_id).await
    }

    /// The recorded dispute for a transaction, if any
    pub async fn get_dispute(&self, tx_id: &TransactionId) -> Option<Dispute> {
        self.disputes.read().await.get(tx_id).cloned()
    }

    /// The recorded resolution for a transaction, if any
    pub async fn get_resolution(&self, tx_id: &TransactionId) -> Option<DisputeResolution> {
        self.resolutions.read().await.get(tx_id).cloned()
    }

    /// Wait until the transaction reaches `target`, or `timeout` elapses.
    ///
    /// Pure observation with a caller-supplied deadline: resolves immediately
    /// if the committed state already is `target`, and never mutates the
    /// transaction. Times out with `WaitTimeout`.
    pub async fn wait_for_state(
        &self,
        tx_id: &TransactionId,
        target: TxState,
        timeout: std::time::Duration,
    ) -> Result<TxState> {
        let mut rx = self.events.subscribe();

        // Subscribe first, then snapshot: a transition committed in between
        // is seen on one side or the other.
        if self.store.get(tx_id).await?.state == target {
            return Ok(target);
        }

        let timeout_err = || ActpError::WaitTimeout {
            tx_id: tx_id.to_string(),
            target: target.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(timeout_err());
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(event)) => {
                    if event.tx_id() == tx_id && event.new_state() == Some(target) {
                        return Ok(target);
                    }
                }
                // Lagged receiver: fall back to the committed snapshot
                Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => {
                    if self.store.get(tx_id).await?.state == target {
                        return Ok(target);
                    }
                }
                Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => {
                    return Err(timeout_err());
                }
                Err(_) => return Err(timeout_err()),
            }
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Acquire the per-transaction serialization lock without waiting.
    /// A held lock means another mutation is mid-flight; the caller loses
    /// the race explicitly.
    fn lock_for(&self, tx_id: &TransactionId) -> Result<OwnedMutexGuard<()>> {
        let lock = self
            .tx_locks
            .entry(tx_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.try_lock_owned()
            .map_err(|_| ActpError::ConcurrentModification {
                tx_id: tx_id.to_string(),
            })
    }

    fn invalid_state(&self, tx: &Transaction, target: TxState) -> ActpError {
        ActpError::InvalidState {
            tx_id: tx.id.to_string(),
            from: tx.state.to_string(),
            to: target.to_string(),
        }
    }

    fn emit_state_change(&self, tx_id: &TransactionId, old_state: TxState, new_state: TxState) {
        self.events.emit(TransactionEvent::StateChanged {
            tx_id: tx_id.clone(),
            old_state,
            new_state,
            timestamp: self.clock.now(),
        });
    }
}

/// Convenience constructor wiring the kernel with in-memory collaborators.
///
/// Returns the kernel plus handles to the funding source, attestation
/// registry, and mediator set so callers can seed balances, submit
/// attestations, and grant capabilities.
pub fn build_in_memory(
    policy: KernelPolicy,
) -> (
    Arc<Kernel>,
    Arc<actp_ledger::InMemoryFundingSource>,
    Arc<actp_attestation::AttestationRegistry>,
    Arc<MediatorSet>,
) {
    let (ledger, funding) = EscrowLedger::in_memory();
    let registry = Arc::new(actp_attestation::AttestationRegistry::new());
    let consumed: Arc<dyn actp_attestation::ConsumedUidStore> =
        Arc::new(actp_attestation::InMemoryConsumedStore::new());
    let verifier = AttestationVerifier::new(registry.clone(), consumed);
    let mediators = Arc::new(MediatorSet::new());
    let kernel = Arc::new(Kernel::new(ledger, verifier, mediators.clone(), policy));
    (kernel, funding, registry, mediators)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actp_ledger::FundingSource;
    use actp_types::{Attestation, DeliveryProof, ProofMetadata};
    use chrono::{Duration, Utc};

    const WINDOW: i64 = 120;

    struct Harness {
        kernel: Arc<Kernel>,
        funding: Arc<actp_ledger::InMemoryFundingSource>,
        registry: Arc<actp_attestation::AttestationRegistry>,
        mediators: Arc<MediatorSet>,
        clock: Arc<ManualClock>,
        requester: AgentId,
        provider: AgentId,
    }

    async fn harness(policy: KernelPolicy) -> Harness {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (ledger, funding) = EscrowLedger::in_memory();
        let registry = Arc::new(actp_attestation::AttestationRegistry::new());
        let consumed: Arc<dyn actp_attestation::ConsumedUidStore> =
            Arc::new(actp_attestation::InMemoryConsumedStore::new());
        let verifier = AttestationVerifier::new(registry.clone(), consumed);
        let mediators = Arc::new(MediatorSet::new());
        let kernel = Arc::new(
            Kernel::new(ledger, verifier, mediators.clone(), policy)
                .with_clock(clock.clone()),
        );

        let requester = AgentId::new();
        let provider = AgentId::new();
        funding
            .fund_account(&requester, Amount::from_units(100))
            .await;

        Harness {
            kernel,
            funding,
            registry,
            mediators,
            clock,
            requester,
            provider,
        }
    }

    impl Harness {
        fn create_request(&self) -> CreateTransactionRequest {
            CreateTransactionRequest {
                requester: self.requester.clone(),
                provider: self.provider.clone(),
                amount: Amount::from_units(10),
                deadline: self.clock.now() + Duration::hours(1),
                dispute_window_secs: WINDOW,
            }
        }

        async fn delivered_tx(&self) -> Transaction {
            let tx = self
                .kernel
                .create_transaction(self.create_request())
                .await
                .unwrap();
            self.kernel.link_escrow(&tx.id).await.unwrap();
            self.kernel
                .transition_state(&tx.id, TxState::Delivered, Some("proofhash".to_string()))
                .await
                .unwrap()
        }
    }

    fn permissive() -> KernelPolicy {
        KernelPolicy::permissive().with_min_dispute_window(WINDOW)
    }

    // Scenario A: create -> linkEscrow -> COMMITTED with locked escrow
    #[tokio::test]
    async fn test_link_escrow_commits_and_locks() {
        let h = harness(permissive()).await;
        let tx = h
            .kernel
            .create_transaction(h.create_request())
            .await
            .unwrap();
        assert_eq!(tx.state, TxState::Initiated);

        let escrow = h.kernel.link_escrow(&tx.id).await.unwrap();
        assert!(escrow.locked);
        assert_eq!(escrow.amount, Amount::from_micro(10_000_000));

        let tx = h.kernel.get_transaction(&tx.id).await.unwrap();
        assert_eq!(tx.state, TxState::Committed);
        assert_eq!(tx.escrow_id, Some(escrow.id));
        assert_eq!(h.funding.balance(&h.requester).await, Amount::from_units(90));
    }

    #[tokio::test]
    async fn test_create_validation() {
        let h = harness(KernelPolicy::default()).await;

        let mut req = h.create_request();
        req.dispute_window_secs = 120; // below the 3600s default minimum
        assert!(matches!(
            h.kernel.create_transaction(req).await,
            Err(ActpError::DisputeWindowTooShort { .. })
        ));

        let mut req = h.create_request();
        req.amount = Amount::zero();
        assert!(matches!(
            h.kernel.create_transaction(req).await,
            Err(ActpError::InvalidAmount { .. })
        ));

        let mut req = h.create_request();
        req.deadline = h.clock.now() - Duration::hours(1);
        assert!(matches!(
            h.kernel.create_transaction(req).await,
            Err(ActpError::DeadlinePassed { .. })
        ));
    }

    #[tokio::test]
    async fn test_link_escrow_funding_failure_leaves_state() {
        let h = harness(permissive()).await;
        let mut req = h.create_request();
        req.amount = Amount::from_units(500); // more than funded
        let tx = h.kernel.create_transaction(req).await.unwrap();

        let result = h.kernel.link_escrow(&tx.id).await;
        assert!(matches!(result, Err(ActpError::InsufficientFunds { .. })));

        let tx = h.kernel.get_transaction(&tx.id).await.unwrap();
        assert_eq!(tx.state, TxState::Initiated);
        assert!(tx.escrow_id.is_none());
    }

    #[tokio::test]
    async fn test_forward_only_transitions() {
        let h = harness(permissive()).await;
        let tx = h.delivered_tx().await;

        // Backward transition attempts fail and leave state unchanged
        for target in [TxState::Quoted, TxState::InProgress] {
            let result = h.kernel.transition_state(&tx.id, target, None).await;
            assert!(matches!(result, Err(ActpError::InvalidState { .. })));
        }
        assert_eq!(
            h.kernel.get_transaction(&tx.id).await.unwrap().state,
            TxState::Delivered
        );
    }

    #[tokio::test]
    async fn test_advisory_states_are_optional() {
        let h = harness(permissive()).await;
        let tx = h
            .kernel
            .create_transaction(h.create_request())
            .await
            .unwrap();

        h.kernel
            .transition_state(&tx.id, TxState::Quoted, None)
            .await
            .unwrap();
        h.kernel.link_escrow(&tx.id).await.unwrap();
        h.kernel
            .transition_state(&tx.id, TxState::InProgress, None)
            .await
            .unwrap();
        let tx = h
            .kernel
            .transition_state(&tx.id, TxState::Delivered, Some("p".to_string()))
            .await
            .unwrap();
        assert_eq!(tx.state, TxState::Delivered);
    }

    #[tokio::test]
    async fn test_delivery_requires_proof_and_escrow() {
        let h = harness(permissive()).await;
        let tx = h
            .kernel
            .create_transaction(h.create_request())
            .await
            .unwrap();

        // No escrow linked yet
        let result = h
            .kernel
            .transition_state(&tx.id, TxState::Delivered, Some("p".to_string()))
            .await;
        assert!(matches!(result, Err(ActpError::InvalidState { .. })));

        h.kernel.link_escrow(&tx.id).await.unwrap();
        let result = h
            .kernel
            .transition_state(&tx.id, TxState::Delivered, None)
            .await;
        assert!(matches!(result, Err(ActpError::MissingDeliveryProof { .. })));
    }

    // Scenario B: release blocked at t=60, allowed at t=121
    #[tokio::test]
    async fn test_dispute_window_gates_release() {
        let h = harness(permissive()).await;
        let tx = h.delivered_tx().await;

        h.clock.advance(Duration::seconds(60));
        let result = h.kernel.release_escrow(&tx.id, None).await;
        assert!(matches!(result, Err(ActpError::DisputeWindowActive { .. })));
        assert_eq!(
            h.kernel.get_transaction(&tx.id).await.unwrap().state,
            TxState::Delivered
        );

        h.clock.advance(Duration::seconds(61)); // t = 121
        let escrow = h.kernel.release_escrow(&tx.id, None).await.unwrap();
        assert!(escrow.released);

        let tx = h.kernel.get_transaction(&tx.id).await.unwrap();
        assert_eq!(tx.state, TxState::Settled);
        assert_eq!(h.funding.balance(&h.provider).await, Amount::from_units(10));
    }

    #[tokio::test]
    async fn test_dispute_window_boundary() {
        // raise at T+W-1 succeeds; a fresh tx raised at T+W+1 fails
        let h = harness(permissive()).await;
        let tx = h.delivered_tx().await;

        h.clock.advance(Duration::seconds(WINDOW - 1));
        h.kernel
            .raise_dispute(&tx.id, &h.requester, "late check", None)
            .await
            .unwrap();

        let tx2 = h.delivered_tx().await;
        h.clock.advance(Duration::seconds(WINDOW + 1));
        let result = h
            .kernel
            .raise_dispute(&tx2.id, &h.requester, "too late", None)
            .await;
        assert!(matches!(result, Err(ActpError::DisputeWindowExpired { .. })));
        assert_eq!(
            h.kernel.get_transaction(&tx2.id).await.unwrap().state,
            TxState::Delivered
        );
    }

    #[tokio::test]
    async fn test_dispute_only_by_party() {
        let h = harness(permissive()).await;
        let tx = h.delivered_tx().await;

        let result = h
            .kernel
            .raise_dispute(&tx.id, &AgentId::new(), "outsider", None)
            .await;
        assert!(matches!(result, Err(ActpError::Unauthorized { .. })));
    }

    // Scenario C: dispute -> mediator split -> SETTLED
    #[tokio::test]
    async fn test_dispute_resolution_splits_funds() {
        let h = harness(permissive()).await;
        let tx = h.delivered_tx().await;

        h.clock.advance(Duration::seconds(60));
        h.kernel
            .raise_dispute(&tx.id, &h.requester, "partial delivery", Some("ipfs://ev".to_string()))
            .await
            .unwrap();
        assert_eq!(
            h.kernel.get_transaction(&tx.id).await.unwrap().state,
            TxState::Disputed
        );

        let mediator = AgentId::new();
        h.mediators.grant(&mediator).await;

        // Wrong sum is rejected with the escrow still locked
        let bad = ResolutionSplit::new(
            Amount::from_units(4),
            Amount::from_units(5),
            Amount::zero(),
        );
        let result = h
            .kernel
            .resolve_dispute(&tx.id, &mediator, bad, "bad math")
            .await;
        assert!(matches!(
            result,
            Err(ActpError::ResolutionAmountMismatch { .. })
        ));
        let escrow_id = h
            .kernel
            .get_transaction(&tx.id)
            .await
            .unwrap()
            .escrow_id
            .unwrap();
        assert_eq!(
            h.kernel.escrow_balance(&escrow_id).await.unwrap(),
            Amount::from_units(10)
        );

        let split = ResolutionSplit::new(
            Amount::from_micro(4_000_000),
            Amount::from_micro(6_000_000),
            Amount::zero(),
        );
        let resolution = h
            .kernel
            .resolve_dispute(&tx.id, &mediator, split, "split 40/60")
            .await
            .unwrap();
        assert_eq!(resolution.decided_by, mediator);

        let tx = h.kernel.get_transaction(&tx.id).await.unwrap();
        assert_eq!(tx.state, TxState::Settled);
        assert_eq!(h.funding.balance(&h.requester).await, Amount::from_units(94));
        assert_eq!(h.funding.balance(&h.provider).await, Amount::from_units(6));
        assert!(h.kernel.get_resolution(&tx.id).await.is_some());
    }

    #[tokio::test]
    async fn test_release_after_dispute_fails() {
        let h = harness(permissive()).await;
        let tx = h.delivered_tx().await;

        h.kernel
            .raise_dispute(&tx.id, &h.requester, "contested", None)
            .await
            .unwrap();

        h.clock.advance(Duration::seconds(WINDOW + 10));
        let result = h.kernel.release_escrow(&tx.id, None).await;
        assert!(matches!(result, Err(ActpError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_attestation_gated_release() {
        let h = harness(permissive().with_required_attestation()).await;

        let proof = DeliveryProof::from_content(
            TransactionId::new(),
            b"deliverable",
            ProofMetadata::default(),
        );
        let tx = h
            .kernel
            .create_transaction(h.create_request())
            .await
            .unwrap();
        h.kernel.link_escrow(&tx.id).await.unwrap();
        h.kernel
            .transition_state(&tx.id, TxState::Delivered, Some(proof.content_hash.clone()))
            .await
            .unwrap();
        h.clock.advance(Duration::seconds(WINDOW + 1));

        // Policy requires an attestation
        let result = h.kernel.release_escrow(&tx.id, None).await;
        assert!(matches!(result, Err(ActpError::AttestationRequired { .. })));

        let uid = h
            .registry
            .submit(Attestation::for_delivery(
                h.provider.clone(),
                h.requester.clone(),
                &proof,
            ))
            .await;
        let escrow = h.kernel.release_escrow(&tx.id, Some(&uid)).await.unwrap();
        assert!(escrow.released);
    }

    #[tokio::test]
    async fn test_replayed_attestation_rejected() {
        let h = harness(permissive().with_required_attestation()).await;
        let proof = DeliveryProof::from_content(
            TransactionId::new(),
            b"deliverable",
            ProofMetadata::default(),
        );
        let uid = h
            .registry
            .submit(Attestation::for_delivery(
                h.provider.clone(),
                h.requester.clone(),
                &proof,
            ))
            .await;

        let mut settled = Vec::new();
        for _ in 0..2 {
            let tx = h
                .kernel
                .create_transaction(h.create_request())
                .await
                .unwrap();
            h.kernel.link_escrow(&tx.id).await.unwrap();
            h.kernel
                .transition_state(&tx.id, TxState::Delivered, Some(proof.content_hash.clone()))
                .await
                .unwrap();
            settled.push(tx.id);
        }
        h.clock.advance(Duration::seconds(WINDOW + 1));

        h.kernel
            .release_escrow(&settled[0], Some(&uid))
            .await
            .unwrap();

        // Same UID on a second transaction: replay, no fund movement
        let result = h.kernel.release_escrow(&settled[1], Some(&uid)).await;
        assert!(matches!(result, Err(ActpError::ReplayedAttestation { .. })));
        let tx = h.kernel.get_transaction(&settled[1]).await.unwrap();
        assert_eq!(tx.state, TxState::Delivered);
        assert_eq!(
            h.kernel.escrow_balance(&tx.escrow_id.unwrap()).await.unwrap(),
            Amount::from_units(10)
        );
    }

    #[tokio::test]
    async fn test_double_release_fails() {
        let h = harness(permissive()).await;
        let tx = h.delivered_tx().await;
        h.clock.advance(Duration::seconds(WINDOW + 1));

        h.kernel.release_escrow(&tx.id, None).await.unwrap();
        let result = h.kernel.release_escrow(&tx.id, None).await;
        assert!(matches!(result, Err(ActpError::InvalidState { .. })));
        assert_eq!(h.funding.balance(&h.provider).await, Amount::from_units(10));
    }

    #[tokio::test]
    async fn test_cancel_refunds_escrow() {
        let h = harness(permissive()).await;
        let tx = h
            .kernel
            .create_transaction(h.create_request())
            .await
            .unwrap();
        h.kernel.link_escrow(&tx.id).await.unwrap();
        assert_eq!(h.funding.balance(&h.requester).await, Amount::from_units(90));

        let tx = h.kernel.cancel_transaction(&tx.id).await.unwrap();
        assert_eq!(tx.state, TxState::Cancelled);
        assert_eq!(h.funding.balance(&h.requester).await, Amount::from_units(100));

        // Terminal: nothing further is permitted
        let result = h.kernel.link_escrow(&tx.id).await;
        assert!(matches!(result, Err(ActpError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_cancel_after_delivery_rejected() {
        let h = harness(permissive()).await;
        let tx = h.delivered_tx().await;

        let result = h.kernel.cancel_transaction(&tx.id).await;
        assert!(matches!(result, Err(ActpError::InvalidState { .. })));
    }

    // Scenario D: concurrent mutations on one transaction
    #[tokio::test]
    async fn test_concurrent_transitions_serialize() {
        let h = harness(permissive()).await;
        let tx = h
            .kernel
            .create_transaction(h.create_request())
            .await
            .unwrap();
        h.kernel.link_escrow(&tx.id).await.unwrap();

        let (a, b) = tokio::join!(
            h.kernel
                .transition_state(&tx.id, TxState::InProgress, None),
            h.kernel
                .transition_state(&tx.id, TxState::Delivered, Some("p".to_string())),
        );

        let successes = [a.is_ok(), b.is_ok()].iter().filter(|s| **s).count();
        assert!(successes >= 1);
        for result in [a, b] {
            if let Err(err) = result {
                assert!(matches!(
                    err,
                    ActpError::ConcurrentModification { .. } | ActpError::InvalidState { .. }
                ));
            }
        }

        // Committed state is one of the two targets, never a torn mix
        let state = h.kernel.get_transaction(&tx.id).await.unwrap().state;
        assert!(matches!(state, TxState::InProgress | TxState::Delivered));
    }

    #[tokio::test]
    async fn test_terminal_transactions_free_their_locks() {
        let h = harness(permissive()).await;

        let tx = h.delivered_tx().await;
        assert!(h.kernel.tx_locks.contains_key(&tx.id));
        h.clock.advance(Duration::seconds(WINDOW + 1));
        h.kernel.release_escrow(&tx.id, None).await.unwrap();
        assert!(!h.kernel.tx_locks.contains_key(&tx.id));

        let tx2 = h
            .kernel
            .create_transaction(h.create_request())
            .await
            .unwrap();
        h.kernel.link_escrow(&tx2.id).await.unwrap();
        h.kernel.cancel_transaction(&tx2.id).await.unwrap();
        assert!(!h.kernel.tx_locks.contains_key(&tx2.id));

        // A late call on a settled transaction still fails cleanly
        let result = h.kernel.cancel_transaction(&tx.id).await;
        assert!(matches!(result, Err(ActpError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_wait_for_state_observes_transition() {
        let h = harness(permissive()).await;
        let tx = h
            .kernel
            .create_transaction(h.create_request())
            .await
            .unwrap();

        let kernel = h.kernel.clone();
        let tx_id = tx.id.clone();
        let waiter = tokio::spawn(async move {
            kernel
                .wait_for_state(&tx_id, TxState::Committed, std::time::Duration::from_secs(5))
                .await
        });

        h.kernel.link_escrow(&tx.id).await.unwrap();
        let observed = waiter.await.unwrap().unwrap();
        assert_eq!(observed, TxState::Committed);
    }

    #[tokio::test]
    async fn test_wait_for_state_times_out() {
        let h = harness(permissive()).await;
        let tx = h
            .kernel
            .create_transaction(h.create_request())
            .await
            .unwrap();

        let result = h
            .kernel
            .wait_for_state(
                &tx.id,
                TxState::Settled,
                std::time::Duration::from_millis(50),
            )
            .await;
        assert!(matches!(result, Err(ActpError::WaitTimeout { .. })));

        // Observation never mutates
        assert_eq!(
            h.kernel.get_transaction(&tx.id).await.unwrap().state,
            TxState::Initiated
        );
    }

    #[tokio::test]
    async fn test_state_change_events_match_commit_order() {
        let h = harness(permissive()).await;
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _sub = h.kernel.events().on_state_changed(move |_, _, new_state| {
            seen2.lock().unwrap().push(new_state);
        });

        let tx = h.delivered_tx().await;
        h.clock.advance(Duration::seconds(WINDOW + 1));
        h.kernel.release_escrow(&tx.id, None).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![TxState::Committed, TxState::Delivered, TxState::Settled]
        );
    }
}
