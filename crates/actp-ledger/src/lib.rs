//! ACTP Escrow Ledger - Locked-until-release fund balances
//!
//! The ledger holds one record per escrow, linked to exactly one transaction.
//! Funds are debited from a funding source at lock time and credited back out
//! in a single release. Full settlement (one payout to the provider) and
//! dispute splits (up to three payouts) use the same release primitive.
//!
//! # Invariants
//!
//! 1. No negative balances in the funding source
//! 2. An escrow is released exactly once
//! 3. The payouts of that single release sum to the locked amount exactly
//! 4. A failed release leaves the escrow and all balances unchanged

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use actp_types::{
    ActpError, AgentId, Amount, Clock, Escrow, EscrowId, Payout, Result, SystemClock,
    TransactionId,
};

/// Abstraction over the token balance + allowance source that funds escrows.
///
/// In production this sits in front of an on-chain token contract; the core
/// only requires that a debit or a credit batch either fully succeeds or
/// fully fails.
#[async_trait::async_trait]
pub trait FundingSource: Send + Sync {
    /// Remove `amount` from `account`, checking allowance then balance
    async fn debit(&self, account: &AgentId, amount: Amount) -> Result<()>;

    /// Apply every payout leg, atomically: either all legs land or no
    /// balance changes at all
    async fn credit_all(&self, payouts: &[Payout]) -> Result<()>;

    /// Current spendable balance of `account`
    async fn balance(&self, account: &AgentId) -> Amount;
}

/// In-memory funding source with token-style allowance semantics
pub struct InMemoryFundingSource {
    accounts: RwLock<HashMap<AgentId, AccountFunds>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct AccountFunds {
    balance: Amount,
    /// Amount the account has approved the ledger to spend
    allowance: Amount,
}

impl InMemoryFundingSource {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
        }
    }

    /// Seed an account with a balance and a matching allowance
    pub async fn fund_account(&self, account: &AgentId, amount: Amount) {
        let mut accounts = self.accounts.write().await;
        let funds = accounts.entry(account.clone()).or_default();
        funds.balance = funds.balance.checked_add(amount).unwrap_or(funds.balance);
        funds.allowance = funds.allowance.checked_add(amount).unwrap_or(funds.allowance);
    }

    /// Set the spend allowance for an account without changing its balance
    pub async fn set_allowance(&self, account: &AgentId, amount: Amount) {
        let mut accounts = self.accounts.write().await;
        accounts.entry(account.clone()).or_default().allowance = amount;
    }
}

impl Default for InMemoryFundingSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl FundingSource for InMemoryFundingSource {
    async fn debit(&self, account: &AgentId, amount: Amount) -> Result<()> {
        let mut accounts = self.accounts.write().await;
        let funds = accounts.entry(account.clone()).or_default();

        if funds.allowance < amount {
            return Err(ActpError::InsufficientFunds {
                account: account.to_string(),
                fund_source: "allowance".to_string(),
                requested: amount.to_string(),
                available: funds.allowance.to_string(),
            });
        }
        if funds.balance < amount {
            return Err(ActpError::InsufficientFunds {
                account: account.to_string(),
                fund_source: "balance".to_string(),
                requested: amount.to_string(),
                available: funds.balance.to_string(),
            });
        }

        funds.balance = funds.balance.checked_sub(amount)?;
        funds.allowance = funds.allowance.checked_sub(amount)?;
        Ok(())
    }

    async fn credit_all(&self, payouts: &[Payout]) -> Result<()> {
        let mut accounts = self.accounts.write().await;

        // Stage every resulting balance before touching any account, so an
        // overflowing leg rejects the whole batch
        let mut staged: HashMap<AgentId, Amount> = HashMap::new();
        for payout in payouts {
            let current = match staged.get(&payout.to) {
                Some(balance) => *balance,
                None => accounts
                    .get(&payout.to)
                    .map(|f| f.balance)
                    .unwrap_or_default(),
            };
            staged.insert(payout.to.clone(), current.checked_add(payout.amount)?);
        }
        for (account, balance) in staged {
            accounts.entry(account).or_default().balance = balance;
        }
        Ok(())
    }

    async fn balance(&self, account: &AgentId) -> Amount {
        let accounts = self.accounts.read().await;
        accounts.get(account).map(|f| f.balance).unwrap_or_default()
    }
}

/// The ACTP escrow ledger
///
/// Thread-safe and designed for concurrent access; the kernel serializes
/// per-transaction mutations above this layer.
#[derive(Clone)]
pub struct EscrowLedger {
    escrows: Arc<RwLock<HashMap<EscrowId, Escrow>>>,
    funding: Arc<dyn FundingSource>,
    clock: Arc<dyn Clock>,
}

impl EscrowLedger {
    /// Create a ledger backed by the given funding source
    pub fn new(funding: Arc<dyn FundingSource>) -> Self {
        Self {
            escrows: Arc::new(RwLock::new(HashMap::new())),
            funding,
            clock: Arc::new(SystemClock),
        }
    }

    /// Create a ledger with a fresh in-memory funding source
    pub fn in_memory() -> (Self, Arc<InMemoryFundingSource>) {
        let funding = Arc::new(InMemoryFundingSource::new());
        (Self::new(funding.clone()), funding)
    }

    /// Replace the clock used for escrow timestamps (deterministic tests).
    /// Escrow state stays shared with the original handle.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Lock `amount` from `payer` into a new escrow for `transaction_id`.
    ///
    /// The debit and the record insertion commit together: a funding failure
    /// surfaces unchanged and no record is created.
    pub async fn create_escrow(
        &self,
        transaction_id: &TransactionId,
        payer: &AgentId,
        amount: Amount,
    ) -> Result<Escrow> {
        self.funding.debit(payer, amount).await?;

        let escrow = Escrow {
            id: EscrowId::new(),
            transaction_id: transaction_id.clone(),
            payer: payer.clone(),
            amount,
            locked: true,
            released: false,
            created_at: self.clock.now(),
            released_at: None,
        };

        let mut escrows = self.escrows.write().await;
        escrows.insert(escrow.id.clone(), escrow.clone());
        info!(escrow_id = %escrow.id, tx_id = %transaction_id, %amount, "escrow locked");
        Ok(escrow)
    }

    /// Pay out the full locked amount across `payouts`, exactly once.
    ///
    /// Validates conservation (`sum(payouts) == escrow.amount`) and single
    /// release before any fund movement; zero-amount payouts are skipped.
    pub async fn release(&self, escrow_id: &EscrowId, payouts: &[Payout]) -> Result<Escrow> {
        let mut escrows = self.escrows.write().await;
        let escrow = escrows
            .get_mut(escrow_id)
            .ok_or_else(|| ActpError::EscrowNotFound {
                escrow_id: escrow_id.to_string(),
            })?;

        if !escrow.can_release() {
            warn!(escrow_id = %escrow_id, "release attempted on settled escrow");
            return Err(ActpError::AlreadyReleased {
                escrow_id: escrow_id.to_string(),
            });
        }

        let payout_sum = Amount::checked_sum(payouts.iter().map(|p| &p.amount))?;
        if payout_sum != escrow.amount {
            return Err(ActpError::AmountMismatch {
                escrow_id: escrow_id.to_string(),
                payout_sum: payout_sum.to_string(),
                escrow_amount: escrow.amount.to_string(),
            });
        }

        let legs: Vec<Payout> = payouts
            .iter()
            .filter(|p| !p.amount.is_zero())
            .cloned()
            .collect();
        self.funding.credit_all(&legs).await?;

        escrow.locked = false;
        escrow.released = true;
        escrow.released_at = Some(self.clock.now());
        info!(escrow_id = %escrow_id, legs = payouts.len(), "escrow released");
        Ok(escrow.clone())
    }

    /// Return the full locked amount to the payer (cancellation path)
    pub async fn refund(&self, escrow_id: &EscrowId) -> Result<Escrow> {
        let payer = {
            let escrows = self.escrows.read().await;
            let escrow = escrows
                .get(escrow_id)
                .ok_or_else(|| ActpError::EscrowNotFound {
                    escrow_id: escrow_id.to_string(),
                })?;
            escrow.payer.clone()
        };
        let amount = self.locked_amount(escrow_id).await?;
        self.release(escrow_id, &[Payout::new(payer, amount)]).await
    }

    /// Locked balance of an escrow: the full amount until release, zero after
    pub async fn balance(&self, escrow_id: &EscrowId) -> Result<Amount> {
        let escrows = self.escrows.read().await;
        escrows
            .get(escrow_id)
            .map(|e| e.balance())
            .ok_or_else(|| ActpError::EscrowNotFound {
                escrow_id: escrow_id.to_string(),
            })
    }

    /// Snapshot of an escrow record
    pub async fn get(&self, escrow_id: &EscrowId) -> Result<Escrow> {
        let escrows = self.escrows.read().await;
        escrows
            .get(escrow_id)
            .cloned()
            .ok_or_else(|| ActpError::EscrowNotFound {
                escrow_id: escrow_id.to_string(),
            })
    }

    async fn locked_amount(&self, escrow_id: &EscrowId) -> Result<Amount> {
        let escrows = self.escrows.read().await;
        escrows
            .get(escrow_id)
            .map(|e| e.amount)
            .ok_or_else(|| ActpError::EscrowNotFound {
                escrow_id: escrow_id.to_string(),
            })
    }
}
