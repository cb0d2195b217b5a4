//! Error types for the ACTP core
//!
//! Every error names the record it concerns and the invariant that was
//! violated. All errors are terminal for the calling operation; the caller
//! always observes the pre-operation state unchanged.

use thiserror::Error;

/// Result type for ACTP operations
pub type Result<T> = std::result::Result<T, ActpError>;

/// ACTP error taxonomy
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActpError {
    // ========================================================================
    // Amount Errors
    // ========================================================================

    /// Amount overflow during arithmetic
    #[error("Amount overflow during arithmetic operation")]
    AmountOverflow,

    /// Amount underflow during arithmetic
    #[error("Amount underflow during arithmetic operation")]
    AmountUnderflow,

    /// Amount failed creation-time validation
    #[error("Invalid amount: {reason}")]
    InvalidAmount { reason: String },

    // ========================================================================
    // State Machine Errors
    // ========================================================================

    /// Transition not legal from the current state
    #[error("Transaction {tx_id}: transition {from} -> {to} is not legal")]
    InvalidState {
        tx_id: String,
        from: String,
        to: String,
    },

    /// Transaction not found
    #[error("Transaction {tx_id} not found")]
    TransactionNotFound { tx_id: String },

    /// Deadline is in the past
    #[error("Transaction deadline {deadline} is not in the future")]
    DeadlinePassed { deadline: String },

    /// Dispute window below the policy minimum
    #[error("Dispute window {window_secs}s is below the policy minimum {min_secs}s")]
    DisputeWindowTooShort { window_secs: i64, min_secs: i64 },

    /// A DELIVERED transition requires a delivery proof
    #[error("Transaction {tx_id}: delivery requires a proof reference")]
    MissingDeliveryProof { tx_id: String },

    /// Lost a linearization race on the same transaction
    #[error("Transaction {tx_id}: concurrent modification in progress")]
    ConcurrentModification { tx_id: String },

    // ========================================================================
    // Escrow Errors
    // ========================================================================

    /// Escrow not found
    #[error("Escrow {escrow_id} not found")]
    EscrowNotFound { escrow_id: String },

    /// Escrow funding cannot be covered
    #[error("Insufficient {fund_source} for account {account}: requested {requested}, available {available}")]
    InsufficientFunds {
        account: String,
        /// Which funding check failed ("balance" or "allowance")
        fund_source: String,
        requested: String,
        available: String,
    },

    /// Double-release or double-refund attempted
    #[error("Escrow {escrow_id} has already been released")]
    AlreadyReleased { escrow_id: String },

    /// Payout sums do not reconcile to the escrow amount
    #[error("Escrow {escrow_id}: payouts sum to {payout_sum}, escrow holds {escrow_amount}")]
    AmountMismatch {
        escrow_id: String,
        payout_sum: String,
        escrow_amount: String,
    },

    /// Transaction already has an escrow linked
    #[error("Transaction {tx_id} already has escrow {escrow_id} linked")]
    EscrowAlreadyLinked { tx_id: String, escrow_id: String },

    // ========================================================================
    // Dispute Errors
    // ========================================================================

    /// Release attempted while the dispute window is still open
    #[error("Transaction {tx_id}: dispute window open until {open_until}")]
    DisputeWindowActive { tx_id: String, open_until: String },

    /// Dispute attempted after the window elapsed
    #[error("Transaction {tx_id}: dispute window closed at {closed_at}")]
    DisputeWindowExpired { tx_id: String, closed_at: String },

    /// Resolution split does not reconcile to the escrow amount
    #[error("Transaction {tx_id}: resolution sums to {resolution_sum}, escrow holds {escrow_amount}")]
    ResolutionAmountMismatch {
        tx_id: String,
        resolution_sum: String,
        escrow_amount: String,
    },

    // ========================================================================
    // Attestation Errors
    // ========================================================================

    /// Attestation not found in the registry
    #[error("Attestation {uid} not found")]
    AttestationNotFound { uid: String },

    /// Attestation UID was already consumed by a prior release
    #[error("Attestation {uid} has already been consumed")]
    ReplayedAttestation { uid: String },

    /// Attestation failed a verification check
    #[error("Attestation {uid} rejected: {reason}")]
    AttestationRejected { uid: String, reason: String },

    /// Policy requires an attestation for release but none was supplied
    #[error("Transaction {tx_id}: release requires a delivery attestation")]
    AttestationRequired { tx_id: String },

    // ========================================================================
    // Authorization Errors
    // ========================================================================

    /// Caller lacks the required role
    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    // ========================================================================
    // Observation Errors
    // ========================================================================

    /// Bounded wait elapsed before the target state was observed
    #[error("Timed out after {timeout_ms}ms waiting for transaction {tx_id} to reach {target}")]
    WaitTimeout {
        tx_id: String,
        target: String,
        timeout_ms: u64,
    },

    // ========================================================================
    // General Errors
    // ========================================================================

    /// Persistent store failure
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Service name not known to the registry
    #[error("Service {service} is not registered")]
    ServiceNotRegistered { service: String },
}

impl ActpError {
    /// Create an unauthorized error
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Get an error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AmountOverflow => "AMOUNT_OVERFLOW",
            Self::AmountUnderflow => "AMOUNT_UNDERFLOW",
            Self::InvalidAmount { .. } => "INVALID_AMOUNT",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::TransactionNotFound { .. } => "TRANSACTION_NOT_FOUND",
            Self::DeadlinePassed { .. } => "DEADLINE_PASSED",
            Self::DisputeWindowTooShort { .. } => "DISPUTE_WINDOW_TOO_SHORT",
            Self::MissingDeliveryProof { .. } => "MISSING_DELIVERY_PROOF",
            Self::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            Self::EscrowNotFound { .. } => "ESCROW_NOT_FOUND",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::AlreadyReleased { .. } => "ALREADY_RELEASED",
            Self::AmountMismatch { .. } => "AMOUNT_MISMATCH",
            Self::EscrowAlreadyLinked { .. } => "ESCROW_ALREADY_LINKED",
            Self::DisputeWindowActive { .. } => "DISPUTE_WINDOW_ACTIVE",
            Self::DisputeWindowExpired { .. } => "DISPUTE_WINDOW_EXPIRED",
            Self::ResolutionAmountMismatch { .. } => "RESOLUTION_AMOUNT_MISMATCH",
            Self::AttestationNotFound { .. } => "ATTESTATION_NOT_FOUND",
            Self::ReplayedAttestation { .. } => "REPLAYED_ATTESTATION",
            Self::AttestationRejected { .. } => "ATTESTATION_REJECTED",
            Self::AttestationRequired { .. } => "ATTESTATION_REQUIRED",
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::WaitTimeout { .. } => "WAIT_TIMEOUT",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::ServiceNotRegistered { .. } => "SERVICE_NOT_REGISTERED",
        }
    }
}
