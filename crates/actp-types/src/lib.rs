//! ACTP Types - Canonical domain types for the Agent Commerce Transaction Protocol
//!
//! This crate contains all foundational types for the ACTP core with zero
//! dependencies on other actp crates. It defines the complete type system for:
//!
//! - Identity types (TransactionId, EscrowId, AgentId, AttestationUid)
//! - Amount type with 6-decimal micro-unit precision
//! - Transaction and state-machine types
//! - Escrow and payout types
//! - Delivery proof and attestation types
//! - Dispute and resolution types
//! - Transaction lifecycle events
//!
//! # Protocol Invariants
//!
//! These types support the core ACTP invariants:
//!
//! 1. Transaction state moves strictly forward; terminal states freeze the record
//! 2. An escrow is released exactly once, and its payouts conserve the locked amount
//! 3. A delivery attestation UID authorizes at most one release
//! 4. Every failure is explicit and names the violated invariant

pub mod identity;
pub mod amount;
pub mod clock;
pub mod transaction;
pub mod escrow;
pub mod attestation;
pub mod dispute;
pub mod event;
pub mod error;

pub use identity::*;
pub use amount::*;
pub use clock::*;
pub use transaction::*;
pub use escrow::*;
pub use attestation::*;
pub use dispute::*;
pub use event::*;
pub use error::*;

/// Version of the ACTP types schema
pub const TYPES_VERSION: &str = "0.1.0";
