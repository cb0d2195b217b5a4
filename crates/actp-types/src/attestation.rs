//! Delivery proof and attestation types
//!
//! A provider generates a `DeliveryProof` at delivery time; the proof (or an
//! attestation anchoring it) is consumed once by the verifier before escrow
//! release. Each attestation UID authorizes at most one release.

use crate::{AgentId, AttestationUid, TransactionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Schema identifier for delivery-proof attestations
pub const DELIVERY_PROOF_SCHEMA: &str = "actp.delivery-proof.v1";

/// Metadata describing a deliverable
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofMetadata {
    /// Size of the deliverable in bytes
    pub size_bytes: u64,
    /// MIME type of the deliverable
    pub mime_type: Option<String>,
    /// Human-readable description
    pub description: Option<String>,
}

/// Proof of delivery generated by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryProof {
    /// Transaction the deliverable belongs to
    pub transaction_id: TransactionId,
    /// Hex SHA-256 hash of the deliverable content
    pub content_hash: String,
    /// When the proof was generated
    pub generated_at: DateTime<Utc>,
    /// Deliverable metadata
    pub metadata: ProofMetadata,
}

impl DeliveryProof {
    /// Build a proof by hashing the deliverable bytes
    pub fn from_content(
        transaction_id: TransactionId,
        content: &[u8],
        metadata: ProofMetadata,
    ) -> Self {
        Self {
            transaction_id,
            content_hash: hash_content(content),
            generated_at: Utc::now(),
            metadata,
        }
    }
}

/// Hex SHA-256 hash of deliverable bytes
pub fn hash_content(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// An on-chain-style delivery attestation record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    /// Unique identifier from the attestation service
    pub uid: AttestationUid,
    /// Schema the attestation was issued under
    pub schema: String,
    /// Account that signed the attestation
    pub attester: AgentId,
    /// Account the attestation is addressed to
    pub recipient: AgentId,
    /// Content hash embedded in the attestation payload
    pub content_hash: String,
    /// When the attestation was issued
    pub time: DateTime<Utc>,
    /// Whether the attester may revoke
    pub revocable: bool,
    /// Set once revoked
    pub revocation_time: Option<DateTime<Utc>>,
}

impl Attestation {
    /// Issue a delivery-proof attestation for a proof
    pub fn for_delivery(attester: AgentId, recipient: AgentId, proof: &DeliveryProof) -> Self {
        Self {
            uid: AttestationUid::new(),
            schema: DELIVERY_PROOF_SCHEMA.to_string(),
            attester,
            recipient,
            content_hash: proof.content_hash.clone(),
            time: Utc::now(),
            revocable: true,
            revocation_time: None,
        }
    }

    /// Check if the attestation has been revoked
    pub fn is_revoked(&self) -> bool {
        self.revocation_time.is_some()
    }
}
