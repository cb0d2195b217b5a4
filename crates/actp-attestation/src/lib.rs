//! ACTP Attestation - Delivery-attestation verification
//!
//! Before an escrow releases against an attestation, the verifier checks:
//!
//! 1. The attestation exists in the registry
//! 2. Its schema is the configured delivery-proof schema
//! 3. Its attester is the transaction's provider
//! 4. It has not been revoked
//! 5. Its UID has not been consumed by a prior release (replay protection)
//! 6. Its embedded content hash matches the transaction's recorded proof
//!
//! Replay protection persists across process restarts via the sled-backed
//! consumed-UID store; a passing verification consumes the UID.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use actp_types::{
    ActpError, Attestation, AttestationUid, Result, Transaction, DELIVERY_PROOF_SCHEMA,
};

// ============================================================================
// Attestation Registry
// ============================================================================

/// In-memory record store keyed by attestation UID.
///
/// Stands in for the external attestation service; the verifier only reads
/// from it.
pub struct AttestationRegistry {
    records: RwLock<HashMap<AttestationUid, Attestation>>,
}

impl AttestationRegistry {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Record a newly issued attestation
    pub async fn submit(&self, attestation: Attestation) -> AttestationUid {
        let uid = attestation.uid.clone();
        let mut records = self.records.write().await;
        records.insert(uid.clone(), attestation);
        uid
    }

    /// Fetch an attestation record
    pub async fn get(&self, uid: &AttestationUid) -> Result<Attestation> {
        let records = self.records.read().await;
        records
            .get(uid)
            .cloned()
            .ok_or_else(|| ActpError::AttestationNotFound {
                uid: uid.to_string(),
            })
    }

    /// Mark an attestation as revoked
    pub async fn revoke(&self, uid: &AttestationUid) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(uid)
            .ok_or_else(|| ActpError::AttestationNotFound {
                uid: uid.to_string(),
            })?;
        record.revocation_time = Some(chrono::Utc::now());
        Ok(())
    }
}

impl Default for AttestationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Consumed-UID Store
// ============================================================================

/// Set of attestation UIDs already used to authorize a release.
///
/// Implementations must make `insert` durable before returning: replay
/// protection has to survive process restarts.
#[async_trait::async_trait]
pub trait ConsumedUidStore: Send + Sync {
    /// Check whether a UID was already consumed
    async fn contains(&self, uid: &AttestationUid) -> Result<bool>;

    /// Record a UID as consumed
    async fn insert(&self, uid: &AttestationUid) -> Result<()>;
}

/// Volatile consumed-UID store for tests and single-process use
pub struct InMemoryConsumedStore {
    consumed: RwLock<HashSet<AttestationUid>>,
}

impl InMemoryConsumedStore {
    pub fn new() -> Self {
        Self {
            consumed: RwLock::new(HashSet::new()),
        }
    }
}

impl Default for InMemoryConsumedStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ConsumedUidStore for InMemoryConsumedStore {
    async fn contains(&self, uid: &AttestationUid) -> Result<bool> {
        Ok(self.consumed.read().await.contains(uid))
    }

    async fn insert(&self, uid: &AttestationUid) -> Result<()> {
        self.consumed.write().await.insert(uid.clone());
        Ok(())
    }
}

/// Durable consumed-UID store backed by sled
pub struct SledConsumedStore {
    db: sled::Db,
}

impl SledConsumedStore {
    /// Open (or create) the store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path).map_err(|e| ActpError::storage(e.to_string()))?;
        Ok(Self { db })
    }
}

#[async_trait::async_trait]
impl ConsumedUidStore for SledConsumedStore {
    async fn contains(&self, uid: &AttestationUid) -> Result<bool> {
        self.db
            .contains_key(uid.to_string().as_bytes())
            .map_err(|e| ActpError::storage(e.to_string()))
    }

    async fn insert(&self, uid: &AttestationUid) -> Result<()> {
        self.db
            .insert(uid.to_string().as_bytes(), Vec::<u8>::new())
            .map_err(|e| ActpError::storage(e.to_string()))?;
        self.db
            .flush_async()
            .await
            .map_err(|e| ActpError::storage(e.to_string()))?;
        Ok(())
    }
}

// ============================================================================
// Verifier
// ============================================================================

/// Validates a delivery attestation before an escrow release
pub struct AttestationVerifier {
    registry: Arc<AttestationRegistry>,
    consumed: Arc<dyn ConsumedUidStore>,
    /// Schema delivery attestations must be issued under
    schema: String,
}

impl AttestationVerifier {
    pub fn new(registry: Arc<AttestationRegistry>, consumed: Arc<dyn ConsumedUidStore>) -> Self {
        Self {
            registry,
            consumed,
            schema: DELIVERY_PROOF_SCHEMA.to_string(),
        }
    }

    /// Override the expected schema (non-default deployments)
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Verify `uid` against the transaction's provider and recorded proof.
    ///
    /// On success the UID is marked consumed, so a second release attempt
    /// with the same UID fails with `ReplayedAttestation`. Any failure means
    /// no fund movement and no consumption.
    pub async fn verify(&self, tx: &Transaction, uid: &AttestationUid) -> Result<()> {
        let attestation = self.registry.get(uid).await?;

        if attestation.schema != self.schema {
            return Err(self.reject(uid, format!("schema {} does not match {}", attestation.schema, self.schema)));
        }
        if attestation.attester != tx.provider {
            return Err(self.reject(uid, "attester is not the transaction provider".to_string()));
        }
        if attestation.is_revoked() {
            return Err(self.reject(uid, "attestation has been revoked".to_string()));
        }
        if self.consumed.contains(uid).await? {
            warn!(%uid, tx_id = %tx.id, "attestation replay attempt");
            return Err(ActpError::ReplayedAttestation {
                uid: uid.to_string(),
            });
        }
        match tx.proof_reference.as_deref() {
            Some(proof_hash) if proof_hash == attestation.content_hash => {}
            Some(_) => {
                return Err(self.reject(uid, "content hash does not match recorded proof".to_string()));
            }
            None => {
                return Err(ActpError::MissingDeliveryProof {
                    tx_id: tx.id.to_string(),
                });
            }
        }

        self.consumed.insert(uid).await?;
        debug!(%uid, tx_id = %tx.id, "attestation verified and consumed");
        Ok(())
    }

    fn reject(&self, uid: &AttestationUid, reason: String) -> ActpError {
        warn!(%uid, %reason, "attestation rejected");
        ActpError::AttestationRejected {
            uid: uid.to_string(),
            reason,
        }
    }
}
