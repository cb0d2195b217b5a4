//! ACTP SDK - Agent-facing client over the kernel
//!
//! Two tiers share one kernel:
//!
//! - **Basic tier** (`ActpClient`): one call per lifecycle milestone.
//!   `request_service` creates and funds a transaction in one step, `deliver`
//!   hashes the deliverable and marks it delivered, `settle` releases escrow
//!   after the dispute window.
//! - **Advanced tier**: call the [`Kernel`](actp_kernel::Kernel) operations
//!   directly via [`ActpClient::kernel`].
//!
//! The `ServiceRegistry` is a directory of offered services; it holds no
//! funds and grants no authority.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use actp_kernel::Kernel;
use actp_types::{
    ActpError, AgentId, Amount, AttestationUid, CreateTransactionRequest, DeliveryProof, Dispute,
    Escrow, ProofMetadata, Result, Transaction, TransactionId, TxState,
};

// ============================================================================
// Service registry
// ============================================================================

/// A service offered by a provider agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceListing {
    /// Unique service name used for lookup
    pub name: String,
    /// Agent that fulfils requests for this service
    pub provider: AgentId,
    /// Human-readable description
    pub description: String,
    /// Fixed price per request
    pub price: Amount,
}

/// Directory of services offered by provider agents.
///
/// Purely informational: resolving a listing never moves funds or creates
/// transactions.
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, ServiceListing>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Register or replace a listing under its name
    pub async fn register(&self, listing: ServiceListing) {
        info!(service = %listing.name, provider = %listing.provider, "service registered");
        self.services
            .write()
            .await
            .insert(listing.name.clone(), listing);
    }

    /// Remove a listing; returns it if present
    pub async fn unregister(&self, name: &str) -> Option<ServiceListing> {
        self.services.write().await.remove(name)
    }

    /// Look up a listing by name
    pub async fn resolve(&self, name: &str) -> Result<ServiceListing> {
        self.services
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ActpError::ServiceNotRegistered {
                service: name.to_string(),
            })
    }

    /// All current listings
    pub async fn listings(&self) -> Vec<ServiceListing> {
        self.services.read().await.values().cloned().collect()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Client
// ============================================================================

/// Per-agent handle onto a shared kernel.
///
/// Requester agents use `request_service`/`wait_for_settlement`/`dispute`;
/// provider agents use `deliver`/`settle`. One client acts as exactly one
/// agent identity.
pub struct ActpClient {
    kernel: Arc<Kernel>,
    registry: Arc<ServiceRegistry>,
    agent: AgentId,
}

impl ActpClient {
    pub fn new(kernel: Arc<Kernel>, registry: Arc<ServiceRegistry>, agent: AgentId) -> Self {
        Self {
            kernel,
            registry,
            agent,
        }
    }

    /// The agent identity this client acts as
    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    /// The underlying kernel, for advanced-tier calls
    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Request a registered service: create the transaction at the listed
    /// price and fund its escrow in one step.
    ///
    /// On success the transaction is `COMMITTED` with the price locked.
    pub async fn request_service(
        &self,
        service: &str,
        deadline: DateTime<Utc>,
        dispute_window_secs: i64,
    ) -> Result<Transaction> {
        let listing = self.registry.resolve(service).await?;
        let tx = self
            .kernel
            .create_transaction(CreateTransactionRequest {
                requester: self.agent.clone(),
                provider: listing.provider,
                amount: listing.price,
                deadline,
                dispute_window_secs,
            })
            .await?;
        self.kernel.link_escrow(&tx.id).await?;
        self.kernel.get_transaction(&tx.id).await
    }

    /// Mark a deliverable as delivered: hash the content, record the proof,
    /// and transition to `DELIVERED`, starting the dispute window.
    pub async fn deliver(
        &self,
        tx_id: &TransactionId,
        content: &[u8],
        metadata: ProofMetadata,
    ) -> Result<DeliveryProof> {
        let proof = DeliveryProof::from_content(tx_id.clone(), content, metadata);
        self.kernel
            .transition_state(tx_id, TxState::Delivered, Some(proof.content_hash.clone()))
            .await?;
        Ok(proof)
    }

    /// Release the escrow to the provider once the dispute window has passed
    pub async fn settle(
        &self,
        tx_id: &TransactionId,
        attestation_uid: Option<&AttestationUid>,
    ) -> Result<Escrow> {
        self.kernel.release_escrow(tx_id, attestation_uid).await
    }

    /// Contest a delivery as this agent
    pub async fn dispute(
        &self,
        tx_id: &TransactionId,
        reason: impl Into<String>,
        evidence_ref: Option<String>,
    ) -> Result<Dispute> {
        self.kernel
            .raise_dispute(tx_id, &self.agent, reason, evidence_ref)
            .await
    }

    /// Block until the transaction settles, or `timeout` elapses
    pub async fn wait_for_settlement(
        &self,
        tx_id: &TransactionId,
        timeout: std::time::Duration,
    ) -> Result<TxState> {
        self.kernel
            .wait_for_state(tx_id, TxState::Settled, timeout)
            .await
    }

    /// Cancel a transaction this agent no longer wants fulfilled
    pub async fn cancel(&self, tx_id: &TransactionId) -> Result<Transaction> {
        self.kernel.cancel_transaction(tx_id).await
    }
}
