//! Kernel policy configuration
//!
//! The dispute-window minimum and the attestation requirement are deployment
//! policy, not protocol constants. Test and demo environments run with short
//! windows; production deployments typically require at least an hour.

use serde::{Deserialize, Serialize};

/// Default minimum dispute window (one hour)
pub const DEFAULT_MIN_DISPUTE_WINDOW_SECS: i64 = 3600;

/// Tunable policy for a kernel instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelPolicy {
    /// Smallest dispute window accepted at transaction creation, in seconds
    pub min_dispute_window_secs: i64,
    /// Whether `release_escrow` must verify a delivery attestation
    pub require_attestation: bool,
}

impl KernelPolicy {
    /// Policy for test/demo environments: short windows, no attestation
    pub fn permissive() -> Self {
        Self {
            min_dispute_window_secs: 1,
            require_attestation: false,
        }
    }

    /// Require attestation verification before release
    pub fn with_required_attestation(mut self) -> Self {
        self.require_attestation = true;
        self
    }

    /// Set the minimum dispute window
    pub fn with_min_dispute_window(mut self, secs: i64) -> Self {
        self.min_dispute_window_secs = secs;
        self
    }
}

impl Default for KernelPolicy {
    fn default() -> Self {
        Self {
            min_dispute_window_secs: DEFAULT_MIN_DISPUTE_WINDOW_SECS,
            require_attestation: false,
        }
    }
}
