//! Credential issuance and validation for fabric agents.
//!
//! Tokens are compact three-segment credentials signed with HMAC-SHA256.
//! Validation results are cached per subject so hot paths skip the
//! signature check; deactivating a subject evicts its cache entries
//! immediately.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod cache;
mod token;

pub use cache::{AuthCache, AuthCacheConfig};
pub use token::{Claims, TokenConfig, TokenService};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimum accepted signing key length in bytes.
pub const MIN_SIGNING_KEY_LENGTH: usize = 32;

/// Permission bits carried in a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(pub u32);

impl Permissions {
    /// Send direct messages to another agent.
    pub const SEND: Permissions = Permissions(1 << 0);
    /// Broadcast to all agents.
    pub const BROADCAST: Permissions = Permissions(1 << 1);
    /// Register and deregister agents.
    pub const REGISTER: Permissions = Permissions(1 << 2);
    /// Read fabric metrics.
    pub const METRICS: Permissions = Permissions(1 << 3);
    /// Read the audit trail.
    pub const AUDIT_READ: Permissions = Permissions(1 << 4);
    /// Administrative operations, implies everything else.
    pub const ADMIN: Permissions = Permissions(1 << 5);

    pub const NONE: Permissions = Permissions(0);

    pub fn contains(&self, other: Permissions) -> bool {
        if self.0 & Self::ADMIN.0 != 0 {
            return true;
        }
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn with(self, other: Permissions) -> Permissions {
        Permissions(self.0 | other.0)
    }
}

/// Validated identity attached to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthContext {
    /// Subject the credential was issued to.
    pub subject: String,
    /// Role claimed by the credential.
    pub role: String,
    pub permissions: Permissions,
    /// Unique token ID, for audit correlation.
    pub token_id: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthContext {
    pub fn has_permission(&self, required: Permissions) -> bool {
        self.permissions.contains(required)
    }
}

/// Constant-time byte comparison: XOR-fold the full length before
/// deciding, so mismatch position never affects timing.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
