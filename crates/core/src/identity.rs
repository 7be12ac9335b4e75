//! Boundary to the external identity provider.
//!
//! Session issuance lives outside this system; the engine only needs to turn
//! an opaque token into an [`Identity`] or reject it.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::IdentityId;

/// A verified viewer identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub display_name: Option<String>,
}

/// Verifies identity tokens presented on connect.
///
/// Implementations return [`CoreError::Unauthorized`] for invalid or expired
/// tokens.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, CoreError>;
}
