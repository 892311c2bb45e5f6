//! The token-verification seam.
//!
//! The broker does not mint or own identity tokens; it defers signature,
//! issuer, and audience verification to this collaborator and only ever
//! sees the resulting claims. A concrete JWT/JWKS-backed implementation
//! lives in `broker-api`; `broker-core` only pins the trait.

use async_trait::async_trait;

use crate::error::BrokerResult;

/// Verifies a bearer token and returns its claims as a JSON object.
///
/// Implementations must reject expired tokens, bad signatures, and
/// issuer/audience mismatches by returning
/// [`BrokerError::InvalidToken`](crate::error::BrokerError::InvalidToken).
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, bearer_token: &str) -> BrokerResult<serde_json::Value>;
}
