//! The policy-evaluator seam.
//!
//! Every request the dispatcher receives is gated by a policy decision
//! before any cryptographic material is produced or handed out. The
//! decision logic itself (Rego, in `broker-policy`) lives outside this
//! crate; `broker-core` only defines the trait and the inputs/outputs it
//! exchanges with the evaluator.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::BrokerResult;

/// The claims and request context a policy decision is made against:
/// `{claims, nonces, name | principal}`.
///
/// Field names match what the embedded Rego policies query under
/// `input.*`, so changing them is a breaking change for any deployed
/// policy bundle.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyInput {
    /// All claims from the verified token, as a JSON object.
    pub claims: serde_json::Value,
    /// The full current set of unexpired nonces (not just the one this
    /// request happened to present).
    pub nonces: Vec<String>,
    /// The resource being requested: a secret `name` for `/getsecret`, a
    /// keytab `principal` for `/getkeytab`. Absent for `/getnonce`, which
    /// carries no target resource.
    pub name: Option<String>,
}

/// Decides whether a verified, nonce-proven request may proceed.
///
/// Implementations must not block the calling task for longer than the
/// configured policy timeout; `broker-policy`'s implementation enforces
/// this internally with `tokio::time::timeout`.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn check_get_nonce(&self, input: &PolicyInput) -> BrokerResult<bool>;

    async fn check_get_keytab(&self, input: &PolicyInput) -> BrokerResult<bool>;

    async fn check_get_secret(&self, input: &PolicyInput) -> BrokerResult<bool>;
}
