//! The error taxonomy shared by every component of the credential engine.
//!
//! Every variant here corresponds to one of the kinds in the design's error
//! taxonomy. The HTTP layer (`broker-api`) maps all of them down to a single
//! `409` response, by design: authorization outcomes are not meant to be
//! distinguishable from the wire.

use thiserror::Error;

/// Errors produced by the credential engine.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Bearer token signature, expiry, issuer, or audience check failed.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// The policy evaluated to `false` for this request.
    #[error("denied")]
    Denied,

    /// The requested name or principal is not configured.
    #[error("not found: {0}")]
    NotFound(String),

    /// The principal has not completed a successful rotation since startup.
    #[error("temporarily unavailable: {0}")]
    TemporarilyUnavailable(String),

    /// The policy evaluator raised an error while evaluating this input.
    #[error("policy error: {0}")]
    PolicyError(String),

    /// Policy evaluation exceeded its configured deadline.
    #[error("policy evaluation timed out")]
    PolicyTimeout,

    /// RNG failure, a KDC call classified as fatal, or an invariant
    /// violation.
    #[error("internal error: {0}")]
    InternalError(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;
