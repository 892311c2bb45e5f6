//! Core domain types and engines for the credential broker: epoch scheduling,
//! nonce bookkeeping, derived-secret and keytab rotation, and the
//! policy-evaluator seam. Transport, configuration loading, and the concrete
//! policy/KDC adapters live in their own crates.

pub mod clock;
pub mod epoch;
pub mod error;
pub mod keytab;
pub mod nonce;
pub mod policy;
pub mod secret;
pub mod token;

pub mod test_support;

pub use clock::{Clock, DynClock, MockClock, SystemClock};
pub use error::{BrokerError, BrokerResult};
