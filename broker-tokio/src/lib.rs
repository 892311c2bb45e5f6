//! Small extensions to `tokio` shared by every credential-broker crate.

/// A channel for sending deduplicated notifications with no data attached.
pub mod notify;
/// `NotifyOnce`, typically used as a shutdown channel.
pub mod notify_once;
/// `LxTask` and associated helpers for structured task supervision.
pub mod task;

pub use tokio;
