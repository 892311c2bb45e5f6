//! Per-token single-use proof-of-possession strings.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, SystemTime},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::{
    clock::DynClock,
    error::{BrokerError, BrokerResult},
};

/// A single-use, short-lived random value issued by `/getnonce`.
#[derive(Debug, Clone)]
pub struct Nonce {
    pub value: String,
    pub expiry: SystemTime,
}

struct Entry {
    expiry: SystemTime,
    /// SHA-256 of the bearer token that requested this nonce, hex-encoded.
    /// Not part of any invariant; exists purely to correlate log lines with
    /// the request that minted a given nonce.
    #[allow(dead_code)]
    token_fingerprint: String,
}

/// Issues nonces and exposes the current live set to the policy evaluator.
///
/// Writes and reads are serialized by a single mutex; the live set is
/// typically small (O(active clients)), so read copies are cheap.
pub struct NonceManager {
    clock: DynClock,
    lifetime: Duration,
    store: Mutex<HashMap<String, Entry>>,
}

impl NonceManager {
    pub fn new(clock: DynClock, lifetime: Duration) -> Self {
        Self {
            clock,
            lifetime,
            store: Mutex::new(HashMap::new()),
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Hashes a bearer token down to a short, non-reversible fingerprint
    /// suitable for log correlation.
    pub fn fingerprint_token(token: &str) -> String {
        let digest = Sha256::digest(token.as_bytes());
        hex::encode(digest)
    }

    /// Mints a fresh nonce bound to `token_fingerprint` and inserts it into
    /// the store.
    pub fn new_nonce(&self, token_fingerprint: &str) -> BrokerResult<Nonce> {
        let mut bytes = [0u8; 16]; // 128 bits
        rand::rngs::OsRng.try_fill_bytes(&mut bytes).map_err(|e| {
            BrokerError::InternalError(format!("RNG failure: {e}"))
        })?;
        let value = URL_SAFE_NO_PAD.encode(bytes);
        let expiry = self.clock.now() + self.lifetime;

        let mut store = self.store.lock().expect("nonce store mutex poisoned");
        store.insert(
            value.clone(),
            Entry {
                expiry,
                token_fingerprint: token_fingerprint.to_owned(),
            },
        );

        Ok(Nonce { value, expiry })
    }

    /// Returns the values of all unexpired nonces, for feeding into policy
    /// evaluation.
    pub fn current_set(&self) -> Vec<String> {
        let now = self.clock.now();
        let store = self.store.lock().expect("nonce store mutex poisoned");
        store
            .iter()
            .filter(|(_, entry)| entry.expiry > now)
            .map(|(value, _)| value.clone())
            .collect()
    }

    /// Deletes every expired entry. Intended to be called periodically by a
    /// background sweeper task, on a period `<= lifetime / 4`.
    pub fn sweep(&self) {
        let now = self.clock.now();
        let mut store = self.store.lock().expect("nonce store mutex poisoned");
        store.retain(|_, entry| entry.expiry > now);
    }

    pub fn sweep_period(&self) -> Duration {
        (self.lifetime / 4).max(Duration::from_millis(1))
    }

    /// Number of entries currently held, expired or not. Exposed for tests
    /// and health reporting.
    pub fn len(&self) -> usize {
        self.store.lock().expect("nonce store mutex poisoned").len()
    }
}

/// Runs the nonce sweeper forever, at `manager.sweep_period()` intervals,
/// until `shutdown` fires.
pub async fn run_sweeper(
    manager: std::sync::Arc<NonceManager>,
    mut shutdown: broker_tokio::notify_once::NotifyOnce,
) {
    let period = manager.sweep_period();
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            biased;
            () = shutdown.recv() => return,
            _ = interval.tick() => manager.sweep(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::clock::MockClock;

    fn manager(lifetime: Duration) -> (Arc<MockClock>, NonceManager) {
        let clock = Arc::new(MockClock::new(SystemTime::UNIX_EPOCH));
        let manager = NonceManager::new(clock.clone(), lifetime);
        (clock, manager)
    }

    #[test]
    fn nonces_are_unique_across_many_issuances() {
        let (_clock, manager) = manager(Duration::from_secs(60));
        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            let nonce = manager.new_nonce("fp").expect("rng should not fail");
            assert!(seen.insert(nonce.value), "nonce collision");
        }
    }

    #[test]
    fn expired_nonces_are_absent_from_current_set() {
        let (clock, manager) = manager(Duration::from_secs(10));
        let nonce = manager.new_nonce("fp").unwrap();
        assert!(manager.current_set().contains(&nonce.value));

        clock.advance(Duration::from_secs(11));
        assert!(!manager.current_set().contains(&nonce.value));
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let (clock, manager) = manager(Duration::from_secs(5));
        manager.new_nonce("fp").unwrap();
        assert_eq!(manager.len(), 1);

        clock.advance(Duration::from_secs(6));
        manager.sweep();
        assert_eq!(manager.len(), 0);
    }
}
