//! Time-window derived-secret generator.
//!
//! Each configured secret rotates on its own epoch schedule. At any instant,
//! up to two records are live: `current` (rising half-life) and `previous`
//! (still valid through the remainder of its original lifetime), so clients
//! straddling a rotation never fail.

use std::{
    sync::Mutex,
    time::{Duration, SystemTime},
};

use hkdf::Hkdf;
use sha2::Sha256;

use crate::{
    clock::DynClock,
    epoch::{epoch_number, epoch_start, EpochScheduler},
    error::{BrokerError, BrokerResult},
};

/// The default output width (in bytes) of a derived secret.
pub const DEFAULT_SECRET_WIDTH: usize = 32;

/// One derived value, scoped to a single epoch of a single named secret.
#[derive(Debug, Clone)]
pub struct SharedSecretRecord {
    pub name: String,
    pub epoch: u64,
    pub value: Vec<u8>,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
}

/// `value = HKDF-Expand(PRK = HKDF-Extract(salt = name, ikm = seed), info =
/// epoch as big-endian u64, L = width)`.
pub fn derive_secret(name: &str, seed: &[u8], epoch: u64, width: usize) -> Vec<u8> {
    let hk = Hkdf::<Sha256>::new(Some(name.as_bytes()), seed);
    let mut okm = vec![0u8; width];
    hk.expand(&epoch.to_be_bytes(), &mut okm)
        .expect("HKDF output width must fit within 255 * hash length");
    okm
}

fn record_for_epoch(
    name: &str,
    seed: &[u8],
    lifetime: Duration,
    width: usize,
    epoch: u64,
) -> SharedSecretRecord {
    let not_before = epoch_start(epoch, lifetime);
    // `previous` must remain valid through the full lifetime past its
    // creation-epoch's end, i.e. two lifetimes after its own not_before.
    let not_after = not_before + lifetime * 2;
    SharedSecretRecord {
        name: name.to_owned(),
        epoch,
        value: derive_secret(name, seed, epoch, width),
        not_before,
        not_after,
    }
}

struct Slot {
    current: Option<SharedSecretRecord>,
    previous: Option<SharedSecretRecord>,
}

/// A single named secret's configuration and rotation state.
pub struct SecretGenerator {
    pub name: String,
    seed: Vec<u8>,
    lifetime: Duration,
    width: usize,
    slot: Mutex<Slot>,
}

impl SecretGenerator {
    pub fn new(name: impl Into<String>, seed: Vec<u8>, lifetime: Duration) -> Self {
        Self::with_width(name, seed, lifetime, DEFAULT_SECRET_WIDTH)
    }

    pub fn with_width(
        name: impl Into<String>,
        seed: Vec<u8>,
        lifetime: Duration,
        width: usize,
    ) -> Self {
        Self {
            name: name.into(),
            seed,
            lifetime,
            width,
            slot: Mutex::new(Slot {
                current: None,
                previous: None,
            }),
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Advances this generator's state to `now`'s epoch.
    ///
    /// - If there is no `current` yet (startup), populates both `current`
    ///   (now's epoch) and `previous` (now's epoch - 1, predated; its
    ///   `not_after` is still in the future by one lifetime).
    /// - If the new epoch equals the current one's, does nothing.
    /// - Otherwise shifts `current` -> `previous` and installs the new
    ///   record as `current`.
    pub fn rotate_to(&self, now: SystemTime) {
        let new_epoch = epoch_number(now, self.lifetime);
        let mut slot = self.slot.lock().expect("secret slot mutex poisoned");

        match &slot.current {
            None => {
                let current =
                    record_for_epoch(&self.name, &self.seed, self.lifetime, self.width, new_epoch);
                let previous = record_for_epoch(
                    &self.name,
                    &self.seed,
                    self.lifetime,
                    self.width,
                    new_epoch.saturating_sub(1),
                );
                slot.previous = Some(previous);
                slot.current = Some(current);
            }
            Some(current) if current.epoch == new_epoch => {
                // Already up to date.
            }
            Some(_) => {
                let new_current =
                    record_for_epoch(&self.name, &self.seed, self.lifetime, self.width, new_epoch);
                slot.previous = slot.current.take();
                slot.current = Some(new_current);
            }
        }
    }

    /// Returns `(current, previous)`. `previous` is `None` only before the
    /// first call to [`rotate_to`].
    pub fn get(&self) -> (Option<SharedSecretRecord>, Option<SharedSecretRecord>) {
        let slot = self.slot.lock().expect("secret slot mutex poisoned");
        (slot.current.clone(), slot.previous.clone())
    }
}

/// A collection of named secret generators, looked up by name.
pub struct SecretRegistry {
    generators: std::collections::HashMap<String, std::sync::Arc<SecretGenerator>>,
}

impl SecretRegistry {
    pub fn new(generators: Vec<std::sync::Arc<SecretGenerator>>) -> Self {
        Self {
            generators: generators.into_iter().map(|g| (g.name.clone(), g)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> BrokerResult<std::sync::Arc<SecretGenerator>> {
        self.generators
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("secret '{name}' is not configured")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &std::sync::Arc<SecretGenerator>> {
        self.generators.values()
    }
}

/// Drives one named secret's rotation forever: derivation never fails, so
/// unlike [`crate::keytab::run_keytab_rotator`] there is no retry/backoff
/// path -- each epoch boundary is simply an HKDF computation away.
pub async fn run_secret_rotator(
    generator: std::sync::Arc<SecretGenerator>,
    clock: DynClock,
    mut shutdown: broker_tokio::notify_once::NotifyOnce,
) {
    let mut scheduler = EpochScheduler::new(clock.clone(), generator.lifetime());
    loop {
        tokio::select! {
            biased;
            () = shutdown.recv() => return,
            _epoch = scheduler.tick() => generator.rotate_to(clock.now()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn derivation_is_deterministic_across_instances() {
        let a = derive_secret("db-password", b"seed", 42, 32);
        let b = derive_secret("db-password", b"seed", 42, 32);
        assert_eq!(a, b);
    }

    #[test]
    fn different_names_derive_different_values() {
        let a = derive_secret("a", b"seed", 1, 32);
        let b = derive_secret("b", b"seed", 1, 32);
        assert_ne!(a, b);
    }

    #[test]
    fn startup_populates_current_and_previous() {
        let lifetime = Duration::from_secs(2);
        let gen = SecretGenerator::new("n", b"seed".to_vec(), lifetime);
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        gen.rotate_to(now);

        let (current, previous) = gen.get();
        let current = current.unwrap();
        let previous = previous.unwrap();
        assert_eq!(current.epoch, previous.epoch + 1);
        assert!(previous.not_after > now);
    }

    #[test]
    fn rotation_straddle_keeps_previous_valid() {
        // Configure lifetime 2s; fetch at t=1.9s then t=2.1s.
        let lifetime = Duration::from_secs(2);
        let gen = SecretGenerator::new("n", b"seed".to_vec(), lifetime);

        let t1 = SystemTime::UNIX_EPOCH + Duration::from_millis(1900);
        gen.rotate_to(t1);
        let (a1, _) = gen.get();
        let a1 = a1.unwrap();
        assert!(a1.not_after > t1);

        let t2 = SystemTime::UNIX_EPOCH + Duration::from_millis(2100);
        gen.rotate_to(t2);
        let (a2, prev) = gen.get();
        let a2 = a2.unwrap();
        let prev = prev.unwrap();

        assert_ne!(a1.value, a2.value);
        assert_eq!(prev.value, a1.value);
        assert!(prev.not_after > t2); // previous still valid
        assert!(a2.not_after > a1.not_after);
    }

    #[test]
    fn same_epoch_tick_is_a_no_op() {
        let lifetime = Duration::from_secs(60);
        let gen = SecretGenerator::new("n", b"seed".to_vec(), lifetime);
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        gen.rotate_to(now);
        let (before, _) = gen.get();

        gen.rotate_to(now + Duration::from_secs(1));
        let (after, _) = gen.get();

        assert_eq!(before.unwrap().value, after.unwrap().value);
    }
}
