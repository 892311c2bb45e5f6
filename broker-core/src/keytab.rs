//! Keytab rotator.
//!
//! On the same epoch schedule as the derived-secret generator, generates a
//! fresh random password for each configured Kerberos principal, invokes the
//! KDC administrative tooling to set that password, and packages the
//! resulting keytab bytes for delivery.

use std::{
    sync::Mutex,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use broker_tokio::notify_once::NotifyOnce;
use rand::RngCore;
use tracing::{error, warn};

use crate::{clock::DynClock, epoch::epoch_start};

/// A keytab, scoped to the epoch in which it was minted.
#[derive(Debug, Clone)]
pub struct KeytabRecord {
    pub principal: String,
    pub epoch: u64,
    pub bytes: Vec<u8>,
    pub kvno: u32,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
}

/// A keytab extracted from the KDC, along with the key version number the
/// KDC tooling reports for it (e.g. via `getprinc`'s "Key: vno N" line).
#[derive(Debug, Clone)]
pub struct KeytabBlob {
    pub bytes: Vec<u8>,
    pub kvno: u32,
}

/// How the KDC administrative tool responded to a `set_password` call,
/// classified per the documented exit-code/stderr table the concrete
/// [`KdcAdmin`] implementation maintains (see `broker-kdc`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetPasswordOutcome {
    Ok,
    Retryable { reason: String },
    FatalForPrincipal { reason: String },
}

/// The KDC administrative tool, as a collaborator trait so the rotator can
/// be tested without a real KDC.
#[async_trait]
pub trait KdcAdmin: Send + Sync {
    async fn set_password(&self, principal: &str, password: &str) -> SetPasswordOutcome;

    async fn extract_keytab(&self, principal: &str) -> Result<KeytabBlob, String>;
}

/// The outcome of one rotation attempt, for the caller (a per-principal
/// rotator task) to decide whether/when to retry.
#[derive(Debug, PartialEq, Eq)]
pub enum RotationOutcome {
    /// A new `current` keytab was installed.
    Rotated,
    /// The epoch hadn't advanced; nothing to do.
    NoOp,
    /// `set_password` failed in a way worth retrying with backoff.
    Retryable,
    /// `set_password` or `extract_keytab` failed in a way not worth
    /// retrying until the next regular tick.
    FatalForPrincipal,
}

struct Slot {
    current: Option<KeytabRecord>,
    previous: Option<KeytabRecord>,
    /// Set once a rotation has ever succeeded. Used to distinguish "never
    /// rotated" (TemporarilyUnavailable) from "rotation just hasn't run
    /// this tick yet".
    ever_succeeded: bool,
    last_error: Option<String>,
}

/// Rotation state and configuration for a single Kerberos principal.
pub struct KeytabGenerator {
    pub principal: String,
    /// Optional deterministic seed. When present, the per-epoch password is
    /// a reproducible HKDF derivation (like the shared-secret generator)
    /// rather than pure randomness, so a restarted broker regenerates the
    /// same password sequence a KDC admin already reconciled out-of-band.
    seed: Option<Vec<u8>>,
    lifetime: Duration,
    kdc: std::sync::Arc<dyn KdcAdmin>,
    slot: Mutex<Slot>,
}

/// Printable character class accepted by MIT `kadmin`'s `-pw` argument:
/// ASCII letters, digits, and a conservative set of punctuation (excludes
/// shell metacharacters and quote characters since the password may be
/// interpolated into a `kadmin` script).
const PASSWORD_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_.,@#%^&*+=~";

/// Generates a password with at least 128 bits of entropy, restricted to
/// [`PASSWORD_ALPHABET`].
fn random_password(rng_bytes: &[u8]) -> String {
    // log2(75) ~= 6.23 bits/char; 24 chars gives > 128 bits of entropy.
    const LEN: usize = 24;
    let mut out = String::with_capacity(LEN);
    for i in 0..LEN {
        let idx = (rng_bytes[i % rng_bytes.len()] as usize
            ^ rng_bytes[(i * 7 + 3) % rng_bytes.len()] as usize)
            % PASSWORD_ALPHABET.len();
        out.push(PASSWORD_ALPHABET[idx] as char);
    }
    out
}

impl KeytabGenerator {
    pub fn new(
        principal: impl Into<String>,
        seed: Option<Vec<u8>>,
        lifetime: Duration,
        kdc: std::sync::Arc<dyn KdcAdmin>,
    ) -> Self {
        Self {
            principal: principal.into(),
            seed,
            lifetime,
            kdc,
            slot: Mutex::new(Slot {
                current: None,
                previous: None,
                ever_succeeded: false,
                last_error: None,
            }),
        }
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    fn next_password(&self, now: SystemTime) -> String {
        match &self.seed {
            Some(seed) => {
                let epoch = crate::epoch::epoch_number(now, self.lifetime);
                let derived = crate::secret::derive_secret(&self.principal, seed, epoch, 32);
                random_password(&derived)
            }
            None => {
                let mut bytes = [0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut bytes);
                random_password(&bytes)
            }
        }
    }

    /// Runs one rotation attempt for `now`'s epoch.
    pub async fn rotate_once(&self, now: SystemTime) -> RotationOutcome {
        let new_epoch = crate::epoch::epoch_number(now, self.lifetime);
        {
            let slot = self.slot.lock().expect("keytab slot mutex poisoned");
            if let Some(current) = &slot.current {
                if current.epoch == new_epoch {
                    return RotationOutcome::NoOp;
                }
            }
        }

        let password = self.next_password(now);
        match self.kdc.set_password(&self.principal, &password).await {
            SetPasswordOutcome::Retryable { reason } => {
                let mut slot = self.slot.lock().expect("keytab slot mutex poisoned");
                slot.last_error = Some(reason);
                return RotationOutcome::Retryable;
            }
            SetPasswordOutcome::FatalForPrincipal { reason } => {
                let mut slot = self.slot.lock().expect("keytab slot mutex poisoned");
                slot.last_error = Some(reason);
                return RotationOutcome::FatalForPrincipal;
            }
            SetPasswordOutcome::Ok => {}
        }

        let blob = match self.kdc.extract_keytab(&self.principal).await {
            Ok(blob) => blob,
            Err(reason) => {
                let mut slot = self.slot.lock().expect("keytab slot mutex poisoned");
                slot.last_error = Some(reason);
                return RotationOutcome::FatalForPrincipal;
            }
        };

        {
            let mut slot = self.slot.lock().expect("keytab slot mutex poisoned");
            if let Some(current) = &slot.current {
                if blob.kvno <= current.kvno {
                    slot.last_error = Some(format!(
                        "KVNO did not increment after set_password: was {}, extracted {}",
                        current.kvno, blob.kvno
                    ));
                    return RotationOutcome::Retryable;
                }
            }
        }

        let not_before = epoch_start(new_epoch, self.lifetime);
        let not_after = not_before + self.lifetime * 2;
        let record = KeytabRecord {
            principal: self.principal.clone(),
            epoch: new_epoch,
            bytes: blob.bytes,
            kvno: blob.kvno,
            not_before,
            not_after,
        };

        let mut slot = self.slot.lock().expect("keytab slot mutex poisoned");
        slot.previous = slot.current.take();
        slot.current = Some(record);
        slot.ever_succeeded = true;
        slot.last_error = None;
        RotationOutcome::Rotated
    }

    /// Returns `(current, previous)`, or `Err` if no rotation has ever
    /// succeeded for this principal since startup.
    pub fn get(&self) -> Result<(KeytabRecord, Option<KeytabRecord>), ()> {
        let slot = self.slot.lock().expect("keytab slot mutex poisoned");
        match &slot.current {
            Some(current) => Ok((current.clone(), slot.previous.clone())),
            None => Err(()),
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.slot.lock().expect("keytab slot mutex poisoned").last_error.clone()
    }
}

/// The backoff schedule for [`RotationOutcome::Retryable`]: 5s, 10s, 20s,
/// ..., capped at `lifetime / 2`.
pub fn next_backoff(previous: Duration, lifetime: Duration) -> Duration {
    let cap = (lifetime / 2).max(Duration::from_secs(5));
    let doubled = previous.saturating_mul(2);
    doubled.min(cap)
}

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(5);

/// Drives one principal's [`KeytabGenerator`] forever: waits for each epoch
/// boundary, then rotates, retrying with [`next_backoff`] on
/// [`RotationOutcome::Retryable`] until it either succeeds or the epoch
/// schedule moves past it again. A [`RotationOutcome::FatalForPrincipal`]
/// is logged and left for the next epoch tick; it is not retried within the
/// current epoch, since the failure is assumed not to be transient.
pub async fn run_keytab_rotator(
    generator: std::sync::Arc<KeytabGenerator>,
    clock: DynClock,
    mut shutdown: NotifyOnce,
) {
    let mut scheduler = crate::epoch::EpochScheduler::new(clock.clone(), generator.lifetime());
    loop {
        tokio::select! {
            biased;
            () = shutdown.recv() => return,
            _epoch = scheduler.tick() => {}
        }

        let mut backoff = INITIAL_BACKOFF;
        loop {
            match generator.rotate_once(clock.now()).await {
                RotationOutcome::Rotated | RotationOutcome::NoOp => break,
                RotationOutcome::FatalForPrincipal => {
                    error!(
                        principal = %generator.principal,
                        reason = ?generator.last_error(),
                        "keytab rotation failed fatally for this principal; will retry next epoch"
                    );
                    break;
                }
                RotationOutcome::Retryable => {
                    warn!(
                        principal = %generator.principal,
                        backoff = ?backoff,
                        reason = ?generator.last_error(),
                        "keytab rotation failed retryably; backing off"
                    );
                    tokio::select! {
                        biased;
                        () = shutdown.recv() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = next_backoff(backoff, generator.lifetime());
                }
            }
        }
    }
}

/// A collection of named keytab generators, looked up by principal.
pub struct KeytabRegistry {
    generators: std::collections::HashMap<String, std::sync::Arc<KeytabGenerator>>,
}

impl KeytabRegistry {
    pub fn new(generators: Vec<std::sync::Arc<KeytabGenerator>>) -> Self {
        Self {
            generators: generators
                .into_iter()
                .map(|g| (g.principal.clone(), g))
                .collect(),
        }
    }

    pub fn get(
        &self,
        principal: &str,
    ) -> Result<std::sync::Arc<KeytabGenerator>, crate::error::BrokerError> {
        self.generators.get(principal).cloned().ok_or_else(|| {
            crate::error::BrokerError::NotFound(format!(
                "principal '{principal}' is not configured"
            ))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &std::sync::Arc<KeytabGenerator>> {
        self.generators.values()
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;

    struct MockKdc {
        fail_n_times: AtomicU32,
        outcome_on_fail: SetPasswordOutcome,
        kvno: AtomicU32,
    }

    #[async_trait]
    impl KdcAdmin for MockKdc {
        async fn set_password(&self, _principal: &str, _password: &str) -> SetPasswordOutcome {
            let remaining = self.fail_n_times.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_n_times.fetch_sub(1, Ordering::SeqCst);
                return self.outcome_on_fail.clone();
            }
            SetPasswordOutcome::Ok
        }

        async fn extract_keytab(&self, _principal: &str) -> Result<KeytabBlob, String> {
            let kvno = self.kvno.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(KeytabBlob {
                bytes: vec![0x05, 0x02, kvno as u8],
                kvno,
            })
        }
    }

    fn mock(fail_n_times: u32, outcome: SetPasswordOutcome) -> Arc<MockKdc> {
        Arc::new(MockKdc {
            fail_n_times: AtomicU32::new(fail_n_times),
            outcome_on_fail: outcome,
            kvno: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn happy_path_rotates_and_retains_previous() {
        let kdc = mock(0, SetPasswordOutcome::Ok);
        let gen = KeytabGenerator::new("HTTP/svc@EX", None, Duration::from_secs(60), kdc);

        let t1 = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        assert_eq!(gen.rotate_once(t1).await, RotationOutcome::Rotated);
        let (current1, previous1) = gen.get().unwrap();
        assert!(previous1.is_none());
        assert!(!current1.bytes.is_empty());

        let t2 = t1 + Duration::from_secs(61);
        assert_eq!(gen.rotate_once(t2).await, RotationOutcome::Rotated);
        let (current2, previous2) = gen.get().unwrap();
        assert_eq!(previous2.unwrap().bytes, current1.bytes);
        assert_ne!(current2.bytes, current1.bytes);
    }

    #[tokio::test]
    async fn same_epoch_is_a_no_op() {
        let kdc = mock(0, SetPasswordOutcome::Ok);
        let gen = KeytabGenerator::new("p", None, Duration::from_secs(60), kdc);
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        assert_eq!(gen.rotate_once(t).await, RotationOutcome::Rotated);
        assert_eq!(
            gen.rotate_once(t + Duration::from_secs(1)).await,
            RotationOutcome::NoOp
        );
    }

    #[tokio::test]
    async fn retryable_failure_leaves_current_untouched() {
        let kdc = mock(
            2,
            SetPasswordOutcome::Retryable {
                reason: "kadmin: connection refused".to_owned(),
            },
        );
        let gen = KeytabGenerator::new("p", None, Duration::from_secs(60), kdc);
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(100);

        assert_eq!(gen.rotate_once(t).await, RotationOutcome::Retryable);
        assert!(gen.get().is_err(), "never rotated successfully yet");

        assert_eq!(gen.rotate_once(t).await, RotationOutcome::Retryable);
        assert_eq!(gen.rotate_once(t).await, RotationOutcome::Rotated);
        assert!(gen.get().is_ok());
    }

    #[tokio::test]
    async fn unconfigured_principal_is_not_found() {
        let kdc = mock(0, SetPasswordOutcome::Ok);
        let gen = Arc::new(KeytabGenerator::new("p", None, Duration::from_secs(60), kdc));
        let registry = KeytabRegistry::new(vec![gen]);
        assert!(registry.get("p").is_ok());
        assert!(matches!(
            registry.get("other"),
            Err(crate::error::BrokerError::NotFound(_))
        ));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let lifetime = Duration::from_secs(3600);
        let mut delay = INITIAL_BACKOFF;
        assert_eq!(delay, Duration::from_secs(5));
        delay = next_backoff(delay, lifetime);
        assert_eq!(delay, Duration::from_secs(10));
        delay = next_backoff(delay, lifetime);
        assert_eq!(delay, Duration::from_secs(20));

        // Should cap at lifetime / 2 eventually.
        for _ in 0..20 {
            delay = next_backoff(delay, lifetime);
        }
        assert_eq!(delay, lifetime / 2);
    }
}
