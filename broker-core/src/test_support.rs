//! Shared test doubles, used by this crate's own tests and re-used by
//! `broker-api`'s integration tests. Not feature-gated: a plain public
//! module, matching the pack's `test_utils`-style shared mock modules.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;

use crate::{
    error::{BrokerError, BrokerResult},
    keytab::{KdcAdmin, KeytabBlob, SetPasswordOutcome},
    policy::{PolicyEvaluator, PolicyInput},
    token::TokenVerifier,
};

/// A [`KdcAdmin`] that fails the first `fail_n_times` calls to
/// `set_password` with `outcome_on_fail`, then succeeds.
pub struct MockKdcAdmin {
    fail_n_times: AtomicU32,
    outcome_on_fail: SetPasswordOutcome,
    kvno: AtomicU32,
    set_password_calls: AtomicU32,
}

impl MockKdcAdmin {
    pub fn always_ok() -> Self {
        Self {
            fail_n_times: AtomicU32::new(0),
            outcome_on_fail: SetPasswordOutcome::Ok,
            kvno: AtomicU32::new(0),
            set_password_calls: AtomicU32::new(0),
        }
    }

    pub fn fail_then_succeed(fail_n_times: u32, outcome: SetPasswordOutcome) -> Self {
        Self {
            fail_n_times: AtomicU32::new(fail_n_times),
            outcome_on_fail: outcome,
            kvno: AtomicU32::new(0),
            set_password_calls: AtomicU32::new(0),
        }
    }

    pub fn set_password_call_count(&self) -> u32 {
        self.set_password_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KdcAdmin for MockKdcAdmin {
    async fn set_password(&self, _principal: &str, _password: &str) -> SetPasswordOutcome {
        self.set_password_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_n_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_n_times.fetch_sub(1, Ordering::SeqCst);
            return self.outcome_on_fail.clone();
        }
        SetPasswordOutcome::Ok
    }

    async fn extract_keytab(&self, principal: &str) -> Result<KeytabBlob, String> {
        let kvno = self.kvno.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(KeytabBlob {
            bytes: format!("keytab-for-{principal}-v{kvno}").into_bytes(),
            kvno,
        })
    }
}

/// A [`PolicyEvaluator`] that returns a fixed decision for every call, and
/// records the inputs it was asked to decide on.
pub struct MockPolicyEvaluator {
    pub allow: bool,
    pub seen_inputs: Mutex<Vec<PolicyInput>>,
}

impl MockPolicyEvaluator {
    pub fn allow_all() -> Arc<Self> {
        Arc::new(Self {
            allow: true,
            seen_inputs: Mutex::new(Vec::new()),
        })
    }

    pub fn deny_all() -> Arc<Self> {
        Arc::new(Self {
            allow: false,
            seen_inputs: Mutex::new(Vec::new()),
        })
    }

    fn record(&self, input: &PolicyInput) {
        self.seen_inputs
            .lock()
            .expect("mock policy mutex poisoned")
            .push(input.clone());
    }
}

/// A [`TokenVerifier`] that accepts any token of the form `valid:<claims
/// json>` and rejects everything else, without touching the network.
pub struct MockTokenVerifier;

#[async_trait]
impl TokenVerifier for MockTokenVerifier {
    async fn verify(&self, bearer_token: &str) -> BrokerResult<serde_json::Value> {
        let claims_json = bearer_token
            .strip_prefix("valid:")
            .ok_or_else(|| BrokerError::InvalidToken("not a recognized test token".to_owned()))?;
        serde_json::from_str(claims_json)
            .map_err(|e| BrokerError::InvalidToken(format!("bad claims json: {e}")))
    }
}

#[async_trait]
impl PolicyEvaluator for MockPolicyEvaluator {
    async fn check_get_nonce(&self, input: &PolicyInput) -> BrokerResult<bool> {
        self.record(input);
        Ok(self.allow)
    }

    async fn check_get_keytab(&self, input: &PolicyInput) -> BrokerResult<bool> {
        self.record(input);
        Ok(self.allow)
    }

    async fn check_get_secret(&self, input: &PolicyInput) -> BrokerResult<bool> {
        self.record(input);
        Ok(self.allow)
    }
}
