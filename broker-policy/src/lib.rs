//! Rego-backed [`PolicyEvaluator`](broker_core::policy::PolicyEvaluator).
//!
//! Compiles one policy bundle at construction and evaluates the three named
//! queries below against a fresh [`regorus::Engine`] clone per request.

use std::time::Duration;

use broker_core::{
    error::{BrokerError, BrokerResult},
    policy::{PolicyEvaluator, PolicyInput},
};
use regorus::Engine;
use tokio::sync::Mutex;

/// The three named decisions a configured policy bundle must expose, under
/// the fixed `data.broker.*` package path.
const QUERY_GET_NONCE: &str = "data.broker.auth_get_nonce";
const QUERY_GET_KEYTAB: &str = "data.broker.auth_get_keytab";
const QUERY_GET_SECRET: &str = "data.broker.auth_get_secret";

/// A policy bundle compiled once at startup and evaluated for the life of
/// the process. Immutable after construction except for regorus's own
/// internal evaluation bookkeeping, which is why the engine sits behind a
/// mutex rather than being `Sync` on its own.
pub struct RegoPolicyEvaluator {
    engine: Mutex<Engine>,
    timeout: Duration,
}

impl RegoPolicyEvaluator {
    /// Compiles `source` as a single Rego module named `policy.rego`.
    /// Returns an error immediately if the source fails to parse -- a
    /// broker must never start serving with an unusable policy.
    pub fn new(source: &str, timeout: Duration) -> BrokerResult<Self> {
        let mut engine = Engine::new();
        engine
            .add_policy("policy.rego".to_owned(), source.to_owned())
            .map_err(|e| BrokerError::InternalError(format!("policy failed to compile: {e}")))?;
        Ok(Self {
            engine: Mutex::new(engine),
            timeout,
        })
    }

    async fn decide(&self, query: &str, input: &PolicyInput) -> BrokerResult<bool> {
        let input_json = serde_json::to_string(input)
            .map_err(|e| BrokerError::InternalError(format!("policy input not serializable: {e}")))?;

        let fut = async {
            let input_value = regorus::Value::from_json_str(&input_json)
                .map_err(|e| BrokerError::PolicyError(format!("invalid policy input: {e}")))?;
            let mut engine = self.engine.lock().await;
            engine.set_input(input_value);
            let result = engine
                .eval_query(query.to_owned(), false)
                .map_err(|e| BrokerError::PolicyError(format!("policy evaluation failed: {e}")))?;

            let value = result
                .result
                .first()
                .and_then(|r| r.expressions.first())
                .map(|e| e.value.clone())
                .ok_or_else(|| {
                    BrokerError::PolicyError(format!("decision '{query}' produced no result"))
                })?;

            match value.as_bool() {
                Ok(b) => Ok(*b),
                Err(_) => Err(BrokerError::PolicyError(format!(
                    "decision '{query}' did not evaluate to a boolean"
                ))),
            }
        };

        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::PolicyTimeout),
        }
    }
}

#[async_trait::async_trait]
impl PolicyEvaluator for RegoPolicyEvaluator {
    async fn check_get_nonce(&self, input: &PolicyInput) -> BrokerResult<bool> {
        self.decide(QUERY_GET_NONCE, input).await
    }

    async fn check_get_keytab(&self, input: &PolicyInput) -> BrokerResult<bool> {
        self.decide(QUERY_GET_KEYTAB, input).await
    }

    async fn check_get_secret(&self, input: &PolicyInput) -> BrokerResult<bool> {
        self.decide(QUERY_GET_SECRET, input).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const POLICY: &str = r#"
package broker

default auth_get_nonce = true

default auth_get_keytab = false
auth_get_keytab {
    input.name == "HTTP/svc@EXAMPLE.COM"
    some n
    input.nonces[n]
}

default auth_get_secret = false
auth_get_secret {
    input.claims.role == "admin"
}
"#;

    fn input(name: Option<&str>, nonces: Vec<&str>, claims: serde_json::Value) -> PolicyInput {
        PolicyInput {
            claims,
            nonces: nonces.into_iter().map(str::to_owned).collect(),
            name: name.map(str::to_owned),
        }
    }

    #[tokio::test]
    async fn default_allows_nonce() {
        let eval = RegoPolicyEvaluator::new(POLICY, Duration::from_millis(250)).unwrap();
        let allowed = eval
            .check_get_nonce(&input(None, vec![], serde_json::json!({})))
            .await
            .unwrap();
        assert!(allowed);
    }

    #[tokio::test]
    async fn keytab_requires_matching_name_and_a_live_nonce() {
        let eval = RegoPolicyEvaluator::new(POLICY, Duration::from_millis(250)).unwrap();

        let denied = eval
            .check_get_keytab(&input(
                Some("HTTP/other@EXAMPLE.COM"),
                vec!["n1"],
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert!(!denied);

        let allowed = eval
            .check_get_keytab(&input(
                Some("HTTP/svc@EXAMPLE.COM"),
                vec!["n1"],
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert!(allowed);
    }

    #[tokio::test]
    async fn secret_checks_claims() {
        let eval = RegoPolicyEvaluator::new(POLICY, Duration::from_millis(250)).unwrap();

        let denied = eval
            .check_get_secret(&input(Some("db"), vec![], serde_json::json!({"role": "guest"})))
            .await
            .unwrap();
        assert!(!denied);

        let allowed = eval
            .check_get_secret(&input(Some("db"), vec![], serde_json::json!({"role": "admin"})))
            .await
            .unwrap();
        assert!(allowed);
    }

    #[tokio::test]
    async fn bad_policy_source_fails_at_construction() {
        let result = RegoPolicyEvaluator::new("this is not rego {{{", Duration::from_millis(250));
        assert!(result.is_err());
    }
}
