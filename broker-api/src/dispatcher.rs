//! The three HTTP handlers and the shared state they read.
//!
//! Each handler requires a bearer token, then runs one policy check before
//! doing anything principal-specific; a route that matches no handler falls
//! back to the same uniform denial shape.

use std::{sync::Arc, time::SystemTime};

use axum::{
    extract::{RawQuery, State},
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use broker_core::{
    clock::DynClock,
    error::{BrokerError, BrokerResult},
    keytab::KeytabRegistry,
    nonce::NonceManager,
    policy::{PolicyEvaluator, PolicyInput},
    secret::SecretRegistry,
    token::TokenVerifier,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    auth::{extract_bearer_token, percent_decode},
    error_response::DenialResponse,
};

/// Everything a request handler needs, shared behind one `Arc`.
pub struct BrokerState {
    pub clock: DynClock,
    pub token_verifier: Arc<dyn TokenVerifier>,
    pub policy: Arc<dyn PolicyEvaluator>,
    pub nonces: Arc<NonceManager>,
    pub secrets: Arc<SecretRegistry>,
    pub keytabs: Arc<KeytabRegistry>,
}

async fn authenticate(
    state: &BrokerState,
    headers: &http::HeaderMap,
    query: &str,
) -> BrokerResult<(String, serde_json::Value)> {
    let token = extract_bearer_token(headers, query)
        .ok_or_else(|| BrokerError::InvalidToken("token required".to_owned()))?;
    let claims = state.token_verifier.verify(&token).await?;
    Ok((token, claims))
}

fn unix_seconds(t: SystemTime) -> i64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Serialize)]
struct NonceResponseBody {
    value: String,
    expiry: String,
}

pub async fn get_nonce(
    State(state): State<Arc<BrokerState>>,
    headers: http::HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    match get_nonce_inner(&state, &headers, query.as_deref().unwrap_or("")).await {
        Ok(body) => Json(body).into_response(),
        Err(e) => {
            warn!(error = %e, "getnonce denied");
            DenialResponse(e).into_response()
        }
    }
}

async fn get_nonce_inner(
    state: &BrokerState,
    headers: &http::HeaderMap,
    query: &str,
) -> BrokerResult<NonceResponseBody> {
    let (token, claims) = authenticate(state, headers, query).await?;

    let input = PolicyInput {
        claims,
        nonces: state.nonces.current_set(),
        name: None,
    };
    if !state.policy.check_get_nonce(&input).await? {
        return Err(BrokerError::Denied);
    }

    let fingerprint = NonceManager::fingerprint_token(&token);
    let nonce = state.nonces.new_nonce(&fingerprint)?;
    info!("issued nonce");

    Ok(NonceResponseBody {
        value: nonce.value,
        expiry: humantime::format_rfc3339_seconds(nonce.expiry).to_string(),
    })
}

#[derive(Serialize)]
struct KeytabResponseBody {
    principal: String,
    base64file: String,
    exp: i64,
}

pub async fn get_keytab(
    State(state): State<Arc<BrokerState>>,
    headers: http::HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let query = query.unwrap_or_default();
    match get_keytab_inner(&state, &headers, &query).await {
        Ok(body) => Json(body).into_response(),
        Err(e) => {
            warn!(error = %e, "getkeytab denied");
            DenialResponse(e).into_response()
        }
    }
}

async fn get_keytab_inner(
    state: &BrokerState,
    headers: &http::HeaderMap,
    query: &str,
) -> BrokerResult<KeytabResponseBody> {
    let principal = query_value(query, "principal")
        .ok_or_else(|| BrokerError::InvalidToken("principal required".to_owned()))?;
    let (_token, claims) = authenticate(state, headers, query).await?;

    let input = PolicyInput {
        claims,
        nonces: state.nonces.current_set(),
        name: Some(principal.clone()),
    };
    if !state.policy.check_get_keytab(&input).await? {
        return Err(BrokerError::Denied);
    }

    let generator = state.keytabs.get(&principal)?;
    let (current, _previous) = generator
        .get()
        .map_err(|()| BrokerError::TemporarilyUnavailable(principal.clone()))?;

    Ok(KeytabResponseBody {
        principal: current.principal,
        base64file: STANDARD.encode(&current.bytes),
        exp: unix_seconds(current.not_after),
    })
}

#[derive(Serialize)]
struct SecretResponseBody {
    name: String,
    secret: String,
    exp: i64,
    #[serde(rename = "nextSecret", skip_serializing_if = "Option::is_none")]
    next_secret: Option<String>,
    #[serde(rename = "nextExp", skip_serializing_if = "Option::is_none")]
    next_exp: Option<i64>,
}

pub async fn get_secret(
    State(state): State<Arc<BrokerState>>,
    headers: http::HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let query = query.unwrap_or_default();
    match get_secret_inner(&state, &headers, &query).await {
        Ok(body) => Json(body).into_response(),
        Err(e) => {
            warn!(error = %e, "getsecret denied");
            DenialResponse(e).into_response()
        }
    }
}

async fn get_secret_inner(
    state: &BrokerState,
    headers: &http::HeaderMap,
    query: &str,
) -> BrokerResult<SecretResponseBody> {
    let name =
        query_value(query, "name").ok_or_else(|| BrokerError::InvalidToken("name required".to_owned()))?;
    let (_token, claims) = authenticate(state, headers, query).await?;

    let input = PolicyInput {
        claims,
        nonces: state.nonces.current_set(),
        name: Some(name.clone()),
    };
    if !state.policy.check_get_secret(&input).await? {
        return Err(BrokerError::Denied);
    }

    let generator = state.secrets.get(&name)?;
    let (current, previous) = generator.get();
    let current = current.ok_or_else(|| BrokerError::TemporarilyUnavailable(name.clone()))?;

    Ok(SecretResponseBody {
        name: current.name,
        secret: STANDARD.encode(&current.value),
        exp: unix_seconds(current.not_after),
        next_secret: previous.as_ref().map(|p| STANDARD.encode(&p.value)),
        next_exp: previous.as_ref().map(|p| unix_seconds(p.not_after)),
    })
}

/// Reads a single `key=value` pair out of a raw query string. Not a general
/// query-string parser (no repeated-key or `+`-as-space handling); the only
/// values ever placed here are opaque names/principals.
fn query_value(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key && !v.is_empty()).then(|| percent_decode(v))
    })
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use broker_core::{
        clock::MockClock,
        keytab::KeytabGenerator,
        secret::SecretGenerator,
        test_support::{MockKdcAdmin, MockPolicyEvaluator, MockTokenVerifier},
    };

    use super::*;

    #[test]
    fn query_value_reads_and_decodes_named_param() {
        assert_eq!(
            query_value("principal=HTTP%2Fsvc&other=1", "principal"),
            Some("HTTP/svc".to_owned())
        );
        assert_eq!(query_value("other=1", "principal"), None);
    }

    fn state_with(
        policy_allows: bool,
        secrets: Vec<Arc<SecretGenerator>>,
        keytabs: Vec<Arc<KeytabRegistryEntry>>,
    ) -> (Arc<MockClock>, BrokerState) {
        let clock = Arc::new(MockClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000)));
        let policy: Arc<dyn PolicyEvaluator> = if policy_allows {
            MockPolicyEvaluator::allow_all()
        } else {
            MockPolicyEvaluator::deny_all()
        };
        let keytabs = keytabs.into_iter().map(|e| e.0.clone()).collect();
        let state = BrokerState {
            clock: clock.clone(),
            token_verifier: Arc::new(MockTokenVerifier),
            policy,
            nonces: Arc::new(NonceManager::new(clock.clone(), Duration::from_secs(60))),
            secrets: Arc::new(SecretRegistry::new(secrets)),
            keytabs: Arc::new(KeytabRegistry::new(keytabs)),
        };
        (clock, state)
    }

    /// Newtype so `state_with` can accept pre-built keytab generators without
    /// clashing with `Vec<Arc<SecretGenerator>>`'s type in overload-free Rust.
    struct KeytabRegistryEntry(Arc<KeytabGenerator>);

    fn bearer_headers(token: &str) -> http::HeaderMap {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            http::HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    const VALID_TOKEN: &str = "valid:{}";

    #[tokio::test]
    async fn get_nonce_denied_by_policy() {
        let (_clock, state) = state_with(false, vec![], vec![]);
        let err = get_nonce_inner(&state, &bearer_headers(VALID_TOKEN), "")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Denied));
    }

    #[tokio::test]
    async fn get_nonce_missing_token_is_invalid() {
        let (_clock, state) = state_with(true, vec![], vec![]);
        let err = get_nonce_inner(&state, &http::HeaderMap::new(), "")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn happy_keytab_flow() {
        let kdc = Arc::new(MockKdcAdmin::always_ok());
        let generator = Arc::new(KeytabGenerator::new(
            "HTTP/svc@EX",
            None,
            Duration::from_secs(60),
            kdc,
        ));
        generator.rotate_once(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000)).await;

        let (_clock, state) =
            state_with(true, vec![], vec![KeytabRegistryEntry(generator)]);

        let body = get_keytab_inner(
            &state,
            &bearer_headers(VALID_TOKEN),
            "principal=HTTP%2Fsvc%40EX",
        )
        .await
        .unwrap();
        assert_eq!(body.principal, "HTTP/svc@EX");
        assert!(!body.base64file.is_empty());
        assert!(body.exp > 1_000);
    }

    #[tokio::test]
    async fn keytab_never_rotated_is_temporarily_unavailable() {
        let kdc = Arc::new(MockKdcAdmin::always_ok());
        let generator = Arc::new(KeytabGenerator::new(
            "HTTP/svc@EX",
            None,
            Duration::from_secs(60),
            kdc,
        ));
        let (_clock, state) =
            state_with(true, vec![], vec![KeytabRegistryEntry(generator)]);

        let err = get_keytab_inner(
            &state,
            &bearer_headers(VALID_TOKEN),
            "principal=HTTP%2Fsvc%40EX",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BrokerError::TemporarilyUnavailable(_)));
    }

    #[tokio::test]
    async fn unconfigured_keytab_principal_is_not_found() {
        let (_clock, state) = state_with(true, vec![], vec![]);
        let err = get_keytab_inner(&state, &bearer_headers(VALID_TOKEN), "principal=nope")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotFound(_)));
    }

    #[tokio::test]
    async fn rotation_straddle_exposes_next_secret() {
        let generator = Arc::new(SecretGenerator::new(
            "db-password",
            b"seed".to_vec(),
            Duration::from_secs(2),
        ));
        let (clock, state) = state_with(true, vec![generator.clone()], vec![]);

        let t1 = SystemTime::UNIX_EPOCH + Duration::from_millis(1_900);
        clock.set(t1);
        generator.rotate_to(t1);
        let first = get_secret_inner(&state, &bearer_headers(VALID_TOKEN), "name=db-password")
            .await
            .unwrap();

        let t2 = SystemTime::UNIX_EPOCH + Duration::from_millis(2_100);
        clock.set(t2);
        generator.rotate_to(t2);
        let second = get_secret_inner(&state, &bearer_headers(VALID_TOKEN), "name=db-password")
            .await
            .unwrap();
        assert_ne!(second.secret, first.secret);
        assert_eq!(second.next_secret.as_deref(), Some(first.secret.as_str()));
    }

    #[tokio::test]
    async fn get_secret_denied_by_policy() {
        let generator = Arc::new(SecretGenerator::new(
            "db-password",
            b"seed".to_vec(),
            Duration::from_secs(60),
        ));
        let (_clock, state) = state_with(false, vec![generator], vec![]);
        let err = get_secret_inner(&state, &bearer_headers(VALID_TOKEN), "name=db-password")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Denied));
    }
}
