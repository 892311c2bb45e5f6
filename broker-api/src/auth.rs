//! Bearer-token extraction and the default JWT/JWKS [`TokenVerifier`].
//!
//! The token is read from the `Authorization: Bearer …` header, falling
//! back to a `bearertoken` query parameter when no header is present.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use broker_core::{
    error::{BrokerError, BrokerResult},
    token::TokenVerifier,
};
use jsonwebtoken::{
    decode, decode_header,
    jwk::{AlgorithmParameters, Jwk, JwkSet},
    Algorithm, DecodingKey, Validation,
};
use tokio::sync::RwLock;

pub const QUERY_PARAM: &str = "bearertoken";

/// Extracts the bearer token from either the `Authorization: Bearer …`
/// header or the `bearertoken` query parameter, header taking precedence.
pub fn extract_bearer_token(headers: &http::HeaderMap, query: &str) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        let mut parts = value.splitn(2, ' ');
        if let (Some(scheme), Some(token)) = (parts.next(), parts.next()) {
            if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
                return Some(token.to_owned());
            }
        }
    }
    query_param(query, QUERY_PARAM)
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == name && !value.is_empty() {
            Some(percent_decode(value))
        } else {
            None
        }
    })
}

/// Minimal `application/x-www-form-urlencoded` percent-decoding, sufficient
/// for query parameter values (no `+`-as-space handling needed here since
/// tokens and principal/secret names never legitimately contain spaces).
pub(crate) fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&value[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// A [`TokenVerifier`] backed by a remote JWKS endpoint, refreshed on a
/// timer. Verifies signature, expiry, issuer, and (optionally) audience.
pub struct JwtTokenVerifier {
    http: reqwest::Client,
    jwks_url: String,
    issuer: Option<String>,
    audience: Option<String>,
    keys: RwLock<HashMap<String, Jwk>>,
}

impl JwtTokenVerifier {
    pub fn new(
        jwks_url: impl Into<String>,
        issuer: Option<String>,
        audience: Option<String>,
        fetch_timeout: Duration,
    ) -> BrokerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .map_err(|e| BrokerError::InternalError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            jwks_url: jwks_url.into(),
            issuer,
            audience,
            keys: RwLock::new(HashMap::new()),
        })
    }

    /// Fetches the JWKS document and replaces the cached key set.
    pub async fn refresh(&self) -> BrokerResult<()> {
        let jwks: JwkSet = self
            .http
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| BrokerError::TemporarilyUnavailable(format!("JWKS fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| BrokerError::TemporarilyUnavailable(format!("JWKS body invalid: {e}")))?;

        let mut by_kid = HashMap::new();
        for key in jwks.keys {
            if let Some(kid) = key.common.key_id.clone() {
                by_kid.insert(kid, key);
            }
        }
        *self.keys.write().await = by_kid;
        Ok(())
    }

    fn decoding_key(jwk: &Jwk) -> BrokerResult<(DecodingKey, Algorithm)> {
        match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => {
                let key = DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
                    .map_err(|e| BrokerError::InvalidToken(format!("bad RSA JWK: {e}")))?;
                Ok((key, Algorithm::RS256))
            }
            AlgorithmParameters::EllipticCurve(ec) => {
                let key = DecodingKey::from_ec_components(&ec.x, &ec.y)
                    .map_err(|e| BrokerError::InvalidToken(format!("bad EC JWK: {e}")))?;
                Ok((key, Algorithm::ES256))
            }
            _ => Err(BrokerError::InvalidToken(
                "unsupported JWK key type".to_owned(),
            )),
        }
    }
}

#[async_trait]
impl TokenVerifier for JwtTokenVerifier {
    async fn verify(&self, bearer_token: &str) -> BrokerResult<serde_json::Value> {
        let header = decode_header(bearer_token)
            .map_err(|e| BrokerError::InvalidToken(format!("bad JWT header: {e}")))?;
        let kid = header
            .kid
            .ok_or_else(|| BrokerError::InvalidToken("JWT header missing 'kid'".to_owned()))?;

        let jwk = {
            let keys = self.keys.read().await;
            keys.get(&kid).cloned()
        };
        let jwk = match jwk {
            Some(jwk) => jwk,
            None => {
                // Key not cached yet -- refresh once and retry, in case the
                // issuer just rotated its signing keys.
                self.refresh().await?;
                self.keys
                    .read()
                    .await
                    .get(&kid)
                    .cloned()
                    .ok_or_else(|| BrokerError::InvalidToken(format!("unknown key id '{kid}'")))?
            }
        };

        let (decoding_key, algorithm) = Self::decoding_key(&jwk)?;
        let mut validation = Validation::new(algorithm);
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &self.audience {
            validation.set_audience(&[audience]);
        } else {
            validation.validate_aud = false;
        }

        let data = decode::<serde_json::Value>(bearer_token, &decoding_key, &validation)
            .map_err(|e| BrokerError::InvalidToken(format!("JWT verification failed: {e}")))?;

        Ok(data.claims)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn headers_with_bearer(value: &str) -> http::HeaderMap {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            http::header::AUTHORIZATION,
            http::HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn extracts_from_authorization_header() {
        let headers = headers_with_bearer("Bearer abc123");
        assert_eq!(
            extract_bearer_token(&headers, ""),
            Some("abc123".to_owned())
        );
    }

    #[test]
    fn header_case_insensitive_scheme() {
        let headers = headers_with_bearer("bearer abc123");
        assert_eq!(
            extract_bearer_token(&headers, ""),
            Some("abc123".to_owned())
        );
    }

    #[test]
    fn falls_back_to_query_param_when_no_header() {
        let headers = http::HeaderMap::new();
        assert_eq!(
            extract_bearer_token(&headers, "bearertoken=xyz789&other=1"),
            Some("xyz789".to_owned())
        );
    }

    #[test]
    fn header_takes_precedence_over_query() {
        let headers = headers_with_bearer("Bearer from-header");
        assert_eq!(
            extract_bearer_token(&headers, "bearertoken=from-query"),
            Some("from-header".to_owned())
        );
    }

    #[test]
    fn missing_token_is_none() {
        let headers = http::HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers, ""), None);
    }

    #[test]
    fn percent_decodes_query_values() {
        assert_eq!(
            extract_bearer_token(&http::HeaderMap::new(), "bearertoken=a%2Fb"),
            Some("a/b".to_owned())
        );
    }
}
