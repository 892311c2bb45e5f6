//! The uniform denial response.
//!
//! Every error, regardless of cause, maps to HTTP 409 with body
//! `{"error": "<message>"}`. Collapsing every denial reason onto one status
//! and shape keeps the wire protocol from leaking which authorization step
//! actually failed.

use axum::response::{IntoResponse, Response};
use broker_core::error::BrokerError;
use http::StatusCode;
use serde::Serialize;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Wraps a [`BrokerError`] for the dispatcher's `IntoResponse` impl. Every
/// variant renders identically on the wire; only the log line (emitted by
/// the caller before constructing this) distinguishes the cause.
pub struct DenialResponse(pub BrokerError);

impl From<BrokerError> for DenialResponse {
    fn from(err: BrokerError) -> Self {
        Self(err)
    }
}

/// Serializes `body` and appends a trailing newline, matching the exact
/// byte shape clients are expected to parse against.
fn error_response(body: &ErrorBody) -> Response {
    let mut json = serde_json::to_string(body).expect("ErrorBody always serializes");
    json.push('\n');
    (
        StatusCode::CONFLICT,
        [(http::header::CONTENT_TYPE, "application/json")],
        json,
    )
        .into_response()
}

impl IntoResponse for DenialResponse {
    fn into_response(self) -> Response {
        error_response(&ErrorBody {
            error: self.0.to_string(),
        })
    }
}

/// The response for a request path that matched no route.
pub fn path_not_mapped(path: &str) -> Response {
    error_response(&ErrorBody {
        error: format!("Path {path} not mapped"),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn denial_response_body_ends_with_newline() {
        let response = DenialResponse(BrokerError::NotFound("x".to_owned())).into_response();
        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap();
        assert_eq!(content_type, "application/json");
    }

    #[test]
    fn error_body_serializes_with_trailing_newline() {
        let body = ErrorBody {
            error: "denied".to_owned(),
        };
        let mut json = serde_json::to_string(&body).unwrap();
        json.push('\n');
        assert_eq!(json, "{\"error\":\"denied\"}\n");
    }
}
