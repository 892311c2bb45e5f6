//! HTTP surface of the credential broker: route table, request/response
//! shapes, bearer-token verification, and server bootstrap.

pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod error_response;
pub mod server;

use std::sync::Arc;

use axum::{routing::get, Router};

use crate::dispatcher::{get_keytab, get_nonce, get_secret, BrokerState};

/// Builds the three-route table: `/getnonce`, `/getkeytab`, `/getsecret`.
/// A catch-all fallback (installed by
/// [`server::spawn_server_task`], not here) returns the uniform
/// "path not mapped" 409 for everything else.
pub fn router(state: Arc<BrokerState>) -> Router<()> {
    Router::new()
        .route("/getnonce", get(get_nonce))
        .route("/getkeytab", get(get_keytab))
        .route("/getsecret", get(get_secret))
        .with_state(state)
}
