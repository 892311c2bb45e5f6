//! HTTP server bootstrap: middleware stack, TLS, and graceful shutdown.
//!
//! The middleware ordering is load-shed, buffer, concurrency limit, then
//! timeout, wrapping a single listener with `axum_server::Handle`-driven
//! graceful shutdown. TLS is plain server-auth TLS: a certificate chain and
//! PKCS8 private key loaded from disk, with no client-attestation machinery.

use std::{
    fs,
    io::BufReader,
    net::{SocketAddr, TcpListener},
    sync::Arc,
    time::Duration,
};

use axum::{extract::DefaultBodyLimit, Router};
use axum_server::tls_rustls::RustlsConfig;
use broker_tokio::{notify_once::NotifyOnce, task::LxTask};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tower::ServiceBuilder;
use tracing::{error, info, warn, Instrument};

/// Tower/axum middleware knobs. Mirrors the shape (not the exact defaults --
/// this broker expects far lighter traffic than a multi-tenant API) of a
/// production service's layer config.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerConfig {
    pub body_limit: Option<usize>,
    pub load_shed: bool,
    pub buffer_size: Option<usize>,
    pub concurrency: Option<usize>,
    pub handling_timeout: Option<Duration>,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            body_limit: Some(8192),
            load_shed: true,
            buffer_size: Some(1024),
            concurrency: Some(1024),
            handling_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// The grace period passed to [`axum_server::Handle::graceful_shutdown`].
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(3);
/// The maximum time to wait for in-flight connections to drain.
const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Reads a PEM certificate chain and a PKCS8 private key from disk and
/// builds a [`rustls::ServerConfig`] for plain (non-mTLS) TLS termination.
pub fn load_tls_config(cert_path: &str, key_path: &str) -> anyhow::Result<rustls::ServerConfig> {
    let cert_bytes = fs::read(cert_path)
        .map_err(|e| anyhow::anyhow!("failed to read TLS cert '{cert_path}': {e}"))?;
    let mut cert_reader = BufReader::new(cert_bytes.as_slice());
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("failed to parse TLS cert '{cert_path}': {e}"))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in '{cert_path}'");
    }

    let key_bytes = fs::read(key_path)
        .map_err(|e| anyhow::anyhow!("failed to read TLS key '{key_path}': {e}"))?;
    let mut key_reader = BufReader::new(key_bytes.as_slice());
    let key: PrivateKeyDer = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
        .next()
        .ok_or_else(|| anyhow::anyhow!("no PKCS8 private key found in '{key_path}'"))?
        .map(PrivateKeyDer::Pkcs8)
        .map_err(|e| anyhow::anyhow!("failed to parse TLS key '{key_path}': {e}"))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("failed to build TLS server config: {e}"))
}

/// Binds `bind_addr`, wraps `router` in the standard middleware stack, and
/// spawns the resulting server as a named [`LxTask`]. `maybe_tls` selects
/// plain HTTP vs TLS termination. The returned task finishes once `shutdown`
/// fires and either all connections drain or [`SERVER_SHUTDOWN_TIMEOUT`]
/// elapses.
pub fn spawn_server_task(
    name: &'static str,
    bind_addr: SocketAddr,
    router: Router<()>,
    layer_config: LayerConfig,
    maybe_tls: Option<Arc<rustls::ServerConfig>>,
    shutdown: NotifyOnce,
) -> anyhow::Result<LxTask<()>> {
    let listener = TcpListener::bind(bind_addr)
        .map_err(|e| anyhow::anyhow!("failed to bind {bind_addr}: {e}"))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| anyhow::anyhow!("failed to set listener non-blocking: {e}"))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| anyhow::anyhow!("failed to read bound address: {e}"))?;

    let scheme = if maybe_tls.is_some() { "https" } else { "http" };
    info!("{name} listening on {scheme}://{local_addr}");

    let server_fut = build_server_fut(listener, router, layer_config, maybe_tls, shutdown);
    Ok(LxTask::spawn(name, server_fut))
}

fn build_server_fut(
    listener: TcpListener,
    router: Router<()>,
    layer_config: LayerConfig,
    maybe_tls: Option<Arc<rustls::ServerConfig>>,
    mut shutdown: NotifyOnce,
) -> impl std::future::Future<Output = ()> {
    let span = tracing::Span::current();

    let router_with_fallback = router.fallback(|uri: http::Uri| async move {
        crate::error_response::path_not_mapped(uri.path())
    });

    let middleware_stack = ServiceBuilder::new()
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(
            layer_config
                .body_limit
                .map(DefaultBodyLimit::max)
                .unwrap_or_else(DefaultBodyLimit::disable),
        )
        .option_layer(layer_config.load_shed.then(tower::load_shed::LoadShedLayer::new))
        .option_layer(layer_config.buffer_size.map(tower::buffer::BufferLayer::new))
        .option_layer(
            layer_config
                .concurrency
                .map(tower::limit::ConcurrencyLimitLayer::new),
        )
        .option_layer(layer_config.handling_timeout.map(tower::timeout::TimeoutLayer::new));

    let layered_router = router_with_fallback.layer(middleware_stack);

    let handle = axum_server::Handle::new();
    let handle_clone = handle.clone();

    let serve_fut = async move {
        let make_service = layered_router.into_make_service();
        let result = match maybe_tls {
            Some(tls_config) => {
                let axum_tls_config = RustlsConfig::from_config(tls_config);
                axum_server::from_tcp_rustls(listener, axum_tls_config)
                    .handle(handle_clone)
                    .serve(make_service)
                    .await
            }
            None => axum_server::from_tcp(listener).handle(handle_clone).serve(make_service).await,
        };
        if let Err(e) = result {
            error!("server exited with error: {e}");
        }
    };

    let graceful_shutdown_fut = async move {
        shutdown.recv().await;
        info!("shutting down API server");
        handle.graceful_shutdown(Some(SHUTDOWN_GRACE_PERIOD));
    };

    async move {
        tokio::pin!(serve_fut);
        tokio::select! {
            biased;
            () = graceful_shutdown_fut => (),
            _ = &mut serve_fut => return error!("server exited before a shutdown signal"),
        }
        match tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, serve_fut).await {
            Ok(()) => info!("API server shut down cleanly"),
            Err(_) => warn!("API server timed out waiting for connections to drain"),
        }
    }
    .instrument(span)
}
