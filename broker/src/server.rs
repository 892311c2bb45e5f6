//! Top-level lifecycle: builds every collaborator from configuration, spawns
//! the background tasks (nonce sweeper, rotators, API server), and joins
//! them on shutdown.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use broker_api::{auth::JwtTokenVerifier, config::KdcConfig};
use broker_core::{
    clock::{Clock, SystemClock},
    keytab::{run_keytab_rotator, KeytabGenerator, KeytabRegistry},
    nonce::{run_sweeper, NonceManager},
    secret::{run_secret_rotator, SecretGenerator, SecretRegistry},
};
use broker_kdc::{ConcurrencyLimitedKdcAdmin, KdcTool, ShellKdcAdmin};
use broker_policy::RegoPolicyEvaluator;
use broker_tokio::{
    notify_once::NotifyOnce,
    task::{try_join_tasks_and_shutdown, LxTask},
};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// How long to wait, after `shutdown` fires, for in-flight tasks to finish
/// before giving up and returning an error.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Loads configuration from `config_sources`, initializes logging, builds
/// every collaborator, and runs until a shutdown signal (Ctrl-C) arrives or a
/// static task fails.
pub async fn run(config_sources: String) -> anyhow::Result<()> {
    let config = broker_api::config::load_from(&config_sources)
        .await
        .context("failed to load configuration")?;

    crate::logging::init(&config.logging).context("failed to initialize logging")?;

    info!("starting credential broker");

    let shutdown = NotifyOnce::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let policy = Arc::new(
        RegoPolicyEvaluator::new(&config.policy.policy, config.policy.policy_timeout)
            .context("policy failed to compile")?,
    );

    let kdc_admin = build_kdc_admin(&config.kdc);

    let token_verifier = Arc::new(
        JwtTokenVerifier::new(
            config.token.jwks_url.clone(),
            config.token.issuer.clone(),
            config.token.audience.clone(),
            config.token.jwks_fetch_timeout,
        )
        .context("failed to build token verifier")?,
    );
    token_verifier
        .refresh()
        .await
        .context("failed to fetch initial JWKS")?;

    let nonces = Arc::new(NonceManager::new(clock.clone(), config.policy.nonce_lifetime));

    let mut secret_generators = Vec::with_capacity(config.data.shared_secrets.len());
    for secret in &config.data.shared_secrets {
        let lifetime = secret.lifetime.unwrap_or(config.policy.shared_secret_lifetime);
        secret_generators.push(Arc::new(SecretGenerator::new(
            secret.name.clone(),
            secret.seed.clone().into_bytes(),
            lifetime,
        )));
    }
    let secrets = Arc::new(SecretRegistry::new(secret_generators.clone()));

    let mut keytab_generators = Vec::with_capacity(config.data.keytabs.len());
    for keytab in &config.data.keytabs {
        let lifetime = keytab.lifetime.unwrap_or(config.policy.keytab_lifetime);
        keytab_generators.push(Arc::new(KeytabGenerator::new(
            keytab.principal.clone(),
            keytab.seed.clone().map(String::into_bytes),
            lifetime,
            kdc_admin.clone(),
        )));
    }
    let keytabs = Arc::new(KeytabRegistry::new(keytab_generators.clone()));

    // Populate the first current/previous pair for every secret before
    // serving, so the very first request never sees an empty registry.
    let now = clock.now();
    for generator in &secret_generators {
        generator.rotate_to(now);
    }
    for generator in &keytab_generators {
        use broker_core::keytab::RotationOutcome;
        match generator.rotate_once(now).await {
            RotationOutcome::Rotated | RotationOutcome::NoOp => {}
            RotationOutcome::Retryable | RotationOutcome::FatalForPrincipal => {
                warn!(
                    principal = %generator.principal,
                    reason = ?generator.last_error(),
                    "initial keytab rotation failed; will retry on the regular epoch schedule"
                );
            }
        }
    }

    let state = Arc::new(broker_api::dispatcher::BrokerState {
        clock: clock.clone(),
        token_verifier,
        policy,
        nonces: nonces.clone(),
        secrets,
        keytabs,
    });
    let router = broker_api::router(state);

    let listen_host = match config.network.listen.to_lowercase().as_str() {
        "any" | "" => "0.0.0.0",
        _ => &config.network.listen,
    };
    let bind_addr: SocketAddr = format!(
        "{}:{}",
        listen_host,
        if config.network.https_port > 0 {
            config.network.https_port
        } else {
            config.network.http_port
        }
    )
    .parse()
    .context("invalid network.listen/port combination")?;

    let maybe_tls = if config.network.https_port > 0 {
        let cert_path = config
            .network
            .tls_cert
            .as_deref()
            .expect("validated: tlsCert required when httpsPort is set");
        let key_path = config
            .network
            .tls_key
            .as_deref()
            .expect("validated: tlsKey required when httpsPort is set");
        Some(Arc::new(broker_api::server::load_tls_config(
            cert_path, key_path,
        )?))
    } else {
        None
    };

    let server_task = broker_api::server::spawn_server_task(
        "api",
        bind_addr,
        router,
        broker_api::server::LayerConfig::default(),
        maybe_tls,
        shutdown.clone(),
    )?;

    let mut static_tasks = vec![
        LxTask::spawn("nonce-sweeper", run_sweeper(nonces, shutdown.clone())),
        server_task,
    ];
    for generator in secret_generators {
        let name = format!("secret-rotator-{}", generator.name);
        static_tasks.push(LxTask::spawn(
            name,
            run_secret_rotator(generator, clock.clone(), shutdown.clone()),
        ));
    }
    for generator in keytab_generators {
        let name = format!("keytab-rotator-{}", generator.principal);
        static_tasks.push(LxTask::spawn(
            name,
            run_keytab_rotator(generator, clock.clone(), shutdown.clone()),
        ));
    }

    let (_eph_tasks_tx, eph_tasks_rx) = mpsc::channel(1);
    let shutdown_on_ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl-C, shutting down");
        shutdown_on_ctrl_c.send();
    });

    try_join_tasks_and_shutdown(static_tasks, eph_tasks_rx, shutdown, SHUTDOWN_TIMEOUT)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))
}

fn build_kdc_admin(config: &KdcConfig) -> Arc<dyn broker_core::keytab::KdcAdmin> {
    let (tool, concurrency, call_timeout) = match config.clone() {
        KdcConfig::Local {
            binary,
            concurrency,
            call_timeout,
        } => (KdcTool::Local { binary }, concurrency, call_timeout),
        KdcConfig::Remote {
            binary,
            admin_principal,
            keytab_path,
            server,
            concurrency,
            call_timeout,
        } => (
            KdcTool::Remote {
                binary,
                admin_principal,
                keytab_path,
                server,
            },
            concurrency,
            call_timeout,
        ),
    };

    let shell_admin: Arc<dyn broker_core::keytab::KdcAdmin> =
        Arc::new(ShellKdcAdmin::new(tool).with_call_timeout(call_timeout));

    match concurrency {
        Some(bound) => Arc::new(ConcurrencyLimitedKdcAdmin::new(shell_admin, bound)),
        None => shell_admin,
    }
}
