//! Global `tracing` logger setup.
//!
//! Honors `RUST_LOG` when set, via a `Targets` filter; otherwise falls back
//! to the level configured in `LoggingConfig`. The config schema additionally
//! lets operators request JSON output and/or file sinks without an env var.

use std::{fs::OpenOptions, str::FromStr};

use broker_api::config::{LogFormat, LoggingConfig};
use tracing::Level;
use tracing_subscriber::{
    filter::{FilterExt, LevelFilter, Targets},
    fmt::layer as fmt_layer,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

fn target_filter(level: Level) -> Targets {
    std::env::var("RUST_LOG")
        .ok()
        .and_then(|rust_log| Targets::from_str(&rust_log).ok())
        .unwrap_or_else(|| Targets::new().with_default(level))
}

fn default_level(config: &LoggingConfig) -> Level {
    match config.log_level {
        broker_api::config::LogLevel::Debug => Level::DEBUG,
        broker_api::config::LogLevel::Info => Level::INFO,
        broker_api::config::LogLevel::Warn => Level::WARN,
        broker_api::config::LogLevel::Error => Level::ERROR,
    }
}

/// Builds one fmt layer for `path` ("-" means stdout), honoring
/// `config.log_format` and `min_level`.
fn sink_layer(
    path: &str,
    config: &LoggingConfig,
    base_filter: Targets,
    min_level: LevelFilter,
) -> anyhow::Result<BoxedLayer> {
    let is_json = matches!(config.log_format, LogFormat::Json);
    let filter = base_filter.and(min_level);

    if path == "-" {
        let layer = if is_json {
            fmt_layer().json().with_target(true).boxed()
        } else {
            fmt_layer().compact().with_target(true).with_ansi(true).boxed()
        };
        return Ok(layer.with_filter(filter).boxed());
    }

    // TODO: non-blocking writer for prod; see tracing-appender.
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("failed to open log output path '{path}': {e}"))?;

    let layer = if is_json {
        fmt_layer().json().with_target(true).with_writer(file).boxed()
    } else {
        fmt_layer()
            .compact()
            .with_target(true)
            .with_ansi(false)
            .with_writer(file)
            .boxed()
    };
    Ok(layer.with_filter(filter).boxed())
}

/// Initializes the global logger from `config`. Panics if a logger is
/// already initialized (mirrors `logger::init`'s contract).
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = default_level(config);
    let base_filter = target_filter(level);

    let mut layers: Vec<BoxedLayer> = Vec::new();

    let output_paths: Vec<&str> = if config.output_paths.is_empty() {
        vec!["-"]
    } else {
        config.output_paths.iter().map(String::as_str).collect()
    };
    for path in output_paths {
        layers.push(sink_layer(
            path,
            config,
            base_filter.clone(),
            LevelFilter::from_level(level),
        )?);
    }
    for path in &config.error_output_paths {
        layers.push(sink_layer(
            path,
            config,
            base_filter.clone(),
            LevelFilter::ERROR,
        )?);
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install global logger: {e}"))
}
