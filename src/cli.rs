//! Command-line entry point.

use std::io;
use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tollgate_config::{
    CliOverrides, Config, LoggingConfig, apply_env, apply_overrides, load_config, validate_config,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::{self, BoxError};

/// tollgate command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "tollgate",
    version,
    about = "Authenticating HTTP/HTTPS proxy with per-user egress addresses and traffic plans"
)]
pub struct Args {
    /// Config file path (json/jsonc/yaml/toml); built-in defaults when omitted
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: CliOverrides,
}

/// Resolve the effective configuration: file, then environment, then flags.
pub fn resolve_config<F>(args: &Args, lookup: F) -> Result<Config, BoxError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    apply_env(&mut config, lookup)?;
    apply_overrides(&mut config, &args.overrides);
    validate_config(&config)?;
    Ok(config)
}

pub async fn run(args: Args) -> Result<(), BoxError> {
    let config = resolve_config(&args, |key| std::env::var(key).ok())?;
    init_tracing(&config.logging);

    if let Some(listen) = &config.metrics.listen {
        match tollgate_metrics::init_prometheus(listen) {
            Ok(()) => info!(%listen, "metrics exporter listening"),
            Err(e) => warn!(%listen, error = %e, "failed to start metrics exporter"),
        }
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal_handler().await;
        info!("shutdown signal received");
        signal.cancel();
    });

    app::run(config, shutdown).await
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal_handler() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Filter directive from the base level and per-module overrides.
fn filter_directive(config: &LoggingConfig) -> String {
    let mut directive = config.level.as_deref().unwrap_or("info").to_string();
    let mut modules: Vec<_> = config.filters.iter().collect();
    modules.sort();
    for (module, level) in modules {
        directive.push_str(&format!(",{module}={level}"));
    }
    directive
}

fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_new(filter_directive(config)).unwrap_or_else(|_| EnvFilter::new("info"));
    let format = config.format.as_deref().unwrap_or("pretty");
    let to_stdout = config.output.as_deref() == Some("stdout");
    let registry = tracing_subscriber::registry().with(filter);

    match (format, to_stdout) {
        ("json", true) => registry.with(fmt::layer().json().with_writer(io::stdout)).init(),
        ("json", false) => registry.with(fmt::layer().json().with_writer(io::stderr)).init(),
        ("compact", true) => registry.with(fmt::layer().compact().with_writer(io::stdout)).init(),
        ("compact", false) => registry.with(fmt::layer().compact().with_writer(io::stderr)).init(),
        (_, true) => registry.with(fmt::layer().with_writer(io::stdout)).init(),
        (_, false) => registry.with(fmt::layer().with_writer(io::stderr)).init(),
    }
}
