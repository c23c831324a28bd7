//! portway: a SOCKS 5 proxy server.
//!
//! Accepts client connections on the configured inbounds, negotiates SOCKS 5,
//! dials the requested destination directly and relays bytes both ways until
//! either side finishes or the connection goes idle.

mod config;
mod inbound;
mod instance;
mod outbound;
mod sockopt;
mod socks;
#[cfg(test)]
mod testutil;

use anyhow::Context;
use clap::Parser;
use config::{Config, Overrides};
use instance::Instance;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// portway: SOCKS 5 proxy server
#[derive(Parser, Debug)]
#[command(name = "portway", version, about = "SOCKS 5 proxy server")]
struct Cli {
    /// Config file path (TOML, or JSON with a .json extension)
    #[arg(long, default_value = "~/.portway/config.toml")]
    config: String,

    /// Listen address of the first TCP inbound
    #[arg(long)]
    listen: Option<String>,

    /// Listen port of the first TCP inbound
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Do not record access events
    #[arg(long)]
    no_access_log: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config_path = PathBuf::from(&cli.config);
    let loaded = Config::load(
        Some(&config_path),
        Overrides {
            listen: cli.listen.as_deref(),
            port: cli.port,
            log_level: cli.log_level.as_deref(),
            no_access_log: cli.no_access_log,
        },
    );

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let level = match &loaded {
        Ok(cfg) => cfg.log_level.clone(),
        Err(_) => cli.log_level.clone().unwrap_or_else(|| "info".to_string()),
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, path = %cli.config, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        inbounds = config.inbounds.len(),
        "starting portway"
    );

    if let Err(e) = run(config).await {
        error!(error = %format!("{e:#}"), "portway failed");
        std::process::exit(1);
    }

    info!("portway stopped");
}

async fn run(config: Config) -> anyhow::Result<()> {
    let instance = Instance::new(&config).context("failed to build instance")?;
    instance.start().context("failed to start inbounds")?;
    for worker in instance.workers() {
        info!(tag = %worker.tag(), port = worker.port(), "inbound ready");
    }

    shutdown_signal().await;
    info!("received shutdown signal");

    let closed = instance.close();
    for (name, value) in instance.stats().snapshot() {
        info!(counter = %name, value, "traffic");
    }
    closed.context("failed to close instance")
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
