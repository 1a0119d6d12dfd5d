//! Registry daemon.
//!
//! ```bash
//! # First member bootstraps a cluster
//! registry --config /etc/registry/registry.toml
//!
//! # Further members join through any existing leader
//! registry --config /etc/registry/registry.toml --join 10.0.0.1:9001
//! ```
//!
//! SIGINT, SIGTERM and SIGHUP stop the node gracefully.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use registry::config::LogConfig;
use registry::config::RegistryConfig;
use registry::node::RegistryNode;
use tokio::signal;
use tracing::error;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "registry", version, about = "Replicated inventory and policy registry")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Cluster address of the leader to join instead of bootstrapping.
    #[arg(long)]
    join: Option<String>,
}

/// `RUST_LOG` wins over `log.loglevel`. With `log.logdir` set, output is
/// appended to `<logdir>/registry.log`.
fn init_tracing(log: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.loglevel));
    if log.logdir.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
        return Ok(());
    }

    std::fs::create_dir_all(&log.logdir).with_context(|| format!("failed to create log dir {}", log.logdir))?;
    let path = PathBuf::from(&log.logdir).join("registry.log");
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Arc::new(file))
        .with_ansi(false)
        .with_target(false)
        .init();
    Ok(())
}

fn write_pid(path: &str) {
    if path.is_empty() {
        return;
    }
    if let Err(err) = std::fs::write(path, std::process::id().to_string()) {
        warn!(%path, error = %err, "failed to write pid file");
    }
}

/// Waits for SIGINT, SIGTERM or SIGHUP.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let unix = async {
        use signal::unix::SignalKind;

        let (mut term, mut hup) = match (
            signal::unix::signal(SignalKind::terminate()),
            signal::unix::signal(SignalKind::hangup()),
        ) {
            (Ok(term), Ok(hup)) => (term, hup),
            (Err(err), _) | (_, Err(err)) => {
                error!("failed to install signal handlers: {}", err);
                return std::future::pending::<&'static str>().await;
            }
        };
        tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = hup.recv() => "SIGHUP",
        }
    };

    #[cfg(not(unix))]
    let unix = std::future::pending::<&'static str>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, initiating graceful shutdown"),
        name = unix => info!(signal = name, "initiating graceful shutdown"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = RegistryConfig::from_toml_file(&args.config)?;
    init_tracing(&config.log)?;
    config.validate()?;
    info!(config = %args.config.display(), "configuration loaded");
    write_pid(&config.common.pid);

    let node = RegistryNode::start(&config, args.join.as_deref()).await?;
    shutdown_signal().await;
    node.shutdown().await?;
    info!("registry exited cleanly");
    Ok(())
}
