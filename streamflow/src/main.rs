use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

use streamflow_core::bootstrap::init_services;
use streamflow_core::{logging, Config};

/// Stream quality scheduler for an upstream IPTV orchestrator
#[derive(Debug, Parser)]
#[command(name = "streamflow", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "STREAMFLOW_CONFIG")]
    config: Option<String>,

    /// Override the state directory
    #[arg(long, env = "STREAMFLOW_STATE_DIR")]
    state_dir: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let mut config = Config::load(cli.config.as_deref())
        .map_err(|err| anyhow::anyhow!("failed to load configuration: {err}"))?;
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = state_dir;
    }

    // 2. Validate (fail fast, reporting every problem at once)
    if let Err(errors) = config.validate() {
        for message in &errors {
            eprintln!("config error: {message}");
        }
        anyhow::bail!("invalid configuration ({} error(s))", errors.len());
    }
    if cli.check_config {
        println!("configuration OK");
        return Ok(());
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("StreamFlow starting");
    info!(upstream = %config.upstream.base_url, "Upstream orchestrator");

    // 4. Build services and start the scheduler loops
    let services = init_services(&config)?;

    // Apply per-account concurrency caps once the account list is known.
    // Non-fatal: the upstream may be briefly unreachable at boot.
    if let Err(err) = services.scheduler.reload_limits().await {
        warn!(error = %err, "Could not fetch M3U accounts yet, using global limit only");
    }

    services.scheduler.start();

    // 5. Wait for shutdown and drain
    shutdown_signal().await;
    info!("Shutdown signal received, draining in-flight checks");
    services.scheduler.stop().await;
    info!("StreamFlow stopped");
    Ok(())
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
