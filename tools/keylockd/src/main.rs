//! keylockd - Keylock key management server.
//!
//! Loads the configuration, restores the vault from its last dump, and
//! serves clients until interrupted. A final dump is written on shutdown.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use keylock_common::Error;
use keylock_server::{Dumper, Server, ServerConfig};
use keylock_vault::KeyVault;

#[derive(Parser)]
#[command(name = "keylockd")]
#[command(about = "Keylock - In-memory encrypted key management server")]
#[command(version)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "keylock.toml")]
    config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Err(e) = run(&cli).await {
        error!(error = %format!("{:#}", e), "keylockd stopped");
        return Err(e);
    }
    Ok(())
}

async fn run(cli: &Cli) -> Result<()> {
    let config = ServerConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    let kdf_params = config.kdf_params()?;

    let dumper = Arc::new(Dumper::from_config(&config)?);
    let snapshot = dumper.restore().await.map_err(|e| match e {
        Error::AuthFailure => anyhow::anyhow!(
            "Dump {} could not be decrypted: wrong dump_password or tampered file",
            config.dump_path.display()
        ),
        other => anyhow::Error::new(other)
            .context(format!("Failed to restore {}", config.dump_path.display())),
    })?;

    let password = config.password.clone();
    let vault = tokio::task::spawn_blocking(move || {
        KeyVault::open(password.as_bytes(), kdf_params, snapshot)
    })
    .await
    .context("Vault open task failed")?
    .context("Failed to open vault with the configured password")?;
    let vault = Arc::new(vault);
    info!(records = vault.count().await, "Vault ready");

    let server = Server::bind(&config, vault, dumper)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;

    server
        .run_until(shutdown_signal())
        .await
        .context("Final dump failed")?;

    info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
