//! Scheduler binary: loads configuration, restores replication state and
//! serves the node and operator API.

use anyhow::Result;
use clap::Parser;
use scheduler::{AppState, HttpNodeClient, SledRepository, api, background, load_config};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file (defaults to ./scheduler.toml when present)
    #[arg(short, long, env = "SCHEDULER_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    info!(version = env!("CARGO_PKG_VERSION"), listen = %config.listen_addr, "Starting scheduler");

    let repo = Arc::new(SledRepository::open(&config.db_path)?);
    let client = Arc::new(HttpNodeClient::new(config.dispatch_timeout())?);
    let state = Arc::new(AppState::new(config, repo.clone(), client)?);

    let restored = state.replication.restore()?;
    info!(
        records = restored,
        nodes_with_assets = state.assets.node_count(),
        "Replication state restored"
    );
    // Nodes re-announce after a scheduler restart; batches resume once
    // the directory knows them again.
    let resume_state = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(
            resume_state.config.sweep_interval_secs.max(1),
        ))
        .await;
        let resumed = resume_state.replication.resume().await;
        info!(records = resumed, "Unfinished replication resumed");
    });

    tokio::spawn(background::validation_loop(state.clone()));
    tokio::spawn(background::sweep_loop(state.clone()));

    let app = api::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.config.listen_addr).await?;
    info!(address = %state.config.listen_addr, "Scheduler listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = repo.flush() {
        error!(error = %e, "Failed to flush state on shutdown");
    }
    info!("Scheduler shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, initiating graceful shutdown");
}
