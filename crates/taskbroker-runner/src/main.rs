//! Task Runner Daemon

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use taskbroker_runner::{Config, NodeExecutor, RunnerConnection, RunnerError};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("taskbroker_runner=info")),
        )
        .with_target(true)
        .init();

    let config = Config::parse().resolve_runner_id();
    config.validate()?;

    let executor = Arc::new(NodeExecutor::new(config.node_path.clone()));
    let connection = RunnerConnection::new(&config, executor);

    info!(
        runner_id = %connection.runner_id(),
        broker = %config.broker_addr,
        max_concurrency = config.max_concurrency,
        allow_modules = ?config.allow_modules,
        deny_modules = ?config.deny_modules,
        "Starting task runner"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
            shutdown.cancel();
        }
    });

    // Reconnection loop
    while !shutdown.is_cancelled() {
        match connection.connect_and_run(&shutdown).await {
            Ok(()) => info!("Connection closed"),
            Err(RunnerError::RegistrationFailed(reason)) => {
                error!(reason = %reason, "Broker refused registration");
            }
            Err(e) => error!(error = %e, "Connection error"),
        }

        if shutdown.is_cancelled() {
            break;
        }
        info!(
            delay_secs = config.reconnect_delay_secs,
            "Reconnecting in {} seconds...", config.reconnect_delay_secs
        );
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(config.reconnect_delay()) => {}
        }
    }

    info!("Task runner stopped");
    Ok(())
}
