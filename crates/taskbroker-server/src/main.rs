//! Task Broker Server

use std::net::SocketAddr;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use taskbroker_server::{http, monitor, transport, Broker, Config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("taskbroker=info,taskbroker_server=info")),
        )
        .with_target(true)
        .init();

    let config = Config::parse();
    config.validate()?;

    let runner_addr: SocketAddr = config.runner_addr.parse()?;
    let http_addr: SocketAddr = config.http_addr.parse()?;

    info!(
        runner_addr = %runner_addr,
        http_addr = %http_addr,
        heartbeat_interval_secs = config.heartbeat_interval_secs,
        heartbeat_timeout_secs = config.heartbeat_timeout_secs,
        max_concurrency = config.max_concurrency,
        task_timeout_secs = config.task_timeout_secs,
        "Starting task broker"
    );

    let (broker, events) = Broker::new(config);
    let shutdown = CancellationToken::new();
    let monitors = monitor::spawn(broker.clone(), events, shutdown.clone());

    let runner_listener = TcpListener::bind(runner_addr).await?;
    let runner_server = transport::serve(runner_listener, broker.clone(), shutdown.clone());

    let http_listener = TcpListener::bind(http_addr).await?;
    let http_router = http::create_router(broker);
    let http_shutdown = shutdown.clone();
    let http_server = axum::serve(http_listener, http_router)
        .with_graceful_shutdown(async move { http_shutdown.cancelled().await });

    info!("Runner endpoint listening on {}", runner_addr);
    info!("HTTP server listening on {}", http_addr);

    tokio::select! {
        result = runner_server => {
            if let Err(e) = result {
                error!(error = %e, "Runner endpoint error");
            }
        }
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    shutdown.cancel();
    monitors.join().await;
    info!("Task broker stopped");

    Ok(())
}
