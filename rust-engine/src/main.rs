//! Lure Dispatcher - promotes due campaigns and sends them.
//!
//! Runs the scheduler loop until SIGINT/SIGTERM, then waits for in-flight
//! sends of already dispatched campaigns before exiting.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lure::{Config, Dispatcher, Scheduler, SmtpTransport, Store};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("dispatcher_starting");

    // Load configuration from environment
    let config = Config::from_env();
    info!(
        database_url = %config.database_url,
        phish_base_url = %config.phish_base_url,
        interval_secs = config.scheduler_interval_secs,
        send_concurrency = config.send_concurrency,
        smtp_timeout_ms = config.smtp_timeout_ms,
        "config_loaded"
    );

    let store = Store::connect(&config.database_url)
        .await
        .context("Failed to open database")?;

    let transport = Arc::new(SmtpTransport::new(&config.smtp_helo_name, config.smtp_timeout()));
    let dispatcher = Dispatcher::new(store.clone(), transport, &config)
        .context("Failed to create dispatcher")?;

    let scheduler = Scheduler::new(store, Arc::new(dispatcher), config.scheduler_interval());
    let handle = scheduler.start();

    info!("dispatcher_ready");
    shutdown_signal().await;

    let outstanding = handle.stop().await;
    info!(outstanding = outstanding.len(), "dispatcher_draining");

    for dispatch in outstanding {
        let summary = dispatch.join().await;
        info!(
            campaign_id = summary.campaign_id,
            sent = summary.sent,
            failed = summary.failed,
            aborted = summary.aborted,
            "campaign_dispatch_finished"
        );
    }

    info!("dispatcher_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("dispatcher_stopping");
}
